use crate::config::AnalysisConfig;
use crate::memory::TimingOracle;
use crate::util::median;
use rand::Rng;
use rand::seq::index::sample;

/// Addresses believed to share one DRAM bank.
///
/// A new address is compared against a random sample of the members instead of
/// all of them, which keeps classification cost independent of group size.
#[derive(Clone, Debug)]
pub struct AddressGroup {
    addresses: Vec<usize>,
    block_size: usize,
    compare_addresses: usize,
    measurements: usize,
    fenced: bool,
}

impl AddressGroup {
    /// Creates a group holding only `addr`.
    pub fn new(addr: usize, block_size: usize, config: &AnalysisConfig) -> Self {
        AddressGroup {
            addresses: vec![addr],
            block_size,
            compare_addresses: config.compare_addresses,
            measurements: config.measurements_per_comparison,
            fenced: config.fenced,
        }
    }

    /// Members in insertion order, or sorted after block size operations.
    pub fn addresses(&self) -> &[usize] {
        &self.addresses
    }

    /// Number of members.
    pub fn len(&self) -> usize {
        self.addresses.len()
    }

    /// Whether the group has no members.
    pub fn is_empty(&self) -> bool {
        self.addresses.is_empty()
    }

    /// Block size the members were classified at.
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub(crate) fn push(&mut self, addr: usize) {
        self.addresses.push(addr);
    }

    pub(crate) fn set_block_size(&mut self, block_size: usize) {
        self.block_size = block_size;
    }

    pub(crate) fn addresses_mut(&mut self) -> &mut Vec<usize> {
        &mut self.addresses
    }

    pub(crate) fn into_addresses(self) -> Vec<usize> {
        self.addresses
    }

    /// Times `addr` against up to `compare_addresses` randomly chosen members
    /// and returns the median latency.
    ///
    /// A high value means `addr` conflicts with the group, i.e. it most likely
    /// lives in the same bank. An empty group scores 0.
    pub fn compare_address_timing<T: TimingOracle, R: Rng + ?Sized>(
        &self,
        addr: usize,
        oracle: &T,
        rng: &mut R,
    ) -> u64 {
        let amount = self.compare_addresses.min(self.addresses.len());
        let mut times = sample(rng, self.addresses.len(), amount)
            .into_iter()
            .map(|idx| oracle.measure(self.addresses[idx], addr, self.measurements, self.fenced))
            .collect::<Vec<_>>();
        median(&mut times).unwrap_or(0)
    }
}
