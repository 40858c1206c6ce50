use super::{MaskCandidates, search_masks};
use crate::config::AnalysisConfig;
use crate::util::{log2_floor, parity};
use itertools::Itertools;
use log::{debug, info, warn};
use thiserror::Error;

/// Reduces `masks` to a linearly independent basis over GF(2).
///
/// Masks are visited in ascending order. A mask joins the basis unless it is
/// the XOR of a nonempty subset of the masks already in it. The span of the
/// basis is kept explicitly and doubles with every accepted mask, which is
/// cheap because the basis never grows beyond log2 of the bank count.
///
/// # Examples
///
/// ```
/// use bankfn_core::search::unify_masks;
///
/// assert_eq!(unify_masks(vec![0x36000, 0x24000, 0x12000]), vec![0x12000, 0x24000]);
/// ```
pub fn unify_masks(mut masks: Vec<u64>) -> Vec<u64> {
    masks.sort_unstable();
    masks.dedup();
    let mut basis = vec![];
    let mut span: Vec<u64> = vec![];
    for mask in masks {
        if mask == 0 || span.contains(&mask) {
            continue;
        }
        let sums = span.iter().map(|s| s ^ mask).collect::<Vec<_>>();
        span.extend(sums);
        span.push(mask);
        basis.push(mask);
    }
    basis
}

/// The bank address function derived from a grouping.
///
/// Immutable once computed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AddressFunction {
    masks: Vec<u64>,
    parities: Vec<Vec<u64>>,
    bank_count: usize,
    orthogonal: bool,
    relevant_bits: u64,
}

impl AddressFunction {
    /// Basis masks in ascending order.
    pub fn masks(&self) -> &[u64] {
        &self.masks
    }

    /// Dominant parity of every group, one vector per mask.
    pub fn parities(&self) -> &[Vec<u64>] {
        &self.parities
    }

    /// Number of banks observed by the classifier.
    pub fn bank_count(&self) -> usize {
        self.bank_count
    }

    /// Whether every pair of masks is orthogonal.
    pub fn is_orthogonal(&self) -> bool {
        self.orthogonal
    }

    /// Bits whose flip moved the lowest address into another bank, or out of
    /// the observed addresses.
    pub fn relevant_bits(&self) -> u64 {
        self.relevant_bits
    }

    /// Whether the masks explain exactly the observed number of banks.
    pub fn is_complete(&self) -> bool {
        u32::try_from(self.masks.len())
            .ok()
            .and_then(|n| 1usize.checked_shl(n))
            == Some(self.bank_count)
    }

    /// Bank index of `addr`, bit `i` being the parity under mask `i`.
    pub fn bank_of(&self, addr: u64) -> u64 {
        self.masks
            .iter()
            .enumerate()
            .fold(0, |bank, (i, &m)| bank | (parity(addr & m) << i))
    }
}

/// The masks found do not explain the observed bank count.
///
/// Carries the function found anyway for diagnosis.
#[derive(Debug, Error)]
#[error(
    "{} address functions do not match {} banks",
    .0.masks.len(),
    .0.bank_count
)]
pub struct BasisMismatch(pub AddressFunction);

/// Search for the address function of a finished grouping.
///
/// `groups` holds the physical addresses of every bank. Bits below the block
/// size never take part in a mask.
pub struct FunctionSearch<'g> {
    groups: &'g [Vec<u64>],
    skip: u32,
    config: &'g AnalysisConfig,
}

impl<'g> FunctionSearch<'g> {
    /// Prepares the search over `groups` classified at `block_size`.
    pub fn new(groups: &'g [Vec<u64>], block_size: usize, config: &'g AnalysisConfig) -> Self {
        FunctionSearch {
            groups,
            skip: log2_floor(block_size),
            config,
        }
    }

    /// Runs the mask search on `threads` workers and reduces the result to a
    /// basis.
    ///
    /// # Errors
    ///
    /// Returns [`BasisMismatch`] if 2 to the power of the basis size differs
    /// from the number of groups.
    pub fn calculate_bit_masks(&self, threads: usize) -> Result<AddressFunction, BasisMismatch> {
        let candidates = MaskCandidates::new(self.skip, self.config.max_mask_bits);
        let found = search_masks(
            self.groups,
            candidates,
            self.config.max_error_percentage,
            threads,
        );
        debug!(
            "Found {} masks before reduction: {:x?}",
            found.len(),
            found.iter().sorted().collect::<Vec<_>>()
        );
        let masks = unify_masks(found);
        let orthogonal = self.are_masks_orthogonal(&masks);
        let parities = masks
            .iter()
            .map(|&m| self.dominant_parities(m))
            .collect::<Vec<_>>();
        if orthogonal {
            debug!("Masks are orthogonal");
        } else {
            debug!("Masks are not orthogonal");
        }
        for (mask, p) in masks.iter().zip(&parities) {
            debug!("Mask 0x{:x}: {}", mask, p.iter().join(" "));
        }
        let function = AddressFunction {
            masks,
            parities,
            bank_count: self.groups.len(),
            orthogonal,
            relevant_bits: self.relevant_bits(),
        };
        info!("Found {} address functions", function.masks.len());
        for mask in &function.masks {
            info!("Address function 0x{:x} seems to be valid", mask);
        }
        if !function.is_complete() {
            warn!(
                "The number of address functions ({}) does not match the number of banks ({})",
                function.masks.len(),
                function.bank_count
            );
            return Err(BasisMismatch(function));
        }
        Ok(function)
    }

    /// Majority parity of every group under `mask`; ties count as 0.
    pub fn dominant_parities(&self, mask: u64) -> Vec<u64> {
        self.groups
            .iter()
            .map(|group| {
                let ones = group.iter().filter(|&&a| parity(a & mask) == 1).count();
                u64::from(ones > group.len() - ones)
            })
            .collect()
    }

    /// Checks every pair of `masks` for orthogonality.
    ///
    /// Two masks are orthogonal if their dominant parities agree in exactly as
    /// many groups as they disagree in.
    pub fn are_masks_orthogonal(&self, masks: &[u64]) -> bool {
        masks
            .iter()
            .map(|&m| self.dominant_parities(m))
            .tuple_combinations()
            .all(|(a, b)| {
                let agree = a.iter().zip(&b).filter(|(x, y)| x == y).count();
                agree * 2 == a.len()
            })
    }

    /// Bits that influence the bank of the lowest observed address.
    ///
    /// Every bit above the block size is flipped in the lowest address. The bit
    /// is relevant if the resulting address was classified into another bank.
    /// It is relevant as well if that address was never observed, since its
    /// influence cannot be ruled out. Returns 0 without addresses.
    pub fn relevant_bits(&self) -> u64 {
        let lowest = self
            .groups
            .iter()
            .enumerate()
            .flat_map(|(idx, g)| g.iter().map(move |&a| (a, idx)))
            .min();
        let Some((lowest, bank)) = lowest else {
            return 0;
        };
        let mut relevant = 0;
        for bit in self.skip..64 {
            let wanted = lowest ^ (1 << bit);
            let mut holders = self
                .groups
                .iter()
                .enumerate()
                .filter(|(_, g)| g.contains(&wanted))
                .map(|(idx, _)| idx)
                .peekable();
            if holders.peek().is_none() {
                debug!("No address found for bit {}", bit);
                relevant |= 1 << bit;
            } else if holders.any(|idx| idx != bank) {
                debug!("Bit {} is relevant", bit);
                relevant |= 1 << bit;
            }
        }
        debug!("Relevant bits: 0x{:x}", relevant);
        relevant
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grouping(masks: &[u64], range: std::ops::Range<u64>, step: usize) -> Vec<Vec<u64>> {
        let mut groups = vec![vec![]; 1 << masks.len()];
        for addr in range.step_by(step) {
            let bank = masks
                .iter()
                .enumerate()
                .fold(0, |b, (i, &m)| b | (parity(addr & m) << i));
            groups[bank as usize].push(addr);
        }
        groups
    }

    fn config(max_mask_bits: u32) -> AnalysisConfig {
        AnalysisConfig {
            max_mask_bits,
            threads: 2,
            ..Default::default()
        }
    }

    #[test]
    fn test_unify_keeps_independent_masks() {
        let basis = unify_masks(vec![0b0110, 0b0011, 0b0101, 0b1000, 0b0011]);
        assert_eq!(basis, vec![0b0011, 0b0101, 0b1000]);
        for (i, &m) in basis.iter().enumerate() {
            let others = basis.iter().enumerate().filter(|&(j, _)| j != i).map(|(_, &o)| o);
            for subset in others.powerset().skip(1) {
                assert_ne!(subset.into_iter().fold(0, |a, b| a ^ b), m);
            }
        }
        assert!(unify_masks(vec![]).is_empty());
    }

    #[test]
    fn test_orthogonality() {
        // dominant parities [1, 1, 0, 0] and [1, 0, 1, 0]
        let groups = vec![vec![0b11], vec![0b01], vec![0b10], vec![0b00]];
        let config = config(2);
        let search = FunctionSearch::new(&groups, 1, &config);
        assert_eq!(search.dominant_parities(0b01), vec![1, 1, 0, 0]);
        assert_eq!(search.dominant_parities(0b10), vec![1, 0, 1, 0]);
        assert!(search.are_masks_orthogonal(&[0b01, 0b10]));
        assert!(!search.are_masks_orthogonal(&[0b01, 0b01]));
        assert!(search.are_masks_orthogonal(&[0b01]));
        assert!(search.are_masks_orthogonal(&[]));
    }

    #[test]
    fn test_ties_count_as_zero() {
        let groups = vec![vec![0b1, 0b0], vec![0b1, 0b1, 0b0]];
        let config = config(2);
        let search = FunctionSearch::new(&groups, 1, &config);
        assert_eq!(search.dominant_parities(1), vec![0, 1]);
    }

    #[test]
    fn test_relevant_bits() {
        let groups = grouping(&[0x12000, 0x24000], 0x4000_0000..0x4020_0000, 0x2000);
        let config = config(2);
        let search = FunctionSearch::new(&groups, 0x2000, &config);
        let relevant = search.relevant_bits();
        for bit in [13, 14, 16, 17, 21, 31, 63] {
            assert_ne!(relevant & (1 << bit), 0, "bit {}", bit);
        }
        for bit in [15, 18, 19, 20] {
            assert_eq!(relevant & (1 << bit), 0, "bit {}", bit);
        }
        assert_eq!(relevant & 0x1fff, 0);
        let empty = FunctionSearch::new(&[], 0x2000, &config);
        assert_eq!(empty.relevant_bits(), 0);
    }

    #[test]
    fn test_calculate_bit_masks() {
        let groups = grouping(&[0x12000, 0x24000], 0x4000_0000..0x4020_0000, 0x2000);
        let config = config(4);
        let function = FunctionSearch::new(&groups, 0x2000, &config)
            .calculate_bit_masks(3)
            .expect("complete basis");
        assert_eq!(function.masks(), &[0x12000, 0x24000]);
        assert!(function.is_orthogonal());
        assert!(function.is_complete());
        assert_eq!(function.bank_count(), 4);
        for (bank, group) in groups.iter().enumerate() {
            assert!(group.iter().all(|&a| function.bank_of(a) == bank as u64));
        }
    }

    #[test]
    fn test_basis_mismatch() {
        // three masks needed, only two bits allowed
        let groups = grouping(
            &[0x12000, 0x24000, 0x48000 | 0x100000],
            0x4000_0000..0x4020_0000,
            0x2000,
        );
        let config = config(2);
        let err = FunctionSearch::new(&groups, 0x2000, &config)
            .calculate_bit_masks(2)
            .expect_err("incomplete basis");
        let BasisMismatch(function) = err;
        assert_eq!(function.masks(), &[0x12000, 0x24000]);
        assert_eq!(function.bank_count(), 8);
        assert!(!function.is_complete());
    }
}
