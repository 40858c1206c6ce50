use std::collections::{BTreeMap, HashSet};

use super::{AddressGroup, ClassifyError};
use crate::config::AnalysisConfig;
use crate::memory::{AddressTranslator, TimingOracle};
use crate::util::{NamedProgress, PAGE_SIZE};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use log::{debug, info, warn};
use rand::SeedableRng;
use rand::rngs::StdRng;

/// Partition of the observed addresses into banks.
///
/// The position of a group is its inferred bank index. Addresses are assigned
/// by timing them against samples of every group, see
/// [`bank_index_for`](BankGroup::bank_index_for). All measurements go through
/// the one [`TimingOracle`] the classifier owns, and classification runs on a
/// single thread.
pub struct BankGroup<'a, T: TimingOracle> {
    groups: Vec<AddressGroup>,
    threshold: u64,
    block_size: usize,
    config: &'a AnalysisConfig,
    oracle: T,
    rng: StdRng,
    seed: u64,
    progress: Option<MultiProgress>,
}

impl<'a, T: TimingOracle> BankGroup<'a, T> {
    /// Creates an empty classifier at the configured initial block size.
    ///
    /// Group members are sampled with a generator seeded from `config.seed`,
    /// or from a random seed if none is configured.
    pub fn new(config: &'a AnalysisConfig, threshold: u64, oracle: T) -> Self {
        let seed = config.seed.unwrap_or_else(rand::random);
        debug!("Sampling group members with seed {}", seed);
        BankGroup {
            groups: vec![],
            threshold,
            block_size: config.initial_block_size,
            config,
            oracle,
            rng: StdRng::seed_from_u64(seed),
            seed,
            progress: None,
        }
    }

    /// Reports the progress of long running operations to `progress`.
    pub fn progress(mut self, progress: MultiProgress) -> Self {
        self.progress = Some(progress);
        self
    }

    /// The groups found so far.
    pub fn groups(&self) -> &[AddressGroup] {
        &self.groups
    }

    /// Number of groups, i.e. the number of banks assumed right now.
    pub fn bank_count(&self) -> usize {
        self.groups.len()
    }

    /// Whether the number of groups is a plausible bank count.
    pub fn is_power_of_two(&self) -> bool {
        self.bank_count().is_power_of_two()
    }

    /// Current block size in bytes.
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Row conflict threshold in cycles.
    pub fn threshold(&self) -> u64 {
        self.threshold
    }

    /// Seed used for sampling group members.
    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Returns the index of the group `addr` conflicts with.
    ///
    /// Every group scores the median latency of `addr` against a sample of its
    /// members. Out of the groups scoring at least the threshold the highest
    /// score wins. If no group qualifies the search is repeated up to
    /// `max_retries_for_bank_index_search` times before giving up.
    pub fn bank_index_for(&mut self, addr: usize) -> Option<usize> {
        for _ in 0..=self.config.max_retries_for_bank_index_search {
            let mut best: Option<(usize, u64)> = None;
            for (idx, group) in self.groups.iter().enumerate() {
                let time = group.compare_address_timing(addr, &self.oracle, &mut self.rng);
                if time >= self.threshold && best.is_none_or(|(_, t)| time > t) {
                    best = Some((idx, time));
                }
            }
            if let Some((idx, _)) = best {
                return Some(idx);
            }
        }
        None
    }

    /// Adds `addr` to the group it conflicts with.
    ///
    /// If no group matches and `allow_new_groups` is set, `addr` opens a new
    /// group. Returns `false` whenever no existing group matched.
    pub fn classify(&mut self, addr: usize, allow_new_groups: bool) -> bool {
        match self.bank_index_for(addr) {
            Some(idx) => {
                self.groups[idx].push(addr);
                true
            }
            None => {
                if allow_new_groups {
                    self.groups
                        .push(AddressGroup::new(addr, self.block_size, self.config));
                }
                false
            }
        }
    }

    /// Adds `addr`, creating a new group if necessary.
    pub fn add_address(&mut self, addr: usize) -> bool {
        self.classify(addr, true)
    }

    /// Adds `addr` to an existing group only.
    pub fn add_address_to_existing(&mut self, addr: usize) -> bool {
        self.classify(addr, false)
    }

    /// Classifies every block of the huge block at `base` between the
    /// configured start and end page.
    ///
    /// Returns the number of addresses that matched no existing group.
    pub fn add_region(&mut self, base: usize, allow_new_groups: bool) -> usize {
        let start = base + self.config.start_offset * PAGE_SIZE;
        let end = base + self.config.end_offset * PAGE_SIZE;
        let addrs = (start..end).step_by(self.block_size).collect::<Vec<_>>();
        let p = self.progress.as_ref().map(|p| {
            p.add(
                ProgressBar::new(addrs.len() as u64)
                    .with_style(ProgressStyle::named_bar("Classifying block")),
            )
        });
        let mut errors = 0;
        for addr in addrs {
            if !self.classify(addr, allow_new_groups) {
                errors += 1;
            }
            if let Some(p) = &p {
                p.inc(1);
            }
        }
        if let Some(p) = p {
            p.finish_and_clear();
        }
        debug!(
            "Added block at 0x{:x}, {} groups, {} unmatched addresses",
            base,
            self.groups.len(),
            errors
        );
        errors
    }

    /// Adds the huge block at `base` to the existing groups only.
    ///
    /// Returns the number of addresses that were left out.
    pub fn add_region_to_existing(&mut self, base: usize) -> usize {
        self.add_region(base, false)
    }

    /// Removes every group once and classifies its members again.
    ///
    /// Groups are drained from the front, so addresses are reinserted against
    /// a mix of already regrouped and not yet regrouped groups. A single pass
    /// does not guarantee a plausible bank count.
    pub fn regroup_all_addresses(&mut self) {
        let rounds = self.groups.len();
        let p = self.progress.as_ref().map(|p| {
            p.add(ProgressBar::new(rounds as u64).with_style(ProgressStyle::named_bar("Regrouping")))
        });
        for _ in 0..rounds {
            if self.groups.is_empty() {
                break;
            }
            let group = self.groups.remove(0);
            for addr in group.into_addresses() {
                self.add_address(addr);
            }
            if let Some(p) = &p {
                p.inc(1);
            }
        }
        if let Some(p) = p {
            p.finish_and_clear();
        }
        debug!("Regrouping done, {} groups", self.groups.len());
    }

    /// Regroups until the number of groups is a power of two.
    ///
    /// Returns the number of rounds it took.
    ///
    /// # Errors
    ///
    /// Returns [`ClassifyError::ImplausibleBankCount`] if the bank count is
    /// still not a power of two after `max_rounds` rounds.
    pub fn regroup_until_plausible(&mut self, max_rounds: usize) -> Result<usize, ClassifyError> {
        for round in 1..=max_rounds {
            self.regroup_all_addresses();
            debug!("Regrouping round {}: {} groups", round, self.groups.len());
            if self.is_power_of_two() {
                info!("Assuming {} banks after {} rounds", self.groups.len(), round);
                return Ok(round);
            }
        }
        Err(ClassifyError::ImplausibleBankCount {
            banks: self.groups.len(),
            rounds: max_rounds,
        })
    }

    /// Guesses the block size from the current grouping.
    ///
    /// Within every group, runs of addresses exactly one block apart are
    /// counted. The most frequent run length times the current block size is
    /// the guess; ties resolve to the shorter run. Returns 0 without groups.
    pub fn guess_block_size(&mut self) -> usize {
        let block_size = self.block_size;
        let mut runs: BTreeMap<usize, usize> = BTreeMap::new();
        for group in &mut self.groups {
            let addrs = group.addresses_mut();
            addrs.sort_unstable();
            let Some((&first, rest)) = addrs.split_first() else {
                continue;
            };
            let (mut last, mut run) = (first, 1);
            for &addr in rest {
                if addr == last + block_size {
                    run += 1;
                } else {
                    *runs.entry(run).or_default() += 1;
                    run = 1;
                }
                last = addr;
            }
            *runs.entry(run).or_default() += 1;
        }
        let mut guess = (0, 0);
        for (&run, &count) in &runs {
            if count > guess.1 {
                guess = (run, count);
            }
        }
        guess.0 * block_size
    }

    /// Detects the block size and switches to it.
    ///
    /// As long as the guess equals the current size, the size is halved (down
    /// to the configured minimum) and the grouping refined. The first guess that
    /// differs from the current size is committed. If the minimum is reached
    /// first, the block size stays at the minimum.
    pub fn detect_block_size(&mut self) -> usize {
        let minimum = self.config.minimum_block_size;
        while self.guess_block_size() == self.block_size && self.block_size > minimum {
            debug!(
                "Block size {} is not below the actual block size, trying {}",
                self.block_size,
                self.block_size / 2
            );
            self.set_block_size(self.block_size / 2);
        }
        let guess = self.guess_block_size();
        if guess == 0 {
            warn!("No groups to guess the block size from, keeping {}", self.block_size);
        } else if guess == self.block_size {
            warn!(
                "Block size did not stabilize before reaching the minimum, using {}",
                self.block_size
            );
        } else {
            self.set_block_size(guess);
        }
        self.block_size
    }

    /// Moves towards `target` one doubling or halving at a time.
    ///
    /// Falls back to [`detect_block_size`](BankGroup::detect_block_size) if
    /// either the target or the current size is not a power of two.
    pub fn set_block_size_in_steps(&mut self, target: usize) -> usize {
        if target == self.block_size {
            return self.block_size;
        }
        if !target.is_power_of_two() || !self.block_size.is_power_of_two() {
            warn!(
                "Cannot step from block size {} to {}, detecting the block size instead",
                self.block_size, target
            );
            return self.detect_block_size();
        }
        while self.block_size != target {
            let next = if target > self.block_size {
                self.block_size * 2
            } else {
                self.block_size / 2
            };
            debug!("Changing block size to {}", next);
            self.set_block_size(next);
        }
        self.block_size
    }

    /// Switches the grouping to `block_size`.
    ///
    /// Shrinking classifies the new addresses between the old block boundaries
    /// into the existing groups. Growing keeps only the addresses aligned to the
    /// new size whose whole run of old-size successors is in the same group.
    pub fn set_block_size(&mut self, block_size: usize) {
        if block_size == 0 {
            return;
        }
        if block_size < self.block_size {
            self.expand(self.block_size, block_size);
        } else if block_size > self.block_size {
            self.simplify(self.block_size, block_size);
        }
        for group in &mut self.groups {
            group.set_block_size(block_size);
        }
        self.block_size = block_size;
        let empty = self.groups.iter().filter(|g| g.is_empty()).count();
        if empty > 0 {
            warn!(
                "{} of {} groups are empty at block size {}, the block size is likely too large",
                empty,
                self.groups.len(),
                block_size
            );
        }
    }

    fn expand(&mut self, old: usize, new: usize) {
        let aligned = self
            .groups
            .iter()
            .flat_map(|g| g.addresses().iter().copied().filter(|a| a % old == 0))
            .collect::<Vec<_>>();
        let (mut added, mut errors) = (0, 0);
        for addr in aligned {
            for offset in (new..old).step_by(new) {
                if !self.add_address_to_existing(addr + offset) {
                    errors += 1;
                }
                added += 1;
            }
        }
        debug!(
            "Expanded blocks from {} to {}: {} new addresses, {} errors",
            old, new, added, errors
        );
    }

    fn simplify(&mut self, old: usize, new: usize) {
        let steps = new / old;
        let mut removed = 0;
        for group in &mut self.groups {
            let members = group.addresses().iter().copied().collect::<HashSet<_>>();
            let addrs = group.addresses_mut();
            let before = addrs.len();
            addrs.retain(|&a| a % new == 0 && (1..steps).all(|k| members.contains(&(a + k * old))));
            addrs.sort_unstable();
            removed += before - addrs.len();
        }
        debug!(
            "Simplified blocks from {} to {}: removed {} addresses",
            old, new, removed
        );
    }

    /// Translates every member to its physical address, keeping the grouping.
    ///
    /// # Errors
    ///
    /// Returns the first translation error.
    pub fn physical_addresses<A: AddressTranslator>(
        &self,
        translator: &mut A,
    ) -> Result<Vec<Vec<u64>>, A::Error> {
        self.groups
            .iter()
            .map(|group| {
                group
                    .addresses()
                    .iter()
                    .map(|&addr| translator.translate(addr).map(u64::from))
                    .collect()
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::IdentityTranslator;
    use crate::util::parity;
    use std::collections::HashMap;

    const THRESHOLD: u64 = 300;

    /// Latencies of a DRAM whose bank is selected by XOR masks.
    struct MaskOracle {
        masks: Vec<u64>,
    }

    impl MaskOracle {
        fn bank(&self, addr: usize) -> Vec<u64> {
            self.masks.iter().map(|m| parity(addr as u64 & m)).collect()
        }
    }

    impl TimingOracle for MaskOracle {
        fn measure(&self, a: usize, b: usize, _rounds: usize, _fenced: bool) -> u64 {
            if self.bank(a) == self.bank(b) {
                THRESHOLD + 100
            } else {
                THRESHOLD - 100
            }
        }
    }

    /// Latencies given per group member, independent of the candidate.
    struct TableOracle {
        times: HashMap<usize, u64>,
    }

    impl TimingOracle for TableOracle {
        fn measure(&self, a: usize, _b: usize, _rounds: usize, _fenced: bool) -> u64 {
            self.times[&a]
        }
    }

    fn config() -> AnalysisConfig {
        AnalysisConfig {
            seed: Some(0),
            compare_addresses: 3,
            end_offset: 64,
            ..Default::default()
        }
    }

    fn group_of(addrs: &[usize], config: &AnalysisConfig) -> AddressGroup {
        let mut group = AddressGroup::new(addrs[0], config.initial_block_size, config);
        addrs[1..].iter().for_each(|&a| group.push(a));
        group
    }

    #[test]
    fn test_highest_score_above_threshold_wins() {
        let config = config();
        let times = HashMap::from([
            (0x1000, 160),
            (0x2000, 170),
            (0x3000, 155),
            (0x11000, 100),
            (0x12000, 120),
            (0x21000, 149),
        ]);
        let mut banks = BankGroup::new(&config, 150, TableOracle { times });
        banks.groups = vec![
            group_of(&[0x11000, 0x12000], &config),
            group_of(&[0x1000, 0x2000, 0x3000], &config),
            group_of(&[0x21000], &config),
        ];
        assert_eq!(banks.bank_index_for(0x9000), Some(1));
        assert!(banks.add_address_to_existing(0x9000));
        assert_eq!(banks.groups()[1].len(), 4);
    }

    #[test]
    fn test_unmatched_address() {
        let config = config();
        let times = HashMap::from([(0x1000, 100)]);
        let mut banks = BankGroup::new(&config, 150, TableOracle { times });
        assert!(!banks.add_address(0x1000));
        assert_eq!(banks.bank_count(), 1);
        assert!(!banks.add_address_to_existing(0x5000));
        assert_eq!(banks.bank_count(), 1);
        assert!(!banks.add_address(0x5000));
        assert_eq!(banks.bank_count(), 2);
    }

    #[test]
    fn test_add_region() {
        let config = config();
        let oracle = MaskOracle {
            masks: vec![1 << 12, 1 << 13],
        };
        let mut banks = BankGroup::new(&config, THRESHOLD, oracle);
        // the first address of every bank opens a group
        assert_eq!(banks.add_region(0x4000_0000, true), 4);
        assert_eq!(banks.bank_count(), 4);
        assert!(banks.groups().iter().all(|g| g.len() == 16));
        assert_eq!(banks.add_region_to_existing(0x4020_0000), 0);
        assert!(banks.groups().iter().all(|g| g.len() == 32));
    }

    #[test]
    fn test_regroup_merges_split_bank() {
        let config = config();
        let oracle = MaskOracle {
            masks: vec![1 << 12],
        };
        let mut banks = BankGroup::new(&config, THRESHOLD, oracle);
        banks.groups = vec![
            group_of(&[0x0000, 0x2000], &config),
            group_of(&[0x4000, 0x6000], &config),
            group_of(&[0x1000, 0x3000, 0x5000], &config),
        ];
        assert!(!banks.is_power_of_two());
        assert_eq!(banks.regroup_until_plausible(4).ok(), Some(1));
        assert_eq!(banks.bank_count(), 2);
        let mut sizes = banks.groups().iter().map(AddressGroup::len).collect::<Vec<_>>();
        sizes.sort();
        assert_eq!(sizes, vec![3, 4]);
    }

    #[test]
    fn test_regroup_gives_up() {
        struct ThreeBanks;
        impl TimingOracle for ThreeBanks {
            fn measure(&self, a: usize, b: usize, _: usize, _: bool) -> u64 {
                if (a / PAGE_SIZE) % 3 == (b / PAGE_SIZE) % 3 {
                    THRESHOLD + 100
                } else {
                    THRESHOLD - 100
                }
            }
        }
        let config = config();
        let mut banks = BankGroup::new(&config, THRESHOLD, ThreeBanks);
        banks.add_region(0, true);
        assert_eq!(banks.bank_count(), 3);
        assert!(matches!(
            banks.regroup_until_plausible(3),
            Err(ClassifyError::ImplausibleBankCount { banks: 3, rounds: 3 })
        ));
    }

    #[test]
    fn test_guess_counts_runs() {
        let config = config();
        let mut banks = BankGroup::new(&config, THRESHOLD, MaskOracle { masks: vec![] });
        banks.groups = vec![
            group_of(&[0x0000, 0x1000, 0x4000, 0x5000], &config),
            group_of(&[0x2000, 0x3000, 0x8000], &config),
        ];
        // runs of two: 3, runs of one: 1
        assert_eq!(banks.guess_block_size(), 0x2000);
        banks.groups = vec![group_of(&[0x0000, 0x1000, 0x4000], &config)];
        // tie between one and two resolves to the shorter run
        assert_eq!(banks.guess_block_size(), 0x1000);
        banks.groups.clear();
        assert_eq!(banks.guess_block_size(), 0);
    }

    #[test]
    fn test_grow_and_shrink() {
        let config = config();
        // 8 KB blocks: bit 12 does not select the bank
        let oracle = MaskOracle {
            masks: vec![1 << 13, 1 << 14],
        };
        let mut banks = BankGroup::new(&config, THRESHOLD, oracle);
        banks.add_region(0, true);
        assert_eq!(banks.bank_count(), 4);
        assert_eq!(banks.detect_block_size(), 0x2000);
        assert!(banks.groups().iter().all(|g| g.len() == 8));
        assert!(
            banks
                .groups()
                .iter()
                .flat_map(|g| g.addresses())
                .all(|a| a % 0x2000 == 0)
        );
        assert_eq!(banks.set_block_size_in_steps(0x800), 0x800);
        assert!(banks.groups().iter().all(|g| g.len() == 32));
        assert!(banks.groups().iter().all(|g| g.block_size() == 0x800));
        assert_eq!(banks.set_block_size_in_steps(0x2000), 0x2000);
        assert!(banks.groups().iter().all(|g| g.len() == 8));
    }

    #[test]
    fn test_simplify_drops_broken_runs() {
        let config = config();
        let mut banks = BankGroup::new(&config, THRESHOLD, MaskOracle { masks: vec![] });
        banks.groups = vec![
            group_of(&[0x0000, 0x1000, 0x2000, 0x5000, 0x6000], &config),
            group_of(&[0x3000, 0x4000, 0x7000], &config),
        ];
        banks.set_block_size(0x2000);
        assert_eq!(banks.groups()[0].addresses(), &[0x0000]);
        assert!(banks.groups()[1].is_empty());
    }

    #[test]
    fn test_block_size_stays_at_minimum() {
        let config = AnalysisConfig {
            initial_block_size: 128,
            minimum_block_size: 128,
            end_offset: 1,
            ..config()
        };
        // every 128 byte block switches the bank
        let oracle = MaskOracle {
            masks: vec![1 << 7],
        };
        let mut banks = BankGroup::new(&config, THRESHOLD, oracle);
        banks.add_region(0, true);
        assert_eq!(banks.bank_count(), 2);
        assert_eq!(banks.detect_block_size(), 128);
        assert_eq!(banks.block_size(), 128);
        assert!(banks.groups().iter().all(|g| g.len() == 16));
    }

    #[test]
    fn test_growing_past_block_size_empties_groups() {
        let config = config();
        let oracle = MaskOracle {
            masks: vec![1 << 13, 1 << 14],
        };
        let mut banks = BankGroup::new(&config, THRESHOLD, oracle);
        banks.add_region(0, true);
        assert_eq!(banks.detect_block_size(), 0x2000);
        // no 16 KB block lies within a single bank
        assert_eq!(banks.set_block_size_in_steps(0x4000), 0x4000);
        assert_eq!(banks.bank_count(), 4);
        assert!(banks.groups().iter().all(AddressGroup::is_empty));
    }

    #[test]
    fn test_physical_addresses() {
        let config = config();
        let mut banks = BankGroup::new(&config, THRESHOLD, MaskOracle { masks: vec![] });
        banks.groups = vec![group_of(&[0x1000, 0x3000], &config), group_of(&[0x2000], &config)];
        let phys = banks.physical_addresses(&mut IdentityTranslator);
        assert_eq!(phys, Ok(vec![vec![0x1000, 0x3000], vec![0x2000]]));
    }
}
