use std::sync::{Mutex, PoisonError};
use std::thread;

use super::MaskCandidates;
use crate::util::parity;
use log::{debug, trace};

/// Decides whether a bit mask is a bank selection function for a grouping.
///
/// Validation only reads the grouped physical addresses, so one validator can
/// be shared by any number of workers.
#[derive(Clone, Copy, Debug)]
pub struct MaskValidator<'g> {
    groups: &'g [Vec<u64>],
    max_error_percentage: u64,
}

impl<'g> MaskValidator<'g> {
    /// Creates a validator over `groups`, one vector of physical addresses per
    /// bank. Up to `max_error_percentage` percent of every group may disagree
    /// with the parity of the rest of the group.
    pub fn new(groups: &'g [Vec<u64>], max_error_percentage: u64) -> Self {
        MaskValidator {
            groups,
            max_error_percentage,
        }
    }

    /// Checks whether `mask` is a valid and irreducible bank function.
    ///
    /// Every group must have one dominant parity under `mask`. The dominant
    /// parity is the parity of the first member unless more than the tolerated
    /// share of members disagrees with it, in which case it is inverted. The
    /// mask is rejected as soon as a group's disagreement can no longer end up
    /// within the tolerance or within the tolerance of the inverse. The mask
    /// then has to split the groups evenly into parity 0 and parity 1 and must
    /// pass [`check_modified_masks`](MaskValidator::check_modified_masks).
    pub fn check_mask(&self, mask: u64) -> bool {
        let (mut ones, mut zeroes) = (0usize, 0usize);
        for group in self.groups {
            let Some((&first, rest)) = group.split_first() else {
                continue;
            };
            let result = parity(first & mask);
            let size = group.len() as u64;
            let max_errors = size * self.max_error_percentage / 100;
            let mut errors = 0;
            for (i, &addr) in rest.iter().enumerate() {
                if parity(addr & mask) != result {
                    errors += 1;
                }
                // too many errors, and too few members left for an inversion
                let remaining = (rest.len() - i - 1) as u64;
                if errors > max_errors && errors + remaining < size - max_errors {
                    return false;
                }
            }
            if (result == 1 && errors <= max_errors) || (result == 0 && errors > max_errors) {
                ones += 1;
            } else {
                zeroes += 1;
            }
        }
        ones > 0 && ones == zeroes && self.check_modified_masks(mask)
    }

    /// Checks that no mask with a subset of the bits of `mask` behaves like it.
    ///
    /// A submask behaves like `mask` if it yields the same parity, or the
    /// inverted parity, for every observed address. Masks with one bit removed
    /// are tried first; only if none of them is equivalent are all other
    /// submasks tried.
    pub fn check_modified_masks(&self, mask: u64) -> bool {
        let single_bit_removed = (0..64u32)
            .filter(|i| mask & (1 << i) != 0)
            .map(|i| mask & !(1 << i))
            .filter(|&m| m != 0);
        for submask in single_bit_removed {
            if self.is_equivalent(mask, submask) {
                return false;
            }
        }
        let mut submask = mask.wrapping_sub(1) & mask;
        while submask != 0 {
            if self.is_equivalent(mask, submask) {
                return false;
            }
            submask = (submask - 1) & mask;
        }
        true
    }

    /// `mask` and `other` agree on all addresses, or disagree on all of them.
    fn is_equivalent(&self, mask: u64, other: u64) -> bool {
        let diff = mask ^ other;
        let mut parities = self.groups.iter().flatten().map(|&a| parity(a & diff));
        match parities.next() {
            Some(first) => parities.all(|p| p == first),
            None => true,
        }
    }
}

/// One worker of the parallel mask search.
///
/// Worker `id` out of `workers` validates its share of the candidate
/// enumeration (see [`MaskCandidates::partition`]) and appends every valid mask
/// to a shared sink.
#[derive(Clone, Debug)]
pub struct MaskSearchWorker<'g> {
    id: usize,
    workers: usize,
    candidates: MaskCandidates,
    validator: MaskValidator<'g>,
}

impl<'g> MaskSearchWorker<'g> {
    /// Creates worker `id` of `workers`.
    pub fn new(
        id: usize,
        workers: usize,
        candidates: MaskCandidates,
        validator: MaskValidator<'g>,
    ) -> Self {
        MaskSearchWorker {
            id,
            workers,
            candidates,
            validator,
        }
    }

    /// Validates all candidates of this worker. Returns the number of
    /// candidates checked.
    pub fn run(self, sink: &Mutex<Vec<u64>>) -> usize {
        let mut checked = 0;
        for mask in self.candidates.partition(self.id, self.workers) {
            checked += 1;
            if self.validator.check_mask(mask) {
                trace!("Worker {} found mask 0x{:x}", self.id, mask);
                sink.lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push(mask);
            }
        }
        debug!("Worker {} checked {} candidates", self.id, checked);
        checked
    }
}

/// Runs `threads` workers over `candidates` and collects the valid masks.
///
/// The order of the result depends on thread scheduling.
pub fn search_masks(
    groups: &[Vec<u64>],
    candidates: MaskCandidates,
    max_error_percentage: u64,
    threads: usize,
) -> Vec<u64> {
    let threads = threads.max(1);
    let validator = MaskValidator::new(groups, max_error_percentage);
    let sink = Mutex::new(vec![]);
    thread::scope(|s| {
        for id in 0..threads {
            let worker = MaskSearchWorker::new(id, threads, candidates.clone(), validator);
            let sink = &sink;
            s.spawn(move || worker.run(sink));
        }
    });
    sink.into_inner().unwrap_or_else(PoisonError::into_inner)
}
