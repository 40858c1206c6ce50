/// Smallest integer greater than `x` with the same number of set bits.
///
/// Returns `None` for `x == 0` and when the result does not fit into 64 bits.
///
/// # Examples
///
/// ```
/// use bankfn_core::search::next_same_popcount;
///
/// assert_eq!(next_same_popcount(0b0011), Some(0b0101));
/// assert_eq!(next_same_popcount(0b0110), Some(0b1001));
/// assert_eq!(next_same_popcount(1 << 63), None);
/// ```
pub fn next_same_popcount(x: u64) -> Option<u64> {
    if x == 0 {
        return None;
    }
    let smallest = x & x.wrapping_neg();
    let ripple = x.checked_add(smallest)?;
    let ones = ((x ^ ripple) >> 2) / smallest;
    Some(ripple | ones)
}

fn low_ones(bits: u32) -> u64 {
    if bits >= 64 { u64::MAX } else { (1 << bits) - 1 }
}

/// Ordered enumeration of candidate bit masks.
///
/// Masks never use the `skip` lowest bits, which lie inside one block and
/// cannot influence the bank. Within a popcount class masks are yielded in
/// increasing order, starting with the single bit masks. Once a class is
/// exhausted the enumeration continues with the smallest mask of the next
/// class, and it ends after the class of `max_bits` bits.
#[derive(Clone, Debug)]
pub struct MaskCandidates {
    next: Option<u64>,
    skip: u32,
    max_bits: u32,
}

impl MaskCandidates {
    /// Enumerates masks above bit `skip` with at most `max_bits` bits set.
    pub fn new(skip: u32, max_bits: u32) -> Self {
        let next = (skip < 64 && max_bits > 0).then_some(1);
        MaskCandidates {
            next,
            skip,
            max_bits,
        }
    }

    /// The part of the enumeration handled by worker `worker` out of `workers`.
    ///
    /// Worker `i` receives the elements at positions `i`, `i + workers`,
    /// `i + 2 * workers` and so on. The parts of all workers are disjoint and
    /// together form the whole enumeration.
    ///
    /// # Panics
    ///
    /// Panics if `workers` is 0.
    pub fn partition(self, worker: usize, workers: usize) -> impl Iterator<Item = u64> {
        self.skip(worker).step_by(workers)
    }

    fn advance(&self, mask: u64) -> Option<u64> {
        let width = 64 - self.skip;
        let fits = |m: &u64| width == 64 || m >> width == 0;
        if let Some(next) = next_same_popcount(mask).filter(fits) {
            return Some(next);
        }
        let bits = mask.count_ones() + 1;
        (bits <= self.max_bits && bits <= width).then(|| low_ones(bits))
    }
}

impl Iterator for MaskCandidates {
    type Item = u64;

    fn next(&mut self) -> Option<u64> {
        let current = self.next?;
        self.next = self.advance(current);
        Some(current << self.skip)
    }
}
