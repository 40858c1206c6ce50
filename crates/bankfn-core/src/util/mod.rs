//! Utility functions and types used throughout bankfn.
//!
//! This module provides:
//! - Constants for memory layout ([`PAGE_SIZE`], [`PAGES_PER_THP`], etc.)
//! - [`parity`] and [`median`] helpers shared by the classifier and the mask search
//! - [`GroupBy`] trait for collection grouping operations
//! - [`NamedProgress`] for labelled progress bars

mod constants;
mod named_progress;

pub use self::constants::*;
pub use self::named_progress::NamedProgress;

use std::collections::HashMap;

/// Trait for grouping collection elements by a key function.
///
/// Used by the integration tests to bucket addresses by their recovered bank.
pub trait GroupBy<V> {
    /// Groups elements by the result of applying a function to each element.
    fn group_by<K: std::hash::Hash + std::cmp::Eq, F: Fn(&V) -> K>(
        self,
        f: F,
    ) -> HashMap<K, Vec<V>>;
}

impl<T> GroupBy<T> for Vec<T> {
    fn group_by<K: std::hash::Hash + std::cmp::Eq, F: Fn(&T) -> K>(
        self,
        f: F,
    ) -> HashMap<K, Vec<T>> {
        let mut out = HashMap::new();
        for elem in self {
            let k = f(&elem);
            out.entry(k).or_insert(vec![]).push(elem);
        }
        out
    }
}

/// XOR-parity of all bits of `x`.
///
/// # Examples
///
/// ```
/// use bankfn_core::util::parity;
///
/// assert_eq!(parity(0b1011), 1);
/// assert_eq!(parity(0b1001), 0);
/// ```
#[inline]
pub fn parity(x: u64) -> u64 {
    (x.count_ones() & 1) as u64
}

/// Median of `values` as the element at index `len / 2` after sorting in
/// descending order (the lower median for an even number of values).
///
/// Returns `None` for an empty input. The slice is reordered.
pub fn median(values: &mut [u64]) -> Option<u64> {
    if values.is_empty() {
        return None;
    }
    values.sort_unstable_by(|a, b| b.cmp(a));
    Some(values[values.len() / 2])
}

/// Floor of log2 of `n`, with `0` for `n < 2`.
pub fn log2_floor(n: usize) -> u32 {
    if n < 2 { 0 } else { n.ilog2() }
}

#[cfg(test)]
mod tests {
    use super::{GroupBy, log2_floor, median, parity};

    #[test]
    fn test_group_mod2() {
        let addrs = vec![0, 1, 2, 3, 4, 5, 6, 7, 8, 9];
        let groups = addrs.group_by(|x| x % 2);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[&0], vec![0, 2, 4, 6, 8]);
        assert_eq!(groups[&1], vec![1, 3, 5, 7, 9]);
    }

    #[test]
    fn test_parity() {
        assert_eq!(parity(0), 0);
        assert_eq!(parity(u64::MAX), 0);
        assert_eq!(parity(1 << 63), 1);
        assert_eq!(parity(0x12000), 0);
        assert_eq!(parity(0x12000 & 0x2000), 1);
    }

    #[test]
    fn test_median() {
        assert_eq!(median(&mut []), None);
        assert_eq!(median(&mut [160, 170, 155]), Some(160));
        // lower median for even counts
        assert_eq!(median(&mut [1, 2, 3, 4]), Some(2));
        assert_eq!(median(&mut [7]), Some(7));
    }

    #[test]
    fn test_log2_floor() {
        assert_eq!(log2_floor(0), 0);
        assert_eq!(log2_floor(1), 0);
        assert_eq!(log2_floor(4096), 12);
        assert_eq!(log2_floor(8191), 12);
    }
}
