//! Timing based bank classification.
//!
//! [`BankGroup`] partitions addresses into [`AddressGroup`]s, one per inferred
//! bank, by timing every new address against samples of the existing groups.
//! Misclassifications caused by measurement noise are repaired by regrouping,
//! and the granularity of the bank mapping is discovered by
//! [`BankGroup::detect_block_size`].

mod address_group;
mod bank_group;

pub use self::address_group::AddressGroup;
pub use self::bank_group::BankGroup;

use thiserror::Error;

/// Errors that can occur during classification.
///
/// Addresses that match no group are not an error; they are counted and
/// reported by the insertion functions.
#[derive(Debug, Error)]
pub enum ClassifyError {
    /// Regrouping did not arrive at a power of two number of banks
    #[error("{banks} banks after {rounds} regrouping rounds, expected a power of two")]
    ImplausibleBankCount {
        /// Number of groups after the last round
        banks: usize,
        /// Number of rounds performed
        rounds: usize,
    },
}
