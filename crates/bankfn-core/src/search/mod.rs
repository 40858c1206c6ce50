//! GF(2) mask search.
//!
//! Given the physical addresses of every bank, this module enumerates XOR bit
//! masks ([`MaskCandidates`]), validates them in parallel
//! ([`MaskSearchWorker`], [`search_masks`]) and reduces the survivors to a
//! basis ([`unify_masks`]) that forms the [`AddressFunction`].

mod address_function;
mod candidates;
mod mask_worker;

pub use self::address_function::{AddressFunction, BasisMismatch, FunctionSearch, unify_masks};
pub use self::candidates::{MaskCandidates, next_same_popcount};
pub use self::mask_worker::{MaskSearchWorker, MaskValidator, search_masks};
