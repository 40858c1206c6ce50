//! The `memory` module provides the measurement-side abstractions the classifier builds on.
//!
//! - `Memory`: a mapped block of (huge page backed) memory.
//! - `TimingOracle`: relative access latency between two addresses.
//! - `RdtscOracle`: the x86_64 implementation of `TimingOracle`.
//! - `AddressTranslator`: resolution of virtual to physical addresses.
//! - `LinuxPageMap`: `AddressTranslator` based on `/proc/self/pagemap`.
//! - `IdentityTranslator`: `AddressTranslator` for synthetic address spaces.
mod memblock;
mod timer;
mod virt_to_phys;

pub use self::memblock::Memory;
pub use self::timer::TimingOracle;
#[cfg(target_arch = "x86_64")]
pub use self::timer::{RdtscOracle, TimerError};
pub use self::virt_to_phys::{
    AddressTranslator, IdentityTranslator, LinuxPageMap, LinuxPageMapError, PhysAddr,
};
