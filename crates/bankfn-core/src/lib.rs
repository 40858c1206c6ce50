//! # bankfn core
//!
//! `bankfn-core` reverse engineers the function a memory controller uses to map
//! physical addresses to DRAM banks. It only needs the timing side channel that
//! is observable from user space: two addresses in the same bank but in
//! different rows take longer to access alternately than two addresses in
//! different banks.
//!
//! ## Architecture Overview
//!
//! - [`memory::TimingOracle`] - relative access latency of two addresses. The
//!   x86_64 implementation is [`memory::RdtscOracle`]; tests drive the
//!   classifier with deterministic oracles instead.
//!
//! - [`provider::MemoryProvider`] - obtains the huge page backed blocks the
//!   measurements run in.
//!
//! - [`memory::AddressTranslator`] - virtual to physical address translation.
//!
//! ## Main Components
//!
//! - [`calibration`] - derives the row conflict threshold from latency
//!   histograms.
//!
//! - [`classify::BankGroup`] - partitions addresses into banks, regroups them
//!   until the bank count is plausible and detects the block size.
//!
//! - [`search::FunctionSearch`] - searches XOR masks that are constant within
//!   every bank in parallel and reduces them to a basis, the
//!   [`search::AddressFunction`].
//!
//! - [`report::AnalysisReport`] - serializable summary of a run.
//!
//! ## Platform Support
//!
//! The hardware timing oracle requires x86_64 with `rdtscp`. Physical address
//! translation uses `/proc/self/pagemap` and requires root privileges.

#![warn(missing_docs)]

pub mod calibration;
pub mod classify;
pub mod config;
pub mod memory;
pub mod provider;
pub mod report;
pub mod search;
pub mod util;

pub use crate::config::{AnalysisConfig, ConfigError, FlushKind};
