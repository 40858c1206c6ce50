//! # bankfn
//!
//! Timing based reverse engineering of DRAM bank address functions.
//!
//! This crate bundles [`bankfn_core`] with the memory providers, which are
//! enabled by the `thp` and `hugepage` features.
//!
//! ```no_run
//! use bankfn::AnalysisConfig;
//!
//! let config = AnalysisConfig::default();
//! assert!(config.validate().is_ok());
//! ```

pub use bankfn_core::*;

#[cfg(feature = "hugepage")]
pub use bankfn_hugepage as hugepage;
#[cfg(feature = "thp")]
pub use bankfn_thp as thp;
