//! # bankfn
//!
//! Command line front end that reverse engineers the DRAM bank address
//! function of the machine it runs on.
//!
//! ## Quickstart guide
//!
//! ```sh
//! # THP must be enabled ("always" or "madvise")
//! cargo build --release
//! sudo target/release/bankfn --initial-thps 4 --additional-thps 4 --output result.json
//! ```
//!
//! Root privileges are required to read physical addresses from
//! `/proc/self/pagemap`. Use `target/release/bankfn --help` to see available
//! options.
//!
//! ## Modules
//!
//! - `provider`: Selects the memory provider the blocks are allocated with.
pub mod provider;

use indicatif::MultiProgress;
use indicatif_log_bridge::LogWrapper;

/// Installs the logger and returns the progress bar container it cooperates with.
///
/// The default filter is `info`, or `debug` if `debug` is set. `RUST_LOG`
/// overrides both.
pub fn init_logging_with_progress(debug: bool) -> anyhow::Result<MultiProgress> {
    let default = if debug { "debug" } else { "info" };
    let logger =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default))
            .build();
    let progress = MultiProgress::new();
    LogWrapper::new(progress.clone(), logger).try_init()?;
    Ok(progress)
}
