use std::{
    fs::File,
    io::{BufWriter, Write},
    path::PathBuf,
    time::Instant,
};

use anyhow::{Result, bail};
use bankfn_bin::init_logging_with_progress;
use bankfn_bin::provider::{ProviderKind, alloc_memory};
use bankfn_core::memory::Memory;
use bankfn_core::report::AnalysisReport;
use bankfn_core::{AnalysisConfig, FlushKind};
use clap::Parser;
use indicatif::MultiProgress;
use log::{error, info, warn};
use serde::Serialize;

/// CLI arguments for the `bankfn` binary.
///
/// Every option left unset keeps the value of the configuration file, or the
/// built-in default if no file is given.
#[derive(Debug, Parser, Serialize, Clone)]
#[clap(about = "Reverse engineer the DRAM bank address function")]
struct CliArgs {
    /// JSON configuration file.
    #[clap(long = "config")]
    config: Option<PathBuf>,
    /// The memory provider the huge blocks are allocated with.
    #[clap(long = "allocator", value_enum, default_value = "thp")]
    allocator: ProviderKind,
    /// Number of huge blocks used to discover the banks.
    #[clap(long = "initial-thps", short = 'i')]
    initial_thps: Option<usize>,
    /// Number of huge blocks added to the discovered banks afterwards.
    #[clap(long = "additional-thps", short = 'a')]
    additional_thps: Option<usize>,
    /// Number of 4 KB pages per huge block.
    #[clap(long = "pages-per-thp", short = 'P')]
    pages_per_thp: Option<usize>,
    /// First page of each huge block that is classified.
    #[clap(long = "start-offset", short = 'S')]
    start_offset: Option<usize>,
    /// First page of each huge block that is no longer classified.
    #[clap(long = "end-offset", short = 'E')]
    end_offset: Option<usize>,
    /// Block size in bytes while the banks are discovered.
    #[clap(long = "initial-block-size", short = 'b')]
    initial_block_size: Option<usize>,
    /// Fixed block size in bytes instead of detecting it.
    #[clap(long = "block-size", short = 'B')]
    block_size: Option<usize>,
    /// Smallest block size considered by the detection.
    #[clap(long = "minimum-block-size", short = 's')]
    minimum_block_size: Option<usize>,
    /// Fixed row conflict threshold in cycles instead of calibrating it.
    #[clap(long = "row-conflict-threshold", short = 'T')]
    row_conflict_threshold: Option<u64>,
    /// Number of calibration runs.
    #[clap(long = "measurements-for-threshold", short = 't')]
    measurements_for_threshold: Option<usize>,
    /// Number of group members timed against a new address.
    #[clap(long = "address-group-comparisons", short = 'c')]
    compare_addresses: Option<usize>,
    /// Number of access rounds per timed address pair.
    #[clap(long = "address-group-measurements", short = 'm')]
    measurements_per_comparison: Option<usize>,
    /// Number of retries before an address is left unclassified.
    #[clap(long = "retries-for-grouping", short = 'r')]
    retries: Option<usize>,
    /// Percentage of addresses per bank that may contradict a mask.
    #[clap(long = "mask-error-percentage", short = 'p')]
    max_error_percentage: Option<u64>,
    /// Number of mask search threads.
    #[clap(long = "threads", short = 'n')]
    threads: Option<usize>,
    /// Maximum number of set bits in a mask candidate.
    #[clap(long = "max-mask-bits", short = 'x')]
    max_mask_bits: Option<u32>,
    /// Number of regrouping rounds before giving up.
    #[clap(long = "max-regroup-rounds")]
    max_regroup_rounds: Option<usize>,
    /// DRAM generation, selects the flush instruction (ddr3 or ddr4).
    #[clap(long = "memory-type", short = 'g')]
    memory_type: Option<FlushKind>,
    /// Seed for sampling group members.
    #[clap(long = "seed")]
    seed: Option<u64>,
    /// Do not serialize access rounds with memory fences.
    #[clap(long = "no-fences", short = 'f')]
    no_fences: bool,
    /// Enable debug output.
    #[clap(long = "debug", short = 'd')]
    debug: bool,
    /// Output file for results (JSON format).
    #[clap(long = "output")]
    output: Option<String>,
}

impl CliArgs {
    /// Loads the configuration file, if any, and applies the overrides.
    fn analysis_config(&self) -> Result<AnalysisConfig> {
        let mut config = match &self.config {
            Some(path) => AnalysisConfig::from_jsonfile(path)?,
            None => AnalysisConfig::default(),
        };
        fn set<T: Copy>(target: &mut T, value: Option<T>) {
            if let Some(value) = value {
                *target = value;
            }
        }
        set(&mut config.initial_thps, self.initial_thps);
        set(&mut config.additional_thps, self.additional_thps);
        set(&mut config.pages_per_thp, self.pages_per_thp);
        set(&mut config.start_offset, self.start_offset);
        set(&mut config.end_offset, self.end_offset);
        set(&mut config.initial_block_size, self.initial_block_size);
        set(&mut config.minimum_block_size, self.minimum_block_size);
        set(
            &mut config.measurements_for_threshold,
            self.measurements_for_threshold,
        );
        set(&mut config.compare_addresses, self.compare_addresses);
        set(
            &mut config.measurements_per_comparison,
            self.measurements_per_comparison,
        );
        set(&mut config.max_retries_for_bank_index_search, self.retries);
        set(&mut config.max_error_percentage, self.max_error_percentage);
        set(&mut config.threads, self.threads);
        set(&mut config.max_mask_bits, self.max_mask_bits);
        set(&mut config.max_regroup_rounds, self.max_regroup_rounds);
        set(&mut config.flush, self.memory_type);
        if self.block_size.is_some() {
            config.block_size = self.block_size;
        }
        if self.row_conflict_threshold.is_some() {
            config.row_conflict_threshold = self.row_conflict_threshold;
        }
        if self.seed.is_some() {
            config.seed = self.seed;
        }
        if self.no_fences {
            config.fenced = false;
        }
        config.validate()?;
        Ok(config)
    }
}

fn save_to_file(report: &AnalysisReport, filename: &str) -> Result<()> {
    let file = File::create(filename)?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer_pretty(&mut writer, report)?;
    writer.flush()?;
    info!("Results saved to {}", filename);
    Ok(())
}

#[cfg(target_arch = "x86_64")]
fn analyze(
    config: &AnalysisConfig,
    blocks: &[Memory],
    progress: MultiProgress,
) -> Result<AnalysisReport> {
    use bankfn_core::calibration::measure_row_conflict_threshold;
    use bankfn_core::classify::BankGroup;
    use bankfn_core::memory::{LinuxPageMap, RdtscOracle};
    use bankfn_core::search::{BasisMismatch, FunctionSearch};

    let oracle = RdtscOracle::new(blocks, config.flush)?;
    let threshold = match config.row_conflict_threshold {
        Some(threshold) => threshold,
        None => {
            info!("Measuring row conflict threshold...");
            measure_row_conflict_threshold(&oracle, blocks[0].base(), config)?
        }
    };
    info!("Row conflict threshold: {} cycles", threshold);

    let (initial, additional) = blocks.split_at(config.initial_thps);
    let mut banks = BankGroup::new(config, threshold, &oracle).progress(progress);
    for block in initial {
        banks.add_region(block.base(), true);
    }
    banks.regroup_until_plausible(config.max_regroup_rounds)?;
    info!("Found {} banks", banks.bank_count());

    let block_size = match config.block_size {
        Some(block_size) => banks.set_block_size_in_steps(block_size),
        None => banks.detect_block_size(),
    };
    info!("Block size: {} bytes", block_size);

    let classification_errors: usize = additional
        .iter()
        .map(|block| banks.add_region_to_existing(block.base()))
        .sum();
    if classification_errors > 0 {
        warn!(
            "{} addresses of the additional blocks matched no bank",
            classification_errors
        );
    }

    let mut pagemap = LinuxPageMap::new()?;
    let groups = banks.physical_addresses(&mut pagemap)?;
    let search = FunctionSearch::new(&groups, block_size, config);
    let function = match search.calculate_bit_masks(config.threads) {
        Ok(function) => function,
        Err(BasisMismatch(function)) => function,
    };
    Ok(AnalysisReport::new(
        &function,
        block_size,
        threshold,
        banks.seed(),
        classification_errors,
    ))
}

#[cfg(not(target_arch = "x86_64"))]
fn analyze(
    _config: &AnalysisConfig,
    _blocks: &[Memory],
    _progress: MultiProgress,
) -> Result<AnalysisReport> {
    bail!("Timing measurements are only supported on x86_64")
}

fn main() -> Result<()> {
    let args = CliArgs::parse();
    let progress = init_logging_with_progress(args.debug)?;
    let config = args.analysis_config()?;
    info!("Configuration: {:?}", config);

    let start = Instant::now();
    let blocks = alloc_memory(
        args.allocator,
        &config,
        config.initial_thps + config.additional_thps,
    )?;
    let result = analyze(&config, &blocks, progress);
    for block in blocks {
        block.dealloc();
    }
    let report = result?.with_data(serde_json::to_value(&args)?);
    info!("Analysis took {:?}", start.elapsed());

    if let Some(output) = &args.output {
        save_to_file(&report, output)?;
    }
    if !report.success() {
        error!("The address functions do not explain the number of banks");
        bail!("Bank address function incomplete");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_flags() -> Result<()> {
        let args = CliArgs::try_parse_from([
            "bankfn", "-i", "2", "-a", "3", "-b", "8192", "-B", "8192", "-T", "250", "-g",
            "ddr3", "-f", "-d",
        ])?;
        assert!(args.debug);
        let config = args.analysis_config()?;
        assert_eq!(config.initial_thps, 2);
        assert_eq!(config.additional_thps, 3);
        assert_eq!(config.initial_block_size, 8192);
        assert_eq!(config.block_size, Some(8192));
        assert_eq!(config.row_conflict_threshold, Some(250));
        assert_eq!(config.flush, FlushKind::Ddr3);
        assert!(!config.fenced);
        Ok(())
    }

    #[test]
    fn test_invalid_overrides_are_rejected() -> Result<()> {
        let args = CliArgs::try_parse_from(["bankfn", "--threads", "0"])?;
        assert!(args.analysis_config().is_err());
        assert!(CliArgs::try_parse_from(["bankfn", "-g", "ddr5"]).is_err());
        Ok(())
    }
}
