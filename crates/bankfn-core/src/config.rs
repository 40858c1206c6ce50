//! Analysis configuration.
//!
//! [`AnalysisConfig`] is loaded once (defaults, optional JSON file, command line
//! overrides), checked with [`AnalysisConfig::validate`] and then handed by
//! reference to every component. Nothing in this crate reads configuration from
//! global state.

use crate::util::{PAGE_SIZE, PAGES_PER_THP};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Read;
use std::path::Path;
use thiserror::Error;

/// Cache line flush instruction used by the timing oracle.
///
/// The DRAM generation decides which flush is reliable: DDR3 machines use the
/// serializing `clflush`, DDR4 machines the weaker-ordered `clflushopt`.
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FlushKind {
    /// `clflush`
    Ddr3,
    /// `clflushopt`
    #[default]
    Ddr4,
}

impl std::str::FromStr for FlushKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "ddr3" => Ok(FlushKind::Ddr3),
            "ddr4" => Ok(FlushKind::Ddr4),
            _ => Err(ConfigError::UnknownMemoryType(s.to_string())),
        }
    }
}

/// Errors raised for malformed configurations.
///
/// A configuration error is fatal: it is reported before any memory is
/// allocated or measured.
#[derive(Debug, Error)]
#[allow(missing_docs)]
pub enum ConfigError {
    #[error("Value 0 is invalid for parameter {0}")]
    Zero(&'static str),
    #[error("{name} must be a power of two, got {value}")]
    NotPowerOfTwo { name: &'static str, value: usize },
    #[error("minimum block size {minimum} exceeds initial block size {initial}")]
    MinimumAboveInitial { minimum: usize, initial: usize },
    #[error("block size {block_size} is below the minimum block size {minimum}")]
    BlockSizeBelowMinimum { block_size: usize, minimum: usize },
    #[error("initial block size {block_size} exceeds the huge block size {block_bytes}")]
    BlockSizeAboveHugeBlock { block_size: usize, block_bytes: usize },
    #[error("page offsets {start}..{end} do not fit into {pages} pages")]
    InvalidOffsets { start: usize, end: usize, pages: usize },
    #[error("mask error percentage {0} exceeds 100")]
    ErrorPercentage(u64),
    #[error("maximum number of mask bits must be within 1..=64, got {0}")]
    MaskBits(u32),
    #[error("DRAM type '{0}' not supported")]
    UnknownMemoryType(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Result type for configuration handling.
pub type Result<T> = std::result::Result<T, ConfigError>;

/// Parameters of one reverse engineering run.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct AnalysisConfig {
    /// Number of huge blocks used to discover the banks
    pub initial_thps: usize,
    /// Number of huge blocks added to the existing banks afterwards
    pub additional_thps: usize,
    /// Number of 4 KB pages per huge block
    pub pages_per_thp: usize,
    /// First page of each huge block that is classified
    pub start_offset: usize,
    /// First page of each huge block that is no longer classified
    pub end_offset: usize,
    /// Block size used while discovering the banks
    pub initial_block_size: usize,
    /// Fixed block size; detected from the grouping when unset
    pub block_size: Option<usize>,
    /// Smallest block size considered by the block size detection
    pub minimum_block_size: usize,
    /// Fixed row conflict threshold in cycles; calibrated when unset
    pub row_conflict_threshold: Option<u64>,
    /// Number of calibration runs whose median becomes the threshold
    pub measurements_for_threshold: usize,
    /// Number of group members timed against a new address
    pub compare_addresses: usize,
    /// Number of access rounds per timed address pair
    pub measurements_per_comparison: usize,
    /// Serialize every access round with `mfence`
    pub fenced: bool,
    /// Number of retries before an address is left unclassified
    pub max_retries_for_bank_index_search: usize,
    /// Percentage of addresses per group that may disagree with a valid mask
    pub max_error_percentage: u64,
    /// Number of mask search workers
    pub threads: usize,
    /// Maximum number of set bits in a mask candidate
    pub max_mask_bits: u32,
    /// Number of regrouping rounds before the bank count is deemed implausible
    pub max_regroup_rounds: usize,
    /// Flush instruction used while timing
    pub flush: FlushKind,
    /// Seed for the sampling of group members
    pub seed: Option<u64>,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            initial_thps: 1,
            additional_thps: 0,
            pages_per_thp: PAGES_PER_THP,
            start_offset: 0,
            end_offset: PAGES_PER_THP,
            initial_block_size: PAGE_SIZE,
            block_size: None,
            minimum_block_size: 64,
            row_conflict_threshold: None,
            measurements_for_threshold: 21,
            compare_addresses: 9,
            measurements_per_comparison: 200,
            fenced: true,
            max_retries_for_bank_index_search: 1,
            max_error_percentage: 1,
            threads: std::thread::available_parallelism().map_or(1, |n| n.get()),
            max_mask_bits: 7,
            max_regroup_rounds: 64,
            flush: FlushKind::default(),
            seed: None,
        }
    }
}

impl AnalysisConfig {
    /// Loads a configuration from a JSON file. Missing keys keep their defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed. The result is not
    /// validated yet.
    pub fn from_jsonfile(filepath: impl AsRef<Path>) -> Result<AnalysisConfig> {
        let mut file = File::open(filepath.as_ref())?;
        let mut contents = String::new();
        file.read_to_string(&mut contents)?;
        let config: AnalysisConfig = serde_json::from_str(&contents)?;
        Ok(config)
    }

    /// Size of one huge block in bytes.
    pub fn huge_block_bytes(&self) -> usize {
        self.pages_per_thp * PAGE_SIZE
    }

    /// Checks the configuration for values the analysis cannot work with.
    ///
    /// # Errors
    ///
    /// Returns the first violated rule.
    pub fn validate(&self) -> Result<()> {
        let nonzero = [
            ("initial-thps", self.initial_thps),
            ("pages-per-thp", self.pages_per_thp),
            ("end-offset", self.end_offset),
            ("initial-block-size", self.initial_block_size),
            ("minimum-block-size", self.minimum_block_size),
            ("measurements-for-threshold", self.measurements_for_threshold),
            ("address-group-comparisons", self.compare_addresses),
            ("address-group-measurements", self.measurements_per_comparison),
            ("threads", self.threads),
            ("max-regroup-rounds", self.max_regroup_rounds),
        ];
        for (name, value) in nonzero {
            if value == 0 {
                return Err(ConfigError::Zero(name));
            }
        }
        for (name, value) in [
            ("initial-block-size", self.initial_block_size),
            ("minimum-block-size", self.minimum_block_size),
        ] {
            if !value.is_power_of_two() {
                return Err(ConfigError::NotPowerOfTwo { name, value });
            }
        }
        if self.minimum_block_size > self.initial_block_size {
            return Err(ConfigError::MinimumAboveInitial {
                minimum: self.minimum_block_size,
                initial: self.initial_block_size,
            });
        }
        if self.initial_block_size > self.huge_block_bytes() {
            return Err(ConfigError::BlockSizeAboveHugeBlock {
                block_size: self.initial_block_size,
                block_bytes: self.huge_block_bytes(),
            });
        }
        match self.block_size {
            Some(0) => return Err(ConfigError::Zero("block-size")),
            Some(block_size) if block_size < self.minimum_block_size => {
                return Err(ConfigError::BlockSizeBelowMinimum {
                    block_size,
                    minimum: self.minimum_block_size,
                });
            }
            _ => {}
        }
        if self.row_conflict_threshold == Some(0) {
            return Err(ConfigError::Zero("row-conflict-threshold"));
        }
        if self.start_offset >= self.end_offset || self.end_offset > self.pages_per_thp {
            return Err(ConfigError::InvalidOffsets {
                start: self.start_offset,
                end: self.end_offset,
                pages: self.pages_per_thp,
            });
        }
        if self.max_error_percentage > 100 {
            return Err(ConfigError::ErrorPercentage(self.max_error_percentage));
        }
        if !(1..=64).contains(&self.max_mask_bits) {
            return Err(ConfigError::MaskBits(self.max_mask_bits));
        }
        Ok(())
    }
}
