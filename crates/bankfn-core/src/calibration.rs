//! Row conflict threshold calibration.
//!
//! One huge block spans every bank many times, so timing its first byte against
//! the first byte of every page yields two clusters of latencies: fast pairs in
//! different banks and slow pairs in the same bank (row conflicts). The
//! threshold is put in the gap between the two clusters of a histogram.

use crate::config::AnalysisConfig;
use crate::memory::TimingOracle;
use crate::util::{PAGE_SIZE, THRESHOLD_BIN_WIDTH, median};
use log::{debug, info, trace, warn};
use thiserror::Error;

/// Errors that can occur during threshold calibration.
#[derive(Debug, Error)]
pub enum ThresholdError {
    /// None of the histograms showed a gap between the two latency clusters
    #[error("no latency gap found in {0} calibration runs")]
    NoGap(usize),
}

/// Measures one threshold candidate over the block starting at `base`.
///
/// The timings of `base` against each of the `pages` pages are bucketed into
/// bins of [`THRESHOLD_BIN_WIDTH`] cycles. Walking the bins upward, the first
/// bin holding more than two samples that is separated from the previous such
/// bin by at least two bins, once three quarters of all samples have been seen,
/// marks the slow cluster. The candidate lies halfway between the two bins.
///
/// Returns `None` if the histogram has no such gap.
pub fn measure_single_threshold<T: TimingOracle>(
    oracle: &T,
    base: usize,
    pages: usize,
    rounds: usize,
    fenced: bool,
) -> Option<u64> {
    if pages == 0 {
        return None;
    }
    let mut times = (0..pages)
        .map(|j| oracle.measure(base, base + j * PAGE_SIZE, rounds, fenced))
        .collect::<Vec<_>>();
    times.sort_unstable();
    threshold_from_sorted(&times)
}

fn threshold_from_sorted(times: &[u64]) -> Option<u64> {
    let (first, last) = (*times.first()?, *times.last()?);
    let lowest = first / THRESHOLD_BIN_WIDTH;
    let mut bins = vec![0usize; (last / THRESHOLD_BIN_WIDTH - lowest + 1) as usize];
    for time in times {
        bins[(time / THRESHOLD_BIN_WIDTH - lowest) as usize] += 1;
    }

    let mut last_value = 0u64;
    let mut found = 0usize;
    let mut threshold = None;
    for (i, &count) in bins.iter().enumerate() {
        let i = i as u64;
        found += count;
        if count > 2 {
            if threshold.is_none() && last_value + 2 < i && found >= times.len() * 3 / 4 {
                threshold = Some(((i + last_value) / 2 + lowest) * THRESHOLD_BIN_WIDTH);
            }
            last_value = i;
        }
        trace!(
            "{:4}: {}",
            (i + lowest) * THRESHOLD_BIN_WIDTH,
            "#".repeat(count.min(200))
        );
    }
    threshold
}

/// Calibrates the row conflict threshold.
///
/// Runs [`measure_single_threshold`] `measurements_for_threshold` times over
/// the block at `base` and returns the median of the successful runs.
///
/// # Errors
///
/// Returns [`ThresholdError::NoGap`] if no run produced a candidate.
pub fn measure_row_conflict_threshold<T: TimingOracle>(
    oracle: &T,
    base: usize,
    config: &AnalysisConfig,
) -> Result<u64, ThresholdError> {
    let runs = config.measurements_for_threshold;
    let mut candidates = Vec::with_capacity(runs);
    for run in 0..runs {
        match measure_single_threshold(
            oracle,
            base,
            config.pages_per_thp,
            config.measurements_per_comparison,
            config.fenced,
        ) {
            Some(candidate) => {
                debug!("Threshold run {}: {} cycles", run, candidate);
                candidates.push(candidate);
            }
            None => warn!("Threshold run {} found no latency gap", run),
        }
    }
    let threshold = median(&mut candidates).ok_or(ThresholdError::NoGap(runs))?;
    info!(
        "Row conflict threshold: {} cycles ({}/{} runs usable)",
        threshold,
        candidates.len(),
        runs
    );
    Ok(threshold)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Every 16th page conflicts with page 0.
    struct StripedOracle;

    impl TimingOracle for StripedOracle {
        fn measure(&self, a: usize, b: usize, _rounds: usize, _fenced: bool) -> u64 {
            if ((b - a) / PAGE_SIZE) % 16 == 0 { 320 } else { 205 }
        }
    }

    #[test]
    fn test_gap_between_clusters() {
        let threshold = measure_single_threshold(&StripedOracle, 0, 512, 1, true);
        // bins 20 and 32, lowest bin 20: ((12 + 0) / 2 + 20) * 10
        assert_eq!(threshold, Some(260));
    }

    #[test]
    fn test_no_gap() {
        let times = vec![200; 64];
        assert_eq!(threshold_from_sorted(&times), None);
        let mut times = vec![200; 60];
        times.extend([210, 210, 210, 220]);
        assert_eq!(threshold_from_sorted(&times), None);
    }

    #[test]
    fn test_slow_cluster_must_follow_bulk() {
        // the gap after the first quarter of samples is ignored
        let mut times = vec![100; 10];
        times.extend(vec![200; 40]);
        times.extend(vec![300; 18]);
        assert_eq!(threshold_from_sorted(&times), Some(250));
    }

    #[test]
    fn test_median_of_runs() -> anyhow::Result<()> {
        let config = AnalysisConfig {
            measurements_for_threshold: 5,
            ..Default::default()
        };
        assert_eq!(
            measure_row_conflict_threshold(&StripedOracle, 0, &config)?,
            260
        );
        Ok(())
    }

    #[test]
    fn test_calibration_fails_without_gap() {
        struct Flat;
        impl TimingOracle for Flat {
            fn measure(&self, _: usize, _: usize, _: usize, _: bool) -> u64 {
                180
            }
        }
        let config = AnalysisConfig {
            measurements_for_threshold: 3,
            ..Default::default()
        };
        assert!(matches!(
            measure_row_conflict_threshold(&Flat, 0, &config),
            Err(ThresholdError::NoGap(3))
        ));
    }
}
