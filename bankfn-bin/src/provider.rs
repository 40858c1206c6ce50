//! Memory provider selection.
//!
//! To add a new memory provider, implement
//! [`bankfn_core::provider::MemoryProvider`] for it and add a variant to
//! [`ProviderKind`].

use anyhow::bail;
use bankfn_core::AnalysisConfig;
use bankfn_core::memory::Memory;
use bankfn_core::provider::{MemoryProvider, alloc_blocks};
use bankfn_hugepage::HugepageProvider;
use bankfn_thp::ThpProvider;
use clap::ValueEnum;
use log::info;
use serde::Serialize;

/// Available memory providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// Transparent huge pages
    Thp,
    /// hugetlbfs huge pages
    Hugetlbfs,
}

/// Allocates `count` blocks with the provider of `kind`.
///
/// # Errors
///
/// Fails if the provider cannot be set up, if its blocks are smaller than
/// `pages_per_thp` pages or if an allocation fails.
pub fn alloc_memory(
    kind: ProviderKind,
    config: &AnalysisConfig,
    count: usize,
) -> anyhow::Result<Vec<Memory>> {
    match kind {
        ProviderKind::Thp => alloc_with(ThpProvider::new(config.pages_per_thp)?, config, count),
        ProviderKind::Hugetlbfs => alloc_with(HugepageProvider::new(), config, count),
    }
}

fn alloc_with<P>(mut provider: P, config: &AnalysisConfig, count: usize) -> anyhow::Result<Vec<Memory>>
where
    P: MemoryProvider,
    P::Error: Send + Sync + 'static,
{
    if provider.block_size() < config.huge_block_bytes() {
        bail!(
            "Provider blocks of {} bytes cannot hold {} pages",
            provider.block_size(),
            config.pages_per_thp
        );
    }
    let blocks = alloc_blocks(&mut provider, count)?;
    info!(
        "Allocated {} blocks of {} pages",
        blocks.len(),
        blocks.first().map_or(0, Memory::pages)
    );
    Ok(blocks)
}
