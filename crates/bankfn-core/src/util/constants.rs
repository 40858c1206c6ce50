/// Page shift value (12 bits) for 4KB pages
pub const PAGE_SHIFT: usize = 12;
/// Standard page size (4096 bytes)
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;
/// Mask for extracting page offset
pub const PAGE_MASK: usize = PAGE_SIZE - 1;

/// Number of pages in a 2MB transparent huge page
pub const PAGES_PER_THP: usize = 512;

/// Width of the histogram bins used during threshold calibration, in cycles
pub const THRESHOLD_BIN_WIDTH: u64 = 10;
