//! Transparent Huge Pages (THP) memory provider.
//!
//! This crate provides a [`bankfn_core::provider::MemoryProvider`] that backs
//! every block with one transparent huge page. The mapping is aligned to the
//! block size and advised with `MADV_HUGEPAGE`, then every page is touched so
//! that the kernel faults the huge page in right away.
//!
//! # Platform Requirements
//!
//! - Linux with THP support enabled
//! - THP should be set to "always" or "madvise" mode

#![warn(missing_docs)]

use std::ptr::null_mut;

use bankfn_core::memory::{AddressTranslator, LinuxPageMap, Memory};
use bankfn_core::provider::MemoryProvider;
use bankfn_core::util::{PAGE_SIZE, PAGES_PER_THP};
use log::{debug, log_enabled, warn};
use thiserror::Error;

/// Errors that can happen during THP allocation
#[derive(Debug, Error)]
#[allow(missing_docs)]
pub enum Error {
    #[error(transparent)]
    IoError(#[from] std::io::Error),
    #[error("Block size must be a power of two number of 4 KB pages, got {0} bytes")]
    SizeError(usize),
}

/// THP provider. Every block is backed by one transparent huge page.
#[derive(Debug, Clone, Copy)]
pub struct ThpProvider {
    block_size: usize,
}

impl Default for ThpProvider {
    fn default() -> Self {
        ThpProvider {
            block_size: PAGES_PER_THP * PAGE_SIZE,
        }
    }
}

impl ThpProvider {
    /// Creates a provider for blocks of `pages` pages.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SizeError`] if the block size is not a power of two
    /// number of pages.
    pub fn new(pages: usize) -> Result<Self, Error> {
        let block_size = pages * PAGE_SIZE;
        if pages == 0 || !block_size.is_power_of_two() {
            return Err(Error::SizeError(block_size));
        }
        Ok(ThpProvider { block_size })
    }

    /// Maps `2 * size` bytes and trims the mapping to one `size` aligned
    /// block.
    fn mmap_aligned(size: usize) -> Result<*mut u8, std::io::Error> {
        let p = unsafe {
            libc::mmap(
                null_mut(),
                2 * size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if p == libc::MAP_FAILED {
            return Err(std::io::Error::last_os_error());
        }
        let start = p as usize;
        let aligned = align_up(start, size);
        unsafe {
            if aligned > start {
                libc::munmap(p, aligned - start);
            }
            let tail = aligned + size;
            let end = start + 2 * size;
            if end > tail {
                libc::munmap(tail as *mut libc::c_void, end - tail);
            }
        }
        Ok(aligned as *mut u8)
    }
}

fn align_up(addr: usize, align: usize) -> usize {
    addr.next_multiple_of(align)
}

impl MemoryProvider for ThpProvider {
    type Error = Error;

    fn block_size(&self) -> usize {
        self.block_size
    }

    fn alloc_block(&mut self) -> Result<Memory, Self::Error> {
        let size = self.block_size;
        let p = Self::mmap_aligned(size)?;
        let block = Memory::new(p, size);
        if unsafe { libc::madvise(p as *mut libc::c_void, size, libc::MADV_HUGEPAGE) } != 0 {
            let err = std::io::Error::last_os_error();
            block.dealloc();
            return Err(err.into());
        }
        block.touch_pages();
        if log_enabled!(log::Level::Debug)
            && let Ok(mut pagemap) = LinuxPageMap::new()
            && let Ok(phys) = pagemap.translate(block.base())
        {
            if phys.as_u64() as usize & (size - 1) != 0 {
                warn!(
                    "Block at {:p} is not backed by an aligned huge page: {:?}",
                    block.ptr, phys
                );
            } else {
                debug!("Block at {:p} starts at {:?}", block.ptr, phys);
            }
        }
        Ok(block)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(0x20_0000, 0x20_0000), 0x20_0000);
        assert_eq!(align_up(0x20_1000, 0x20_0000), 0x40_0000);
        assert_eq!(align_up(0x7f12_3456_7000, 0x20_0000), 0x7f12_3460_0000);
    }

    #[test]
    fn test_block_sizes() {
        assert_eq!(ThpProvider::default().block_size(), 0x20_0000);
        assert!(matches!(ThpProvider::new(0), Err(Error::SizeError(0))));
        assert!(matches!(ThpProvider::new(3), Err(Error::SizeError(0x3000))));
        assert!(ThpProvider::new(1024).is_ok());
    }

    #[test]
    #[ignore]
    fn test_alloc_aligned() -> Result<(), Error> {
        let mut provider = ThpProvider::default();
        let block = provider.alloc_block()?;
        assert_eq!(block.base() % block.len, 0);
        assert_eq!(unsafe { *block.ptr.byte_add(PAGE_SIZE) }, 0x2a);
        block.dealloc();
        Ok(())
    }
}
