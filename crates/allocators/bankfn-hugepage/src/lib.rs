//! hugetlbfs memory provider.
//!
//! This crate provides a [`bankfn_core::provider::MemoryProvider`] that maps
//! one explicit huge page from hugetlbfs per block. Unlike transparent huge
//! pages the kernel never splits these, but they have to be reserved up front
//! (`vm.nr_hugepages` or kernel boot parameters).
//!
//! # Platform Requirements
//!
//! - Linux with hugetlbfs mounted at `/dev/hugepages`
//! - Enough free huge pages of the default size for all blocks

#![warn(missing_docs)]

use std::ffi::CString;
use std::fs::File;
use std::io::Read;
use std::ptr::null_mut;

use bankfn_core::memory::Memory;
use bankfn_core::provider::MemoryProvider;
use lazy_static::lazy_static;
use libc::{MAP_POPULATE, MAP_SHARED, O_CREAT, O_RDWR};
use log::{debug, warn};

// https://www.kernel.org/doc/Documentation/vm/hugetlbpage.txt
//
// /proc/meminfo contains a line like
// Hugepagesize:    yyy kB
const MEMINFO_PATH: &str = "/proc/meminfo";
const TOKEN: &str = "Hugepagesize:";
const HUGETLBFS_DIR: &str = "/dev/hugepages";

lazy_static! {
    static ref HUGEPAGE_SIZE: Option<usize> = {
        let buf = File::open(MEMINFO_PATH).map_or(String::new(), |mut f| {
            let mut s = String::new();
            let _ = f.read_to_string(&mut s);
            s
        });
        parse_hugepage_size(&buf)
    };
}

fn parse_hugepage_size(s: &str) -> Option<usize> {
    let line = s.lines().find_map(|line| line.strip_prefix(TOKEN))?;
    let mut parts = line.split_whitespace();
    let size = parts.next()?.parse::<usize>().ok()?;
    let unit = match parts.next() {
        Some("kB") => 1024,
        Some(_) => return None,
        None => 1,
    };
    Some(size * unit)
}

/// Provider mapping one hugetlbfs huge page of the default size per block.
///
/// Every block is backed by its own file below `/dev/hugepages`, which is
/// unlinked right after mapping.
#[derive(Debug, Default)]
pub struct HugepageProvider {
    allocated: usize,
}

impl HugepageProvider {
    /// Creates a provider.
    pub fn new() -> Self {
        Self::default()
    }

    fn huge_page_size() -> Result<usize, std::io::Error> {
        (*HUGEPAGE_SIZE).ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::Unsupported,
                "no huge page size in /proc/meminfo",
            )
        })
    }
}

impl MemoryProvider for HugepageProvider {
    type Error = std::io::Error;

    /// Default huge page size, 0 if the kernel does not report one.
    fn block_size(&self) -> usize {
        (*HUGEPAGE_SIZE).unwrap_or(0)
    }

    fn alloc_block(&mut self) -> Result<Memory, Self::Error> {
        let size = Self::huge_page_size()?;
        let path = format!(
            "{}/bankfn_{}_{}",
            HUGETLBFS_DIR,
            std::process::id(),
            self.allocated
        );
        let c_path = CString::new(path.clone()).map_err(std::io::Error::other)?;
        let fd = unsafe { libc::open(c_path.as_ptr(), O_RDWR | O_CREAT, 0o600) };
        if fd == -1 {
            return Err(std::io::Error::last_os_error());
        }
        let p = unsafe {
            libc::mmap(
                null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                MAP_SHARED | MAP_POPULATE,
                fd,
                0,
            )
        };
        let mmap_err = std::io::Error::last_os_error();
        unsafe { libc::close(fd) };
        if unsafe { libc::unlink(c_path.as_ptr()) } != 0 {
            warn!("Failed to unlink {}: {}", path, std::io::Error::last_os_error());
        }
        if p == libc::MAP_FAILED {
            return Err(mmap_err);
        }
        self.allocated += 1;
        let block = Memory::new(p as *mut u8, size);
        block.touch_pages();
        debug!("Mapped huge page {} at {:p} ({} bytes)", path, block.ptr, size);
        Ok(block)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_hugepage_size() {
        // correct.
        assert_eq!(parse_hugepage_size("Hugepagesize:1024"), Some(1024));
        assert_eq!(parse_hugepage_size("Hugepagesize: 2048 kB"), Some(2 << 20));
        assert_eq!(
            parse_hugepage_size("MemTotal: 16 kB\nHugepagesize:    1048576 kB\n"),
            Some(1 << 30)
        );

        // wrong.
        assert_eq!(parse_hugepage_size("Hugepagesize:1kB"), None);
        assert_eq!(parse_hugepage_size("Hugepagesize: 2 MB"), None);
        assert_eq!(parse_hugepage_size("MemTotal: 16 kB"), None);
    }

    #[test]
    #[ignore]
    fn test_alloc_block() -> std::io::Result<()> {
        let mut provider = HugepageProvider::new();
        let block = provider.alloc_block()?;
        assert_eq!(block.len, provider.block_size());
        assert_eq!(unsafe { *block.ptr }, 0x2a);
        block.dealloc();
        Ok(())
    }
}
