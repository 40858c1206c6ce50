use std::fmt::{Debug, Formatter};

use crate::util::{PAGE_MASK, PAGE_SHIFT};
use log::warn;
use pagemap2::{PageMapError, VirtualMemoryArea};
use serde::Serialize;
use thiserror::Error;

#[repr(transparent)]
#[derive(Clone, Copy, Default, Serialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
/// Physical memory address.
///
/// A newtype wrapper around a 64 bit physical address.
pub struct PhysAddr(u64);

impl Debug for PhysAddr {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!("PhysAddr(0x{:02x})", self.0))
    }
}

impl PhysAddr {
    /// Creates a new physical address.
    pub fn new(addr: u64) -> Self {
        PhysAddr(addr)
    }

    /// Returns the address as a u64.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl From<PhysAddr> for u64 {
    fn from(addr: PhysAddr) -> u64 {
        addr.0
    }
}

/// Translates the virtual addresses the classifier works on into the physical
/// addresses the mask search works on.
pub trait AddressTranslator {
    /// Errors that can occur during physical address resolution
    type Error: std::error::Error;

    /// Translates a virtual address to a physical address.
    ///
    /// # Errors
    ///
    /// Returns an error if address translation fails.
    fn translate(&mut self, virt: usize) -> Result<PhysAddr, Self::Error>;
}

/// Errors that can happen during PageMap operations
#[derive(Debug, Error)]
pub enum LinuxPageMapError {
    /// Opening or reading the pagemap failed
    #[error(transparent)]
    PageMap(#[from] PageMapError),
    /// The pagemap returned an unexpected number of entries for one page
    #[error("Got {entries} pagemap entries for virtual address 0x{virt:x}, expected exactly one")]
    EntryCount {
        /// Number of entries returned
        entries: usize,
        /// Queried virtual address
        virt: usize,
    },
}

/// Virtual to physical address translator using Linux pagemap.
///
/// Uses `/proc/{pid}/pagemap` to translate virtual to physical addresses.
/// Requires root privileges, otherwise the kernel reports PFN 0 for every page.
pub struct LinuxPageMap {
    pagemap_wrapper: pagemap2::PageMap,
}

impl LinuxPageMap {
    /// Creates a new pagemap for the current process.
    ///
    /// # Errors
    ///
    /// Returns an error if opening `/proc/self/pagemap` fails.
    pub fn new() -> Result<LinuxPageMap, LinuxPageMapError> {
        let res = LinuxPageMap {
            pagemap_wrapper: pagemap2::PageMap::new(std::process::id() as u64)?,
        };
        Ok(res)
    }
}

impl AddressTranslator for LinuxPageMap {
    type Error = LinuxPageMapError;

    fn translate(&mut self, virt: usize) -> Result<PhysAddr, Self::Error> {
        let vaddr_start_page = (virt & !PAGE_MASK) as u64;
        let vaddr_end_page = vaddr_start_page + PAGE_MASK as u64;

        let memory_region = VirtualMemoryArea::from((vaddr_start_page, vaddr_end_page));
        let entry = self.pagemap_wrapper.pagemap_vma(&memory_region)?;
        if entry.len() != 1 {
            return Err(LinuxPageMapError::EntryCount {
                entries: entry.len(),
                virt,
            });
        }
        let pfn = entry[0].pfn()?;
        if pfn == 0 {
            warn!(
                "Got invalid PFN 0 for virtual address 0x{:x}. Are we root?",
                virt
            );
        }

        Ok(PhysAddr((pfn << PAGE_SHIFT) | (virt & PAGE_MASK) as u64))
    }
}

/// Translator for address spaces where virtual and physical addresses coincide.
///
/// Used for synthetic address spaces, e.g. when replaying recorded groupings or
/// when driving the classifier with a simulated timing oracle.
#[derive(Debug, Default, Clone, Copy)]
pub struct IdentityTranslator;

impl AddressTranslator for IdentityTranslator {
    type Error = std::convert::Infallible;

    fn translate(&mut self, virt: usize) -> Result<PhysAddr, Self::Error> {
        Ok(PhysAddr(virt as u64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity() {
        let mut translator = IdentityTranslator;
        assert_eq!(
            translator.translate(0x4000_1234).map(u64::from),
            Ok(0x4000_1234)
        );
    }

    #[test]
    fn test_debug_format() {
        assert_eq!(format!("{:?}", PhysAddr::new(0xab)), "PhysAddr(0xab)");
    }

    #[test]
    #[ignore]
    fn test_pagemap_offset_preserved() -> anyhow::Result<()> {
        let block = crate::memory::Memory::mmap(crate::util::PAGE_SIZE)?;
        block.touch_pages();
        let mut pagemap = LinuxPageMap::new()?;
        let phys = pagemap.translate(block.base() + 0x123)?;
        assert_eq!(phys.as_u64() & PAGE_MASK as u64, 0x123);
        block.dealloc();
        Ok(())
    }
}
