use crate::util::PAGE_SIZE;
use log::trace;
use std::ops::Range;
use std::ptr::null_mut;

/// A mapped memory block.
///
/// Blocks are handed out by a [`crate::provider::MemoryProvider`] and stay
/// mapped until [`Memory::dealloc`] is called. The classifier only ever sees the
/// virtual addresses inside a block, the timing oracle borrows the block itself.
#[derive(Clone, Debug)]
pub struct Memory {
    /// Block pointer
    pub ptr: *mut u8,
    /// Block length in bytes
    pub len: usize,
}

unsafe impl Send for Memory {}

impl Memory {
    /// Wraps an existing mapping.
    pub fn new(ptr: *mut u8, len: usize) -> Self {
        Memory { ptr, len }
    }

    /// Allocates memory using mmap.
    ///
    /// Creates an anonymous, populated read/write mapping of the given size.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if mmap fails.
    pub fn mmap(size: usize) -> std::result::Result<Self, std::io::Error> {
        let p = unsafe {
            libc::mmap(
                null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_POPULATE,
                -1,
                0,
            )
        };
        if p == libc::MAP_FAILED {
            return Err(std::io::Error::last_os_error());
        }
        Ok(Memory::new(p as *mut u8, size))
    }

    /// Virtual address of the first byte.
    pub fn base(&self) -> usize {
        self.ptr as usize
    }

    /// Virtual address range covered by this block.
    pub fn range(&self) -> Range<usize> {
        self.base()..self.base() + self.len
    }

    /// Returns whether `addr` lies inside this block.
    pub fn contains(&self, addr: usize) -> bool {
        self.range().contains(&addr)
    }

    /// Number of 4 KB pages in this block.
    pub fn pages(&self) -> usize {
        self.len / PAGE_SIZE
    }

    /// Writes one byte to every page so that all pages are backed.
    pub fn touch_pages(&self) {
        for offset in (0..self.len).step_by(PAGE_SIZE) {
            unsafe { std::ptr::write_volatile(self.ptr.byte_add(offset), 0x2a) };
        }
    }

    /// Deallocates the memory block.
    ///
    /// Unmaps the memory region using munmap. Consumes self.
    pub fn dealloc(self) {
        trace!("unmapping {:p} ({} bytes)", self.ptr, self.len);
        unsafe { libc::munmap(self.ptr as *mut libc::c_void, self.len) };
    }
}

#[cfg(test)]
mod tests {
    use super::Memory;
    use crate::util::PAGE_SIZE;

    #[test]
    fn test_mmap_range() -> std::io::Result<()> {
        let block = Memory::mmap(4 * PAGE_SIZE)?;
        assert_eq!(block.pages(), 4);
        assert!(block.contains(block.base()));
        assert!(block.contains(block.base() + 4 * PAGE_SIZE - 1));
        assert!(!block.contains(block.base() + 4 * PAGE_SIZE));
        block.touch_pages();
        assert_eq!(unsafe { *block.ptr.byte_add(PAGE_SIZE) }, 0x2a);
        block.dealloc();
        Ok(())
    }
}
