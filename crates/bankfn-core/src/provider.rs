//! Memory provider abstraction.
//!
//! This module defines the [`MemoryProvider`] trait and [`alloc_blocks`], the
//! entry point used to obtain the huge blocks the classifier measures in.

use crate::memory::Memory;
use log::{debug, warn};

/// Trait for strategies that hand out physically contiguous memory blocks.
///
/// The classifier relies on every block being backed by one huge page, so
/// that the low bits of a virtual address inside a block equal the low bits of
/// its physical address. Implementations may use transparent huge pages,
/// hugetlbfs or any other mechanism that gives this guarantee.
///
/// # Associated Types
///
/// * `Error` - The error type returned by allocation operations.
pub trait MemoryProvider {
    /// The error type returned by allocation operations.
    type Error: std::error::Error;

    /// Size of one block in bytes.
    fn block_size(&self) -> usize;

    /// Allocates one block of [`block_size()`](MemoryProvider::block_size) bytes.
    ///
    /// # Errors
    ///
    /// May return an error if the mapping fails or the kernel does not back it
    /// with a huge page.
    fn alloc_block(&mut self) -> Result<Memory, Self::Error>;
}

/// Allocates `count` blocks with `provider`.
///
/// Blocks allocated before a failure are released again.
///
/// # Errors
///
/// Returns the first allocation error.
pub fn alloc_blocks<P: MemoryProvider>(
    provider: &mut P,
    count: usize,
) -> Result<Vec<Memory>, P::Error> {
    let mut blocks = Vec::with_capacity(count);
    for i in 0..count {
        match provider.alloc_block() {
            Ok(block) => {
                debug!(
                    "Allocated block {}/{} at {:p} ({} bytes)",
                    i + 1,
                    count,
                    block.ptr,
                    block.len
                );
                blocks.push(block);
            }
            Err(e) => {
                warn!("Allocation of block {} failed, releasing {} blocks", i + 1, blocks.len());
                blocks.into_iter().for_each(Memory::dealloc);
                return Err(e);
            }
        }
    }
    Ok(blocks)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::PAGE_SIZE;

    struct PageProvider {
        remaining: usize,
    }

    impl MemoryProvider for PageProvider {
        type Error = std::io::Error;

        fn block_size(&self) -> usize {
            PAGE_SIZE
        }

        fn alloc_block(&mut self) -> Result<Memory, Self::Error> {
            if self.remaining == 0 {
                return Err(std::io::Error::other("exhausted"));
            }
            self.remaining -= 1;
            Memory::mmap(self.block_size())
        }
    }

    #[test]
    fn test_alloc_blocks() -> std::io::Result<()> {
        let mut provider = PageProvider { remaining: 3 };
        let blocks = alloc_blocks(&mut provider, 2)?;
        assert_eq!(blocks.len(), 2);
        assert!(blocks.iter().all(|b| b.len == PAGE_SIZE));
        blocks.into_iter().for_each(Memory::dealloc);
        assert!(alloc_blocks(&mut provider, 2).is_err());
        assert_eq!(provider.remaining, 0);
        Ok(())
    }
}
