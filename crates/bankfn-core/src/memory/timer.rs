/// Relative access latency between two addresses.
///
/// The classifier only compares the returned values against each other and
/// against the row conflict threshold, so any monotonic scalar works as long as
/// higher means slower. Implementations must not assume anything about the order
/// in which pairs are queried.
pub trait TimingOracle {
    /// Returns the average latency of accessing `a` and `b` alternately from
    /// DRAM over `rounds` rounds, optionally serializing every round.
    fn measure(&self, a: usize, b: usize, rounds: usize, fenced: bool) -> u64;
}

impl<T: TimingOracle + ?Sized> TimingOracle for &T {
    fn measure(&self, a: usize, b: usize, rounds: usize, fenced: bool) -> u64 {
        (**self).measure(a, b, rounds, fenced)
    }
}

#[cfg(target_arch = "x86_64")]
pub use self::rdtsc::{RdtscOracle, TimerError};

#[cfg(target_arch = "x86_64")]
mod rdtsc {
    use super::TimingOracle;
    use crate::config::FlushKind;
    use crate::memory::Memory;
    use log::debug;
    use std::arch::x86_64::{__cpuid, __cpuid_count, __rdtscp, _mm_clflush, _mm_mfence};
    use thiserror::Error;

    /// Errors that can occur while setting up the hardware timing oracle.
    #[derive(Debug, Error)]
    pub enum TimerError {
        /// The CPU does not provide `rdtscp`
        #[error("CPU does not support rdtscp")]
        RdtscpUnsupported,
        /// `clflushopt` was requested but the CPU does not provide it
        #[error("CPU does not support clflushopt, use the ddr3 memory type")]
        ClflushoptUnsupported,
    }

    /// Timing oracle based on the time stamp counter.
    ///
    /// Every round reads both addresses, flushes them from the cache and
    /// optionally fences. Same bank, different row pairs take longer because
    /// each access has to close and reopen a row.
    ///
    /// The oracle borrows the blocks it measures in and refuses addresses
    /// outside of them.
    pub struct RdtscOracle<'a> {
        blocks: Vec<&'a Memory>,
        flush: FlushKind,
    }

    impl<'a> RdtscOracle<'a> {
        /// Creates an oracle for addresses within `blocks`.
        ///
        /// # Errors
        ///
        /// Returns an error if the CPU lacks `rdtscp` or the requested flush
        /// instruction.
        pub fn new(
            blocks: impl IntoIterator<Item = &'a Memory>,
            flush: FlushKind,
        ) -> Result<Self, TimerError> {
            // CPUID.80000001H:EDX[27] and CPUID.(EAX=07H,ECX=0):EBX[23]
            #[allow(unused_unsafe)]
            let rdtscp = unsafe { __cpuid(0x8000_0001) }.edx & (1 << 27) != 0;
            if !rdtscp {
                return Err(TimerError::RdtscpUnsupported);
            }
            #[allow(unused_unsafe)]
            let clflushopt = unsafe { __cpuid_count(7, 0) }.ebx & (1 << 23) != 0;
            if flush == FlushKind::Ddr4 && !clflushopt {
                return Err(TimerError::ClflushoptUnsupported);
            }
            let blocks: Vec<_> = blocks.into_iter().collect();
            debug!(
                "Timing oracle over {} blocks using {:?} flushes",
                blocks.len(),
                flush
            );
            Ok(RdtscOracle { blocks, flush })
        }

        fn assert_mapped(&self, addr: usize) {
            assert!(
                self.blocks.iter().any(|b| b.contains(addr)),
                "address 0x{:x} is outside of the measured blocks",
                addr
            );
        }

        #[inline(always)]
        unsafe fn flush(&self, p: *const u8) {
            match self.flush {
                FlushKind::Ddr3 => unsafe { _mm_clflush(p) },
                FlushKind::Ddr4 => unsafe {
                    std::arch::asm!("clflushopt [{}]", in(reg) p, options(nostack, preserves_flags));
                },
            }
        }
    }

    impl TimingOracle for RdtscOracle<'_> {
        fn measure(&self, a: usize, b: usize, rounds: usize, fenced: bool) -> u64 {
            self.assert_mapped(a);
            self.assert_mapped(b);
            let rounds = rounds.max(1);
            let (a, b) = (a as *const u8, b as *const u8);
            let mut aux = 0u32;
            unsafe {
                let start = __rdtscp(&mut aux);
                for _ in 0..rounds {
                    std::ptr::read_volatile(a);
                    std::ptr::read_volatile(b);
                    self.flush(a);
                    self.flush(b);
                    if fenced {
                        _mm_mfence();
                    }
                }
                (__rdtscp(&mut aux) - start) / rounds as u64
            }
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::util::PAGE_SIZE;

        #[test]
        #[should_panic(expected = "outside of the measured blocks")]
        fn test_rejects_foreign_address() {
            let block = Memory::mmap(PAGE_SIZE).expect("mmap");
            let oracle = RdtscOracle {
                blocks: vec![&block],
                flush: FlushKind::Ddr3,
            };
            oracle.measure(block.base(), 0x1000, 1, true);
        }

        #[test]
        #[ignore]
        fn test_measure_same_page() -> anyhow::Result<()> {
            let block = Memory::mmap(2 * PAGE_SIZE)?;
            block.touch_pages();
            let oracle = RdtscOracle::new([&block], FlushKind::Ddr3)?;
            let t = oracle.measure(block.base(), block.base() + PAGE_SIZE, 100, true);
            assert!(t > 0);
            drop(oracle);
            block.dealloc();
            Ok(())
        }
    }
}
