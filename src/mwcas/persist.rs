//! Cache-line flush and fence shims for the durable MwCAS variant.
//!
//! The engine targets a byte-addressable persistent address space with
//! explicit flush and fence operations; no persistent-memory SDK is
//! involved. On x86-64 a flush is `clflush` per touched line followed by
//! a store fence; elsewhere it degrades to a sequentially consistent fence,
//! which keeps the volatile semantics intact.

const CACHE_LINE: usize = 64;

/// Flushes every cache line covering `[addr, addr + len)`.
#[inline]
pub(crate) fn flush_range(addr: *const u8, len: usize) {
    #[cfg(target_arch = "x86_64")]
    {
        let start = addr as usize & !(CACHE_LINE - 1);
        let end = addr as usize + len;
        let mut line = start;
        while line < end {
            unsafe { core::arch::x86_64::_mm_clflush(line as *const u8) };
            line += CACHE_LINE;
        }
        unsafe { core::arch::x86_64::_mm_sfence() };
    }
    #[cfg(not(target_arch = "x86_64"))]
    {
        let _ = (addr, len);
        std::sync::atomic::fence(std::sync::atomic::Ordering::SeqCst);
    }
}

/// Flushes the cache line holding one value.
#[inline]
pub(crate) fn flush<T>(value: &T) {
    flush_range(value as *const T as *const u8, std::mem::size_of::<T>());
}
