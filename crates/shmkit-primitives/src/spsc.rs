//! Single-producer single-consumer ring.
//!
//! Index-pair discipline: the producer owns `tail`, the consumer owns
//! `head`, both monotonically increasing 64-bit counters. Because each side
//! has exactly one writer, no CAS is needed anywhere.

use core::cell::UnsafeCell;
use core::ptr;

use bytemuck::Pod;

use crate::sync::{AtomicU64, Ordering};
use crate::ShmInit;

/// Returned by `try_push` when the ring is at capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingFull;

impl core::fmt::Display for RingFull {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str("ring is full")
    }
}

impl std::error::Error for RingFull {}

/// A wait-free SPSC ring of `N` cells (`N` must be a power of two).
#[repr(C, align(64))]
pub struct SpscRing<T, const N: usize> {
    /// Consumer position: next cell to read. Written by the consumer only.
    head: AtomicU64,
    _pad0: [u8; 56],
    /// Producer position: next cell to write. Written by the producer only.
    tail: AtomicU64,
    _pad1: [u8; 56],
    cells: [UnsafeCell<T>; N],
}

// SAFETY: cell access is mediated by the head/tail acquire/release pairs;
// each cell has a single writer at any time.
unsafe impl<T: Send, const N: usize> Send for SpscRing<T, N> {}
unsafe impl<T: Send, const N: usize> Sync for SpscRing<T, N> {}

impl<T: Pod, const N: usize> SpscRing<T, N> {
    const CAPACITY_OK: () = assert!(N > 0 && N & (N - 1) == 0, "capacity must be a power of two");
    const MASK: u64 = (N as u64) - 1;

    #[inline]
    pub const fn capacity(&self) -> usize {
        N
    }

    pub fn len(&self) -> usize {
        let head = self.head.load(Ordering::Acquire);
        let tail = self.tail.load(Ordering::Acquire);
        tail.saturating_sub(head) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.len() >= N
    }

    /// Reset both indices. Not safe to call while a peer is operating.
    pub fn clear(&self) {
        self.head.store(0, Ordering::Relaxed);
        self.tail.store(0, Ordering::Relaxed);
    }

    /// Producer-side push. Fails with [`RingFull`] at capacity.
    pub fn try_push(&self, value: T) -> Result<(), RingFull> {
        let head = self.head.load(Ordering::Acquire);
        let tail = self.tail.load(Ordering::Relaxed);
        if tail.wrapping_sub(head) >= N as u64 {
            return Err(RingFull);
        }

        // SAFETY: the single producer owns cell `tail` until the release
        // store below publishes it.
        unsafe {
            *self.cell(tail) = value;
        }
        self.tail.store(tail + 1, Ordering::Release);
        Ok(())
    }

    /// Consumer-side pop. Returns `None` when empty.
    pub fn try_pop(&self) -> Option<T> {
        let head = self.head.load(Ordering::Relaxed);
        let tail = self.tail.load(Ordering::Acquire);
        if head >= tail {
            return None;
        }

        // SAFETY: the single consumer owns cell `head`; the acquire load of
        // `tail` ordered the producer's write before this read.
        let value = unsafe { *self.cell(head) };
        self.head.store(head + 1, Ordering::Release);
        Some(value)
    }

    #[inline]
    #[allow(clippy::mut_from_ref)]
    unsafe fn cell(&self, pos: u64) -> &mut T {
        unsafe { &mut *self.cells[(pos & Self::MASK) as usize].get() }
    }
}

impl<T: Pod, const N: usize> ShmInit for SpscRing<T, N> {
    unsafe fn init_in_place(this: *mut Self) {
        let _ = Self::CAPACITY_OK;
        unsafe {
            ptr::addr_of_mut!((*this).head).write(AtomicU64::new(0));
            ptr::addr_of_mut!((*this).tail).write(AtomicU64::new(0));
        }
        // Cells stay undefined until published; Pod payloads make any bit
        // pattern valid.
    }
}
