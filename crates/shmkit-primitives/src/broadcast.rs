//! Single-producer broadcast ring: every consumer sees every element.
//!
//! Cells carry a sequence word plus a `remain` fan-out counter. The producer
//! publishes position `pos` into cell `pos % N` by writing the payload,
//! releasing `seq = pos`, then releasing `remain = consumer_count`. Each of
//! the declared consumers copies the payload and decrements `remain`; the
//! cell becomes writable again only once `remain` returns to zero, so a slow
//! consumer throttles the producer instead of losing elements.
//!
//! The consumer count is fixed before the first push and bounded by
//! [`MAX_CONSUMERS`].

use core::cell::UnsafeCell;
use core::fmt;
use core::ptr;
use std::time::Duration;

use bytemuck::Pod;

use crate::backoff::{Backoff, DEFAULT_TIMEOUT};
use crate::sync::{thread, AtomicU32, AtomicU64, Ordering};
use crate::ShmInit;

/// Compile-time bound on the number of broadcast consumers.
pub const MAX_CONSUMERS: u32 = 64;

/// Sequence value of a cell that has never been written.
const SEQ_UNWRITTEN: u64 = u64::MAX;

/// Errors from broadcast ring operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BroadcastError {
    /// `init_consumers` has not been called yet.
    Uninitialized,
    /// The consumer count was already fixed.
    AlreadyInitialized,
    /// Count is zero or exceeds [`MAX_CONSUMERS`], or all declared consumer
    /// slots are taken.
    ConsumerLimit,
    /// The producer's wait for a reusable cell exceeded its budget.
    Timeout,
}

impl fmt::Display for BroadcastError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Uninitialized => write!(f, "consumer count not initialized"),
            Self::AlreadyInitialized => write!(f, "consumer count already initialized"),
            Self::ConsumerLimit => write!(f, "consumer limit exceeded"),
            Self::Timeout => write!(f, "timed out waiting for a reusable cell"),
        }
    }
}

impl std::error::Error for BroadcastError {}

#[repr(C)]
struct Cell<T> {
    /// Position last published into this cell, or `SEQ_UNWRITTEN`.
    seq: AtomicU64,
    /// Consumers that still have to read the published element.
    remain: AtomicU32,
    data: UnsafeCell<T>,
}

/// Broadcast ring of `N` cells (`N` must be a power of two).
#[repr(C, align(64))]
pub struct BroadcastRing<T, const N: usize> {
    tail: AtomicU64,
    _pad0: [u8; 56],
    /// Fixed at `init_consumers` time; zero means uninitialized.
    consumer_count: AtomicU32,
    /// Consumer handles given out so far.
    attached: AtomicU32,
    _pad1: [u8; 56],
    cells: [Cell<T>; N],
}

// SAFETY: payload access is gated by seq/remain acquire-release pairs; the
// producer owns a cell from `remain == 0` until the seq publish, consumers
// only read between the seq publish and their remain decrement.
unsafe impl<T: Send, const N: usize> Send for BroadcastRing<T, N> {}
unsafe impl<T: Send, const N: usize> Sync for BroadcastRing<T, N> {}

impl<T: Pod, const N: usize> BroadcastRing<T, N> {
    const CAPACITY_OK: () = assert!(N > 0 && N & (N - 1) == 0, "capacity must be a power of two");
    const MASK: u64 = (N as u64) - 1;

    #[inline]
    pub const fn capacity(&self) -> usize {
        N
    }

    /// Fix the number of consumers. Must happen exactly once, before the
    /// first push and before any consumer handle is created.
    pub fn init_consumers(&self, count: u32) -> Result<(), BroadcastError> {
        if count == 0 || count > MAX_CONSUMERS {
            return Err(BroadcastError::ConsumerLimit);
        }
        self.consumer_count
            .compare_exchange(0, count, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|_| BroadcastError::AlreadyInitialized)
    }

    pub fn consumer_count(&self) -> u32 {
        self.consumer_count.load(Ordering::Acquire)
    }

    /// Producer-side push with the default budget.
    pub fn try_push(&self, value: T) -> Result<(), BroadcastError> {
        self.push_timeout(value, DEFAULT_TIMEOUT)
    }

    /// Producer-side push.
    ///
    /// Waits (bounded by `timeout`) until the target cell has been drained
    /// by every consumer of its previous lap. A persistent laggard therefore
    /// stalls the producer; that back-pressure is the broadcast contract.
    pub fn push_timeout(&self, value: T, timeout: Duration) -> Result<(), BroadcastError> {
        let consumers = self.consumer_count.load(Ordering::Acquire);
        if consumers == 0 {
            return Err(BroadcastError::Uninitialized);
        }

        let pos = self.tail.fetch_add(1, Ordering::Relaxed);
        let cell = &self.cells[(pos & Self::MASK) as usize];

        let mut backoff = Backoff::new(timeout);
        while cell.remain.load(Ordering::Acquire) != 0 {
            if !backoff.next() {
                // Single producer: nobody else advanced tail, so the claim
                // can be handed back.
                self.tail.store(pos, Ordering::Relaxed);
                return Err(BroadcastError::Timeout);
            }
        }

        // SAFETY: remain == 0 means every consumer finished the previous
        // lap of this cell; the single producer now owns it.
        unsafe {
            *cell.data.get() = value;
        }
        cell.seq.store(pos, Ordering::Release);
        cell.remain.store(consumers, Ordering::Release);
        Ok(())
    }

    /// Create a consumer handle with its cursor at the start of the stream.
    pub fn make_consumer(&self) -> Result<BroadcastConsumer<'_, T, N>, BroadcastError> {
        let declared = self.consumer_count.load(Ordering::Acquire);
        if declared == 0 {
            return Err(BroadcastError::Uninitialized);
        }
        if self.attached.fetch_add(1, Ordering::AcqRel) >= declared {
            self.attached.fetch_sub(1, Ordering::AcqRel);
            return Err(BroadcastError::ConsumerLimit);
        }
        Ok(BroadcastConsumer {
            ring: self,
            cursor: 0,
        })
    }
}

impl<T: Pod, const N: usize> ShmInit for BroadcastRing<T, N> {
    unsafe fn init_in_place(this: *mut Self) {
        let _ = Self::CAPACITY_OK;
        unsafe {
            ptr::addr_of_mut!((*this).tail).write(AtomicU64::new(0));
            ptr::addr_of_mut!((*this).consumer_count).write(AtomicU32::new(0));
            ptr::addr_of_mut!((*this).attached).write(AtomicU32::new(0));
            for i in 0..N {
                let cell = ptr::addr_of_mut!((*this).cells[i]);
                ptr::addr_of_mut!((*cell).seq).write(AtomicU64::new(SEQ_UNWRITTEN));
                ptr::addr_of_mut!((*cell).remain).write(AtomicU32::new(0));
            }
        }
    }
}

/// One consumer's private view of a [`BroadcastRing`].
///
/// Not shareable between threads; each consumer owns its cursor.
pub struct BroadcastConsumer<'a, T, const N: usize> {
    ring: &'a BroadcastRing<T, N>,
    cursor: u64,
}

impl<T: Pod, const N: usize> BroadcastConsumer<'_, T, N> {
    /// Pop the next element of the stream, or `None` if the producer has
    /// not published it yet.
    pub fn try_pop(&mut self) -> Option<T> {
        let cell = &self.ring.cells[(self.cursor & BroadcastRing::<T, N>::MASK) as usize];

        if cell.seq.load(Ordering::Acquire) != self.cursor {
            return None;
        }
        // remain == 0 with a matching seq can only be a stale re-read of an
        // element this consumer already took; report empty.
        if cell.remain.load(Ordering::Acquire) == 0 {
            return None;
        }

        // SAFETY: seq == cursor with remain > 0 pins the payload until this
        // consumer's decrement below.
        let value = unsafe { *cell.data.get() };
        cell.remain.fetch_sub(1, Ordering::AcqRel);
        self.cursor += 1;
        Some(value)
    }

    /// Block (yielding) until the next element arrives.
    pub fn pop_blocking(&mut self) -> T {
        loop {
            if let Some(v) = self.try_pop() {
                return v;
            }
            thread::yield_now();
        }
    }

    /// Position of the next element this consumer will observe.
    pub fn cursor(&self) -> u64 {
        self.cursor
    }
}
