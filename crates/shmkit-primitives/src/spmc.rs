//! Single-producer multi-consumer ring with exclusive delivery.
//!
//! Each cell carries its own sequence counter; the counter encodes whose
//! turn it is to touch the cell, forming a per-cell lock-free exchange
//! between the producer and the contending consumers:
//!
//! - cell `i` is writable when `seq == producer_pos`; the write publishes
//!   `seq = producer_pos + 1`
//! - cell `i` is readable when `seq == consumer_pos + 1`; the read publishes
//!   `seq = consumer_pos + N`, handing the cell to a future producer lap
//!
//! Every pushed element is popped by exactly one consumer.

use core::cell::UnsafeCell;
use core::ptr;

use bytemuck::Pod;

use crate::spsc::RingFull;
use crate::sync::{AtomicU64, Ordering};
use crate::ShmInit;

#[repr(C)]
struct Cell<T> {
    seq: AtomicU64,
    data: UnsafeCell<T>,
}

/// SPMC ring of `N` cells (`N` must be a power of two).
#[repr(C, align(64))]
pub struct SpmcRing<T, const N: usize> {
    head: AtomicU64,
    _pad0: [u8; 56],
    tail: AtomicU64,
    _pad1: [u8; 56],
    cells: [Cell<T>; N],
}

// SAFETY: payload access is gated by each cell's sequence counter; a cell
// has a single owner between the acquire load and the release store.
unsafe impl<T: Send, const N: usize> Send for SpmcRing<T, N> {}
unsafe impl<T: Send, const N: usize> Sync for SpmcRing<T, N> {}

impl<T: Pod, const N: usize> SpmcRing<T, N> {
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

    /// Reset indices and per-cell sequence counters.
    ///
    /// Not safe to call while producers or consumers are operating.
    pub fn clear(&self) {
        self.head.store(0, Ordering::Relaxed);
        self.tail.store(0, Ordering::Relaxed);
        for (i, cell) in self.cells.iter().enumerate() {
            cell.seq.store(i as u64, Ordering::Relaxed);
        }
    }

    /// Producer-side push. Fails with [`RingFull`] at capacity.
    pub fn try_push(&self, value: T) -> Result<(), RingFull> {
        let mut pos = self.tail.load(Ordering::Relaxed);

        loop {
            let cell = &self.cells[(pos & Self::MASK) as usize];
            let seq = cell.seq.load(Ordering::Acquire);
            let diff = seq as i64 - pos as i64;

            if diff == 0 {
                // Writable cell: claim the position.
                match self.tail.compare_exchange_weak(
                    pos,
                    pos + 1,
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        // SAFETY: the tail CAS made this producer the sole
                        // owner of the cell until the seq publish below.
                        unsafe {
                            *cell.data.get() = value;
                        }
                        cell.seq.store(pos + 1, Ordering::Release);
                        return Ok(());
                    }
                    Err(current) => pos = current,
                }
            } else if diff < 0 {
                return Err(RingFull);
            } else {
                // The producer fell behind another claim; resynchronize.
                pos = self.tail.load(Ordering::Relaxed);
            }
        }
    }

    /// Consumer-side pop. Returns `None` when empty.
    pub fn try_pop(&self) -> Option<T> {
        let mut pos = self.head.load(Ordering::Relaxed);

        loop {
            let cell = &self.cells[(pos & Self::MASK) as usize];
            let seq = cell.seq.load(Ordering::Acquire);
            let diff = seq as i64 - (pos + 1) as i64;

            if diff == 0 {
                match self.head.compare_exchange_weak(
                    pos,
                    pos + 1,
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        // SAFETY: the head CAS made this consumer the sole
                        // owner of the cell; the acquire load of seq ordered
                        // the producer's write before this read.
                        let value = unsafe { *cell.data.get() };
                        // Hand the cell to the producer's next lap.
                        cell.seq.store(pos + N as u64, Ordering::Release);
                        return Some(value);
                    }
                    Err(current) => pos = current,
                }
            } else if diff < 0 {
                return None;
            } else {
                pos = self.head.load(Ordering::Relaxed);
            }
        }
    }
}

impl<T: Pod, const N: usize> ShmInit for SpmcRing<T, N> {
    unsafe fn init_in_place(this: *mut Self) {
        let _ = Self::CAPACITY_OK;
        unsafe {
            ptr::addr_of_mut!((*this).head).write(AtomicU64::new(0));
            ptr::addr_of_mut!((*this).tail).write(AtomicU64::new(0));
            for i in 0..N {
                let cell = ptr::addr_of_mut!((*this).cells[i]);
                ptr::addr_of_mut!((*cell).seq).write(AtomicU64::new(i as u64));
            }
        }
    }
}
