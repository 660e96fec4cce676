//! One-shot in-place construction inside a shared region.
//!
//! A region fresh from `ftruncate` is zero-filled, which doubles as the
//! block's `Uninit` state. Exactly one process wins the `Uninit → Building`
//! claim and constructs the contained structure in place; everyone else
//! waits until the winner publishes `Ready`. After that the block is never
//! torn down — segments die by unlinking, not by destructors.

use std::mem;
use std::ptr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::thread;
use std::time::Duration;

use shmkit_primitives::{Backoff, ShmInit};
use tracing::{debug, trace};

/// Construction states of a [`BootstrapBlock`].
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockState {
    /// Fresh zero-filled memory; the contained structure does not exist.
    Uninit = 0,
    /// One process is constructing the structure.
    Building = 1,
    /// The structure is fully published.
    Ready = 2,
}

/// Coordination header plus the contained data structure.
#[repr(C)]
pub struct BootstrapBlock<T> {
    state: AtomicU32,
    inner: T,
}

impl<T: ShmInit> BootstrapBlock<T> {
    /// Bytes a segment must provide for this block.
    pub const fn mem_usage() -> usize {
        mem::size_of::<Self>()
    }

    /// Construct-or-wait entry point for the segment owner.
    ///
    /// The `Uninit → Building` claim elects one constructor; a losing caller
    /// behaves like [`BootstrapBlock::open`].
    ///
    /// # Safety
    ///
    /// `mem` must be aligned for `Self`, span at least [`Self::mem_usage`]
    /// writable bytes shared with the peers, and hold either fresh
    /// zero-filled memory or a previously constructed block. The memory must
    /// stay mapped for `'a`.
    pub unsafe fn create<'a>(mem: *mut u8) -> &'a Self {
        let block = mem as *mut Self;
        // SAFETY: only the state field is referenced while `inner` may still
        // be uninitialized.
        let state = unsafe { &*ptr::addr_of!((*block).state) };

        match state.compare_exchange(
            BlockState::Uninit as u32,
            BlockState::Building as u32,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {
                trace!("bootstrap: won construction claim");
                unsafe { T::init_in_place(ptr::addr_of_mut!((*block).inner)) };
                state.store(BlockState::Ready as u32, Ordering::Release);
                debug!("bootstrap: block constructed");
            }
            Err(_) => {
                wait_ready(state);
                debug!("bootstrap: joined existing block");
            }
        }

        // SAFETY: `inner` is fully constructed once Ready was observed.
        unsafe { &*block }
    }

    /// Wait until a peer publishes `Ready`, without a deadline.
    ///
    /// # Safety
    ///
    /// Same contract as [`BootstrapBlock::create`].
    pub unsafe fn open<'a>(mem: *mut u8) -> &'a Self {
        let block = mem as *const Self;
        // SAFETY: see create().
        let state = unsafe { &*ptr::addr_of!((*block).state) };
        wait_ready(state);
        unsafe { &*block }
    }

    /// Wait until a peer publishes `Ready`, giving up after `timeout`.
    ///
    /// Returns `None` when the deadline passes — typically because the
    /// constructor crashed between `Building` and `Ready`. Recovery is the
    /// caller's call (usually: unlink the segment and start over).
    ///
    /// # Safety
    ///
    /// Same contract as [`BootstrapBlock::create`].
    pub unsafe fn open_timeout<'a>(mem: *mut u8, timeout: Duration) -> Option<&'a Self> {
        let block = mem as *const Self;
        // SAFETY: see create().
        let state = unsafe { &*ptr::addr_of!((*block).state) };

        let mut backoff = Backoff::new(timeout);
        while state.load(Ordering::Acquire) != BlockState::Ready as u32 {
            if !backoff.next() {
                debug!("bootstrap: gave up waiting for Ready");
                return None;
            }
        }
        Some(unsafe { &*block })
    }

    /// Current construction state, if the word is intact.
    pub fn state(&self) -> Option<BlockState> {
        match self.state.load(Ordering::Acquire) {
            0 => Some(BlockState::Uninit),
            1 => Some(BlockState::Building),
            2 => Some(BlockState::Ready),
            _ => None,
        }
    }

    /// The contained structure.
    pub fn get(&self) -> &T {
        &self.inner
    }
}

impl<T: ShmInit> std::ops::Deref for BootstrapBlock<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.inner
    }
}

fn wait_ready(state: &AtomicU32) {
    while state.load(Ordering::Acquire) != BlockState::Ready as u32 {
        thread::yield_now();
    }
}
