//! Per-slot state machine for the hash table.
//!
//! A bucket's coordination word moves through four states:
//!
//! ```text
//!            claim                commit
//!   Empty ──────────► Inserting ──────────► Ready
//!     ▲                   │                  │  ▲
//!     └───────────────────┘       claim      │  │  release
//!           rollback                         ▼  │
//!                                        Accessing
//! ```
//!
//! `Inserting` and `Accessing` are exclusive: at most one actor holds a
//! bucket in either state. Key and value contents are undefined while the
//! bucket is `Empty`; a `Ready` observed with acquire ordering guarantees
//! the key and value published before the matching release are visible.

use core::cell::UnsafeCell;
use core::ptr;

use bytemuck::Pod;

use crate::sync::{AtomicU32, Ordering};

/// Coordination word values for a bucket.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BucketState {
    /// Key and value are undefined and must not be read.
    Empty = 0,
    /// An inserter holds the bucket and is writing key/value.
    Inserting = 1,
    /// Key and value are fully published.
    Ready = 2,
    /// A visitor holds the bucket exclusively.
    Accessing = 3,
}

impl BucketState {
    /// Convert from a raw coordination word.
    pub fn from_u32(v: u32) -> Option<Self> {
        match v {
            0 => Some(BucketState::Empty),
            1 => Some(BucketState::Inserting),
            2 => Some(BucketState::Ready),
            3 => Some(BucketState::Accessing),
            _ => None,
        }
    }
}

/// One slot of the hash table.
///
/// Cache-line aligned so neighboring buckets never share a line. The key is
/// written once, before the first `Ready` publish, and never rewritten while
/// the bucket stays populated; the value is only written under `Inserting`
/// or `Accessing`.
#[repr(C, align(64))]
pub struct Bucket<K, V> {
    state: AtomicU32,
    key: UnsafeCell<K>,
    value: UnsafeCell<V>,
}

// SAFETY: all cross-thread access to key/value is mediated by the state
// word's acquire/release protocol; Pod payloads carry no references.
unsafe impl<K: Send, V: Send> Send for Bucket<K, V> {}
unsafe impl<K: Send, V: Send> Sync for Bucket<K, V> {}

impl<K: Pod, V: Pod> Bucket<K, V> {
    /// Reset the coordination word to `Empty`, leaving key/value undefined.
    ///
    /// # Safety
    ///
    /// `this` must be non-null, aligned, and writable; no other actor may
    /// touch the bucket during initialization.
    pub(crate) unsafe fn init_in_place(this: *mut Self) {
        unsafe {
            ptr::addr_of_mut!((*this).state).write(AtomicU32::new(BucketState::Empty as u32));
        }
    }

    /// Current coordination word (acquire).
    #[inline]
    pub(crate) fn state_word(&self) -> u32 {
        self.state.load(Ordering::Acquire)
    }

    /// Current state, or `None` if the word is corrupted.
    pub fn state(&self) -> Option<BucketState> {
        BucketState::from_u32(self.state_word())
    }

    /// Try to claim a state transition.
    ///
    /// Acquire-release on success, acquire on failure; returns the observed
    /// word when the claim loses.
    #[inline]
    pub(crate) fn try_transition(&self, from: BucketState, to: BucketState) -> Result<(), u32> {
        self.state
            .compare_exchange(
                from as u32,
                to as u32,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map(|_| ())
    }

    /// Publish a state (release). Used to commit, release, or roll back a
    /// held bucket.
    #[inline]
    pub(crate) fn publish(&self, state: BucketState) {
        self.state.store(state as u32, Ordering::Release);
    }

    /// Read the key.
    ///
    /// # Safety
    ///
    /// The caller must have observed the bucket in `Ready` (acquire) or hold
    /// it in an exclusive state; the key is undefined while `Empty`.
    #[inline]
    pub unsafe fn key(&self) -> &K {
        unsafe { &*self.key.get() }
    }

    /// Write the key.
    ///
    /// # Safety
    ///
    /// The caller must hold the bucket in `Inserting`.
    #[inline]
    pub(crate) unsafe fn key_mut(&self) -> &mut K {
        unsafe { &mut *self.key.get() }
    }

    /// Read the value.
    ///
    /// # Safety
    ///
    /// Same visibility rules as [`Bucket::key`].
    #[inline]
    pub unsafe fn value(&self) -> &V {
        unsafe { &*self.value.get() }
    }

    /// Mutable access to the value.
    ///
    /// # Safety
    ///
    /// The caller must hold the bucket in `Inserting` or `Accessing`, or
    /// otherwise guarantee the bucket is quiescent.
    #[inline]
    pub unsafe fn value_mut(&self) -> &mut V {
        unsafe { &mut *self.value.get() }
    }
}

#[cfg(not(feature = "loom"))]
const _: () = assert!(core::mem::size_of::<Bucket<u64, u64>>() == 64);
