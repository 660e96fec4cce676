//! Lock-free primitives for POSIX shared memory.
//!
//! This crate provides the data structures that live *inside* a shared
//! region: a closed-addressing hash table coordinated by per-bucket state
//! machines, and three ring-buffer variants. The structures are plain
//! `repr(C)` values constructed in place ([`ShmInit`]) and manipulated
//! through `&self`; nothing here allocates, and nothing stores a
//! process-local pointer in shared memory.
//!
//! # Primitives
//!
//! - [`HashTable`] / [`RollbackHashTable`]: fixed-capacity table with a
//!   per-key visitor API and bounded-time operations
//! - [`SpscRing`]: one producer, one consumer
//! - [`SpmcRing`]: one producer, contending consumers, exclusive delivery
//! - [`BroadcastRing`]: one producer, every declared consumer sees every
//!   element
//!
//! # Payloads
//!
//! Keys, values and ring elements are bounded by [`bytemuck::Pod`]: fixed
//! layout, no destructors, any bit pattern valid. Two processes mapping the
//! same region at different addresses can then exchange them byte-for-byte.
//!
//! # Loom
//!
//! Enable the `loom` feature to model-check the claim protocols:
//!
//! ```text
//! cargo test -p shmkit-primitives --features loom --release
//! ```

pub mod backoff;
pub mod broadcast;
pub mod bucket;
pub mod spmc;
pub mod spsc;
pub mod status;
pub mod sync;
pub mod table;

pub use backoff::{Backoff, DEFAULT_TIMEOUT};
pub use broadcast::{BroadcastConsumer, BroadcastError, BroadcastRing, MAX_CONSUMERS};
pub use bucket::{Bucket, BucketState};
pub use spmc::SpmcRing;
pub use spsc::{RingFull, SpscRing};
pub use status::{Status, VisitOutcome};
pub use table::{AccessMode, DefaultHashBuilder, HashTable, RollbackHashTable};

/// In-place construction for structures that live inside a shared region.
///
/// Shared segments are mapped, not allocated: the containing block hands a
/// raw pointer to freshly created (zero-filled) memory to exactly one
/// constructor, which must make it valid without ever materializing the
/// value on the stack.
pub trait ShmInit {
    /// Initialize the pointee to a valid empty state.
    ///
    /// # Safety
    ///
    /// `this` must be non-null, properly aligned for `Self`, and point to at
    /// least `size_of::<Self>()` writable bytes. No other thread or process
    /// may access the memory during initialization.
    unsafe fn init_in_place(this: *mut Self);
}
