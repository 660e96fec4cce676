//! Concurrent data structures in named POSIX shared memory.
//!
//! shmkit places the lock-free structures from [`shmkit_primitives`] inside
//! `shm_open` segments so that independent processes (and their threads)
//! cooperate on the same in-memory state without kernel-mediated locks:
//!
//! ```no_run
//! use shmkit::{AccessMode, HashTable, Segment};
//!
//! type Counters = HashTable<u64, u64, 1024>;
//!
//! let segment = Segment::<Counters>::open("/my-counters")?;
//! segment.visit(&42, AccessMode::CreateIfMiss, |_, v, _| *v += 1);
//! # Ok::<(), shmkit::SegmentError>(())
//! ```
//!
//! The first process to open a name creates and sizes the segment, then a
//! [`BootstrapBlock`] elects exactly one constructor for the contained
//! structure; everyone else waits until the block is ready. Dropping a
//! [`Segment`] releases the process-local mapping only — names live until
//! [`Segment::destroy`] unlinks them.

pub mod block;
pub mod segment;

pub use block::{BlockState, BootstrapBlock};
pub use segment::{Segment, SegmentConfig, SegmentError};

pub use shmkit_primitives as primitives;
pub use shmkit_primitives::{
    AccessMode, Backoff, BroadcastConsumer, BroadcastError, BroadcastRing, Bucket, BucketState,
    HashTable, RingFull, RollbackHashTable, ShmInit, SpmcRing, SpscRing, Status, VisitOutcome,
    DEFAULT_TIMEOUT, MAX_CONSUMERS,
};
