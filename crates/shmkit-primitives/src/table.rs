//! Fixed-capacity closed-addressing hash table coordinated per bucket.
//!
//! The table is a flat array of [`Bucket`]s living directly in shared
//! memory; there is no indirection, no allocation, no resizing and no
//! deletion. All access goes through [`HashTable::visit`]: the operation
//! probes linearly from the key's home slot, claims the matching bucket
//! through its state machine, and runs a caller-supplied visitor while
//! holding the claim. Contended claims retry under a [`Backoff`] budget, so
//! every call completes in bounded time.
//!
//! Hashing and key equality must be pure: every process mapping the table
//! computes hashes with its own instance of `S`, so the default build-hasher
//! is the stateless [`DefaultHashBuilder`]. Never use a randomly seeded
//! hasher here.
//!
//! Visitors run while a bucket is held in an exclusive state. A visitor must
//! not re-enter the table on the same key (it would deadlock against its own
//! claim); unrelated keys are fine.

use core::hash::{BuildHasher, BuildHasherDefault, Hash};
use core::marker::PhantomData;
use core::ptr;
use std::collections::hash_map::DefaultHasher;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::time::Duration;

use bytemuck::Pod;
use tracing::trace;

use crate::backoff::{Backoff, DEFAULT_TIMEOUT};
use crate::bucket::{Bucket, BucketState};
use crate::status::{Status, VisitOutcome};
use crate::ShmInit;

/// Deterministic build-hasher used by default.
///
/// `DefaultHasher::default()` is unkeyed, so every process of the same build
/// computes identical hashes — the property the shared table requires.
pub type DefaultHashBuilder = BuildHasherDefault<DefaultHasher>;

/// How a visit treats a missing key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    /// Only visit keys that are already present.
    AccessExist,
    /// Claim an empty slot and create the entry if the key is missing.
    CreateIfMiss,
}

/// Lock-free hash table over `CAPACITY` buckets.
///
/// `ROLLBACK` snapshots the value before each visitor runs on an existing
/// entry and restores it if the visitor fails; failed insert visitors then
/// revert the bucket to empty instead of publishing the key.
#[repr(C)]
pub struct HashTable<
    K,
    V,
    const CAPACITY: usize,
    S = DefaultHashBuilder,
    const ROLLBACK: bool = false,
> {
    buckets: [Bucket<K, V>; CAPACITY],
    _hasher: PhantomData<fn() -> S>,
}

/// A [`HashTable`] with value rollback on visitor failure.
pub type RollbackHashTable<K, V, const CAPACITY: usize, S = DefaultHashBuilder> =
    HashTable<K, V, CAPACITY, S, true>;

impl<K, V, const CAPACITY: usize, S, const ROLLBACK: bool> HashTable<K, V, CAPACITY, S, ROLLBACK>
where
    K: Pod + Hash + Eq,
    V: Pod,
    S: BuildHasher + Default,
{
    const CAPACITY_OK: () = assert!(CAPACITY > 0, "CAPACITY must be > 0");

    #[inline]
    pub const fn capacity(&self) -> usize {
        CAPACITY
    }

    #[inline]
    fn home_index(key: &K) -> usize {
        (S::default().hash_one(key) % CAPACITY as u64) as usize
    }

    /// [`HashTable::visit_timeout`] with the default five-second budget.
    pub fn visit<F, R>(&self, key: &K, mode: AccessMode, visitor: F) -> Status
    where
        F: FnMut(usize, &mut V, bool) -> R,
        R: VisitOutcome,
    {
        self.visit_timeout(key, mode, visitor, DEFAULT_TIMEOUT)
    }

    /// Visit the entry for `key`.
    ///
    /// The visitor receives `(slot_index, value, is_new)` and runs while the
    /// bucket is held exclusively. Returns the visitor's status on a
    /// completed visit, `NotFound` for a miss (or an exhausted probe chain),
    /// and `Timeout` when the backoff budget runs out. A panicking visitor
    /// is reported as `Exception` after any rollback.
    pub fn visit_timeout<F, R>(
        &self,
        key: &K,
        mode: AccessMode,
        mut visitor: F,
        timeout: Duration,
    ) -> Status
    where
        F: FnMut(usize, &mut V, bool) -> R,
        R: VisitOutcome,
    {
        let _ = Self::CAPACITY_OK;
        let mut backoff = Backoff::new(timeout);
        let home = Self::home_index(key);

        for probe in 0..CAPACITY {
            let index = (home + probe) % CAPACITY;
            let bucket = &self.buckets[index];

            loop {
                let state = bucket.state_word();

                if state == BucketState::Ready as u32 {
                    // SAFETY: Ready was observed with acquire ordering and
                    // the key is never rewritten once published.
                    if unsafe { *bucket.key() } != *key {
                        break; // collision, advance the probe
                    }

                    if bucket
                        .try_transition(BucketState::Ready, BucketState::Accessing)
                        .is_err()
                    {
                        if !backoff.next() {
                            trace!(index, "visit: backoff timeout");
                            return Status::Timeout;
                        }
                        continue;
                    }
                    trace!(index, "visit: ready -> accessing");

                    // SAFETY: Accessing grants exclusive value access.
                    let value = unsafe { bucket.value_mut() };
                    let saved = if ROLLBACK { Some(*value) } else { None };
                    let status = apply_visitor(&mut visitor, index, value, false);
                    if status.is_failed() {
                        if let Some(old) = saved {
                            trace!(index, "visit: rolling back value");
                            *value = old;
                        }
                    }
                    bucket.publish(BucketState::Ready);
                    return status;
                }

                if state == BucketState::Empty as u32 {
                    match mode {
                        // A stable chain of non-empty slots would have been
                        // required to place the key past this point.
                        AccessMode::AccessExist => return Status::NotFound,
                        AccessMode::CreateIfMiss => {
                            if bucket
                                .try_transition(BucketState::Empty, BucketState::Inserting)
                                .is_err()
                            {
                                if !backoff.next() {
                                    trace!(index, "visit: backoff timeout");
                                    return Status::Timeout;
                                }
                                continue;
                            }
                            trace!(index, "visit: empty -> inserting");

                            // SAFETY: Inserting grants exclusive access.
                            let value = unsafe { bucket.value_mut() };
                            *value = V::zeroed();
                            let status = apply_visitor(&mut visitor, index, value, true);

                            if ROLLBACK && status.is_failed() {
                                trace!(index, "visit: inserting -> empty (rollback)");
                                bucket.publish(BucketState::Empty);
                                return status;
                            }

                            // SAFETY: still holding Inserting; the key must
                            // be in place before the Ready publish.
                            unsafe {
                                *bucket.key_mut() = *key;
                            }
                            trace!(index, "visit: inserting -> ready");
                            bucket.publish(BucketState::Ready);
                            return status;
                        }
                    }
                }

                // Inserting or Accessing: wait for the holder.
                if !backoff.next() {
                    trace!(index, "visit: backoff timeout");
                    return Status::Timeout;
                }
            }
        }

        // Every slot is Ready with some other key.
        Status::NotFound
    }

    /// [`HashTable::travel_timeout`] with the default five-second budget.
    pub fn travel<F, R>(&self, visitor: F) -> Status
    where
        F: FnMut(usize, &K, &mut V) -> R,
        R: VisitOutcome,
    {
        self.travel_timeout(visitor, DEFAULT_TIMEOUT)
    }

    /// Visit every populated bucket in index order.
    ///
    /// Each slot is claimed, visited, and released independently; the scan
    /// is a sequence of per-slot critical sections, not a consistent
    /// snapshot. A failing visitor stops the traversal with its status.
    pub fn travel_timeout<F, R>(&self, mut visitor: F, timeout: Duration) -> Status
    where
        F: FnMut(usize, &K, &mut V) -> R,
        R: VisitOutcome,
    {
        let _ = Self::CAPACITY_OK;
        let mut backoff = Backoff::new(timeout);

        for (index, bucket) in self.buckets.iter().enumerate() {
            loop {
                let state = bucket.state_word();

                if state == BucketState::Empty as u32 {
                    break; // never published, skip
                }

                if state == BucketState::Ready as u32 {
                    if bucket
                        .try_transition(BucketState::Ready, BucketState::Accessing)
                        .is_err()
                    {
                        if !backoff.next() {
                            return Status::Timeout;
                        }
                        continue;
                    }

                    // SAFETY: Accessing grants exclusive access to both.
                    let key = unsafe { bucket.key() };
                    let value = unsafe { bucket.value_mut() };
                    let status = match catch_unwind(AssertUnwindSafe(|| {
                        visitor(index, key, value).into_status()
                    })) {
                        Ok(status) => status,
                        Err(_) => Status::Exception,
                    };
                    bucket.publish(BucketState::Ready);
                    if status.is_failed() {
                        return status;
                    }
                    break;
                }

                if !backoff.next() {
                    return Status::Timeout;
                }
            }
        }

        Status::Success
    }

    /// Raw access to one bucket, outside the state machine.
    ///
    /// For supervision at quiescent time (auditing, recovery, direct-index
    /// reads); the caller guarantees the bucket is uncontended. Out-of-range
    /// indices report `InvalidArgument`.
    pub fn visit_bucket<F, R>(&self, index: usize, f: F) -> Status
    where
        F: FnOnce(&Bucket<K, V>) -> R,
        R: VisitOutcome,
    {
        let Some(bucket) = self.buckets.get(index) else {
            return Status::InvalidArgument;
        };
        match catch_unwind(AssertUnwindSafe(|| f(bucket).into_status())) {
            Ok(status) => status,
            Err(_) => Status::Exception,
        }
    }

    /// Raw scan over all buckets, outside the state machine.
    ///
    /// Same quiescence contract as [`HashTable::visit_bucket`]. A failing
    /// callback stops the scan with its status.
    pub fn travel_bucket<F, R>(&self, mut f: F) -> Status
    where
        F: FnMut(usize, &Bucket<K, V>) -> R,
        R: VisitOutcome,
    {
        for (index, bucket) in self.buckets.iter().enumerate() {
            let status = match catch_unwind(AssertUnwindSafe(|| f(index, bucket).into_status())) {
                Ok(status) => status,
                Err(_) => Status::Exception,
            };
            if status.is_failed() {
                return status;
            }
        }
        Status::Success
    }
}

impl<K, V, const CAPACITY: usize, S, const ROLLBACK: bool> ShmInit
    for HashTable<K, V, CAPACITY, S, ROLLBACK>
where
    K: Pod + Hash + Eq,
    V: Pod,
    S: BuildHasher + Default,
{
    unsafe fn init_in_place(this: *mut Self) {
        let _ = Self::CAPACITY_OK;
        for i in 0..CAPACITY {
            unsafe {
                Bucket::init_in_place(ptr::addr_of_mut!((*this).buckets[i]));
            }
        }
    }
}

fn apply_visitor<V, F, R>(visitor: &mut F, index: usize, value: &mut V, is_new: bool) -> Status
where
    F: FnMut(usize, &mut V, bool) -> R,
    R: VisitOutcome,
{
    match catch_unwind(AssertUnwindSafe(|| visitor(index, value, is_new).into_status())) {
        Ok(status) => status,
        Err(_) => Status::Exception,
    }
}

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use super::*;
    use crate::testutil::boxed;
    use core::hash::Hasher;
    use std::sync::atomic::{AtomicBool, Ordering as StdOrdering};
    use std::time::Instant;

    /// Identity hash, so `key % CAPACITY` picks the home slot directly.
    #[derive(Default)]
    struct IdentityBuild;

    struct IdentityHasher(u64);

    impl BuildHasher for IdentityBuild {
        type Hasher = IdentityHasher;
        fn build_hasher(&self) -> IdentityHasher {
            IdentityHasher(0)
        }
    }

    impl Hasher for IdentityHasher {
        fn finish(&self) -> u64 {
            self.0
        }
        fn write(&mut self, bytes: &[u8]) {
            let mut buf = [0u8; 8];
            let n = bytes.len().min(8);
            buf[..n].copy_from_slice(&bytes[..n]);
            self.0 = u64::from_le_bytes(buf);
        }
        fn write_u64(&mut self, v: u64) {
            self.0 = v;
        }
    }

    type SmallTable = HashTable<u64, u64, 16>;
    type ChainTable = HashTable<u64, u64, 4, IdentityBuild>;
    type RbTable = RollbackHashTable<u64, u64, 16>;

    fn peek<const N: usize, S, const R: bool>(
        table: &HashTable<u64, u64, N, S, R>,
        key: u64,
    ) -> Option<u64>
    where
        S: BuildHasher + Default,
    {
        let mut out = None;
        let status = table.visit(&key, AccessMode::AccessExist, |_, v, _| {
            out = Some(*v);
        });
        match status {
            Status::Success => out,
            Status::NotFound => None,
            other => panic!("peek failed: {other}"),
        }
    }

    #[test]
    fn insert_then_read() {
        let table = boxed::<HashTable<u64, [u8; 16], 16>>();

        let mut was_new = false;
        let status = table.visit(&42, AccessMode::CreateIfMiss, |_, v, is_new| {
            was_new = is_new;
            v[..5].copy_from_slice(b"hello");
        });
        assert_eq!(status, Status::Success);
        assert!(was_new);

        let status = table.visit(&42, AccessMode::AccessExist, |_, v, is_new| {
            assert!(!is_new);
            assert_eq!(&v[..5], b"hello");
        });
        assert_eq!(status, Status::Success);
    }

    #[test]
    fn missing_key_not_found() {
        let table = boxed::<SmallTable>();
        assert_eq!(
            table.visit(&7, AccessMode::AccessExist, |_, _, _| {}),
            Status::NotFound
        );
    }

    #[test]
    fn collision_chain_probes_linearly() {
        let table = boxed::<ChainTable>();

        // All three keys hash to slot 0.
        for key in [0u64, 4, 8] {
            let status = table.visit(&key, AccessMode::CreateIfMiss, |_, v, is_new| {
                assert!(is_new);
                *v = key * 10;
            });
            assert_eq!(status, Status::Success, "insert {key}");
        }

        assert_eq!(peek(&table, 0), Some(0));
        assert_eq!(peek(&table, 4), Some(40));
        assert_eq!(peek(&table, 8), Some(80));
        assert_eq!(peek(&table, 12), None);
    }

    #[test]
    fn full_table_rejects_new_keys() {
        let table = boxed::<ChainTable>();
        for key in 0u64..4 {
            assert_eq!(
                table.visit(&key, AccessMode::CreateIfMiss, |_, v, _| *v = key),
                Status::Success
            );
        }
        assert_eq!(
            table.visit(&99, AccessMode::CreateIfMiss, |_, _, _| {}),
            Status::NotFound
        );
        // Existing keys still reachable.
        assert_eq!(peek(&table, 3), Some(3));
    }

    #[test]
    fn visitor_status_passes_through() {
        let table = boxed::<SmallTable>();
        assert_eq!(
            table.visit(&1, AccessMode::CreateIfMiss, |_, _, _| Status::OutOfMemory),
            Status::OutOfMemory
        );
        // Without rollback the failed insert still published the entry.
        assert_eq!(peek(&table, 1), Some(0));

        assert_eq!(
            table.visit(&1, AccessMode::AccessExist, |_, _, _| false),
            Status::Error
        );
    }

    #[test]
    fn rollback_insert_failure_leaves_empty() {
        let table = boxed::<RbTable>();
        assert_eq!(
            table.visit(&42, AccessMode::CreateIfMiss, |_, _, _| false),
            Status::Error
        );
        assert_eq!(peek(&table, 42), None);
    }

    #[test]
    fn rollback_update_failure_restores_value() {
        let table = boxed::<RbTable>();
        assert_eq!(
            table.visit(&7, AccessMode::CreateIfMiss, |_, v, _| {
                *v = 1;
                true
            }),
            Status::Success
        );
        assert_eq!(
            table.visit(&7, AccessMode::AccessExist, |_, v, _| {
                *v = 2;
                false
            }),
            Status::Error
        );
        assert_eq!(peek(&table, 7), Some(1));
    }

    #[test]
    fn panicking_visitor_reports_exception_and_releases() {
        let table = boxed::<RbTable>();
        let status = table.visit(&5, AccessMode::CreateIfMiss, |_, _, _| -> Status {
            panic!("visitor blew up");
        });
        assert_eq!(status, Status::Exception);
        // Rollback reverted the claim; the bucket is usable again.
        assert_eq!(peek(&table, 5), None);
        assert_eq!(
            table.visit(&5, AccessMode::CreateIfMiss, |_, v, _| *v = 1),
            Status::Success
        );
        assert_eq!(peek(&table, 5), Some(1));
    }

    #[test]
    fn concurrent_increments_sum_exactly() {
        const THREADS: usize = 8;
        const PER_THREAD: u64 = 1000;

        let table = boxed::<SmallTable>();
        std::thread::scope(|scope| {
            for _ in 0..THREADS {
                scope.spawn(|| {
                    for _ in 0..PER_THREAD {
                        let status =
                            table.visit(&1, AccessMode::CreateIfMiss, |_, v, _| *v += 1);
                        assert_eq!(status, Status::Success);
                    }
                });
            }
        });

        assert_eq!(peek(&table, 1), Some(THREADS as u64 * PER_THREAD));
    }

    #[test]
    fn held_bucket_times_out_then_recovers() {
        let table = boxed::<SmallTable>();
        let holding = AtomicBool::new(false);

        std::thread::scope(|scope| {
            scope.spawn(|| {
                table.visit(&99, AccessMode::CreateIfMiss, |_, v, _| {
                    holding.store(true, StdOrdering::Release);
                    std::thread::sleep(Duration::from_millis(200));
                    *v = 7;
                });
            });

            while !holding.load(StdOrdering::Acquire) {
                std::hint::spin_loop();
            }

            let start = Instant::now();
            let status = table.visit_timeout(
                &99,
                AccessMode::AccessExist,
                |_, _, _| {},
                Duration::from_millis(100),
            );
            assert_eq!(status, Status::Timeout);
            assert!(start.elapsed() >= Duration::from_millis(100));
        });

        // Once the holder commits, the value is visible.
        assert_eq!(peek(&table, 99), Some(7));
    }

    #[test]
    fn travel_visits_every_entry() {
        let table = boxed::<SmallTable>();
        for key in [3u64, 5, 11] {
            table.visit(&key, AccessMode::CreateIfMiss, |_, v, _| *v = key * 2);
        }

        let mut seen = Vec::new();
        let status = table.travel(|_, k, v| {
            seen.push((*k, *v));
        });
        assert_eq!(status, Status::Success);
        seen.sort_unstable();
        assert_eq!(seen, vec![(3, 6), (5, 10), (11, 22)]);
    }

    #[test]
    fn travel_stops_on_visitor_failure() {
        let table = boxed::<SmallTable>();
        for key in 0u64..4 {
            table.visit(&key, AccessMode::CreateIfMiss, |_, v, _| *v = key);
        }

        let mut visited = 0;
        let status = table.travel(|_, _, _| {
            visited += 1;
            if visited == 2 { Status::Error } else { Status::Success }
        });
        assert_eq!(status, Status::Error);
        assert_eq!(visited, 2);
        // All claims were released.
        assert_eq!(table.travel(|_, _, _| {}), Status::Success);
    }

    #[test]
    fn bucket_direct_access() {
        let table = boxed::<SmallTable>();
        table.visit(&2, AccessMode::CreateIfMiss, |_, v, _| *v = 20);

        assert_eq!(
            table.visit_bucket(CAPACITY_OOB, |_| {}),
            Status::InvalidArgument
        );

        let mut populated = 0;
        let status = table.travel_bucket(|_, bucket| {
            if bucket.state() == Some(crate::BucketState::Ready) {
                populated += 1;
                // SAFETY: the table is quiescent in this test.
                assert_eq!(unsafe { *bucket.value() }, 20);
            }
        });
        assert_eq!(status, Status::Success);
        assert_eq!(populated, 1);
    }

    const CAPACITY_OOB: usize = 16;
}
