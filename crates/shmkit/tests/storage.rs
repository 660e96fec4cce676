//! Segment lifecycle and cross-handle bootstrap tests.
//!
//! Every test uses a unique segment name (pid + monotonic counter) and
//! unlinks it on the way out, so runs never observe each other's state.

use std::sync::atomic::{AtomicU64, Ordering};

use shmkit::{AccessMode, HashTable, Segment, SegmentConfig, SegmentError, SpscRing, Status};

type Counters = HashTable<u64, u64, 64>;

static NAME_SEQ: AtomicU64 = AtomicU64::new(0);

fn unique_name(tag: &str) -> String {
    format!(
        "/shmkit-test-{}-{}-{}",
        tag,
        std::process::id(),
        NAME_SEQ.fetch_add(1, Ordering::Relaxed)
    )
}

fn read_counter(segment: &Segment<Counters>, key: u64) -> Option<u64> {
    let mut out = None;
    let status = segment.visit(&key, AccessMode::AccessExist, |_, v, _| {
        out = Some(*v);
    });
    match status {
        Status::Success => out,
        Status::NotFound => None,
        other => panic!("read failed: {other}"),
    }
}

#[test]
fn create_insert_read() {
    let name = unique_name("basic");
    let segment = Segment::<Counters>::open(&name).unwrap();
    assert!(segment.is_owner());
    assert_eq!(segment.name(), name);

    let status = segment.visit(&42, AccessMode::CreateIfMiss, |_, v, is_new| {
        assert!(is_new);
        *v = 7;
    });
    assert_eq!(status, Status::Success);
    assert_eq!(read_counter(&segment, 42), Some(7));

    segment.destroy().unwrap();
}

#[test]
fn second_handle_sees_prior_data() {
    let name = unique_name("reopen");
    let first = Segment::<Counters>::open(&name).unwrap();
    first.visit(&1, AccessMode::CreateIfMiss, |_, v, _| *v = 99);

    let second = Segment::<Counters>::open(&name).unwrap();
    assert!(!second.is_owner());
    assert_eq!(read_counter(&second, 1), Some(99));

    // Writes through either handle land in the same table.
    second.visit(&1, AccessMode::AccessExist, |_, v, _| *v += 1);
    assert_eq!(read_counter(&first, 1), Some(100));

    drop(second);
    first.destroy().unwrap();
}

#[test]
fn dropping_a_handle_keeps_the_segment() {
    let name = unique_name("persist");
    {
        let segment = Segment::<Counters>::open(&name).unwrap();
        segment.visit(&5, AccessMode::CreateIfMiss, |_, v, _| *v = 55);
    }
    // The name survived the handle; the next open attaches, not creates.
    let segment = Segment::<Counters>::open(&name).unwrap();
    assert!(!segment.is_owner());
    assert_eq!(read_counter(&segment, 5), Some(55));
    segment.destroy().unwrap();
}

#[test]
fn destroy_allows_fresh_recreation() {
    let name = unique_name("recreate");
    let segment = Segment::<Counters>::open(&name).unwrap();
    segment.visit(&9, AccessMode::CreateIfMiss, |_, v, _| *v = 1);
    segment.destroy().unwrap();

    let fresh = Segment::<Counters>::open(&name).unwrap();
    assert!(fresh.is_owner());
    assert_eq!(read_counter(&fresh, 9), None);
    fresh.destroy().unwrap();
}

#[test]
fn concurrent_opens_elect_one_owner_and_share_state() {
    const THREADS: usize = 8;
    const PER_THREAD: u64 = 500;

    let name = unique_name("race");
    let owners = AtomicU64::new(0);

    std::thread::scope(|scope| {
        for _ in 0..THREADS {
            scope.spawn(|| {
                let segment = Segment::<Counters>::open(&name).unwrap();
                if segment.is_owner() {
                    owners.fetch_add(1, Ordering::Relaxed);
                }
                for _ in 0..PER_THREAD {
                    let status = segment.visit(&1, AccessMode::CreateIfMiss, |_, v, _| *v += 1);
                    assert_eq!(status, Status::Success);
                }
            });
        }
    });

    assert_eq!(owners.load(Ordering::Relaxed), 1, "exactly one creator");

    let segment = Segment::<Counters>::open(&name).unwrap();
    assert_eq!(
        read_counter(&segment, 1),
        Some(THREADS as u64 * PER_THREAD)
    );
    segment.destroy().unwrap();
}

#[test]
fn ring_shared_between_handles() {
    let name = unique_name("ring");
    let producer = Segment::<SpscRing<u64, 8>>::open(&name).unwrap();
    let consumer = Segment::<SpscRing<u64, 8>>::open(&name).unwrap();

    std::thread::scope(|scope| {
        scope.spawn(|| {
            for i in 0..100u64 {
                while producer.try_push(i).is_err() {
                    std::thread::yield_now();
                }
            }
        });

        let mut expected = 0u64;
        while expected < 100 {
            if let Some(v) = consumer.try_pop() {
                assert_eq!(v, expected);
                expected += 1;
            } else {
                std::thread::yield_now();
            }
        }
    });

    drop(consumer);
    producer.destroy().unwrap();
}

#[test]
fn rejects_invalid_names() {
    assert!(matches!(
        Segment::<Counters>::open("no-slash"),
        Err(SegmentError::InvalidName)
    ));
    assert!(matches!(
        Segment::<Counters>::open("/"),
        Err(SegmentError::InvalidName)
    ));
}

#[test]
fn size_mismatch_detected_on_attach() {
    let name = unique_name("mismatch");
    // A larger layout claims the name first.
    let big = Segment::<HashTable<u64, [u8; 64], 64>>::open(&name).unwrap();

    let config = SegmentConfig {
        ready_timeout: std::time::Duration::from_millis(100),
        ..SegmentConfig::default()
    };
    match Segment::<Counters>::open_with(&name, config) {
        Err(SegmentError::SizeMismatch { expected, found }) => {
            assert!(found > expected);
        }
        other => panic!("expected SizeMismatch, got {:?}", other.map(|_| ())),
    }

    big.destroy().unwrap();
}
