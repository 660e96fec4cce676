//! Bounded adaptive waiting for contended atomic retries.
//!
//! The first few steps yield the CPU; later steps sleep for exponentially
//! growing intervals, capped at roughly one millisecond. The whole sequence
//! is bounded by a total budget so a stuck peer can never hang a caller.

use std::thread;
use std::time::{Duration, Instant};

/// Default budget for table and ring operations.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// First `YIELD_LIMIT` steps use `yield_now` only.
const YIELD_LIMIT: u32 = 10;

/// Exponent cap: `1 << MAX_BACKOFF_EXP` ns ≈ 1 ms.
const MAX_BACKOFF_EXP: u32 = 20;

/// Adaptive backoff with a total time budget.
pub struct Backoff {
    start: Instant,
    timeout: Duration,
    spin: u32,
}

impl Backoff {
    pub fn new(timeout: Duration) -> Self {
        Self {
            start: Instant::now(),
            timeout,
            spin: 0,
        }
    }

    /// Perform one wait step.
    ///
    /// Returns `false` once the elapsed time since construction exceeds the
    /// budget; the deadline check happens before any wait, and time spent
    /// sleeping counts against the budget.
    pub fn next(&mut self) -> bool {
        if self.start.elapsed() > self.timeout {
            return false;
        }

        if self.spin < YIELD_LIMIT {
            thread::yield_now();
        } else {
            let exp = (self.spin - YIELD_LIMIT).min(MAX_BACKOFF_EXP);
            thread::sleep(Duration::from_nanos(1u64 << exp));
        }
        self.spin += 1;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gives_up_after_budget() {
        let mut backoff = Backoff::new(Duration::from_millis(20));
        let start = Instant::now();
        while backoff.next() {}
        assert!(start.elapsed() >= Duration::from_millis(20));
        // Once expired it stays expired.
        assert!(!backoff.next());
    }

    #[test]
    fn zero_budget_expires_quickly() {
        let mut backoff = Backoff::new(Duration::ZERO);
        // The first call may still observe zero elapsed time, but the
        // sequence must terminate almost immediately.
        let start = Instant::now();
        while backoff.next() {}
        assert!(start.elapsed() < Duration::from_millis(100));
    }

    #[test]
    fn later_steps_slower_than_early_steps() {
        let mut backoff = Backoff::new(Duration::from_secs(10));

        let early = Instant::now();
        for _ in 0..10 {
            assert!(backoff.next());
        }
        let early = early.elapsed();

        let late = Instant::now();
        for _ in 0..10 {
            assert!(backoff.next());
        }
        let late = late.elapsed();

        // Yield-only steps must be cheaper on average than sleeping steps.
        assert!(late / 10 > early / 10, "early={early:?} late={late:?}");
    }
}
