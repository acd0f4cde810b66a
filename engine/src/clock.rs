//! Clock sources for field timestamps.
//!
//! Records and fields take timestamps as explicit arguments. Only the
//! [`Store`](crate::Store) reads a clock, through the [`Clock`] trait, so the
//! versioning model stays deterministic under test.

use crate::Timestamp;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// A source of "now" in milliseconds since the Unix epoch.
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// Read the current time.
    fn now(&self) -> Timestamp;
}

/// Wall clock that never repeats or goes backwards within a process.
///
/// Each reading is `max(wall, previous + 1)`, so two writes in the same
/// millisecond still get strictly increasing timestamps.
#[derive(Debug, Default)]
pub struct SystemClock {
    last: AtomicI64,
}

impl SystemClock {
    /// Create a new system clock.
    pub fn new() -> Self {
        Self::default()
    }
}

fn wall_millis() -> Timestamp {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as Timestamp)
        .unwrap_or(0)
}

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        let wall = wall_millis();
        let mut prev = self.last.load(Ordering::Relaxed);
        loop {
            let next = wall.max(prev + 1);
            match self
                .last
                .compare_exchange_weak(prev, next, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => return next,
                Err(actual) => prev = actual,
            }
        }
    }
}

/// A manually driven clock for tests and simulations.
///
/// Every reading returns the current value and then advances it by `step`
/// (0 freezes the clock).
#[derive(Debug)]
pub struct ManualClock {
    current: AtomicI64,
    step: i64,
}

impl ManualClock {
    /// Create a clock starting at `start` that advances by 1 per reading.
    pub fn new(start: Timestamp) -> Self {
        Self::with_step(start, 1)
    }

    /// Create a clock with a custom step.
    pub fn with_step(start: Timestamp, step: i64) -> Self {
        Self {
            current: AtomicI64::new(start),
            step,
        }
    }

    /// Jump to an absolute time.
    pub fn set(&self, to: Timestamp) {
        self.current.store(to, Ordering::SeqCst);
    }

    /// Peek without advancing.
    pub fn peek(&self) -> Timestamp {
        self.current.load(Ordering::SeqCst)
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        self.current.fetch_add(self.step, Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_clock_strictly_increases() {
        let clock = SystemClock::new();
        let mut prev = clock.now();
        for _ in 0..10_000 {
            let next = clock.now();
            assert!(next > prev);
            prev = next;
        }
    }

    #[test]
    fn system_clock_tracks_wall_time() {
        let clock = SystemClock::new();
        let before = wall_millis();
        let reading = clock.now();
        assert!(reading >= before);
    }

    #[test]
    fn manual_clock_advances_by_step() {
        let clock = ManualClock::with_step(100, 10);
        assert_eq!(clock.now(), 100);
        assert_eq!(clock.now(), 110);
        assert_eq!(clock.peek(), 120);
    }

    #[test]
    fn manual_clock_set() {
        let clock = ManualClock::new(0);
        clock.set(5000);
        assert_eq!(clock.now(), 5000);
        assert_eq!(clock.now(), 5001);
    }

    #[test]
    fn frozen_manual_clock() {
        let clock = ManualClock::with_step(42, 0);
        assert_eq!(clock.now(), 42);
        assert_eq!(clock.now(), 42);
    }
}
