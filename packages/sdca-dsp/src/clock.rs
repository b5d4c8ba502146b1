//! Monotonic performance counter abstraction.
//!
//! Every scheduling decision in the engines and the keyword detector is made
//! against a `PerformanceClock`, so tests can freeze or jump time with a
//! `ManualClock` while production code runs on `SystemClock`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use crate::format::HNS_PER_SEC;

/// Counter frequency reported by `SystemClock` (10 MHz, 100ns ticks).
pub const SYSTEM_CLOCK_FREQUENCY: u64 = HNS_PER_SEC;

pub trait PerformanceClock: Send + Sync {
    /// Current counter value in ticks.
    fn query_counter(&self) -> u64;

    /// Ticks per second.
    fn frequency(&self) -> u64;

    /// Convert a counter value to 100ns units.
    fn to_hns(&self, counter: u64) -> u64 {
        let frequency = self.frequency().max(1) as u128;
        (counter as u128 * HNS_PER_SEC as u128 / frequency) as u64
    }

    fn now_hns(&self) -> u64 {
        self.to_hns(self.query_counter())
    }
}

/// Wall-clock backed counter anchored at construction time.
#[derive(Debug, Clone)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl PerformanceClock for SystemClock {
    fn query_counter(&self) -> u64 {
        // Offset by one tick so a freshly created clock never reads zero;
        // zero is reserved as "not started" by the buffering window.
        self.origin.elapsed().as_nanos() as u64 / 100 + 1
    }

    fn frequency(&self) -> u64 {
        SYSTEM_CLOCK_FREQUENCY
    }
}

/// Caller-driven counter for deterministic scheduling tests.
#[derive(Debug)]
pub struct ManualClock {
    counter: AtomicU64,
    frequency: u64,
}

impl ManualClock {
    pub fn new(frequency: u64) -> Self {
        Self {
            counter: AtomicU64::new(1),
            frequency: frequency.max(1),
        }
    }

    pub fn set(&self, counter: u64) {
        self.counter.store(counter, Ordering::SeqCst);
    }

    pub fn advance(&self, ticks: u64) {
        self.counter.fetch_add(ticks, Ordering::SeqCst);
    }

    /// Advance by a duration expressed in milliseconds.
    pub fn advance_ms(&self, ms: u64) {
        self.advance(ms * self.frequency / 1000);
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(SYSTEM_CLOCK_FREQUENCY)
    }
}

impl PerformanceClock for ManualClock {
    fn query_counter(&self) -> u64 {
        self.counter.load(Ordering::SeqCst)
    }

    fn frequency(&self) -> u64 {
        self.frequency
    }
}
