//! Atomic helpers for timestamps and counters.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;
use std::time::Instant;

/// Milliseconds elapsed since the first call in this process.
///
/// All `last_alloc_tick` values share this clock, so ticks are comparable
/// across lanes and highways.
pub fn now_ms() -> u64 {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    EPOCH.get_or_init(Instant::now).elapsed().as_millis() as u64
}

/// A monotonically advancing millisecond tick.
///
/// `touch` publishes the current tick but never moves the value backwards,
/// so concurrent writers cannot make an observer see time regress.
pub struct TickCell(AtomicU64);

impl TickCell {
    /// Create a cell at tick zero.
    pub const fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    /// Publish the current tick.
    pub fn touch(&self) {
        self.advance_to(now_ms());
    }

    /// Advance to `tick` if it is ahead of the stored value.
    pub fn advance_to(&self, tick: u64) {
        let mut current = self.0.load(Ordering::Relaxed);
        while tick > current {
            match self.0.compare_exchange_weak(
                current,
                tick,
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(c) => current = c,
            }
        }
    }

    /// Get the last published tick.
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Acquire)
    }
}

impl Default for TickCell {
    fn default() -> Self {
        Self::new()
    }
}
