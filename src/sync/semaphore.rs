//! Counted permit semaphore with bounded acquisition.
//!
//! Gates concurrent lane creation on the highway.

use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// A semaphore handing out up to `capacity` permits.
pub struct Semaphore {
    available: Mutex<u32>,
    cvar: Condvar,
}

impl Semaphore {
    /// Create a semaphore with the given permit capacity.
    pub fn new(capacity: u32) -> Self {
        Self {
            available: Mutex::new(capacity),
            cvar: Condvar::new(),
        }
    }

    /// Acquire one permit, waiting up to `timeout_ms` (negative = forever).
    ///
    /// Returns `None` if the wait expired.
    pub fn acquire_timeout(&self, timeout_ms: i64) -> Option<Permit<'_>> {
        let mut available = self.available.lock().expect("semaphore lock poisoned");

        if timeout_ms < 0 {
            while *available == 0 {
                available = self.cvar.wait(available).expect("semaphore lock poisoned");
            }
        } else {
            let deadline = Instant::now() + Duration::from_millis(timeout_ms as u64);
            while *available == 0 {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    return None;
                }
                let (guard, _timed_out) = self
                    .cvar
                    .wait_timeout(available, remaining)
                    .expect("semaphore lock poisoned");
                available = guard;
            }
        }

        *available -= 1;
        Some(Permit { semaphore: self })
    }

    fn release(&self) {
        let mut available = self.available.lock().expect("semaphore lock poisoned");
        *available += 1;
        self.cvar.notify_one();
    }
}

/// RAII permit; releasing happens on drop.
pub struct Permit<'a> {
    semaphore: &'a Semaphore,
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        self.semaphore.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_acquire_and_release() {
        let sem = Semaphore::new(1);
        let permit = sem.acquire_timeout(0);
        assert!(permit.is_some());

        // Second acquire fails while the permit is held.
        assert!(sem.acquire_timeout(0).is_none());

        drop(permit);
        assert!(sem.acquire_timeout(0).is_some());
    }

    #[test]
    fn test_waiters_wake_on_release() {
        let sem = Arc::new(Semaphore::new(1));
        let held = sem.acquire_timeout(-1).unwrap();

        let sem2 = Arc::clone(&sem);
        let waiter = std::thread::spawn(move || sem2.acquire_timeout(2000).is_some());

        std::thread::sleep(Duration::from_millis(20));
        drop(held);
        assert!(waiter.join().unwrap());
    }
}
