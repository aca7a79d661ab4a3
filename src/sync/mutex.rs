//! Mutex wrapper - uses parking_lot if available, std otherwise.
//!
//! Extends the plain facade with `lock_timeout`, the bounded acquisition
//! used by the lane's awaited allocation path.

use std::time::Duration;

#[cfg(feature = "parking_lot")]
mod imp {
    use std::time::Duration;

    pub use parking_lot::MutexGuard;

    /// Mutex with bounded acquisition.
    pub struct Mutex<T>(parking_lot::Mutex<T>);

    impl<T> Mutex<T> {
        /// Create a new mutex.
        pub const fn new(value: T) -> Self {
            Self(parking_lot::Mutex::new(value))
        }

        /// Lock the mutex, blocking until acquired.
        pub fn lock(&self) -> MutexGuard<'_, T> {
            self.0.lock()
        }

        /// Try to lock the mutex within `timeout`.
        pub fn lock_timeout(&self, timeout: Duration) -> Option<MutexGuard<'_, T>> {
            self.0.try_lock_for(timeout)
        }
    }
}

#[cfg(not(feature = "parking_lot"))]
mod imp {
    use std::sync::{Mutex as StdMutex, MutexGuard as StdMutexGuard};
    use std::time::{Duration, Instant};

    /// Mutex with bounded acquisition.
    pub struct Mutex<T>(StdMutex<T>);

    impl<T> Mutex<T> {
        /// Create a new mutex.
        pub const fn new(value: T) -> Self {
            Self(StdMutex::new(value))
        }

        /// Lock the mutex, blocking until acquired.
        pub fn lock(&self) -> MutexGuard<'_, T> {
            MutexGuard(self.0.lock().expect("Mutex poisoned"))
        }

        /// Try to lock the mutex within `timeout`.
        ///
        /// std has no timed mutex acquisition, so this spins on `try_lock`
        /// with a yield between attempts until the deadline passes.
        pub fn lock_timeout(&self, timeout: Duration) -> Option<MutexGuard<'_, T>> {
            let deadline = Instant::now() + timeout;
            loop {
                match self.0.try_lock() {
                    Ok(guard) => return Some(MutexGuard(guard)),
                    Err(std::sync::TryLockError::WouldBlock) => {
                        if Instant::now() >= deadline {
                            return None;
                        }
                        std::thread::yield_now();
                    }
                    Err(std::sync::TryLockError::Poisoned(_)) => {
                        panic!("Mutex poisoned")
                    }
                }
            }
        }
    }

    /// Guard for std mutex.
    pub struct MutexGuard<'a, T>(StdMutexGuard<'a, T>);

    impl<'a, T> std::ops::Deref for MutexGuard<'a, T> {
        type Target = T;

        fn deref(&self) -> &Self::Target {
            &self.0
        }
    }

    impl<'a, T> std::ops::DerefMut for MutexGuard<'a, T> {
        fn deref_mut(&mut self) -> &mut Self::Target {
            &mut self.0
        }
    }
}

pub use imp::{Mutex, MutexGuard};

/// Lock with an `await_ms` bound: negative waits forever, zero fails fast.
pub fn lock_awaited<T>(mutex: &Mutex<T>, await_ms: i64) -> Option<MutexGuard<'_, T>> {
    if await_ms < 0 {
        Some(mutex.lock())
    } else {
        mutex.lock_timeout(Duration::from_millis(await_ms as u64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_timeout_uncontended() {
        let m = Mutex::new(5u32);
        let guard = m.lock_timeout(Duration::from_millis(10));
        assert_eq!(*guard.unwrap(), 5);
    }

    #[test]
    fn test_lock_awaited_forever() {
        let m = Mutex::new(());
        assert!(lock_awaited(&m, -1).is_some());
    }

    #[test]
    fn test_lock_timeout_contended() {
        let m = std::sync::Arc::new(Mutex::new(()));
        let held = m.lock();
        let m2 = std::sync::Arc::clone(&m);
        let handle = std::thread::spawn(move || {
            m2.lock_timeout(Duration::from_millis(20)).is_none()
        });
        assert!(handle.join().unwrap());
        drop(held);
    }
}
