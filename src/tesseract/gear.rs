//! Gear state machine and the background shift notifier.
//!
//! Gears partition the concurrent operations permitted on a Tesseract so
//! that structural mutation never races with incompatible access. Shift
//! events are delivered to an optional sink on a worker thread; a sink that
//! panics is logged and never unwinds into container operations.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_queue::SegQueue;

/// Operation mode of a Tesseract.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gear {
    /// get/set/take/format/not_null_items.
    Neutral,
    /// get/set/take/not_null_items/append. The default.
    Straight,
    /// get/set/take/not_null_items/remove_last.
    Reverse,
    /// Only resize. No slot access.
    Park,
}

impl Gear {
    pub(crate) fn from_raw(raw: i32) -> Gear {
        match raw {
            0 => Gear::Neutral,
            1 => Gear::Straight,
            2 => Gear::Reverse,
            _ => Gear::Park,
        }
    }

    pub(crate) fn raw(self) -> i32 {
        match self {
            Gear::Neutral => 0,
            Gear::Straight => 1,
            Gear::Reverse => 2,
            Gear::Park => 3,
        }
    }
}

/// Sink invoked after a gear shift is installed.
pub type GearShiftSink = Arc<dyn Fn(Gear, Gear) + Send + Sync>;

/// Queue-fed worker delivering gear-shift events off the shifting thread.
pub(crate) struct ShiftNotifier {
    events: Arc<SegQueue<(Gear, Gear)>>,
    stop: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl ShiftNotifier {
    pub(crate) fn start(sink: GearShiftSink) -> Self {
        let events: Arc<SegQueue<(Gear, Gear)>> = Arc::new(SegQueue::new());
        let stop = Arc::new(AtomicBool::new(false));

        let queue = Arc::clone(&events);
        let stopping = Arc::clone(&stop);
        let worker = std::thread::Builder::new()
            .name("tesseract-gear-notify".into())
            .spawn(move || loop {
                while let Some((from, to)) = queue.pop() {
                    let result = catch_unwind(AssertUnwindSafe(|| sink(from, to)));
                    if result.is_err() {
                        log::warn!("gear shift sink panicked for {:?} -> {:?}", from, to);
                    }
                }
                if stopping.load(Ordering::Acquire) && queue.is_empty() {
                    return;
                }
                std::thread::sleep(Duration::from_millis(1));
            })
            .expect("failed to spawn gear notifier thread");

        Self { events, stop, worker: Some(worker) }
    }

    /// Queue a shift event for delivery.
    pub(crate) fn publish(&self, from: Gear, to: Gear) {
        self.events.push((from, to));
    }
}

impl Drop for ShiftNotifier {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}
