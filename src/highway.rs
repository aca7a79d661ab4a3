//! Highways - expandable ordered pools of lanes with a dispatch policy.
//!
//! Allocation walks the lanes oldest-first: the oldest lanes are the most
//! likely to be moments away from a reset, so favoring them keeps the pool
//! small. The lap count and per-lane try count are the only knobs trading
//! locality against contention.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use crate::error::Error;
use crate::fragment::Fragment;
use crate::lane::{HeapStorage, Lane, MappedStorage, Storage, UnmanagedStorage, MAX_LANE_CAPACITY};
use crate::settings::{DisposalMode, HighwaySettings};
use crate::sync::atomics::TickCell;
use crate::sync::semaphore::Semaphore;
use crate::tesseract::Tesseract;
use crate::util::size::format_bytes;

/// Highway over process-heap lanes.
pub type HeapHighway = Highway<HeapStorage>;
/// Highway over OS-allocator lanes.
pub type UnmanagedHighway = Highway<UnmanagedStorage>;
/// Highway over memory-mapped lanes.
pub type MappedHighway = Highway<MappedStorage>;

const OPERATIONAL: u8 = 0;
const DISPOSING: u8 = 1;
const DISPOSED: u8 = 2;

/// An ordered, growable pool of lanes sharing one dispatch policy.
///
/// Lanes are only appended; a removed lane is disposed or replaced in
/// place, so indices stay stable for the highway's lifetime. Dropping the
/// highway disposes it.
pub struct Highway<S: Storage> {
    lanes: Tesseract<Lane<S>>,
    settings: HighwaySettings,
    state: AtomicU8,
    last_alloc_tick: TickCell,
    creation_permits: Semaphore,
}

impl<S: Storage> Highway<S> {
    /// Create an empty highway; lanes are grown on demand.
    pub fn new(settings: HighwaySettings) -> Result<Self, Error> {
        settings.validate()?;
        let creation_permits = Semaphore::new(settings.concurrent_new_lane_allocations);
        Ok(Self {
            lanes: Tesseract::new(),
            settings,
            state: AtomicU8::new(OPERATIONAL),
            last_alloc_tick: TickCell::new(),
            creation_permits,
        })
    }

    /// Create a highway with one lane per entry of `capacities`.
    pub fn with_lanes(settings: HighwaySettings, capacities: &[usize]) -> Result<Self, Error> {
        let highway = Self::new(settings)?;
        for &capacity in capacities {
            let lane = Lane::<S>::with_tracking(capacity, highway.tracks_ghosts())?;
            if highway.lanes.append(lane)? < 0 {
                return Err(Error::AllocFailure("lane collection is full"));
            }
        }
        Ok(highway)
    }

    /// Carve a fragment of `size` bytes from the first lane that can serve
    /// it, growing the pool when none can.
    ///
    /// Returns `Ok(None)` only when a limit callback swallowed the breach or
    /// a lane refused in ghost-tracking mode with nothing else available;
    /// every other failure is typed.
    pub fn alloc_fragment(&self, size: usize) -> Result<Option<Fragment<S>>, Error> {
        self.ensure_operational()?;
        if size > MAX_LANE_CAPACITY {
            return Err(Error::SizeOutOfRange { size, min: 0, max: MAX_LANE_CAPACITY });
        }

        for _lap in 0..self.settings.laps_before_new_lane.max(1) {
            if let Some(fragment) = self.scan_lanes(size) {
                return Ok(Some(fragment));
            }
        }
        self.alloc_via_new_lane(size)
    }

    /// One oldest-first pass over the lanes.
    fn scan_lanes(&self, size: usize) -> Option<Fragment<S>> {
        let top = self.lanes.append_index();
        let mut index = 0i64;
        while index <= top {
            if let Ok(Some(lane)) = self.lanes.get(index as usize) {
                if !lane.disposed() {
                    if let Some(fragment) = lane.alloc(
                        size,
                        self.settings.lane_alloc_tries,
                        self.settings.lane_alloc_await_ms,
                    ) {
                        self.last_alloc_tick.touch();
                        return Some(fragment);
                    }
                }
            }
            index += 1;
        }
        None
    }

    fn alloc_via_new_lane(&self, size: usize) -> Result<Option<Fragment<S>>, Error> {
        let _permit = self
            .creation_permits
            .acquire_timeout(self.settings.new_lane_allocation_timeout_ms)
            .ok_or(Error::LockAcquisition)?;

        // A competing permit holder may have grown the pool while this
        // thread waited.
        if let Some(fragment) = self.scan_lanes(size) {
            return Ok(Some(fragment));
        }

        let last_index = self.lanes.append_index();
        let suggested = match &self.settings.next_capacity {
            Some(next) => next(last_index),
            None => self.settings.default_lane_capacity,
        };
        let capacity = suggested.max(size);

        let count = self.lanes_count();
        if count + 1 > self.settings.max_lanes_count {
            return match &self.settings.on_max_lanes_reached {
                Some(swallow) if swallow() => Ok(None),
                _ => Err(Error::MaxLanesCountReached { max: self.settings.max_lanes_count }),
            };
        }
        if self.total_capacity() + capacity as u64 > self.settings.max_total_allocated_bytes {
            return match &self.settings.on_max_total_bytes_reached {
                Some(swallow) if swallow() => Ok(None),
                _ => Err(Error::MaxTotalAllocBytesReached {
                    max: self.settings.max_total_allocated_bytes,
                }),
            };
        }

        let lane = Lane::<S>::with_tracking(capacity, self.tracks_ghosts())?;
        let fragment = lane
            .alloc(size, self.settings.lane_alloc_tries, self.settings.lane_alloc_await_ms)
            .ok_or(Error::NewLaneAllocFail { size })?;

        // The lane joins the pool only once it holds the fragment it was
        // created for.
        if self.lanes.append(Arc::clone(&lane))? < 0 {
            lane.dispose();
            return Err(Error::AllocFailure("lane collection is full"));
        }
        log::debug!("grew highway with {} lane ({})", S::kind(), format_bytes(capacity));
        self.last_alloc_tick.touch();
        Ok(Some(fragment))
    }

    /// Replace a disposed lane at `index` with a fresh one of the
    /// configured default capacity; `None` when the slot is empty or the
    /// lane there is still usable.
    pub fn reopen_lane(&self, index: usize) -> Result<Option<Arc<Lane<S>>>, Error> {
        self.ensure_operational()?;
        match self.lanes.get(index)? {
            Some(lane) if lane.disposed() => {
                let fresh = Lane::<S>::with_tracking(
                    self.settings.default_lane_capacity,
                    self.tracks_ghosts(),
                )?;
                self.lanes.set(index, Some(Arc::clone(&fresh)))?;
                log::debug!("reopened lane slot {}", index);
                Ok(Some(fresh))
            }
            _ => Ok(None),
        }
    }

    /// Dispose the lane at `index` but keep its slot.
    pub fn dispose_lane(&self, index: usize) -> Result<(), Error> {
        self.ensure_operational()?;
        if let Some(lane) = self.lanes.get(index)? {
            lane.dispose();
        }
        Ok(())
    }

    /// Sweep every lane for fragments dropped without a dispose.
    ///
    /// Requires the TrackGhosts disposal mode.
    pub fn free_ghosts(&self) -> Result<usize, Error> {
        self.ensure_operational()?;
        if self.settings.disposal_mode != DisposalMode::TrackGhosts {
            return Err(Error::IncorrectDisposalMode);
        }
        let mut freed = 0;
        for (_, lane) in self.snapshot_lanes() {
            if !lane.disposed() {
                freed += lane.free_ghosts()?;
            }
        }
        Ok(freed)
    }

    /// Summed capacity of non-disposed lanes.
    pub fn total_capacity(&self) -> u64 {
        self.snapshot_lanes()
            .iter()
            .filter(|(_, lane)| !lane.disposed())
            .map(|(_, lane)| lane.capacity() as u64)
            .sum()
    }

    /// Live fragments across all lanes.
    pub fn total_active_fragments(&self) -> i64 {
        self.snapshot_lanes()
            .iter()
            .filter(|(_, lane)| !lane.disposed())
            .map(|(_, lane)| lane.allocations())
            .sum()
    }

    /// Unallocated bytes across non-disposed lanes.
    pub fn total_free_space(&self) -> u64 {
        self.snapshot_lanes()
            .iter()
            .filter(|(_, lane)| !lane.disposed())
            .map(|(_, lane)| (lane.capacity() - lane.offset()) as u64)
            .sum()
    }

    /// Number of occupied lane slots (disposed lanes included).
    pub fn lanes_count(&self) -> usize {
        self.lanes.items_count().max(0) as usize
    }

    /// Index of the newest lane slot; −1 when empty.
    pub fn last_lane_index(&self) -> i64 {
        self.lanes.append_index()
    }

    /// The lane at `index`, if any.
    pub fn lane(&self, index: usize) -> Option<Arc<Lane<S>>> {
        self.lanes.get(index).ok().flatten()
    }

    /// Handles to every lane currently in the pool, in slot order.
    pub fn lanes(&self) -> Vec<Arc<Lane<S>>> {
        self.snapshot_lanes().into_iter().map(|(_, lane)| lane).collect()
    }

    /// Tick of the last successful allocation on any lane.
    pub fn last_alloc_tick(&self) -> u64 {
        self.last_alloc_tick.get()
    }

    /// The settings this highway runs with.
    pub fn settings(&self) -> &HighwaySettings {
        &self.settings
    }

    /// Dispose every lane exactly once and refuse further operations.
    /// Idempotent.
    pub fn dispose(&self) {
        if self
            .state
            .compare_exchange(OPERATIONAL, DISPOSING, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        for (_, lane) in self.snapshot_lanes() {
            lane.dispose();
        }
        self.state.store(DISPOSED, Ordering::Release);
        log::debug!("highway disposed");
    }

    fn tracks_ghosts(&self) -> bool {
        self.settings.disposal_mode == DisposalMode::TrackGhosts
    }

    fn ensure_operational(&self) -> Result<(), Error> {
        if self.state.load(Ordering::Acquire) != OPERATIONAL {
            return Err(Error::ObjectDisposed);
        }
        Ok(())
    }

    fn snapshot_lanes(&self) -> Vec<(usize, Arc<Lane<S>>)> {
        match self.lanes.not_null_items() {
            Ok(iter) => iter.collect(),
            // The highway never shifts its collection out of Straight.
            Err(_) => Vec::new(),
        }
    }
}

impl<S: Storage> Drop for Highway<S> {
    fn drop(&mut self) {
        self.dispose();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tiny_settings() -> HighwaySettings {
        HighwaySettings::default()
            .with_default_lane_capacity(1024)
            .with_laps_before_new_lane(1)
    }

    #[test]
    fn test_grows_first_lane_on_demand() {
        let highway = HeapHighway::new(tiny_settings()).unwrap();
        assert_eq!(highway.lanes_count(), 0);

        let fragment = highway.alloc_fragment(100).unwrap().unwrap();
        assert_eq!(fragment.len(), 100);
        assert_eq!(highway.lanes_count(), 1);
        assert_eq!(highway.last_lane_index(), 0);
        assert!(highway.last_alloc_tick() <= crate::sync::atomics::now_ms());
    }

    #[test]
    fn test_request_larger_than_default_sizes_the_lane() {
        let highway = HeapHighway::new(tiny_settings()).unwrap();
        let _fragment = highway.alloc_fragment(5000).unwrap().unwrap();
        assert_eq!(highway.lane(0).unwrap().capacity(), 5000);
    }

    #[test]
    fn test_size_validation() {
        let highway = HeapHighway::new(tiny_settings()).unwrap();
        assert!(matches!(
            highway.alloc_fragment(MAX_LANE_CAPACITY + 1),
            Err(Error::SizeOutOfRange { .. })
        ));
    }

    #[test]
    fn test_max_lanes_limit_is_typed() {
        let settings = tiny_settings().with_max_lanes_count(1);
        let highway = HeapHighway::new(settings).unwrap();
        let _a = highway.alloc_fragment(1024).unwrap().unwrap();
        assert!(matches!(
            highway.alloc_fragment(1024),
            Err(Error::MaxLanesCountReached { max: 1 })
        ));
    }

    #[test]
    fn test_max_lanes_callback_swallows_into_none() {
        let settings = tiny_settings()
            .with_max_lanes_count(1)
            .with_on_max_lanes_reached(Arc::new(|| true));
        let highway = HeapHighway::new(settings).unwrap();
        let _a = highway.alloc_fragment(1024).unwrap().unwrap();
        assert!(highway.alloc_fragment(1024).unwrap().is_none());
        assert_eq!(highway.lanes_count(), 1);
    }

    #[test]
    fn test_max_total_bytes_limit_is_typed() {
        let settings = tiny_settings().with_max_total_allocated_bytes(1500);
        let highway = HeapHighway::new(settings).unwrap();
        let _a = highway.alloc_fragment(1024).unwrap().unwrap();
        assert!(matches!(
            highway.alloc_fragment(1024),
            Err(Error::MaxTotalAllocBytesReached { .. })
        ));
    }

    #[test]
    fn test_dispose_lane_keeps_slot_and_reopen_replaces() {
        let highway = HeapHighway::with_lanes(tiny_settings(), &[512, 512]).unwrap();
        highway.dispose_lane(0).unwrap();
        assert!(highway.lane(0).unwrap().disposed());
        assert_eq!(highway.lanes_count(), 2);

        let reopened = highway.reopen_lane(0).unwrap().unwrap();
        assert!(!reopened.disposed());
        assert_eq!(reopened.capacity(), 1024);
        // A healthy lane is not replaced.
        assert!(highway.reopen_lane(1).unwrap().is_none());
    }

    #[test]
    fn test_totals_track_lanes() {
        let highway = HeapHighway::with_lanes(tiny_settings(), &[1000, 1000]).unwrap();
        assert_eq!(highway.total_capacity(), 2000);
        assert_eq!(highway.total_free_space(), 2000);

        let _frag = highway.alloc_fragment(600).unwrap().unwrap();
        assert_eq!(highway.total_active_fragments(), 1);
        assert_eq!(highway.total_free_space(), 1400);

        highway.dispose_lane(1).unwrap();
        assert_eq!(highway.total_capacity(), 1000);
    }

    #[test]
    fn test_disposed_highway_refuses_operations() {
        let highway = HeapHighway::with_lanes(tiny_settings(), &[512]).unwrap();
        highway.dispose();
        highway.dispose();
        assert!(matches!(highway.alloc_fragment(10), Err(Error::ObjectDisposed)));
        assert!(matches!(highway.dispose_lane(0), Err(Error::ObjectDisposed)));
        assert!(highway.lane(0).unwrap().disposed());
    }

    #[test]
    fn test_free_ghosts_requires_tracking_mode() {
        let highway = HeapHighway::new(tiny_settings()).unwrap();
        assert!(matches!(highway.free_ghosts(), Err(Error::IncorrectDisposalMode)));
    }

    #[test]
    fn test_ghost_mode_end_to_end() {
        let settings = tiny_settings().with_disposal_mode(DisposalMode::TrackGhosts);
        let highway = HeapHighway::new(settings).unwrap();
        {
            let _forgotten = highway.alloc_fragment(64).unwrap().unwrap();
        }
        assert_eq!(highway.total_active_fragments(), 1);
        assert_eq!(highway.free_ghosts().unwrap(), 1);
        assert_eq!(highway.total_active_fragments(), 0);
    }
}
