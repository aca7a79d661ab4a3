//! Tesseract - a concurrent, expandable, indexable container of handles.
//!
//! Storage is a four-level ragged array addressed by the four bytes of a
//! 32-bit index ([`Pos4`]); only the sub-arrays actually reached exist, and
//! growth happens in tiles of 256 slots. Slot cells are `ArcSwapOption`, so
//! reads never take a lock; writers take the expansion lock only to grow the
//! tile structure.
//!
//! Mutation safety comes from the gear protocol: every operation registers
//! itself in `concurrent_ops`, checks the current [`Gear`], and backs out
//! with a typed error if the gear forbids it. [`Tesseract::clutch`] installs
//! a new gear and waits for in-flight operations to drain before returning.

mod gear;
mod pos4;

pub use gear::{Gear, GearShiftSink};
pub use pos4::Pos4;

use std::sync::atomic::{AtomicI32, AtomicI64, AtomicPtr, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use arc_swap::ArcSwapOption;

use crate::error::Error;
use gear::ShiftNotifier;

/// Slots per tile; also the fan-out of every level.
const TILE_SLOTS: usize = 256;

/// Hard ceiling on the slot count.
pub const MAX_SLOTS: usize = 1 << 30;

/// Tiles added per expansion when no callback overrides the growth.
pub const DEFAULT_EXPANSION_SLOTS: usize = 1 << 13;

const GEARS_SLOT_ACCESS: &[Gear] = &[Gear::Neutral, Gear::Straight, Gear::Reverse];
const GEARS_ANY: &[Gear] = &[Gear::Neutral, Gear::Straight, Gear::Reverse, Gear::Park];

/// Leaf level: 256 lock-free slot cells.
struct Tile<T> {
    slots: [ArcSwapOption<T>; TILE_SLOTS],
}

impl<T> Tile<T> {
    fn new() -> Self {
        Self { slots: std::array::from_fn(|_| ArcSwapOption::empty()) }
    }
}

/// Third level: pointers to tiles, indexed by `d2`.
struct D2<T> {
    tiles: [AtomicPtr<Tile<T>>; TILE_SLOTS],
}

impl<T> D2<T> {
    fn new() -> Self {
        Self { tiles: std::array::from_fn(|_| AtomicPtr::new(std::ptr::null_mut())) }
    }
}

impl<T> Drop for D2<T> {
    fn drop(&mut self) {
        for cell in self.tiles.iter() {
            let p = cell.load(Ordering::Relaxed);
            if !p.is_null() {
                // SAFETY: non-null tile pointers were created by Box::into_raw
                // and are owned exclusively by this level.
                unsafe { drop(Box::from_raw(p)) };
            }
        }
    }
}

/// Second level: pointers to [`D2`] planes, indexed by `d1`.
struct D1<T> {
    planes: [AtomicPtr<D2<T>>; TILE_SLOTS],
}

impl<T> D1<T> {
    fn new() -> Self {
        Self { planes: std::array::from_fn(|_| AtomicPtr::new(std::ptr::null_mut())) }
    }
}

impl<T> Drop for D1<T> {
    fn drop(&mut self) {
        for cell in self.planes.iter() {
            let p = cell.load(Ordering::Relaxed);
            if !p.is_null() {
                // SAFETY: same ownership as D2 tiles.
                unsafe { drop(Box::from_raw(p)) };
            }
        }
    }
}

/// Construction options for a [`Tesseract`].
pub struct TesseractOptions {
    /// Maintain a count of non-null slots.
    pub count_items: bool,
    /// Desired capacity for the next expansion, given the current one.
    pub expansion: Option<Box<dyn Fn(usize) -> usize + Send + Sync>>,
    /// Sink notified of every gear shift, on a background worker.
    pub on_gear_shift: Option<GearShiftSink>,
}

impl Default for TesseractOptions {
    fn default() -> Self {
        Self { count_items: true, expansion: None, on_gear_shift: None }
    }
}

/// Concurrent, indexable, append-expandable container of `Arc<T>` handles.
pub struct Tesseract<T> {
    root: Box<[AtomicPtr<D1<T>>; TILE_SLOTS]>,
    append_index: AtomicI64,
    allocated_slots: AtomicUsize,
    items_count: AtomicI64,
    count_items: bool,
    gear: AtomicI32,
    concurrent_ops: AtomicI64,
    drain_lock: Mutex<()>,
    drain_cvar: Condvar,
    shift_lock: Mutex<()>,
    expansion_lock: Mutex<()>,
    expansion: Option<Box<dyn Fn(usize) -> usize + Send + Sync>>,
    notifier: Option<ShiftNotifier>,
}

// SAFETY: all interior mutation goes through atomics, ArcSwap cells, or the
// container's own locks; raw level pointers are only created from Box and
// freed once.
unsafe impl<T: Send + Sync> Send for Tesseract<T> {}
unsafe impl<T: Send + Sync> Sync for Tesseract<T> {}

/// RAII registration of one in-flight operation.
struct OpGuard<'a, T> {
    t: &'a Tesseract<T>,
}

impl<T> Drop for OpGuard<'_, T> {
    fn drop(&mut self) {
        self.t.finish_op();
    }
}

impl<T> Tesseract<T> {
    /// Create an empty container with default options (Straight gear,
    /// item counting on).
    pub fn new() -> Self {
        Self::with_options(TesseractOptions::default())
    }

    /// Create an empty container with explicit options.
    pub fn with_options(options: TesseractOptions) -> Self {
        Self {
            root: Box::new(std::array::from_fn(|_| AtomicPtr::new(std::ptr::null_mut()))),
            append_index: AtomicI64::new(-1),
            allocated_slots: AtomicUsize::new(0),
            items_count: AtomicI64::new(0),
            count_items: options.count_items,
            gear: AtomicI32::new(Gear::Straight.raw()),
            concurrent_ops: AtomicI64::new(0),
            drain_lock: Mutex::new(()),
            drain_cvar: Condvar::new(),
            shift_lock: Mutex::new(()),
            expansion_lock: Mutex::new(()),
            expansion: options.expansion,
            notifier: options.on_gear_shift.map(ShiftNotifier::start),
        }
    }

    /// The highest reserved index; −1 when empty.
    pub fn append_index(&self) -> i64 {
        self.append_index.load(Ordering::Acquire)
    }

    /// Capacity of the currently allocated tile structure, in slots.
    pub fn allocated_slots(&self) -> usize {
        self.allocated_slots.load(Ordering::Acquire)
    }

    /// Count of non-null slots; zero when counting was disabled.
    pub fn items_count(&self) -> i64 {
        self.items_count.load(Ordering::Acquire)
    }

    /// The current gear.
    pub fn gear(&self) -> Gear {
        Gear::from_raw(self.gear.load(Ordering::Acquire))
    }

    /// Read the slot at `index`.
    ///
    /// Allowed in N, Straight and Reverse; `index` must be below
    /// [`Tesseract::allocated_slots`].
    pub fn get(&self, index: usize) -> Result<Option<Arc<T>>, Error> {
        let _op = self.begin_op("get", GEARS_SLOT_ACCESS)?;
        self.check_allocated(index)?;
        Ok(self.slot(index).load_full())
    }

    /// Replace the slot at `index`, returning the previous value.
    ///
    /// Allowed in N, Straight and Reverse; `index` must not exceed the
    /// append index.
    pub fn set(&self, index: usize, value: Option<Arc<T>>) -> Result<Option<Arc<T>>, Error> {
        let _op = self.begin_op("set", GEARS_SLOT_ACCESS)?;
        let top = self.append_index.load(Ordering::Acquire);
        if top < 0 || index as i64 > top {
            return Err(Error::MissingOrInvalidArgument("index exceeds append index"));
        }
        let installing = value.is_some();
        let prev = self.slot(index).swap(value);
        self.track_items(prev.is_some(), installing);
        Ok(prev)
    }

    /// Atomically swap the slot at `index` with null and return the prior
    /// value.
    ///
    /// Allowed in N, Straight and Reverse.
    pub fn take(&self, index: usize) -> Result<Option<Arc<T>>, Error> {
        let _op = self.begin_op("take", GEARS_SLOT_ACCESS)?;
        self.check_allocated(index)?;
        let prev = self.slot(index).swap(None);
        self.track_items(prev.is_some(), false);
        Ok(prev)
    }

    /// Reserve the next index and write `value` there.
    ///
    /// Straight gear only. Expands the tile structure when the reservation
    /// lands beyond the allocated slots; growth asks the expansion callback
    /// (default: add [`DEFAULT_EXPANSION_SLOTS`]) and is capped at
    /// [`MAX_SLOTS`]. Returns the new index, or −1 when the cap is hit.
    ///
    /// The reserved index becomes visible through
    /// [`Tesseract::append_index`] before the slot value does; racing
    /// readers may observe a null slot at a just-reserved index.
    pub fn append(&self, value: Arc<T>) -> Result<i64, Error> {
        let _op = self.begin_op("append", &[Gear::Straight])?;
        let index = self.append_index.fetch_add(1, Ordering::AcqRel) + 1;
        let slot_index = index as usize;
        if slot_index >= self.allocated_slots.load(Ordering::Acquire)
            && !self.expand_to_cover(slot_index)
        {
            self.append_index.fetch_sub(1, Ordering::AcqRel);
            return Ok(-1);
        }
        let prev = self.slot(slot_index).swap(Some(value));
        self.track_items(prev.is_some(), true);
        Ok(index)
    }

    /// Null the slot at the append index, decrement it and return the prior
    /// value.
    ///
    /// Reverse gear only. Returns `None` when the container is empty.
    pub fn remove_last(&self) -> Result<Option<Arc<T>>, Error> {
        let _op = self.begin_op("remove_last", &[Gear::Reverse])?;
        let index = self.append_index.fetch_sub(1, Ordering::AcqRel);
        if index < 0 {
            self.append_index.fetch_add(1, Ordering::AcqRel);
            return Ok(None);
        }
        let prev = self.slot(index as usize).swap(None);
        self.track_items(prev.is_some(), false);
        Ok(prev)
    }

    /// Grow or shrink the tile structure to hold `slots` slots.
    ///
    /// Growth is allowed in any gear. Shrinking requires Park gear and no
    /// other in-flight operation; it frees tiles above the tile-rounded
    /// bound, cuts the append index to `slots − 1` and rebuilds the item
    /// count. Returns the resulting allocated slot count.
    pub fn resize(&self, slots: usize, expand: bool) -> Result<usize, Error> {
        if slots > MAX_SLOTS {
            return Err(Error::SizeOutOfRange { size: slots, min: 0, max: MAX_SLOTS });
        }

        if expand {
            let _op = self.begin_op("resize", GEARS_ANY)?;
            let _x = self.expansion_lock.lock().expect("expansion lock poisoned");
            let current = self.allocated_slots.load(Ordering::Acquire);
            let target = tile_round_up(slots);
            if target > current {
                for base in (current..target).step_by(TILE_SLOTS) {
                    self.ensure_tile(base);
                }
                self.allocated_slots.store(target, Ordering::Release);
            }
            return Ok(self.allocated_slots.load(Ordering::Acquire));
        }

        let _op = self.begin_op("resize", &[Gear::Park])?;
        let _x = self.expansion_lock.lock().expect("expansion lock poisoned");
        // A clutch timeout can leave Park installed while an older operation
        // is still in flight; freeing tiles under it would be unsound.
        if self.concurrent_ops.load(Ordering::Acquire) != 1 {
            return Err(Error::LockAcquisition);
        }

        let current = self.allocated_slots.load(Ordering::Acquire);
        let target = tile_round_up(slots);
        if target < current {
            self.allocated_slots.store(target, Ordering::Release);
            self.free_tiles(target, current);
        }
        // Null the partial-tile remainder above the new top.
        let kept = target.min(current);
        for index in slots..kept {
            self.slot(index).store(None);
        }

        let new_top = slots as i64 - 1;
        if self.append_index.load(Ordering::Acquire) > new_top {
            self.append_index.store(new_top, Ordering::Release);
        }

        if self.count_items {
            let mut count = 0;
            for index in 0..slots.min(kept) {
                if self.slot(index).load().is_some() {
                    count += 1;
                }
            }
            self.items_count.store(count, Ordering::Release);
        }

        Ok(self.allocated_slots.load(Ordering::Acquire))
    }

    /// Write `value` to every allocated slot. Neutral gear only.
    pub fn format(&self, value: Option<Arc<T>>) -> Result<(), Error> {
        let _op = self.begin_op("format", &[Gear::Neutral])?;
        let allocated = self.allocated_slots.load(Ordering::Acquire);
        for index in 0..allocated {
            self.slot(index).store(value.clone());
        }
        if self.count_items {
            let count = if value.is_some() { allocated as i64 } else { 0 };
            self.items_count.store(count, Ordering::Release);
        }
        Ok(())
    }

    /// Lazy sequence, in index order, of slots that are non-null when
    /// visited. Allowed in N, Straight and Reverse; the iterator counts as
    /// an in-flight operation until dropped.
    pub fn not_null_items(&self) -> Result<NotNullIter<'_, T>, Error> {
        let guard = self.begin_op("not_null_items", GEARS_SLOT_ACCESS)?;
        let top = self.append_index.load(Ordering::Acquire);
        Ok(NotNullIter { guard, next: 0, top })
    }

    /// Linear scan for a slot holding exactly this handle.
    pub fn index_of(&self, value: &Arc<T>) -> Result<Option<usize>, Error> {
        let _op = self.begin_op("index_of", GEARS_SLOT_ACCESS)?;
        let top = self.append_index.load(Ordering::Acquire);
        let mut index = 0i64;
        while index <= top {
            if let Some(held) = self.slot(index as usize).load_full() {
                if Arc::ptr_eq(&held, value) {
                    return Ok(Some(index as usize));
                }
            }
            index += 1;
        }
        Ok(None)
    }

    /// Null the first slot holding exactly this handle.
    pub fn remove(&self, value: &Arc<T>) -> Result<bool, Error> {
        let _op = self.begin_op("remove", GEARS_SLOT_ACCESS)?;
        let top = self.append_index.load(Ordering::Acquire);
        let mut index = 0i64;
        while index <= top {
            if let Some(held) = self.slot(index as usize).load_full() {
                if Arc::ptr_eq(&held, value) {
                    self.slot(index as usize).store(None);
                    self.track_items(true, false);
                    return Ok(true);
                }
            }
            index += 1;
        }
        Ok(false)
    }

    /// Change gear.
    ///
    /// Serialized by a dedicated lock. The new gear is installed first; the
    /// call then waits for in-flight operations to drain, up to `timeout_ms`
    /// milliseconds (−1 waits forever). On timeout the new gear stays
    /// installed and `SignalAwaitTimeout` is returned; `f` runs only after a
    /// successful drain, inside the shift lock. Returns the previous gear.
    pub fn clutch(
        &self,
        gear: Gear,
        f: Option<&dyn Fn()>,
        timeout_ms: i64,
    ) -> Result<Gear, Error> {
        let _shift = self.shift_lock.lock().expect("shift lock poisoned");
        let prev = Gear::from_raw(self.gear.swap(gear.raw(), Ordering::AcqRel));
        if prev != gear {
            if let Some(notifier) = &self.notifier {
                notifier.publish(prev, gear);
            }
        }

        let mut guard = self.drain_lock.lock().expect("drain lock poisoned");
        if timeout_ms < 0 {
            while self.concurrent_ops.load(Ordering::Acquire) != 0 {
                guard = self.drain_cvar.wait(guard).expect("drain lock poisoned");
            }
        } else {
            let deadline = Instant::now() + Duration::from_millis(timeout_ms as u64);
            while self.concurrent_ops.load(Ordering::Acquire) != 0 {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    log::warn!(
                        "gear shift to {:?} installed but drain timed out after {} ms",
                        gear,
                        timeout_ms
                    );
                    return Err(Error::SignalAwaitTimeout);
                }
                let (g, _) = self
                    .drain_cvar
                    .wait_timeout(guard, remaining)
                    .expect("drain lock poisoned");
                guard = g;
            }
        }
        drop(guard);

        if let Some(f) = f {
            f();
        }
        Ok(prev)
    }

    /// Overwrite the append index without any checks.
    ///
    /// Bypasses every invariant; only meaningful for recovery after forced
    /// resets. Diagnostics only.
    pub fn force_append_index(&self, index: i64) {
        self.append_index.store(index, Ordering::Release);
    }

    fn begin_op(&self, op: &'static str, allowed: &[Gear]) -> Result<OpGuard<'_, T>, Error> {
        self.concurrent_ops.fetch_add(1, Ordering::AcqRel);
        let gear = self.gear();
        if !allowed.contains(&gear) {
            self.finish_op();
            return Err(Error::WrongGear { op, gear });
        }
        Ok(OpGuard { t: self })
    }

    fn finish_op(&self) {
        if self.concurrent_ops.fetch_sub(1, Ordering::AcqRel) == 1 {
            // Take the drain lock so a clutch between its counter check and
            // its wait cannot miss this wakeup.
            let _g = self.drain_lock.lock().expect("drain lock poisoned");
            self.drain_cvar.notify_all();
        }
    }

    fn check_allocated(&self, index: usize) -> Result<(), Error> {
        if index >= self.allocated_slots.load(Ordering::Acquire) {
            return Err(Error::MissingOrInvalidArgument("index exceeds allocated slots"));
        }
        Ok(())
    }

    fn track_items(&self, had: bool, has: bool) {
        if self.count_items {
            match (had, has) {
                (false, true) => {
                    self.items_count.fetch_add(1, Ordering::AcqRel);
                }
                (true, false) => {
                    self.items_count.fetch_sub(1, Ordering::AcqRel);
                }
                _ => {}
            }
        }
    }

    /// Resolve the slot cell for `index`.
    ///
    /// Callers must have verified `index < allocated_slots` with acquire
    /// semantics; the release store publishing `allocated_slots` ordered the
    /// level pointers on this path before it.
    fn slot(&self, index: usize) -> &ArcSwapOption<T> {
        let p = Pos4::new(index as u32);
        // SAFETY: see above; every pointer on a published path is non-null
        // and points at a Box-allocated level owned by this container.
        unsafe {
            let d1 = &*self.root[p.d0 as usize].load(Ordering::Relaxed);
            let d2 = &*d1.planes[p.d1 as usize].load(Ordering::Relaxed);
            let tile = &*d2.tiles[p.d2 as usize].load(Ordering::Relaxed);
            &tile.slots[p.d3 as usize]
        }
    }

    /// Grow the tile structure so `need` is a valid slot index.
    ///
    /// Returns false when the hard cap forbids it.
    fn expand_to_cover(&self, need: usize) -> bool {
        if need >= MAX_SLOTS {
            return false;
        }
        let _x = self.expansion_lock.lock().expect("expansion lock poisoned");
        let current = self.allocated_slots.load(Ordering::Acquire);
        if need < current {
            return true;
        }
        let wanted = match &self.expansion {
            Some(f) => f(current),
            None => current.saturating_add(DEFAULT_EXPANSION_SLOTS),
        };
        let target = tile_round_up(wanted.max(need + 1)).min(MAX_SLOTS);
        for base in (current..target).step_by(TILE_SLOTS) {
            self.ensure_tile(base);
        }
        self.allocated_slots.store(target, Ordering::Release);
        true
    }

    /// Materialize the path to the tile containing `slot_index`.
    ///
    /// Only called under the expansion lock; the relaxed stores are
    /// published to readers by the release store of `allocated_slots`.
    fn ensure_tile(&self, slot_index: usize) {
        let p = Pos4::new(slot_index as u32);

        let d1_cell = &self.root[p.d0 as usize];
        let mut d1 = d1_cell.load(Ordering::Relaxed);
        if d1.is_null() {
            d1 = Box::into_raw(Box::new(D1::new()));
            d1_cell.store(d1, Ordering::Relaxed);
        }
        // SAFETY: just ensured non-null; owned by this container.
        let d1 = unsafe { &*d1 };

        let d2_cell = &d1.planes[p.d1 as usize];
        let mut d2 = d2_cell.load(Ordering::Relaxed);
        if d2.is_null() {
            d2 = Box::into_raw(Box::new(D2::new()));
            d2_cell.store(d2, Ordering::Relaxed);
        }
        // SAFETY: as above.
        let d2 = unsafe { &*d2 };

        let tile_cell = &d2.tiles[p.d2 as usize];
        if tile_cell.load(Ordering::Relaxed).is_null() {
            tile_cell.store(Box::into_raw(Box::new(Tile::new())), Ordering::Relaxed);
        }
    }

    /// Free whole tiles in `[from, to)`. Caller holds the expansion lock and
    /// has already lowered `allocated_slots`.
    fn free_tiles(&self, from: usize, to: usize) {
        for base in (from..to).step_by(TILE_SLOTS) {
            let p = Pos4::new(base as u32);
            let d1 = self.root[p.d0 as usize].load(Ordering::Relaxed);
            if d1.is_null() {
                continue;
            }
            // SAFETY: published level pointers stay valid until freed here
            // or in drop; both paths hold exclusive structural access.
            let d2 = unsafe { &*d1 }.planes[p.d1 as usize].load(Ordering::Relaxed);
            if d2.is_null() {
                continue;
            }
            let tile_cell = unsafe { &*d2 }.tiles[p.d2 as usize].load(Ordering::Relaxed);
            if !tile_cell.is_null() {
                unsafe { &*d2 }.tiles[p.d2 as usize]
                    .store(std::ptr::null_mut(), Ordering::Relaxed);
                // SAFETY: pointer came from Box::into_raw and was just
                // detached from the structure.
                unsafe { drop(Box::from_raw(tile_cell)) };
            }
        }
    }
}

impl<T> Default for Tesseract<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for Tesseract<T> {
    fn drop(&mut self) {
        for cell in self.root.iter() {
            let p = cell.load(Ordering::Relaxed);
            if !p.is_null() {
                // SAFETY: level pointers are Box-allocated and owned here;
                // D1/D2 drops cascade to the tiles.
                unsafe { drop(Box::from_raw(p)) };
            }
        }
    }
}

/// Iterator over non-null slots; see [`Tesseract::not_null_items`].
pub struct NotNullIter<'a, T> {
    guard: OpGuard<'a, T>,
    next: i64,
    top: i64,
}

impl<T> Iterator for NotNullIter<'_, T> {
    type Item = (usize, Arc<T>);

    fn next(&mut self) -> Option<Self::Item> {
        while self.next <= self.top {
            let index = self.next as usize;
            self.next += 1;
            if let Some(value) = self.guard.t.slot(index).load_full() {
                return Some((index, value));
            }
        }
        None
    }
}

fn tile_round_up(n: usize) -> usize {
    n.saturating_add(TILE_SLOTS - 1) & !(TILE_SLOTS - 1)
}
