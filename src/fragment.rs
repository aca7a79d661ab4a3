//! Fragments - owning handles over a slice of one lane.
//!
//! A fragment is pinned to the lane cycle it was carved in. Accessors
//! re-validate that pin (and the lane's closed/disposed flags) on every
//! call unless the per-fragment check toggle is off.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::Error;
use crate::lane::{Lane, Storage};

/// Shared state of one fragment; the ghost index holds weak handles to it.
pub(crate) struct FragmentCore<S: Storage> {
    lane: Arc<Lane<S>>,
    start: usize,
    length: usize,
    cycle: u64,
    disposed: AtomicBool,
    checks: AtomicBool,
    /// Slot in the lane's ghost index; `Some` exactly in tracking mode.
    ghost_slot: Option<usize>,
}

impl<S: Storage> FragmentCore<S> {
    fn guard(&self) -> Result<(), Error> {
        if !self.checks.load(Ordering::Acquire) {
            return Ok(());
        }
        if self.disposed.load(Ordering::Acquire) {
            return Err(Error::ObjectDisposed);
        }
        if self.lane.disposed() {
            return Err(Error::DisposedLane);
        }
        if self.lane.closed() {
            return Err(Error::ClosedLane);
        }
        let lane_cycle = self.lane.cycle();
        if lane_cycle != self.cycle {
            return Err(Error::WrongLaneCycle { fragment: self.cycle, lane: lane_cycle });
        }
        Ok(())
    }

    fn dispose(&self) -> Result<(), Error> {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if let Some(slot) = self.ghost_slot {
            // Cleared before the decrement so a concurrent sweep cannot
            // count this fragment a second time.
            self.lane.clear_ghost(slot);
        }
        self.lane
            .release_fragment(self.cycle, self.checks.load(Ordering::Acquire))
    }
}

impl<S: Storage> Drop for FragmentCore<S> {
    fn drop(&mut self) {
        if self.ghost_slot.is_some() {
            // Tracking mode: an undisposed fragment becomes a ghost and is
            // reclaimed by the lane's sweep.
            return;
        }
        if !self.disposed.load(Ordering::Acquire) {
            let released = self
                .lane
                .release_fragment(self.cycle, self.checks.load(Ordering::Acquire));
            if let Err(e) = released {
                log::warn!("fragment drop could not release its lane slot: {}", e);
            }
        }
    }
}

/// An owning view over `length` bytes of one lane.
///
/// Dropping an undisposed fragment disposes it, except in ghost-tracking
/// mode where reclamation is deferred to [`Lane::free_ghosts`].
pub struct Fragment<S: Storage> {
    core: Arc<FragmentCore<S>>,
}

impl<S: Storage> Fragment<S> {
    pub(crate) fn carve(
        lane: Arc<Lane<S>>,
        start: usize,
        length: usize,
        cycle: u64,
        ghost_slot: Option<usize>,
    ) -> Self {
        let core = Arc::new(FragmentCore {
            lane,
            start,
            length,
            cycle,
            disposed: AtomicBool::new(false),
            checks: AtomicBool::new(true),
            ghost_slot,
        });
        if let Some(slot) = ghost_slot {
            core.lane.track_ghost(slot, Arc::downgrade(&core), cycle);
        }
        Self { core }
    }

    /// Byte count. Immutable for the fragment's lifetime.
    pub fn len(&self) -> usize {
        self.core.length
    }

    /// Whether this is a zero-length fragment.
    pub fn is_empty(&self) -> bool {
        self.core.length == 0
    }

    /// The lane cycle this fragment was carved in.
    pub fn cycle(&self) -> u64 {
        self.core.cycle
    }

    /// Whether dispose has run.
    pub fn is_disposed(&self) -> bool {
        self.core.disposed.load(Ordering::Acquire)
    }

    /// Toggle lifetime validation on the accessors. On by default.
    pub fn set_access_checks(&self, enabled: bool) {
        self.core.checks.store(enabled, Ordering::Release);
    }

    /// Whether accessors validate fragment and lane lifetime.
    pub fn access_checks(&self) -> bool {
        self.core.checks.load(Ordering::Acquire)
    }

    /// Copy `len` bytes from the front of `src` into the fragment at
    /// `offset`; returns `offset + len`.
    pub fn write(&mut self, src: &[u8], offset: usize, len: usize) -> Result<usize, Error> {
        if len > src.len() {
            return Err(Error::MissingOrInvalidArgument("length exceeds source"));
        }
        let end = offset
            .checked_add(len)
            .ok_or(Error::MissingOrInvalidArgument("offset + length overflows"))?;
        if end > self.core.length {
            return Err(Error::MissingOrInvalidArgument("write past fragment end"));
        }
        self.core.guard()?;

        // SAFETY: the range [start+offset, start+offset+len) lies inside
        // this fragment, which no other live fragment overlaps; the lane
        // buffer outlives the handle.
        unsafe {
            std::ptr::copy_nonoverlapping(
                src.as_ptr(),
                self.core.lane.data_ptr().add(self.core.start + offset),
                len,
            );
        }
        Ok(end)
    }

    /// Copy up to `min(dst.len − dst_offset, len − offset)` bytes into
    /// `dst[dst_offset..]`; returns `offset + copied`.
    pub fn read(&self, dst: &mut [u8], offset: usize, dst_offset: usize) -> Result<usize, Error> {
        if offset > self.core.length {
            return Err(Error::MissingOrInvalidArgument("offset past fragment end"));
        }
        if dst_offset > dst.len() {
            return Err(Error::MissingOrInvalidArgument("destination offset past end"));
        }
        self.core.guard()?;

        let copied = (dst.len() - dst_offset).min(self.core.length - offset);
        // SAFETY: both ranges were bounds-checked; source is this
        // fragment's exclusive byte range.
        unsafe {
            std::ptr::copy_nonoverlapping(
                self.core.lane.data_ptr().add(self.core.start + offset),
                dst.as_mut_ptr().add(dst_offset),
                copied,
            );
        }
        Ok(offset + copied)
    }

    /// Zero-copy mutable view of the fragment's bytes.
    pub fn span(&mut self) -> Result<&mut [u8], Error> {
        self.core.guard()?;
        // SAFETY: exclusive via &mut self; the range belongs to this
        // fragment alone within the current lane cycle.
        Ok(unsafe {
            std::slice::from_raw_parts_mut(
                self.core.lane.data_ptr().add(self.core.start),
                self.core.length,
            )
        })
    }

    /// Release this fragment's claim on the lane. Idempotent.
    pub fn dispose(&mut self) -> Result<(), Error> {
        self.core.dispose()
    }
}
