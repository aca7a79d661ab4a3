//! Highway configuration.

use std::fmt;
use std::sync::Arc;

use crate::error::Error;
use crate::lane::MAX_LANE_CAPACITY;

/// How fragments give their bytes back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisposalMode {
    /// Each fragment releases its lane slot on dispose (or drop).
    FragmentDispose,
    /// Lanes keep a weak handle per fragment; forgotten fragments are
    /// reclaimed by an explicit ghost sweep.
    TrackGhosts,
}

/// Callback deciding whether a limit breach downgrades to a `None` fragment.
pub type LimitCallback = Arc<dyn Fn() -> bool + Send + Sync>;

/// Callback choosing the capacity of the next auto-grown lane, given the
/// current last lane index (−1 when no lane exists yet).
pub type NextCapacity = Arc<dyn Fn(i64) -> usize + Send + Sync>;

/// Configuration for a highway.
#[derive(Clone)]
pub struct HighwaySettings {
    /// Capacity for auto-grown lanes (default: 8 MB decimal).
    pub default_lane_capacity: usize,

    /// Upper bound on lane slots (default: 1000).
    pub max_lanes_count: usize,

    /// Upper bound on the summed capacity of non-disposed lanes
    /// (default: 200 GB decimal).
    pub max_total_allocated_bytes: u64,

    /// Full passes over the lanes before creating a new one (default: 2).
    pub laps_before_new_lane: u32,

    /// Offset-CAS retries per lane per visit (default: 4).
    pub lane_alloc_tries: u32,

    /// Bound for the per-lane awaited allocation path, in milliseconds
    /// (default: 0 = CAS only; −1 waits forever).
    pub lane_alloc_await_ms: i64,

    /// Permits for concurrent lane creation (default: 1).
    pub concurrent_new_lane_allocations: u32,

    /// Wait for a creation permit, in milliseconds (default: 3000;
    /// −1 waits forever).
    pub new_lane_allocation_timeout_ms: i64,

    /// Fragment reclamation style (default: FragmentDispose).
    pub disposal_mode: DisposalMode,

    /// Returning true swallows `MaxLanesCountReached` into a `None`
    /// fragment.
    pub on_max_lanes_reached: Option<LimitCallback>,

    /// Returning true swallows `MaxTotalAllocBytesReached` into a `None`
    /// fragment.
    pub on_max_total_bytes_reached: Option<LimitCallback>,

    /// Capacity chooser for auto-grown lanes; the request size still wins
    /// when larger.
    pub next_capacity: Option<NextCapacity>,
}

impl Default for HighwaySettings {
    fn default() -> Self {
        Self {
            default_lane_capacity: 8_000_000,
            max_lanes_count: 1000,
            max_total_allocated_bytes: 200_000_000_000,
            laps_before_new_lane: 2,
            lane_alloc_tries: 4,
            lane_alloc_await_ms: 0,
            concurrent_new_lane_allocations: 1,
            new_lane_allocation_timeout_ms: 3000,
            disposal_mode: DisposalMode::FragmentDispose,
            on_max_lanes_reached: None,
            on_max_total_bytes_reached: None,
            next_capacity: None,
        }
    }
}

impl HighwaySettings {
    /// Builder pattern: set the auto-grown lane capacity.
    pub fn with_default_lane_capacity(mut self, capacity: usize) -> Self {
        self.default_lane_capacity = capacity;
        self
    }

    /// Builder pattern: set the lane count limit.
    pub fn with_max_lanes_count(mut self, count: usize) -> Self {
        self.max_lanes_count = count;
        self
    }

    /// Builder pattern: set the total byte limit.
    pub fn with_max_total_allocated_bytes(mut self, bytes: u64) -> Self {
        self.max_total_allocated_bytes = bytes;
        self
    }

    /// Builder pattern: set laps before lane creation.
    pub fn with_laps_before_new_lane(mut self, laps: u32) -> Self {
        self.laps_before_new_lane = laps;
        self
    }

    /// Builder pattern: set per-visit CAS retries.
    pub fn with_lane_alloc_tries(mut self, tries: u32) -> Self {
        self.lane_alloc_tries = tries;
        self
    }

    /// Builder pattern: set the awaited allocation bound.
    pub fn with_lane_alloc_await_ms(mut self, await_ms: i64) -> Self {
        self.lane_alloc_await_ms = await_ms;
        self
    }

    /// Builder pattern: set the creation permit wait.
    pub fn with_new_lane_allocation_timeout_ms(mut self, timeout_ms: i64) -> Self {
        self.new_lane_allocation_timeout_ms = timeout_ms;
        self
    }

    /// Builder pattern: set the disposal mode.
    pub fn with_disposal_mode(mut self, mode: DisposalMode) -> Self {
        self.disposal_mode = mode;
        self
    }

    /// Builder pattern: swallow lane-count breaches into `None` fragments.
    pub fn with_on_max_lanes_reached(mut self, callback: LimitCallback) -> Self {
        self.on_max_lanes_reached = Some(callback);
        self
    }

    /// Builder pattern: swallow byte-limit breaches into `None` fragments.
    pub fn with_on_max_total_bytes_reached(mut self, callback: LimitCallback) -> Self {
        self.on_max_total_bytes_reached = Some(callback);
        self
    }

    /// Builder pattern: choose auto-grown lane capacities.
    pub fn with_next_capacity(mut self, callback: NextCapacity) -> Self {
        self.next_capacity = Some(callback);
        self
    }

    /// Check every option against its permitted range.
    pub fn validate(&self) -> Result<(), Error> {
        if self.default_lane_capacity < 1 || self.default_lane_capacity > MAX_LANE_CAPACITY {
            return Err(Error::SizeOutOfRange {
                size: self.default_lane_capacity,
                min: 1,
                max: MAX_LANE_CAPACITY,
            });
        }
        if self.max_lanes_count == 0 {
            return Err(Error::MissingOrInvalidArgument("max_lanes_count must be positive"));
        }
        if self.concurrent_new_lane_allocations == 0 {
            return Err(Error::MissingOrInvalidArgument(
                "concurrent_new_lane_allocations must be positive",
            ));
        }
        Ok(())
    }
}

impl fmt::Debug for HighwaySettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HighwaySettings")
            .field("default_lane_capacity", &self.default_lane_capacity)
            .field("max_lanes_count", &self.max_lanes_count)
            .field("max_total_allocated_bytes", &self.max_total_allocated_bytes)
            .field("laps_before_new_lane", &self.laps_before_new_lane)
            .field("lane_alloc_tries", &self.lane_alloc_tries)
            .field("lane_alloc_await_ms", &self.lane_alloc_await_ms)
            .field(
                "concurrent_new_lane_allocations",
                &self.concurrent_new_lane_allocations,
            )
            .field(
                "new_lane_allocation_timeout_ms",
                &self.new_lane_allocation_timeout_ms,
            )
            .field("disposal_mode", &self.disposal_mode)
            .field("on_max_lanes_reached", &self.on_max_lanes_reached.is_some())
            .field(
                "on_max_total_bytes_reached",
                &self.on_max_total_bytes_reached.is_some(),
            )
            .field("next_capacity", &self.next_capacity.is_some())
            .finish()
    }
}
