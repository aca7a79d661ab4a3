//! Error types for the allocator.
//!
//! Every failure carries a stable `MLxxx` code so callers can match on a
//! class of error without depending on message text.
//!
//! Code ranges:
//! - `ML1xx` - Arguments, initialization, limits on inputs
//! - `ML2xx` - Tesseract container issues
//! - `ML3xx` - Lane and fragment lifetime issues
//! - `ML4xx` - Highway pool issues

use std::fmt;
use std::sync::Arc;

use crate::tesseract::Gear;

/// Errors surfaced by lanes, fragments, highways and the Tesseract.
#[derive(Debug, Clone)]
pub enum Error {
    /// Operated on a component before it was set up.
    NotInitialized,
    /// Backing storage could not be created.
    InitFailure(Arc<std::io::Error>),
    /// An index, length or argument was missing or out of bounds.
    MissingOrInvalidArgument(&'static str),
    /// A size or capacity fell outside its permitted range.
    SizeOutOfRange { size: usize, min: usize, max: usize },
    /// A lane-level allocation failed in a non-recoverable way.
    AllocFailure(&'static str),
    /// A freshly created lane could not serve the request it was made for.
    NewLaneAllocFail { size: usize },
    /// Creating a lane would exceed the configured lane count.
    MaxLanesCountReached { max: usize },
    /// Creating a lane would exceed the configured total byte limit.
    MaxTotalAllocBytesReached { max: u64 },
    /// A lane's live-fragment counter was driven below zero.
    LaneNegativeReset,
    /// A fragment was accessed after its lane started a new cycle.
    WrongLaneCycle { fragment: u64, lane: u64 },
    /// A fragment or operation touched a disposed lane.
    DisposedLane,
    /// A fragment or operation touched a closed lane.
    ClosedLane,
    /// A ghost-tracking operation ran in the wrong disposal mode.
    IncorrectDisposalMode,
    /// A lock or permit could not be acquired in time.
    LockAcquisition,
    /// A drain or signal wait expired before completion.
    SignalAwaitTimeout,
    /// A Tesseract operation ran in a gear that does not permit it.
    WrongGear { op: &'static str, gear: Gear },
    /// The owning object was disposed.
    ObjectDisposed,
}

impl Error {
    /// Stable code for this error kind.
    pub fn code(&self) -> &'static str {
        match self {
            Error::NotInitialized => "ML100",
            Error::InitFailure(_) => "ML101",
            Error::MissingOrInvalidArgument(_) => "ML102",
            Error::SizeOutOfRange { .. } => "ML103",
            Error::WrongGear { .. } => "ML200",
            Error::SignalAwaitTimeout => "ML201",
            Error::LockAcquisition => "ML202",
            Error::AllocFailure(_) => "ML300",
            Error::LaneNegativeReset => "ML301",
            Error::WrongLaneCycle { .. } => "ML302",
            Error::DisposedLane => "ML303",
            Error::ClosedLane => "ML304",
            Error::IncorrectDisposalMode => "ML305",
            Error::NewLaneAllocFail { .. } => "ML400",
            Error::MaxLanesCountReached { .. } => "ML401",
            Error::MaxTotalAllocBytesReached { .. } => "ML402",
            Error::ObjectDisposed => "ML403",
        }
    }

    /// Whether the caller can reasonably retry after this error.
    ///
    /// Wrong-gear and await-timeout failures are transient; lifetime
    /// violations (`ML301`..`ML303`) indicate fragment misuse and are not.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::WrongGear { .. }
                | Error::SignalAwaitTimeout
                | Error::LockAcquisition
                | Error::AllocFailure(_)
        )
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::NotInitialized => write!(f, "component is not initialized"),
            Error::InitFailure(e) => write!(f, "backing storage init failed: {}", e),
            Error::MissingOrInvalidArgument(what) => {
                write!(f, "missing or invalid argument: {}", what)
            }
            Error::SizeOutOfRange { size, min, max } => {
                write!(f, "size {} outside permitted range [{}, {}]", size, min, max)
            }
            Error::AllocFailure(what) => write!(f, "allocation failure: {}", what),
            Error::NewLaneAllocFail { size } => {
                write!(f, "freshly created lane failed to serve {} bytes", size)
            }
            Error::MaxLanesCountReached { max } => {
                write!(f, "lane count limit reached ({})", max)
            }
            Error::MaxTotalAllocBytesReached { max } => {
                write!(f, "total allocated bytes limit reached ({})", max)
            }
            Error::LaneNegativeReset => {
                write!(f, "lane allocation counter driven below zero (double dispose?)")
            }
            Error::WrongLaneCycle { fragment, lane } => write!(
                f,
                "fragment belongs to cycle {} but the lane is in cycle {}",
                fragment, lane
            ),
            Error::DisposedLane => write!(f, "attempt to access a disposed lane"),
            Error::ClosedLane => write!(f, "attempt to access a closed lane"),
            Error::IncorrectDisposalMode => {
                write!(f, "operation requires the TrackGhosts disposal mode")
            }
            Error::LockAcquisition => write!(f, "failed to acquire a lock or permit in time"),
            Error::SignalAwaitTimeout => write!(f, "wait for concurrent operations timed out"),
            Error::WrongGear { op, gear } => {
                write!(f, "operation `{}` is not permitted in gear {:?}", op, gear)
            }
            Error::ObjectDisposed => write!(f, "object is disposed"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::InitFailure(e) => Some(e.as_ref()),
            _ => None,
        }
    }
}

impl From<Error> for std::io::Error {
    fn from(e: Error) -> Self {
        let kind = match &e {
            Error::MissingOrInvalidArgument(_) | Error::SizeOutOfRange { .. } => {
                std::io::ErrorKind::InvalidInput
            }
            Error::SignalAwaitTimeout | Error::LockAcquisition => std::io::ErrorKind::TimedOut,
            _ => std::io::ErrorKind::Other,
        };
        std::io::Error::new(kind, e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_stable() {
        assert_eq!(Error::LaneNegativeReset.code(), "ML301");
        assert_eq!(Error::ObjectDisposed.code(), "ML403");
        assert_eq!(
            Error::WrongGear { op: "append", gear: Gear::Neutral }.code(),
            "ML200"
        );
    }

    #[test]
    fn test_recoverable_classes() {
        assert!(Error::SignalAwaitTimeout.is_recoverable());
        assert!(!Error::LaneNegativeReset.is_recoverable());
        assert!(!Error::WrongLaneCycle { fragment: 0, lane: 1 }.is_recoverable());
    }
}
