//! # lanealloc
//!
//! Lane-based memory pooling for short-lived byte buffers.
//!
//! ## Features
//!
//! - Lanes: fixed-capacity regions with bump allocation and reset cycles
//! - Highways: expandable lane pools with oldest-first dispatch and limits
//! - Fragments: owning, cycle-checked views over lane bytes
//! - Tesseract: lock-free-readable, append-expandable handle container
//!   with a four-mode gear protocol
//! - Three backings: process heap, OS heap, memory-mapped file
//! - Ghost tracking: opt-in weak-reference sweep for forgotten fragments
//! - Stream adapters over fragments and highways
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use lanealloc::{HeapHighway, HighwaySettings};
//!
//! let highway = HeapHighway::new(HighwaySettings::default()).unwrap();
//!
//! let mut fragment = highway.alloc_fragment(1024).unwrap().unwrap();
//! fragment.write(b"payload", 0, 7).unwrap();
//! // ... frame the message, send it ...
//! fragment.dispose().unwrap();
//! ```

pub mod error;
pub mod fragment;
pub mod highway;
pub mod lane;
pub mod settings;
pub mod stream;
pub mod tesseract;

// Internal modules (not directly exported)
#[allow(dead_code)]
mod sync;
#[allow(dead_code)]
mod util;

pub use error::Error;
pub use fragment::Fragment;
pub use highway::{HeapHighway, Highway, MappedHighway, UnmanagedHighway};
pub use lane::{
    HeapLane, HeapStorage, Lane, MappedLane, MappedStorage, Storage, UnmanagedLane,
    UnmanagedStorage, MAX_LANE_CAPACITY,
};
pub use settings::{DisposalMode, HighwaySettings, LimitCallback, NextCapacity};
pub use stream::{FragmentStream, HighwayStream};
pub use tesseract::{Gear, GearShiftSink, Pos4, Tesseract, TesseractOptions};
