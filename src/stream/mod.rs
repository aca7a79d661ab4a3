//! Stream adapters over fragments and highways.

mod fragment_stream;
mod highway_stream;

pub use fragment_stream::FragmentStream;
pub use highway_stream::HighwayStream;
