//! Growable seekable stream backed by highway fragments.

use std::io::{self, Read, Seek, SeekFrom, Write};

use crate::error::Error;
use crate::fragment::Fragment;
use crate::highway::Highway;
use crate::lane::Storage;

/// A seekable byte stream that grows by whole fragments ("tiles") carved
/// from a highway.
///
/// Growth allocates tiles of the configured size; shrinking disposes the
/// excess tiles. Disposing the stream releases every tile but leaves the
/// highway untouched.
pub struct HighwayStream<'h, S: Storage> {
    highway: &'h Highway<S>,
    tile_size: usize,
    tiles: Vec<Fragment<S>>,
    position: u64,
    length: u64,
}

impl<'h, S: Storage> HighwayStream<'h, S> {
    /// Create an empty stream growing in `tile_size`-byte fragments.
    pub fn new(highway: &'h Highway<S>, tile_size: usize) -> Result<Self, Error> {
        if tile_size == 0 {
            return Err(Error::MissingOrInvalidArgument("tile size must be positive"));
        }
        Ok(Self { highway, tile_size, tiles: Vec::new(), position: 0, length: 0 })
    }

    /// Current stream length in bytes.
    pub fn len(&self) -> u64 {
        self.length
    }

    /// Whether the stream has zero length.
    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// Current position.
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Fragment size used for growth.
    pub fn tile_size(&self) -> usize {
        self.tile_size
    }

    /// Number of tiles currently held.
    pub fn tiles_count(&self) -> usize {
        self.tiles.len()
    }

    /// Grow or shrink to `length` bytes, allocating or disposing tiles as
    /// needed.
    pub fn set_length(&mut self, length: u64) -> Result<(), Error> {
        let needed = (length as usize + self.tile_size - 1) / self.tile_size;
        while self.tiles.len() < needed {
            match self.highway.alloc_fragment(self.tile_size)? {
                Some(tile) => self.tiles.push(tile),
                None => return Err(Error::AllocFailure("highway declined a stream tile")),
            }
        }
        self.tiles.truncate(needed); // dropped tiles dispose themselves
        self.length = length;
        if self.position > length {
            self.position = length;
        }
        Ok(())
    }

    /// Release every tile without touching the highway. The stream is empty
    /// afterwards and can grow again.
    pub fn dispose(&mut self) {
        self.tiles.clear();
        self.length = 0;
        self.position = 0;
    }
}

impl<S: Storage> Read for HighwayStream<'_, S> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let available = self.length.saturating_sub(self.position) as usize;
        let mut remaining = buf.len().min(available);
        let mut copied = 0;
        while remaining > 0 {
            let tile_index = (self.position as usize) / self.tile_size;
            let tile_offset = (self.position as usize) % self.tile_size;
            let chunk = remaining.min(self.tile_size - tile_offset);
            self.tiles[tile_index].read(&mut buf[copied..copied + chunk], tile_offset, 0)?;
            self.position += chunk as u64;
            copied += chunk;
            remaining -= chunk;
        }
        Ok(copied)
    }
}

impl<S: Storage> Write for HighwayStream<'_, S> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let end = self.position + buf.len() as u64;
        if end > self.length {
            self.set_length(end)?;
        }

        let mut written = 0;
        while written < buf.len() {
            let tile_index = (self.position as usize) / self.tile_size;
            let tile_offset = (self.position as usize) % self.tile_size;
            let chunk = (buf.len() - written).min(self.tile_size - tile_offset);
            self.tiles[tile_index].write(&buf[written..written + chunk], tile_offset, chunk)?;
            self.position += chunk as u64;
            written += chunk;
        }
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<S: Storage> Seek for HighwayStream<'_, S> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(p) => p as i128,
            SeekFrom::End(delta) => self.length as i128 + delta as i128,
            SeekFrom::Current(delta) => self.position as i128 + delta as i128,
        };
        if target < 0 || target > u64::MAX as i128 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "seek outside the addressable range",
            ));
        }
        self.position = target as u64;
        Ok(self.position)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::highway::HeapHighway;
    use crate::settings::HighwaySettings;

    fn small_highway() -> HeapHighway {
        HeapHighway::new(
            HighwaySettings::default()
                .with_default_lane_capacity(4096)
                .with_laps_before_new_lane(1),
        )
        .unwrap()
    }

    #[test]
    fn test_grows_by_tiles_on_write() {
        let highway = small_highway();
        let mut stream = HighwayStream::new(&highway, 16).unwrap();

        let payload: Vec<u8> = (0..40u8).collect();
        stream.write_all(&payload).unwrap();
        assert_eq!(stream.len(), 40);
        assert_eq!(stream.tiles_count(), 3);

        stream.seek(SeekFrom::Start(0)).unwrap();
        let mut out = Vec::new();
        stream.read_to_end(&mut out).unwrap();
        assert_eq!(out, payload);
    }

    #[test]
    fn test_set_length_shrink_disposes_tiles() {
        let highway = small_highway();
        let mut stream = HighwayStream::new(&highway, 16).unwrap();
        stream.set_length(64).unwrap();
        assert_eq!(stream.tiles_count(), 4);
        assert_eq!(highway.total_active_fragments(), 4);

        stream.set_length(10).unwrap();
        assert_eq!(stream.tiles_count(), 1);
        assert_eq!(highway.total_active_fragments(), 1);
    }

    #[test]
    fn test_dispose_releases_tiles_not_highway() {
        let highway = small_highway();
        let mut stream = HighwayStream::new(&highway, 32).unwrap();
        stream.write_all(&[1u8; 100]).unwrap();
        stream.dispose();
        assert_eq!(stream.len(), 0);
        assert_eq!(highway.total_active_fragments(), 0);

        // The highway stays usable, and so does the stream.
        stream.write_all(&[2u8; 10]).unwrap();
        assert_eq!(highway.total_active_fragments(), 1);
    }

    #[test]
    fn test_write_across_tile_boundary_at_offset() {
        let highway = small_highway();
        let mut stream = HighwayStream::new(&highway, 8).unwrap();
        stream.set_length(24).unwrap();
        stream.seek(SeekFrom::Start(6)).unwrap();
        stream.write_all(&[0xEE; 10]).unwrap();

        stream.seek(SeekFrom::Start(6)).unwrap();
        let mut out = [0u8; 10];
        stream.read_exact(&mut out).unwrap();
        assert_eq!(out, [0xEE; 10]);
    }

    #[test]
    fn test_zero_tile_size_rejected() {
        let highway = small_highway();
        assert!(HighwayStream::new(&highway, 0).is_err());
    }
}
