//! Fixed-length seekable stream over one fragment.

use std::io::{self, Read, Seek, SeekFrom, Write};

use crate::error::Error;
use crate::fragment::Fragment;
use crate::lane::Storage;

/// A seekable byte stream over a single fragment.
///
/// The stream length starts at the fragment length and may only shrink
/// below it; the position may be seeked past the end, where reads return 0
/// and writes are refused.
pub struct FragmentStream<S: Storage> {
    fragment: Fragment<S>,
    position: u64,
    length: u64,
}

impl<S: Storage> FragmentStream<S> {
    /// Wrap a fragment; the stream spans all of it.
    pub fn new(fragment: Fragment<S>) -> Self {
        let length = fragment.len() as u64;
        Self { fragment, position: 0, length }
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

    /// Shrink the stream; `length` must not exceed the fragment length.
    pub fn set_length(&mut self, length: u64) -> Result<(), Error> {
        if length > self.fragment.len() as u64 {
            return Err(Error::MissingOrInvalidArgument(
                "stream length cannot exceed the fragment length",
            ));
        }
        self.length = length;
        if self.position > length {
            self.position = length;
        }
        Ok(())
    }

    /// Recover the wrapped fragment.
    pub fn into_fragment(self) -> Fragment<S> {
        self.fragment
    }
}

impl<S: Storage> Read for FragmentStream<S> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let available = self.length.saturating_sub(self.position) as usize;
        let take = buf.len().min(available);
        if take == 0 {
            return Ok(0);
        }
        self.fragment
            .read(&mut buf[..take], self.position as usize, 0)?;
        self.position += take as u64;
        Ok(take)
    }
}

impl<S: Storage> Write for FragmentStream<S> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let available = self.length.saturating_sub(self.position) as usize;
        let put = buf.len().min(available);
        if put == 0 {
            return Ok(0);
        }
        self.fragment.write(&buf[..put], self.position as usize, put)?;
        self.position += put as u64;
        Ok(put)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<S: Storage> Seek for FragmentStream<S> {
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
