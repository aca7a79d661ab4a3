//! Lane storage backings.
//!
//! A lane owns exactly one contiguous region; the three backings differ only
//! in where that region lives. The trait is sealed: the allocator is defined
//! over precisely these variants, and the highway monomorphizes over them so
//! the hot path never pays dynamic dispatch.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use memmap2::MmapMut;

use crate::error::Error;

/// Region alignment for all backings.
const REGION_ALIGN: usize = 16;

mod sealed {
    pub trait Sealed {}
    impl Sealed for super::HeapStorage {}
    impl Sealed for super::UnmanagedStorage {}
    impl Sealed for super::MappedStorage {}
}

/// A contiguous byte region backing one lane.
pub trait Storage: sealed::Sealed + Send + Sized + 'static {
    /// Reserve a region of exactly `capacity` bytes.
    fn reserve(capacity: usize) -> Result<Self, Error>;

    /// Base pointer of the region. Valid until [`Storage::release`].
    fn as_ptr(&self) -> *mut u8;

    /// Region size in bytes.
    fn capacity(&self) -> usize;

    /// Release the region back to its source. Idempotent.
    fn release(&mut self);

    /// Short name for log records.
    fn kind() -> &'static str;
}

/// Region carved from the process heap via the global allocator, zeroed.
pub struct HeapStorage {
    ptr: NonNull<u8>,
    capacity: usize,
    released: bool,
}

// SAFETY: the region is owned exclusively and carries no thread affinity.
unsafe impl Send for HeapStorage {}

impl Storage for HeapStorage {
    fn reserve(capacity: usize) -> Result<Self, Error> {
        let layout = Layout::from_size_align(capacity, REGION_ALIGN)
            .map_err(|_| Error::MissingOrInvalidArgument("invalid region layout"))?;

        // SAFETY: layout has non-zero size; lanes validate capacity >= 1.
        let raw = unsafe { alloc_zeroed(layout) };
        let ptr = NonNull::new(raw).ok_or_else(|| {
            Error::InitFailure(Arc::new(std::io::Error::new(
                std::io::ErrorKind::OutOfMemory,
                "heap region allocation failed",
            )))
        })?;

        Ok(Self { ptr, capacity, released: false })
    }

    fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    fn capacity(&self) -> usize {
        self.capacity
    }

    fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        let layout = Layout::from_size_align(self.capacity, REGION_ALIGN)
            .expect("layout was validated at reserve time");
        // SAFETY: allocated in `reserve` with this exact layout, freed once.
        unsafe { dealloc(self.ptr.as_ptr(), layout) };
    }

    fn kind() -> &'static str {
        "heap"
    }
}

impl Drop for HeapStorage {
    fn drop(&mut self) {
        self.release();
    }
}

/// Region obtained straight from the OS allocator, bypassing the process
/// allocator. Contents are not zeroed.
pub struct UnmanagedStorage {
    ptr: NonNull<u8>,
    capacity: usize,
    released: bool,
}

// SAFETY: as for HeapStorage.
unsafe impl Send for UnmanagedStorage {}

impl Storage for UnmanagedStorage {
    fn reserve(capacity: usize) -> Result<Self, Error> {
        // SAFETY: malloc with a positive size; failure is a null return.
        let raw = unsafe { libc::malloc(capacity) } as *mut u8;
        let ptr = NonNull::new(raw).ok_or_else(|| {
            Error::InitFailure(Arc::new(std::io::Error::new(
                std::io::ErrorKind::OutOfMemory,
                "malloc failed",
            )))
        })?;

        Ok(Self { ptr, capacity, released: false })
    }

    fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    fn capacity(&self) -> usize {
        self.capacity
    }

    fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        // SAFETY: pointer came from malloc and is freed exactly once.
        unsafe { libc::free(self.ptr.as_ptr() as *mut libc::c_void) };
    }

    fn kind() -> &'static str {
        "unmanaged"
    }
}

impl Drop for UnmanagedStorage {
    fn drop(&mut self) {
        self.release();
    }
}

/// Region backed by a memory-mapped file.
///
/// The file name is auto-generated under the system temp directory unless
/// supplied via [`MappedStorage::with_path`]. Release unmaps, closes and
/// best-effort-deletes the file.
pub struct MappedStorage {
    map: Option<MmapMut>,
    file: Option<File>,
    path: PathBuf,
    capacity: usize,
}

impl MappedStorage {
    /// Map `capacity` bytes over the file at `path`, creating or truncating
    /// it.
    pub fn with_path<P: AsRef<Path>>(path: P, capacity: usize) -> Result<Self, Error> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .map_err(|e| Error::InitFailure(Arc::new(e)))?;
        file.set_len(capacity as u64)
            .map_err(|e| Error::InitFailure(Arc::new(e)))?;

        // SAFETY: the file was just sized to cover the whole mapping and is
        // open read/write.
        let map = unsafe { MmapMut::map_mut(&file) }
            .map_err(|e| Error::InitFailure(Arc::new(e)))?;

        Ok(Self { map: Some(map), file: Some(file), path, capacity })
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn auto_path() -> PathBuf {
        static SEQ: AtomicU64 = AtomicU64::new(0);
        let seq = SEQ.fetch_add(1, Ordering::Relaxed);
        std::env::temp_dir().join(format!("lane-{}-{}.bin", std::process::id(), seq))
    }
}

impl Storage for MappedStorage {
    fn reserve(capacity: usize) -> Result<Self, Error> {
        Self::with_path(Self::auto_path(), capacity)
    }

    fn as_ptr(&self) -> *mut u8 {
        match &self.map {
            Some(map) => map.as_ptr() as *mut u8,
            None => std::ptr::null_mut(),
        }
    }

    fn capacity(&self) -> usize {
        self.capacity
    }

    fn release(&mut self) {
        if self.map.is_none() && self.file.is_none() {
            return;
        }
        self.map = None;
        self.file = None;
        if let Err(e) = std::fs::remove_file(&self.path) {
            log::warn!("could not delete lane file {}: {}", self.path.display(), e);
        }
    }

    fn kind() -> &'static str {
        "mapped"
    }
}

impl Drop for MappedStorage {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_heap_storage_is_zeroed() {
        let storage = HeapStorage::reserve(64).unwrap();
        let bytes = unsafe { std::slice::from_raw_parts(storage.as_ptr(), 64) };
        assert!(bytes.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_release_is_idempotent() {
        let mut storage = UnmanagedStorage::reserve(32).unwrap();
        storage.release();
        storage.release();
    }

    #[test]
    fn test_mapped_storage_deletes_file_on_release() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lane.bin");
        let mut storage = MappedStorage::with_path(&path, 128).unwrap();
        assert!(path.exists());
        assert_eq!(storage.capacity(), 128);
        storage.release();
        assert!(!path.exists());
    }

    #[test]
    fn test_mapped_storage_auto_names() {
        let a = MappedStorage::reserve(64).unwrap();
        let b = MappedStorage::reserve(64).unwrap();
        assert_ne!(a.path(), b.path());
    }
}
