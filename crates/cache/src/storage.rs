//! Storage backends for buffer memory.
//!
//! A [`ChunkCache`](crate::ChunkCache) picks one [`BufferStorage`] when it is
//! created and uses it for every buffer it allocates:
//! - [`HeapStorage`] - plain zeroed heap memory
//! - [`FileStorage`] - regions of a per-cache scratch file mapped with `mmap`
//!
//! File-backed buffers can drop their mapping under memory pressure and map
//! it again later; the bytes stay in the scratch file in between. The scratch
//! file is not a durable cache and is deleted when the cache goes away.

use std::fmt;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use memmap2::{MmapMut, MmapOptions};
use parking_lot::Mutex;

use crate::error::CacheError;

/// Memory backing one buffer.
pub enum Region {
    /// Heap allocation.
    Heap(Box<[u8]>),
    /// Shared mapping of a scratch file range.
    Mapped(MmapMut),
}

impl Region {
    /// Get the region contents.
    pub fn as_slice(&self) -> &[u8] {
        match self {
            Region::Heap(data) => data,
            Region::Mapped(map) => map,
        }
    }

    /// Get the region contents for writing.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        match self {
            Region::Heap(data) => data,
            Region::Mapped(map) => map,
        }
    }
}

impl fmt::Debug for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Region::Heap(data) => write!(f, "Region::Heap({} bytes)", data.len()),
            Region::Mapped(map) => write!(f, "Region::Mapped({} bytes)", map.len()),
        }
    }
}

/// Allocator for buffer memory.
///
/// Implementations must be usable from many threads at once.
pub trait BufferStorage: Send + Sync + fmt::Debug {
    /// Allocate memory for the file range `[offset, offset+length)`.
    ///
    /// # Arguments
    /// * `offset` - File offset the buffer caches
    /// * `length` - Buffer length in bytes
    fn allocate(&self, offset: u64, length: u64) -> Result<Region, CacheError>;

    /// True if dropped memory can be mapped again without losing data.
    fn is_file_backed(&self) -> bool;

    /// Delete any backing store. Later allocations start from scratch.
    fn remove(&self) -> Result<(), CacheError>;
}

/// Heap-backed storage.
#[derive(Debug, Default, Clone, Copy)]
pub struct HeapStorage;

impl BufferStorage for HeapStorage {
    fn allocate(&self, _offset: u64, length: u64) -> Result<Region, CacheError> {
        Ok(Region::Heap(vec![0u8; length as usize].into_boxed_slice()))
    }

    fn is_file_backed(&self) -> bool {
        false
    }

    fn remove(&self) -> Result<(), CacheError> {
        Ok(())
    }
}

/// Open scratch file and its current length.
#[derive(Debug)]
struct BackingFile {
    file: File,
    len: u64,
}

/// Storage backed by a memory-mapped scratch file.
///
/// Buffer offsets map one-to-one to scratch file offsets, so the file is
/// sparse and only as long as the highest cached byte.
///
/// # Directory Structure
/// ```text
/// backing_dir/
/// ├── filecache-1.scratch     # one file per ChunkCache
/// ├── filecache-2.scratch
/// └── ...
/// ```
#[derive(Debug)]
pub struct FileStorage {
    /// Scratch file path.
    path: PathBuf,
    /// Open file, `None` until first use or after `remove()`.
    backing: Mutex<Option<BackingFile>>,
}

impl FileStorage {
    /// Create storage for one cache.
    ///
    /// # Arguments
    /// * `dir` - Backing directory (created if missing)
    /// * `cache_id` - Id of the owning cache, used to name the scratch file
    pub fn new(dir: &Path, cache_id: u64) -> Result<Self, CacheError> {
        std::fs::create_dir_all(dir)?;

        Ok(Self {
            path: Self::scratch_path(dir, cache_id),
            backing: Mutex::new(None),
        })
    }

    /// Path of the scratch file for a cache.
    ///
    /// # Arguments
    /// * `dir` - Backing directory
    /// * `cache_id` - Id of the owning cache
    pub fn scratch_path(dir: &Path, cache_id: u64) -> PathBuf {
        dir.join(format!("filecache-{}.scratch", cache_id))
    }

    /// Get the scratch file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current scratch file length, 0 if not created yet.
    pub fn backing_len(&self) -> u64 {
        self.backing.lock().as_ref().map_or(0, |b| b.len)
    }

    fn open(&self) -> Result<BackingFile, CacheError> {
        let file: File = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&self.path)
            .map_err(|e| CacheError::backing("create", &self.path, e))?;

        tracing::debug!("Created backing file {}", self.path.display());
        Ok(BackingFile { file, len: 0 })
    }
}

impl BufferStorage for FileStorage {
    fn allocate(&self, offset: u64, length: u64) -> Result<Region, CacheError> {
        let mut guard = self.backing.lock();

        if guard.is_none() {
            *guard = Some(self.open()?);
        }
        let backing: &mut BackingFile = match guard.as_mut() {
            Some(b) => b,
            None => unreachable!("backing file opened above"),
        };

        let end: u64 = offset + length;
        if end > backing.len {
            backing.file.set_len(end).map_err(|e| {
                tracing::error!("Cannot extend {} to {}: {}", self.path.display(), end, e);
                CacheError::backing("extend", &self.path, e)
            })?;
            backing.len = end;
        }

        // SAFETY: the scratch file is private to this cache and only ever
        // grows while mapped, so the mapping never refers past end-of-file.
        let map: MmapMut = unsafe {
            MmapOptions::new()
                .offset(offset)
                .len(length as usize)
                .map_mut(&backing.file)
        }
        .map_err(|e| {
            tracing::error!(
                "Cannot mmap [{}, {}) of {}: {}",
                offset,
                end,
                self.path.display(),
                e
            );
            CacheError::backing("mmap", &self.path, e)
        })?;

        Ok(Region::Mapped(map))
    }

    fn is_file_backed(&self) -> bool {
        true
    }

    fn remove(&self) -> Result<(), CacheError> {
        let mut guard = self.backing.lock();

        if guard.take().is_some() {
            match std::fs::remove_file(&self.path) {
                Ok(()) => {
                    tracing::debug!("Removed backing file {}", self.path.display());
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(CacheError::backing("remove", &self.path, e)),
            }
        }
        Ok(())
    }
}

impl Drop for FileStorage {
    fn drop(&mut self) {
        if let Err(e) = self.remove() {
            tracing::warn!("Failed to clean up backing file: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_heap_allocate_zeroed() {
        let region: Region = HeapStorage.allocate(4096, 100).unwrap();
        assert_eq!(region.as_slice().len(), 100);
        assert!(region.as_slice().iter().all(|&b| b == 0));
        assert!(!HeapStorage.is_file_backed());
    }

    #[test]
    fn test_file_allocate_extends_file() {
        let temp = TempDir::new().unwrap();
        let storage = FileStorage::new(temp.path(), 7).unwrap();

        assert_eq!(storage.backing_len(), 0);
        assert!(!storage.path().exists());

        let region: Region = storage.allocate(1000, 500).unwrap();
        assert_eq!(region.as_slice().len(), 500);
        assert_eq!(storage.backing_len(), 1500);
        assert!(storage.path().exists());

        // A lower range never shrinks the file.
        let _low: Region = storage.allocate(0, 10).unwrap();
        assert_eq!(storage.backing_len(), 1500);
    }

    #[test]
    fn test_file_data_survives_remap() {
        let temp = TempDir::new().unwrap();
        let storage = FileStorage::new(temp.path(), 1).unwrap();

        let mut region: Region = storage.allocate(5000, 16).unwrap();
        region.as_mut_slice().copy_from_slice(b"0123456789abcdef");
        drop(region);

        let again: Region = storage.allocate(5000, 16).unwrap();
        assert_eq!(again.as_slice(), b"0123456789abcdef");
    }

    #[test]
    fn test_file_remove_and_recreate() {
        let temp = TempDir::new().unwrap();
        let storage = FileStorage::new(temp.path(), 3).unwrap();

        let mut region: Region = storage.allocate(0, 4).unwrap();
        region.as_mut_slice().copy_from_slice(b"abcd");
        drop(region);

        storage.remove().unwrap();
        assert!(!storage.path().exists());
        assert_eq!(storage.backing_len(), 0);

        // Recreated empty.
        let fresh: Region = storage.allocate(0, 4).unwrap();
        assert_eq!(fresh.as_slice(), &[0, 0, 0, 0]);
    }

    #[test]
    fn test_drop_removes_scratch_file() {
        let temp = TempDir::new().unwrap();
        let path: PathBuf = {
            let storage = FileStorage::new(temp.path(), 9).unwrap();
            let _r: Region = storage.allocate(0, 8).unwrap();
            storage.path().to_path_buf()
        };
        assert!(!path.exists());
    }
}
