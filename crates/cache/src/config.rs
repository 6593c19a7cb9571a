//! Configuration for the chunk cache and readahead engine.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::CacheError;

/// One mebibyte.
pub const MIB: u64 = 1024 * 1024;

/// One gibibyte.
pub const GIB: u64 = 1024 * MIB;

/// Largest file offset the cache will track (no jumbo blocks).
pub const MAX_FILE_SIZE: u64 = 100 * MIB * 50_000;

/// Largest single cache request. Application reads and writes, and hence
/// chunks, are limited to this size.
pub const MAX_CHUNK_SIZE: u64 = 16 * MIB;

/// Default maximum aggregate cache size (4GB).
pub const DEFAULT_MAX_CACHE_SIZE_MB: u64 = 4096;

/// Default readahead window (16MB).
pub const DEFAULT_READAHEAD_KB: u64 = 16 * 1024;

/// Default size of one backend read (1MB).
pub const DEFAULT_BACKEND_READ_SIZE: u64 = MIB;

/// Configuration consumed by [`CacheContext`](crate::CacheContext).
///
/// Loading this from a file or command line is the front end's job; it only
/// needs to deserialize into this struct.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Maximum aggregate size of all chunk caches, in MB.
    pub max_cache_size_mb: u64,
    /// Maximum length of a single get/release request, in bytes.
    pub max_chunk_size: u64,
    /// Readahead window per file, in KB. Zero disables readahead.
    pub readahead_kb: u64,
    /// Preferred size of one backend read, in bytes.
    pub backend_read_size: u64,
    /// Directory for memory-mapped scratch files. Heap buffers when unset.
    pub backing_dir: Option<PathBuf>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_cache_size_mb: DEFAULT_MAX_CACHE_SIZE_MB,
            max_chunk_size: MAX_CHUNK_SIZE,
            readahead_kb: DEFAULT_READAHEAD_KB,
            backend_read_size: DEFAULT_BACKEND_READ_SIZE,
            backing_dir: None,
        }
    }
}

impl CacheConfig {
    /// Create a configuration with a custom maximum cache size.
    ///
    /// # Arguments
    /// * `max_cache_size_mb` - Maximum aggregate cache size in MB
    pub fn with_max_cache_size_mb(max_cache_size_mb: u64) -> Self {
        Self {
            max_cache_size_mb,
            ..Default::default()
        }
    }

    /// Create a file-backed configuration.
    ///
    /// # Arguments
    /// * `backing_dir` - Directory where per-file scratch files are created
    pub fn with_backing_dir(backing_dir: PathBuf) -> Self {
        Self {
            backing_dir: Some(backing_dir),
            ..Default::default()
        }
    }

    /// Maximum aggregate cache size in bytes.
    pub fn max_cache_bytes(&self) -> u64 {
        self.max_cache_size_mb * MIB
    }

    /// Readahead window in bytes.
    pub fn readahead_bytes(&self) -> u64 {
        self.readahead_kb * 1024
    }

    /// Check the configuration for values the cache cannot work with.
    pub fn validate(&self) -> Result<(), CacheError> {
        if self.max_cache_size_mb == 0 {
            return Err(CacheError::InvalidConfig(
                "max_cache_size_mb must be non-zero".to_string(),
            ));
        }
        if self.max_chunk_size == 0 || self.max_chunk_size > MAX_CHUNK_SIZE {
            return Err(CacheError::InvalidConfig(format!(
                "max_chunk_size must be in 1..={}, got {}",
                MAX_CHUNK_SIZE, self.max_chunk_size
            )));
        }
        if self.readahead_kb > 0 && self.backend_read_size == 0 {
            return Err(CacheError::InvalidConfig(
                "backend_read_size must be non-zero when readahead is enabled".to_string(),
            ));
        }
        if self.readahead_bytes() > GIB {
            return Err(CacheError::InvalidConfig(format!(
                "readahead_kb must not exceed 1GB, got {}KB",
                self.readahead_kb
            )));
        }
        Ok(())
    }
}
