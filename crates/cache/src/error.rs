//! Error types for the chunk cache crate.

use std::path::PathBuf;

use thiserror::Error;

/// Errors from chunk cache operations.
///
/// Contract violations (oversized requests, flag changes on a buffer that is
/// not locked, releasing a dirty buffer) are not represented here. Those are
/// programming errors and panic at the call site.
#[derive(Debug, Error)]
pub enum CacheError {
    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Extending, mapping or removing the backing scratch file failed.
    #[error("Failed to {op} backing file {}: {source}", path.display())]
    Backing {
        /// Operation that failed ("extend", "mmap", "remove").
        op: &'static str,
        /// Path of the backing file.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// Buffer memory was dropped and has not been reloaded.
    #[error("Buffer memory not loaded for range [{offset}, {})", offset + length)]
    NotLoaded {
        /// File offset of the buffer.
        offset: u64,
        /// Length of the buffer.
        length: u64,
    },

    /// Configuration rejected by validation.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Backend read or write failed.
    #[error("Backend error: {0}")]
    Backend(String),
}

impl CacheError {
    /// Wrap an IO error from a backing-file operation.
    ///
    /// # Arguments
    /// * `op` - Short name of the failed operation
    /// * `path` - Backing file path
    /// * `source` - Underlying IO error
    pub(crate) fn backing(op: &'static str, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        CacheError::Backing {
            op,
            path: path.into(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backing_error_display() {
        let err = CacheError::backing(
            "mmap",
            "/tmp/filecache-1.scratch",
            std::io::Error::new(std::io::ErrorKind::Other, "no memory"),
        );
        let msg: String = err.to_string();
        assert!(msg.contains("mmap"));
        assert!(msg.contains("/tmp/filecache-1.scratch"));
        assert!(msg.contains("no memory"));
    }

    #[test]
    fn test_not_loaded_display() {
        let err = CacheError::NotLoaded {
            offset: 100,
            length: 50,
        };
        assert_eq!(err.to_string(), "Buffer memory not loaded for range [100, 150)");
    }

    #[test]
    fn test_io_from() {
        let err: CacheError = std::io::Error::new(std::io::ErrorKind::NotFound, "gone").into();
        assert!(matches!(err, CacheError::Io(_)));
    }
}
