//! Byte accounting for chunk caches.
//!
//! Every [`ChunkCache`](crate::ChunkCache) keeps its own [`ByteCounters`] and
//! mirrors each update into the global counters owned by the
//! [`CacheContext`](crate::CacheContext). The global totals are therefore the
//! sum of all live caches' local totals.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Kind of byte counter to update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Counter {
    /// Bytes of buffer memory currently allocated (heap or mapped).
    Allocated,
    /// Bytes covered by chunk map entries.
    Cached,
    /// Bytes in dirty buffers.
    Dirty,
    /// Bytes in buffers with a backend write in flight.
    Flushing,
    /// Bytes in uptodate buffers.
    Uptodate,
    /// Bytes in buffers with a non-zero in-use count.
    InUse,
    /// Bytes in locked buffers.
    Locked,
    /// Number of chunk map entries (not bytes).
    Chunks,
}

/// Set of atomic counters, one per [`Counter`] kind.
#[derive(Debug, Default)]
pub struct ByteCounters {
    allocated: AtomicU64,
    cached: AtomicU64,
    dirty: AtomicU64,
    flushing: AtomicU64,
    uptodate: AtomicU64,
    inuse: AtomicU64,
    locked: AtomicU64,
    chunks: AtomicU64,
}

impl ByteCounters {
    /// Create zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    fn counter(&self, kind: Counter) -> &AtomicU64 {
        match kind {
            Counter::Allocated => &self.allocated,
            Counter::Cached => &self.cached,
            Counter::Dirty => &self.dirty,
            Counter::Flushing => &self.flushing,
            Counter::Uptodate => &self.uptodate,
            Counter::InUse => &self.inuse,
            Counter::Locked => &self.locked,
            Counter::Chunks => &self.chunks,
        }
    }

    pub(crate) fn get(&self, kind: Counter) -> u64 {
        self.counter(kind).load(Ordering::Acquire)
    }

    fn add(&self, kind: Counter, n: u64) {
        self.counter(kind).fetch_add(n, Ordering::AcqRel);
    }

    fn sub(&self, kind: Counter, n: u64) {
        let prev: u64 = self.counter(kind).fetch_sub(n, Ordering::AcqRel);
        debug_assert!(prev >= n, "{:?} counter underflow: {} - {}", kind, prev, n);
    }

    /// Take a point-in-time snapshot.
    ///
    /// Counters are read one by one, so a snapshot taken while other threads
    /// update the cache is only approximately consistent.
    pub fn snapshot(&self) -> CacheStats {
        CacheStats {
            bytes_allocated: self.get(Counter::Allocated),
            bytes_cached: self.get(Counter::Cached),
            bytes_dirty: self.get(Counter::Dirty),
            bytes_flushing: self.get(Counter::Flushing),
            bytes_uptodate: self.get(Counter::Uptodate),
            bytes_inuse: self.get(Counter::InUse),
            bytes_locked: self.get(Counter::Locked),
            num_chunks: self.get(Counter::Chunks),
        }
    }
}

/// Per-cache counters linked to the global counters.
#[derive(Debug)]
pub(crate) struct CacheCounters {
    local: ByteCounters,
    global: Arc<ByteCounters>,
}

impl CacheCounters {
    pub(crate) fn new(global: Arc<ByteCounters>) -> Self {
        Self {
            local: ByteCounters::new(),
            global,
        }
    }

    pub(crate) fn add(&self, kind: Counter, n: u64) {
        self.local.add(kind, n);
        self.global.add(kind, n);
    }

    pub(crate) fn sub(&self, kind: Counter, n: u64) {
        self.local.sub(kind, n);
        self.global.sub(kind, n);
    }

    pub(crate) fn local(&self) -> &ByteCounters {
        &self.local
    }

    pub(crate) fn global(&self) -> &ByteCounters {
        &self.global
    }
}

impl Drop for CacheCounters {
    fn drop(&mut self) {
        // Buffers that outlive their cache can no longer reach these
        // counters, so hand back whatever is still accounted here.
        for kind in [
            Counter::Allocated,
            Counter::Cached,
            Counter::Dirty,
            Counter::Flushing,
            Counter::Uptodate,
            Counter::InUse,
            Counter::Locked,
            Counter::Chunks,
        ] {
            let remaining: u64 = self.local.get(kind);
            if remaining > 0 {
                self.global.sub(kind, remaining);
            }
        }
    }
}

/// Snapshot of cache byte counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Bytes of buffer memory currently allocated.
    pub bytes_allocated: u64,
    /// Bytes covered by chunk map entries.
    pub bytes_cached: u64,
    /// Bytes in dirty buffers.
    pub bytes_dirty: u64,
    /// Bytes in buffers being flushed.
    pub bytes_flushing: u64,
    /// Bytes in uptodate buffers.
    pub bytes_uptodate: u64,
    /// Bytes in buffers currently in use.
    pub bytes_inuse: u64,
    /// Bytes in locked buffers.
    pub bytes_locked: u64,
    /// Number of chunk map entries.
    pub num_chunks: u64,
}

impl CacheStats {
    /// Dirty bytes that do not yet have a backend write in flight.
    pub fn bytes_to_flush(&self) -> u64 {
        self.bytes_dirty.saturating_sub(self.bytes_flushing)
    }

    /// Allocated bytes as a percentage of `max_bytes`.
    ///
    /// # Arguments
    /// * `max_bytes` - Cache budget to compare against
    pub fn utilization(&self, max_bytes: u64) -> f64 {
        if max_bytes == 0 {
            0.0
        } else {
            (self.bytes_allocated as f64 / max_bytes as f64) * 100.0
        }
    }
}
