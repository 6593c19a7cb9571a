//! Sequential-read detection and prefetch.
//!
//! [`ReadaheadState`] watches the application reads of one file. Once it
//! sees a dense, mostly forward stream it recommends prefetch offsets just
//! past the highest byte read (or prefetched), and
//! [`issue_readaheads`](ReadaheadState::issue_readaheads) turns them into
//! locked cache chunks handed to a [`BackendRead`] collaborator.
//!
//! ```text
//!   app reads ──► on_application_read() ──► pattern (min/max/num/bytes)
//!                                               │ is_sequential()
//!                                               ▼
//!   issue_readaheads() ──► get_next_ra() ──► ChunkCache::get() + try_lock
//!                                               │
//!                                               ▼
//!                             BackendRead::issue_read(ReadaheadRequest)
//!                                               │ complete()
//!                                               ▼
//!                 set_uptodate or release range, on_readahead_complete()
//! ```
//!
//! At most `ra_bytes` of readahead are outstanding per file. The detector
//! only remembers one 1GB section of the file; moving anywhere but into the
//! next section of a sequential stream starts over.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;

use crate::chunk::ByteChunk;
use crate::chunk_cache::{ChunkCache, ReadaheadWindow};
use crate::config::{GIB, MAX_FILE_SIZE};
use crate::error::CacheError;

/// Granularity of access history.
const SECTION_SIZE: u64 = GIB;

/// Minimum percentage of the read span actually read for a sequential
/// pattern.
const ACCESS_DENSITY_MIN: u64 = 70;

/// Reads needed before a pattern can be called sequential.
const MIN_SEQUENTIAL_READS: u64 = 3;

// ============================================================================
// Pattern detection
// ============================================================================

#[derive(Debug, Clone, Copy)]
struct Tracker {
    min_byte_read: u64,
    /// Last byte of the furthest read; `u64::MAX` when nothing was read.
    max_byte_read: u64,
    num_reads: u64,
    num_bytes_read: u64,
    /// Last byte handed out for readahead (or read by the application).
    last_byte_readahead: u64,
}

impl Tracker {
    fn new() -> Self {
        Self {
            min_byte_read: 0,
            max_byte_read: u64::MAX,
            num_reads: 0,
            num_bytes_read: 0,
            last_byte_readahead: 0,
        }
    }

    fn is_sequential(&self) -> bool {
        if self.num_reads < MIN_SEQUENTIAL_READS {
            return false;
        }
        let access_range: u64 = self.max_byte_read - self.min_byte_read;
        if access_range == 0 {
            return false;
        }
        let access_density: u128 = self.num_bytes_read as u128 * 100 / access_range as u128;
        access_density > ACCESS_DENSITY_MIN as u128
    }
}

/// Access pattern detector and readahead budget for one file.
#[derive(Debug)]
struct PatternDetector {
    /// Readahead window; 0 disables readahead.
    ra_bytes: u64,
    /// Default size of one readahead.
    def_ra_size: u64,
    tracker: RwLock<Tracker>,
    /// Readahead bytes issued and not yet completed.
    ra_ongoing: AtomicU64,
}

impl PatternDetector {
    fn new(ra_bytes: u64, def_ra_size: u64) -> Self {
        Self {
            ra_bytes,
            def_ra_size,
            tracker: RwLock::new(Tracker::new()),
            ra_ongoing: AtomicU64::new(0),
        }
    }

    fn on_application_read(&self, offset: u64, length: u64) {
        assert!(length > 0, "zero-length application read at {}", offset);
        assert!(
            offset.checked_add(length).is_some_and(|end| end <= MAX_FILE_SIZE),
            "application read [{}, +{}) beyond max file size",
            offset,
            length
        );

        let mut t = self.tracker.write();

        let curr_section: u64 = t.max_byte_read / SECTION_SIZE;
        let this_section: u64 = offset / SECTION_SIZE;
        let read_gap: u64 = offset.abs_diff(t.max_byte_read);

        let reset: bool = if read_gap > self.ra_bytes {
            true
        } else if curr_section != this_section {
            // Only a sequential stream may carry on into the next section.
            this_section != curr_section + 1 || !t.is_sequential()
        } else {
            false
        };

        if reset {
            t.num_reads = 1;
            t.num_bytes_read = length;
            t.min_byte_read = offset;
            t.max_byte_read = offset + length - 1;
            t.last_byte_readahead = 0;
        } else {
            t.num_reads += 1;
            t.num_bytes_read += length;
            t.max_byte_read = t.max_byte_read.max(offset + length - 1);
            t.min_byte_read = t.min_byte_read.min(offset);
        }

        // Never prefetch what the application already read.
        t.last_byte_readahead = t.last_byte_readahead.max(t.max_byte_read);
    }

    fn is_sequential(&self) -> bool {
        self.tracker.read().is_sequential()
    }

    fn get_next_ra(&self, length: u64) -> Option<u64> {
        if self.ra_bytes == 0 {
            return None;
        }
        let length: u64 = if length == 0 { self.def_ra_size } else { length };

        let mut t = self.tracker.write();

        if t.last_byte_readahead + 1 + length > MAX_FILE_SIZE {
            return None;
        }
        if !t.is_sequential() {
            return None;
        }

        let ongoing: u64 = self.ra_ongoing.fetch_add(length, Ordering::AcqRel) + length;
        if ongoing > self.ra_bytes {
            self.ra_ongoing.fetch_sub(length, Ordering::AcqRel);
            return None;
        }

        let next_ra: u64 = t.last_byte_readahead + 1;
        t.last_byte_readahead += length;
        Some(next_ra)
    }

    fn on_readahead_complete(&self, offset: u64, length: u64) {
        let length: u64 = if length == 0 { self.def_ra_size } else { length };
        let prev: u64 = self.ra_ongoing.fetch_sub(length, Ordering::AcqRel);
        assert!(
            prev >= length,
            "readahead completion [{}, +{}) exceeds outstanding {} bytes",
            offset,
            length,
            prev
        );
    }

    fn reset(&self) {
        let mut t = self.tracker.write();
        t.num_reads = 0;
        t.num_bytes_read = 0;
        t.min_byte_read = 0;
        t.max_byte_read = u64::MAX;
    }

    fn in_ra_window(&self, offset: u64, length: u64) -> bool {
        let t = self.tracker.read();
        if t.max_byte_read == u64::MAX || t.last_byte_readahead <= t.max_byte_read {
            return false;
        }
        // Prefetched but not yet read: (max_byte_read, last_byte_readahead].
        offset <= t.last_byte_readahead && offset.saturating_add(length) > t.max_byte_read + 1
    }
}

// ============================================================================
// Backend seam
// ============================================================================

/// Performs backend reads for readahead.
///
/// Implementations take ownership of the request, fill it with
/// [`ReadaheadRequest::write`] (from any thread, possibly in several
/// pieces) and finish it with [`ReadaheadRequest::complete`]. Retries are the
/// implementation's business.
pub trait BackendRead: Send + Sync {
    /// Start reading `request.remaining()` bytes at `request.offset()`.
    fn issue_read(&self, request: ReadaheadRequest);
}

/// One readahead read in flight.
///
/// Owns a whole, locked, in-use chunk. Completing it (or dropping it) unlocks
/// the buffer and returns the readahead budget. The buffer is marked
/// uptodate only if every byte was written and the result is `Ok`;
/// otherwise its range is released from the cache.
pub struct ReadaheadRequest {
    state: Arc<ReadaheadState>,
    chunk: ByteChunk,
    done: bool,
}

impl ReadaheadRequest {
    fn new(state: Arc<ReadaheadState>, chunk: ByteChunk) -> Self {
        Self {
            state,
            chunk,
            done: false,
        }
    }

    /// Get the chunk being filled.
    pub fn chunk(&self) -> &ByteChunk {
        &self.chunk
    }

    /// File offset of the next byte to read.
    pub fn offset(&self) -> u64 {
        self.chunk.offset() + self.chunk.pvt
    }

    /// Bytes still to read.
    pub fn remaining(&self) -> u64 {
        self.chunk.remaining()
    }

    /// Append bytes read from the backend.
    ///
    /// # Returns
    /// Number of bytes taken; anything past the end of the chunk is ignored.
    pub fn write(&mut self, data: &[u8]) -> Result<usize, CacheError> {
        let n: usize = data.len().min(self.remaining() as usize);
        self.chunk.write(self.chunk.pvt, &data[..n])?;
        self.chunk.pvt += n as u64;
        Ok(n)
    }

    /// Finish the request.
    ///
    /// # Arguments
    /// * `result` - Backend outcome; `Ok` with fewer bytes than the chunk
    ///   length counts as a short read
    pub fn complete(mut self, result: Result<(), CacheError>) {
        self.finish(result);
    }

    fn finish(&mut self, result: Result<(), CacheError>) {
        if self.done {
            return;
        }
        self.done = true;

        let (offset, length) = (self.chunk.offset(), self.chunk.length());
        let membuf = self.chunk.membuf().clone();

        match result {
            Ok(()) if self.chunk.pvt == length => {
                membuf.set_uptodate();
                membuf.clear_locked();
                membuf.clear_inuse();
                tracing::trace!("Readahead [{}, {}) done", offset, offset + length);
            }
            other => {
                match other {
                    Err(e) => tracing::debug!("Readahead [{}, {}) failed: {}", offset, offset + length, e),
                    Ok(()) => tracing::debug!(
                        "Readahead [{}, {}) short by {} bytes",
                        offset,
                        offset + length,
                        self.chunk.remaining()
                    ),
                }
                membuf.clear_locked();
                membuf.clear_inuse();
                self.state.cache.release(offset, length);
            }
        }

        self.state.on_readahead_complete(offset, length);
    }
}

impl Drop for ReadaheadRequest {
    fn drop(&mut self) {
        if !self.done {
            self.finish(Err(CacheError::Backend(
                "readahead request dropped before completion".to_string(),
            )));
        }
    }
}

impl fmt::Debug for ReadaheadRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadaheadRequest")
            .field("chunk", &self.chunk)
            .field("pvt", &self.chunk.pvt)
            .field("done", &self.done)
            .finish()
    }
}

// ============================================================================
// ReadaheadState
// ============================================================================

/// Readahead engine for one open file.
pub struct ReadaheadState {
    pattern: PatternDetector,
    cache: Arc<ChunkCache>,
    backend: Arc<dyn BackendRead>,
}

impl ReadaheadState {
    /// Create readahead state for a file and attach its window to the cache.
    ///
    /// Window and read sizes come from the cache's configuration:
    /// `def_ra_size = min(backend_read_size, ra_bytes, max_chunk_size)`.
    ///
    /// # Arguments
    /// * `cache` - The file's chunk cache
    /// * `backend` - Performs the prefetch reads
    pub fn new(cache: Arc<ChunkCache>, backend: Arc<dyn BackendRead>) -> Arc<Self> {
        let config = cache.context().config();
        let ra_bytes: u64 = config.readahead_bytes();
        let def_ra_size: u64 = config
            .backend_read_size
            .min(ra_bytes)
            .min(config.max_chunk_size);

        let state: Arc<ReadaheadState> = Arc::new(Self {
            pattern: PatternDetector::new(ra_bytes, def_ra_size),
            cache,
            backend,
        });

        let window: Weak<ReadaheadState> = Arc::downgrade(&state);
        state.cache.set_readahead_window(window);

        tracing::debug!(
            "Readahead for cache {}: window {} bytes, read size {} bytes",
            state.cache.id(),
            ra_bytes,
            def_ra_size
        );
        state
    }

    /// Readahead window in bytes (0 when disabled).
    pub fn ra_bytes(&self) -> u64 {
        self.pattern.ra_bytes
    }

    /// Default size of one readahead.
    pub fn def_ra_size(&self) -> u64 {
        self.pattern.def_ra_size
    }

    /// Readahead bytes issued and not yet completed.
    pub fn ra_ongoing(&self) -> u64 {
        self.pattern.ra_ongoing.load(Ordering::Acquire)
    }

    /// Get the cache readahead fills.
    pub fn cache(&self) -> &Arc<ChunkCache> {
        &self.cache
    }

    /// Record an application read. Call before issuing the read.
    pub fn on_application_read(&self, offset: u64, length: u64) {
        self.pattern.on_application_read(offset, length);
    }

    /// True once at least 3 reads cover more than 70% of their span.
    pub fn is_sequential(&self) -> bool {
        self.pattern.is_sequential()
    }

    /// Reserve the next readahead.
    ///
    /// # Arguments
    /// * `length` - Readahead size, 0 for `def_ra_size`
    ///
    /// # Returns
    /// Offset to prefetch from, or `None` if the pattern is not sequential,
    /// the window is full or the offset would pass the max file size.
    pub fn get_next_ra(&self, length: u64) -> Option<u64> {
        self.pattern.get_next_ra(length)
    }

    /// Return readahead budget. Must be called once per reserved range,
    /// whatever the outcome.
    ///
    /// # Arguments
    /// * `offset` - Start of the completed range
    /// * `length` - Its length, 0 for `def_ra_size`
    pub fn on_readahead_complete(&self, offset: u64, length: u64) {
        self.pattern.on_readahead_complete(offset, length);
    }

    /// Forget the access history, e.g. on re-open.
    pub fn reset(&self) {
        self.pattern.reset();
    }

    /// Issue as many readaheads as the pattern and window allow.
    ///
    /// Chunks that are already uptodate, locked by someone else or not whole
    /// are skipped. One call issues at most `ra_bytes / def_ra_size`
    /// readaheads.
    ///
    /// # Returns
    /// Number of backend reads issued.
    pub fn issue_readaheads(self: &Arc<Self>) -> usize {
        let length: u64 = self.def_ra_size();
        if self.ra_bytes() == 0 || length == 0 {
            return 0;
        }

        let max_rounds: u64 = self.ra_bytes() / length;
        let mut issued: usize = 0;

        for _ in 0..max_rounds {
            let Some(offset) = self.get_next_ra(length) else {
                break;
            };

            let chunks: Vec<ByteChunk> = match self.cache.get(offset, length) {
                Ok(chunks) => chunks,
                Err(e) => {
                    tracing::warn!("Readahead get [{}, {}) failed: {}", offset, offset + length, e);
                    self.on_readahead_complete(offset, length);
                    break;
                }
            };

            for mut chunk in chunks {
                let membuf = chunk.membuf().clone();

                if !chunk.is_whole() || membuf.is_uptodate() || !membuf.try_lock() {
                    membuf.clear_inuse();
                    self.on_readahead_complete(chunk.offset(), chunk.length());
                    continue;
                }

                // Filled while we were locking.
                if membuf.is_uptodate() {
                    membuf.clear_locked();
                    membuf.clear_inuse();
                    self.on_readahead_complete(chunk.offset(), chunk.length());
                    continue;
                }

                chunk.num_backend_calls_issued += 1;
                tracing::trace!("Issuing readahead [{}, {})", chunk.offset(), chunk.end());
                self.backend.issue_read(ReadaheadRequest::new(self.clone(), chunk));
                issued += 1;
            }
        }

        if issued > 0 {
            tracing::debug!(
                "Cache {}: issued {} readaheads, {} bytes outstanding",
                self.cache.id(),
                issued,
                self.ra_ongoing()
            );
        }
        issued
    }
}

impl ReadaheadWindow for ReadaheadState {
    fn in_ra_window(&self, offset: u64, length: u64) -> bool {
        self.pattern.in_ra_window(offset, length)
    }
}

impl fmt::Debug for ReadaheadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadaheadState")
            .field("cache", &self.cache.id())
            .field("pattern", &self.pattern)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MIB;

    const TIB: u64 = 1024 * GIB;

    #[test]
    fn test_needs_three_reads() {
        let ras = PatternDetector::new(128 * MIB, 4 * MIB);

        ras.on_application_read(0, MIB);
        assert_eq!(ras.get_next_ra(4 * MIB), None);
        ras.on_application_read(MIB, MIB);
        assert_eq!(ras.get_next_ra(4 * MIB), None);
        ras.on_application_read(2 * MIB, MIB);
        assert!(ras.is_sequential());
        assert_eq!(ras.get_next_ra(4 * MIB), Some(3 * MIB));
    }

    #[test]
    fn test_pattern_detection_sequence() {
        let ras = PatternDetector::new(128 * MIB, 4 * MIB);
        let mut next_read: u64 = 0;

        for _ in 0..3 {
            ras.on_application_read(next_read, MIB);
            next_read += MIB;
        }
        next_read -= MIB;

        // 128MB window holds 32 readaheads of 4MB.
        let mut next_ra: u64 = 3 * MIB;
        assert_eq!(ras.get_next_ra(4 * MIB), Some(next_ra));
        for _ in 0..31 {
            next_ra += 4 * MIB;
            assert_eq!(ras.get_next_ra(4 * MIB), Some(next_ra));
        }
        assert_eq!(ras.get_next_ra(4 * MIB), None);

        // One completion frees room for one more.
        let mut complete_ra: u64 = 3 * MIB;
        ras.on_readahead_complete(complete_ra, 4 * MIB);
        next_ra += 4 * MIB;
        assert_eq!(ras.get_next_ra(4 * MIB), Some(next_ra));
        assert_eq!(ras.get_next_ra(4 * MIB), None);

        for _ in 0..32 {
            complete_ra += 4 * MIB;
            ras.on_readahead_complete(complete_ra, 4 * MIB);
        }
        next_ra += 4 * MIB;
        assert_eq!(ras.get_next_ra(4 * MIB), Some(next_ra));
        ras.on_readahead_complete(next_ra, 4 * MIB);
        assert_eq!(ras.pattern_ongoing(), 0);

        // A far read in the same section dilutes the access density.
        ras.on_application_read(100 * MIB, MIB);
        assert!(!ras.is_sequential());
        assert_eq!(ras.get_next_ra(4 * MIB), None);

        // Reading the gap restores it; readahead resumes after the last
        // readahead byte, which is beyond the last byte read.
        for _ in 0..97 {
            next_read += MIB;
            ras.on_application_read(next_read, MIB);
        }
        next_ra += 4 * MIB;
        assert!(next_ra > 101 * MIB);
        assert_eq!(ras.get_next_ra(4 * MIB), Some(next_ra));

        // Jumping two sections ahead resets the detector.
        next_read = 2 * GIB;
        ras.on_application_read(next_read, MIB);
        assert_eq!(ras.get_next_ra(4 * MIB), None);
        next_read += MIB;
        ras.on_application_read(next_read, MIB);
        assert_eq!(ras.get_next_ra(4 * MIB), None);
        next_read += MIB;
        ras.on_application_read(next_read, MIB);
        assert_eq!(ras.get_next_ra(4 * MIB), Some(next_read + MIB));

        // Scattered reads never look sequential.
        ras.on_application_read(4 * GIB, MIB);
        assert_eq!(ras.get_next_ra(4 * MIB), None);
        for i in 0..1000u64 {
            ras.on_application_read(((i * 37) % 1024) * GIB, MIB);
            assert!(!ras.is_sequential());
            assert_eq!(ras.get_next_ra(4 * MIB), None);

            ras.on_application_read(TIB + ((i * 53) % 1024) * GIB, MIB);
            assert!(!ras.is_sequential());
            assert_eq!(ras.get_next_ra(4 * MIB), None);
        }

        // A fresh sequential stream, crossing section boundaries.
        next_read = 10 * GIB;
        ras.on_application_read(next_read, MIB);
        assert_eq!(ras.get_next_ra(4 * MIB), None);
        next_read += MIB;
        ras.on_application_read(next_read, MIB);
        assert_eq!(ras.get_next_ra(4 * MIB), None);
        next_read += MIB;
        ras.on_application_read(next_read, MIB);

        next_ra = next_read + MIB;
        assert_eq!(ras.get_next_ra(4 * MIB), Some(next_ra));

        for _ in 0..2000 {
            next_read += MIB;
            ras.on_application_read(next_read, MIB);

            next_ra += 4 * MIB;
            assert_eq!(ras.get_next_ra(4 * MIB), Some(next_ra));
            ras.on_readahead_complete(next_ra, 4 * MIB);
        }
        assert!(next_read > 11 * GIB);
        assert!(ras.is_sequential());
    }

    #[test]
    fn test_large_gap_resets() {
        let ras = PatternDetector::new(16 * MIB, MIB);
        for i in 0..4 {
            ras.on_application_read(i * MIB, MIB);
        }
        assert!(ras.is_sequential());

        ras.on_application_read(64 * MIB, MIB);
        assert!(!ras.is_sequential());
        assert_eq!(ras.get_next_ra(0), None);

        ras.on_application_read(65 * MIB, MIB);
        ras.on_application_read(66 * MIB, MIB);
        assert_eq!(ras.get_next_ra(0), Some(67 * MIB));
    }

    #[test]
    fn test_reset_forgets_history() {
        let ras = PatternDetector::new(16 * MIB, MIB);
        for i in 0..3 {
            ras.on_application_read(i * MIB, MIB);
        }
        assert!(ras.is_sequential());

        ras.reset();
        assert!(!ras.is_sequential());
        assert_eq!(ras.get_next_ra(0), None);
        assert!(!ras.in_ra_window(0, u64::MAX));
    }

    #[test]
    fn test_disabled_never_recommends() {
        let ras = PatternDetector::new(0, 0);
        for i in 0..10 {
            ras.on_application_read(i * MIB, MIB);
        }
        assert_eq!(ras.get_next_ra(MIB), None);
    }

    #[test]
    fn test_ra_window_covers_prefetched_bytes() {
        let ras = PatternDetector::new(16 * MIB, MIB);
        for i in 0..3 {
            ras.on_application_read(i * MIB, MIB);
        }
        assert!(!ras.in_ra_window(3 * MIB, MIB));

        assert_eq!(ras.get_next_ra(0), Some(3 * MIB));
        assert_eq!(ras.get_next_ra(0), Some(4 * MIB));

        // Already read by the application.
        assert!(!ras.in_ra_window(0, 3 * MIB));
        // Prefetched, not read yet.
        assert!(ras.in_ra_window(3 * MIB, MIB));
        assert!(ras.in_ra_window(4 * MIB, 10));
        assert!(ras.in_ra_window(2 * MIB, 2 * MIB));
        // Beyond the last readahead.
        assert!(!ras.in_ra_window(5 * MIB, MIB));
    }

    #[test]
    #[should_panic(expected = "exceeds outstanding")]
    fn test_completion_without_issue_panics() {
        let ras = PatternDetector::new(16 * MIB, MIB);
        ras.on_readahead_complete(0, MIB);
    }

    impl PatternDetector {
        fn pattern_ongoing(&self) -> u64 {
            self.ra_ongoing.load(Ordering::Acquire)
        }
    }
}
