//! Per-file byte-range cache.
//!
//! A [`ChunkCache`] maps byte ranges of one file to [`MemoryBuffer`]s through
//! an ordered, non-overlapping chunk map.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                         ChunkCache                           │
//! │  chunkmap: Mutex<BTreeMap<offset, ByteChunk>>                │
//! │                                                              │
//! │   [0,50)     [50,225)           [225,250) [250,300)          │
//! │     │           │                   │         │              │
//! │     ▼           ▼                   ▼         ▼              │
//! │  membuf A    membuf B        membuf C @+25  membuf D         │
//! └──────────────────────────────────────────────────────────────┘
//!          │ allocate                        │ counters
//!          ▼                                 ▼
//!   Arc<dyn BufferStorage>         CacheCounters ──► CacheContext
//! ```
//!
//! # Rules
//!
//! - `get()` covers the requested range exactly, reusing cached sub-ranges
//!   and allocating one new buffer per gap.
//! - Every returned chunk has its buffer's in-use count raised; the caller
//!   drops it with `clear_inuse()` when done.
//! - Only chunks whose buffer is not in use, locked or dirty are ever
//!   released, cleared or pruned.
//! - A release trims a chunk only at the edges of the released range. A
//!   release strictly inside one chunk is skipped.
//! - The map mutex is never held across I/O.

use std::collections::BTreeMap;
use std::fmt;
use std::ops::Range;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};

use crate::chunk::ByteChunk;
use crate::config::{MAX_FILE_SIZE, MIB};
use crate::context::CacheContext;
use crate::error::CacheError;
use crate::membuf::MemoryBuffer;
use crate::stats::{CacheCounters, CacheStats, Counter};
use crate::storage::{BufferStorage, FileStorage, HeapStorage};

type ChunkMap = BTreeMap<u64, ByteChunk>;

/// Budget percentage above which `get()` prunes inline.
const INLINE_PRUNE_START_PCT: u64 = 80;
/// Budget percentage inline pruning brings the cache back to.
const INLINE_PRUNE_TARGET_PCT: u64 = 70;
/// Budget percentage above which the periodic sweep prunes.
const PERIODIC_PRUNE_START_PCT: u64 = 60;
/// Budget percentage periodic pruning brings the cache back to.
const PERIODIC_PRUNE_TARGET_PCT: u64 = 50;
/// Smallest non-zero prune goal for one cache.
const MIN_PRUNE_BYTES: u64 = MIB;

/// Answers whether a range lies in a file's active readahead window.
///
/// Pruning leaves such ranges alone so prefetched data is not evicted
/// before the application reads it.
pub trait ReadaheadWindow: Send + Sync {
    /// Check if any part of `[offset, offset+length)` is inside the window.
    fn in_ra_window(&self, offset: u64, length: u64) -> bool;
}

/// Result of [`ChunkCache::getx`].
#[derive(Debug)]
pub struct CacheExtent {
    /// Chunks covering the requested range, in order.
    pub chunks: Vec<ByteChunk>,
    /// First byte of the flush-eligible extent containing the range.
    pub extent_left: u64,
    /// One past the last byte of that extent.
    pub extent_right: u64,
}

/// Outstanding eviction targets for one cache.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PruneGoals {
    /// Bytes to prune synchronously before allocating more memory.
    pub inline_bytes: u64,
    /// Bytes to prune from the periodic sweep.
    pub periodic_bytes: u64,
}

/// Byte-range cache for one file.
pub struct ChunkCache {
    /// Cache id, unique within the context.
    id: u64,
    /// Shared configuration, global counters and registry.
    context: Arc<CacheContext>,
    /// Allocator for buffer memory.
    storage: Arc<dyn BufferStorage>,
    /// Cached ranges keyed by offset.
    chunkmap: Mutex<ChunkMap>,
    /// Set by `invalidate()`, applied by the next `get()`.
    invalidate_pending: AtomicBool,
    /// Readahead window of the owning file, if any.
    ra_window: RwLock<Option<Weak<dyn ReadaheadWindow>>>,
    /// Byte counters. Declared last so buffers in the map are dropped while
    /// these are still reachable.
    counters: Arc<CacheCounters>,
}

impl ChunkCache {
    /// Create a cache and register it with the context.
    ///
    /// The cache is file-backed if the context configuration has a
    /// `backing_dir`.
    ///
    /// # Arguments
    /// * `context` - Shared cache context
    pub fn new(context: &Arc<CacheContext>) -> Result<Arc<Self>, CacheError> {
        let id: u64 = context.next_cache_id();

        let storage: Arc<dyn BufferStorage> = match &context.config().backing_dir {
            Some(dir) => Arc::new(FileStorage::new(dir, id)?),
            None => Arc::new(HeapStorage),
        };

        let cache: Arc<ChunkCache> = Arc::new(Self {
            id,
            context: context.clone(),
            storage,
            chunkmap: Mutex::new(BTreeMap::new()),
            invalidate_pending: AtomicBool::new(false),
            ra_window: RwLock::new(None),
            counters: Arc::new(CacheCounters::new(context.counters().clone())),
        });

        context.register(&cache);
        tracing::debug!(
            "Created chunk cache {} ({})",
            id,
            if cache.is_file_backed() { "file-backed" } else { "heap" }
        );
        Ok(cache)
    }

    /// Cache id, unique within the context.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Get the shared context.
    pub fn context(&self) -> &Arc<CacheContext> {
        &self.context
    }

    /// True if buffer memory comes from a memory-mapped scratch file.
    pub fn is_file_backed(&self) -> bool {
        self.storage.is_file_backed()
    }

    /// Attach the owning file's readahead window, consulted by pruning.
    pub fn set_readahead_window(&self, window: Weak<dyn ReadaheadWindow>) {
        *self.ra_window.write() = Some(window);
    }

    // ========================================================================
    // Map bookkeeping
    // ========================================================================

    fn insert_entry(&self, map: &mut ChunkMap, bc: ByteChunk) {
        self.counters.add(Counter::Cached, bc.length());
        self.counters.add(Counter::Chunks, 1);
        let prev: Option<ByteChunk> = map.insert(bc.offset(), bc);
        debug_assert!(prev.is_none(), "duplicate chunk map key");
    }

    fn remove_entry(&self, map: &mut ChunkMap, key: u64) -> Option<ByteChunk> {
        let bc: ByteChunk = map.remove(&key)?;
        self.counters.sub(Counter::Cached, bc.length());
        self.counters.sub(Counter::Chunks, 1);
        Some(bc)
    }

    /// Map entries overlapping `[start, end)`, in offset order.
    fn overlapping(map: &ChunkMap, start: u64, end: u64) -> impl Iterator<Item = &ByteChunk> {
        let first_key: u64 = map
            .range(..=start)
            .next_back()
            .filter(|(_, bc)| bc.end() > start)
            .map_or(start, |(key, _)| *key);

        map.range(first_key..end).map(|(_, bc)| bc)
    }

    // ========================================================================
    // Get
    // ========================================================================

    /// Get chunks covering `[offset, offset+length)`.
    ///
    /// Cached sub-ranges are returned as views of their existing buffers;
    /// gaps get new buffers (`is_new`). Every returned chunk's buffer is
    /// marked in use and the caller must call `clear_inuse()` on each one.
    ///
    /// # Arguments
    /// * `offset` - File offset
    /// * `length` - Non-zero length, at most `max_chunk_size`
    ///
    /// # Returns
    /// Chunks that, in order, exactly cover the range. On error no chunks
    /// were added to the cache.
    pub fn get(&self, offset: u64, length: u64) -> Result<Vec<ByteChunk>, CacheError> {
        Ok(self.scan_get(offset, length, false)?.chunks)
    }

    /// Like [`get`](Self::get), and also compute the flush-eligible extent
    /// containing the range.
    ///
    /// The extent covers every map entry overlapping the request, grown
    /// left and right through adjacent entries that are dirty and not being
    /// flushed. A gap or any other entry stops growth in that direction.
    pub fn getx(&self, offset: u64, length: u64) -> Result<CacheExtent, CacheError> {
        self.scan_get(offset, length, true)
    }

    fn scan_get(&self, offset: u64, length: u64, want_extent: bool) -> Result<CacheExtent, CacheError> {
        let max_chunk_size: u64 = self.context.config().max_chunk_size;
        assert!(length > 0, "zero-length get at offset {}", offset);
        assert!(
            length <= max_chunk_size,
            "get length {} exceeds max chunk size {}",
            length,
            max_chunk_size
        );
        assert!(
            offset.checked_add(length).is_some_and(|end| end <= MAX_FILE_SIZE),
            "get [{}, +{}) beyond max file size",
            offset,
            length
        );

        self.inline_prune();

        let end: u64 = offset + length;
        let mut map = self.chunkmap.lock();

        if self.invalidate_pending.swap(false, Ordering::AcqRel) {
            let released: u64 = self.clear_map(&mut map);
            tracing::debug!("Cache {}: applied pending invalidate, released {} bytes", self.id, released);
        }

        let mut chunks: Vec<ByteChunk> = Vec::new();
        let mut inserted: Vec<u64> = Vec::new();

        let filled: Result<(), CacheError> = self
            .fill_range(&mut map, offset, end, &mut chunks, &mut inserted)
            .and_then(|()| chunks.iter().try_for_each(|bc| bc.membuf().load().map(|_| ())));

        if let Err(e) = filled {
            tracing::error!(
                "Cache {}: get [{}, {}) failed, rolling back {} new chunks: {}",
                self.id,
                offset,
                end,
                inserted.len(),
                e
            );
            for key in inserted {
                self.remove_entry(&mut map, key);
            }
            return Err(e);
        }

        for bc in &chunks {
            bc.membuf().set_inuse();
        }

        let (extent_left, extent_right) = if want_extent {
            Self::compute_extent(&map, offset, end)
        } else {
            (offset, end)
        };
        drop(map);

        tracing::trace!(
            "Cache {}: get [{}, {}) -> {} chunks ({} new), extent [{}, {})",
            self.id,
            offset,
            end,
            chunks.len(),
            chunks.iter().filter(|bc| bc.is_new()).count(),
            extent_left,
            extent_right
        );

        Ok(CacheExtent {
            chunks,
            extent_left,
            extent_right,
        })
    }

    /// Walk `[offset, end)`, collecting views of existing entries and
    /// allocating new entries for the gaps.
    fn fill_range(
        &self,
        map: &mut ChunkMap,
        offset: u64,
        end: u64,
        chunks: &mut Vec<ByteChunk>,
        inserted: &mut Vec<u64>,
    ) -> Result<(), CacheError> {
        let existing: Vec<ByteChunk> = Self::overlapping(map, offset, end).cloned().collect();
        let mut next: u64 = offset;

        for bc in existing {
            if bc.offset() > next {
                let gap: ByteChunk = self.allocate_chunk(map, next, bc.offset() - next)?;
                inserted.push(gap.offset());
                chunks.push(gap);
                next = bc.offset();
            }

            let view_end: u64 = bc.end().min(end);
            chunks.push(bc.view(next, view_end - next));
            next = view_end;
        }

        if next < end {
            let gap: ByteChunk = self.allocate_chunk(map, next, end - next)?;
            inserted.push(gap.offset());
            chunks.push(gap);
        }

        Ok(())
    }

    /// Allocate a buffer for `[offset, offset+length)` and add it to the map.
    ///
    /// # Returns
    /// The new chunk as handed to the caller (`is_new` set).
    fn allocate_chunk(&self, map: &mut ChunkMap, offset: u64, length: u64) -> Result<ByteChunk, CacheError> {
        let membuf: Arc<MemoryBuffer> = Arc::new(MemoryBuffer::new(
            offset,
            length,
            self.storage.clone(),
            Arc::downgrade(&self.counters),
        )?);

        self.insert_entry(map, ByteChunk::whole(membuf.clone(), false));
        tracing::trace!("Cache {}: new chunk [{}, {})", self.id, offset, offset + length);

        Ok(ByteChunk::whole(membuf, true))
    }

    fn compute_extent(map: &ChunkMap, offset: u64, end: u64) -> (u64, u64) {
        let mut left: u64 = offset;
        let mut right: u64 = end;

        for bc in Self::overlapping(map, offset, end) {
            left = left.min(bc.offset());
            right = right.max(bc.end());
        }

        while let Some((_, bc)) = map.range(..left).next_back() {
            if bc.end() != left || !bc.needs_flush() {
                break;
            }
            left = bc.offset();
        }

        while let Some((_, bc)) = map.range(right..).next() {
            if bc.offset() != right || !bc.needs_flush() {
                break;
            }
            right = bc.end();
        }

        (left, right)
    }

    // ========================================================================
    // Release
    // ========================================================================

    /// Release cached data in `[offset, offset+length)`.
    ///
    /// Chunks whose buffer is in use, locked or dirty are kept. Fully covered
    /// chunks are removed; chunks overlapping one edge of the range are
    /// trimmed; a range strictly inside one chunk is skipped. Uncached ranges
    /// are ignored.
    ///
    /// # Returns
    /// Number of bytes removed from the cache.
    pub fn release(&self, offset: u64, length: u64) -> u64 {
        assert!(length > 0, "zero-length release at offset {}", offset);

        let end: u64 = offset.saturating_add(length);
        let mut map = self.chunkmap.lock();

        let keys: Vec<u64> = Self::overlapping(&map, offset, end).map(|bc| bc.offset()).collect();
        let mut released: u64 = 0;

        for key in keys {
            let Some(bc) = map.get(&key) else {
                continue;
            };
            if !bc.safe_to_release() {
                tracing::trace!("Cache {}: release skipping busy {:?}", self.id, bc);
                continue;
            }

            let (chunk_start, chunk_end) = (bc.offset(), bc.end());

            if offset <= chunk_start && end >= chunk_end {
                self.remove_entry(&mut map, key);
                released += chunk_end - chunk_start;
            } else if offset <= chunk_start {
                let n: u64 = end - chunk_start;
                if let Some(mut bc) = self.remove_entry(&mut map, key) {
                    bc.trim_left(n);
                    self.insert_entry(&mut map, bc);
                    released += n;
                }
            } else if end >= chunk_end {
                let n: u64 = chunk_end - offset;
                if let Some(bc) = map.get_mut(&key) {
                    bc.trim_right(n);
                    self.counters.sub(Counter::Cached, n);
                    released += n;
                }
            } else {
                tracing::trace!(
                    "Cache {}: release [{}, {}) inside [{}, {}), not splitting",
                    self.id,
                    offset,
                    end,
                    chunk_start,
                    chunk_end
                );
            }
        }

        tracing::trace!("Cache {}: release [{}, {}) freed {} bytes", self.id, offset, end, released);
        released
    }

    /// Release every releasable chunk.
    ///
    /// A file-backed cache left with no chunks also deletes its scratch
    /// file.
    ///
    /// # Returns
    /// Number of bytes removed from the cache.
    pub fn clear(&self) -> u64 {
        let mut map = self.chunkmap.lock();
        self.clear_map(&mut map)
    }

    fn clear_map(&self, map: &mut ChunkMap) -> u64 {
        let keys: Vec<u64> = map
            .iter()
            .filter(|(_, bc)| bc.safe_to_release())
            .map(|(key, _)| *key)
            .collect();

        let mut released: u64 = 0;
        for key in keys {
            if let Some(bc) = self.remove_entry(map, key) {
                released += bc.length();
            }
        }

        if map.is_empty() && self.storage.is_file_backed() {
            if let Err(e) = self.storage.remove() {
                tracing::warn!("Cache {}: failed to remove backing file: {}", self.id, e);
            }
        }

        tracing::debug!(
            "Cache {}: cleared {} bytes, {} chunks remain",
            self.id,
            released,
            map.len()
        );
        released
    }

    /// Schedule a whole-cache invalidation.
    ///
    /// The next `get()`/`getx()` clears the cache (same rules as `clear()`)
    /// before serving its request.
    pub fn invalidate(&self) {
        self.invalidate_pending.store(true, Ordering::Release);
    }

    /// Release the memory of file-backed buffers lying entirely within
    /// `[offset, offset+length)`.
    ///
    /// The data stays in the scratch file and is mapped again by the next
    /// `get()` that returns it. Buffers in use or locked are skipped. No-op
    /// for heap-backed caches.
    ///
    /// # Returns
    /// Number of bytes of memory released.
    pub fn drop(&self, offset: u64, length: u64) -> u64 {
        if !self.storage.is_file_backed() {
            return 0;
        }

        let end: u64 = offset.saturating_add(length);
        let map = self.chunkmap.lock();

        let mut dropped: u64 = 0;
        for bc in Self::overlapping(&map, offset, end) {
            let membuf: &Arc<MemoryBuffer> = bc.membuf();
            if membuf.offset() < offset || membuf.end() > end {
                continue;
            }
            if membuf.is_inuse() || membuf.is_locked() {
                continue;
            }
            dropped += membuf.drop_memory();
        }

        tracing::debug!("Cache {}: dropped {} bytes in [{}, {})", self.id, dropped, offset, end);
        dropped
    }

    /// [`drop`](Self::drop) over the whole file.
    pub fn dropall(&self) -> u64 {
        self.drop(0, u64::MAX)
    }

    // ========================================================================
    // Flush support
    // ========================================================================

    /// Get map chunks overlapping `[start, end)` whose buffer is dirty and
    /// not being flushed.
    ///
    /// Each returned chunk's buffer is marked in use.
    pub fn get_dirty_bc_range(&self, start: u64, end: u64) -> Result<Vec<ByteChunk>, CacheError> {
        self.collect_range(start, end, ByteChunk::needs_flush)
    }

    /// Get map chunks overlapping `[start, end)` whose buffer has a write in
    /// flight.
    ///
    /// Each returned chunk's buffer is marked in use.
    pub fn get_flushing_bc_range(&self, start: u64, end: u64) -> Result<Vec<ByteChunk>, CacheError> {
        self.collect_range(start, end, |bc| bc.membuf().is_flushing())
    }

    fn collect_range<F>(&self, start: u64, end: u64, pred: F) -> Result<Vec<ByteChunk>, CacheError>
    where
        F: Fn(&ByteChunk) -> bool,
    {
        if start >= end {
            return Ok(Vec::new());
        }

        let map = self.chunkmap.lock();
        let chunks: Vec<ByteChunk> = Self::overlapping(&map, start, end)
            .filter(|&bc| pred(bc))
            .cloned()
            .collect();

        for bc in &chunks {
            bc.membuf().load()?;
        }
        for bc in &chunks {
            bc.membuf().set_inuse();
        }
        Ok(chunks)
    }

    /// Dirty bytes without a write in flight.
    pub fn get_bytes_to_flush(&self) -> u64 {
        self.counters.local().snapshot().bytes_to_flush()
    }

    /// Size beyond which a writer should flush its accumulated dirty extent.
    pub fn max_dirty_extent_bytes(&self) -> u64 {
        let config = self.context.config();
        (config.max_cache_bytes() * 60 / 100).min(10 * config.max_chunk_size)
    }

    // ========================================================================
    // Pruning
    // ========================================================================

    /// Compute this cache's share of the global eviction targets.
    ///
    /// Global overage above a threshold is split across caches in
    /// proportion to their allocated bytes, with a floor of 1MB.
    pub fn get_prune_goals(&self) -> PruneGoals {
        let max_bytes: u64 = self.context.config().max_cache_bytes();
        let total: u64 = self.counters.global().get(Counter::Allocated);
        let local: u64 = self.counters.local().get(Counter::Allocated);

        let percent = |pct: u64| -> u64 { (max_bytes as u128 * pct as u128 / 100) as u64 };

        let goal = |start_pct: u64, target_pct: u64| -> u64 {
            if total == 0 || total <= percent(start_pct) {
                return 0;
            }
            let overage: u64 = total - percent(target_pct);
            let share: u128 = overage as u128 * local as u128 / total as u128;
            (share as u64).max(MIN_PRUNE_BYTES)
        };

        PruneGoals {
            inline_bytes: goal(INLINE_PRUNE_START_PCT, INLINE_PRUNE_TARGET_PCT),
            periodic_bytes: goal(PERIODIC_PRUNE_START_PCT, PERIODIC_PRUNE_TARGET_PCT),
        }
    }

    /// Prune under severe memory pressure. Called by `get()`.
    ///
    /// # Returns
    /// Bytes of buffer memory released.
    pub fn inline_prune(&self) -> u64 {
        let goals: PruneGoals = self.get_prune_goals();
        if goals.inline_bytes == 0 {
            return 0;
        }
        self.prune(goals.inline_bytes)
    }

    /// Prune under moderate memory pressure. Meant for a periodic sweep,
    /// see [`CacheContext::periodic_prune`].
    ///
    /// # Returns
    /// Bytes of buffer memory released.
    pub fn periodic_prune(&self) -> u64 {
        let goals: PruneGoals = self.get_prune_goals();
        if goals.periodic_bytes == 0 {
            return 0;
        }
        self.prune(goals.periodic_bytes)
    }

    /// Evict releasable chunks outside the readahead window, in offset
    /// order, until `goal` bytes of memory are released.
    pub(crate) fn prune(&self, goal: u64) -> u64 {
        let window: Option<Arc<dyn ReadaheadWindow>> =
            self.ra_window.read().as_ref().and_then(Weak::upgrade);

        let mut map = self.chunkmap.lock();
        let mut victims: Vec<u64> = Vec::new();
        let mut freed: u64 = 0;

        for (key, bc) in map.iter() {
            if freed >= goal {
                break;
            }
            if !bc.safe_to_release() {
                continue;
            }
            if window.as_ref().is_some_and(|w| w.in_ra_window(bc.offset(), bc.length())) {
                continue;
            }
            victims.push(*key);
            if bc.membuf().is_loaded() {
                freed += bc.membuf().length();
            }
        }

        for key in &victims {
            self.remove_entry(&mut map, *key);
        }
        drop(map);

        let max_bytes: u64 = self.context.config().max_cache_bytes();
        tracing::debug!(
            "Cache {}: pruned {} chunks, {} bytes (goal {}), global utilization {:.1}%",
            self.id,
            victims.len(),
            freed,
            goal,
            self.context.stats().utilization(max_bytes)
        );
        freed
    }

    // ========================================================================
    // Introspection
    // ========================================================================

    /// Snapshot of this cache's counters.
    pub fn stats(&self) -> CacheStats {
        self.counters.local().snapshot()
    }

    /// Number of chunk map entries.
    pub fn num_chunks(&self) -> usize {
        self.chunkmap.lock().len()
    }

    /// Ranges currently in the chunk map, in offset order.
    pub fn cached_ranges(&self) -> Vec<Range<u64>> {
        self.chunkmap
            .lock()
            .values()
            .map(|bc| bc.offset()..bc.end())
            .collect()
    }
}

impl Drop for ChunkCache {
    fn drop(&mut self) {
        self.context.unregister(self.id);
        tracing::debug!("Destroyed chunk cache {}", self.id);
    }
}

impl fmt::Debug for ChunkCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChunkCache")
            .field("id", &self.id)
            .field("storage", &self.storage)
            .field("num_chunks", &self.num_chunks())
            .field("stats", &self.stats())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheConfig;

    fn test_cache() -> Arc<ChunkCache> {
        let context: Arc<CacheContext> = CacheContext::new(CacheConfig::default()).unwrap();
        ChunkCache::new(&context).unwrap()
    }

    fn put(chunks: Vec<ByteChunk>) {
        for bc in chunks {
            bc.membuf().clear_inuse();
        }
    }

    fn ranges(chunks: &[ByteChunk]) -> Vec<(u64, u64, bool)> {
        chunks.iter().map(|bc| (bc.offset(), bc.end(), bc.is_new())).collect()
    }

    #[test]
    fn test_get_empty_allocates_one_chunk() {
        let cache = test_cache();
        let chunks = cache.get(0, 300).unwrap();
        assert_eq!(ranges(&chunks), vec![(0, 300, true)]);
        assert!(chunks[0].is_whole());
        assert!(chunks[0].membuf().is_inuse());
        assert_eq!(cache.stats().bytes_cached, 300);
        assert_eq!(cache.stats().num_chunks, 1);
        put(chunks);
        assert_eq!(cache.stats().bytes_inuse, 0);
    }

    #[test]
    fn test_get_fills_gaps_between_entries() {
        let cache = test_cache();
        put(cache.get(100, 100).unwrap());
        put(cache.get(300, 100).unwrap());

        let chunks = cache.get(50, 400).unwrap();
        assert_eq!(
            ranges(&chunks),
            vec![
                (50, 100, true),
                (100, 200, false),
                (200, 300, true),
                (300, 400, false),
                (400, 450, true),
            ]
        );
        put(chunks);
        assert_eq!(cache.cached_ranges(), vec![50..100, 100..200, 200..300, 300..400, 400..450]);
    }

    #[test]
    fn test_get_inside_existing_chunk() {
        let cache = test_cache();
        let first = cache.get(0, 100).unwrap();
        let buf = first[0].membuf().clone();
        put(first);

        let chunks = cache.get(20, 30).unwrap();
        assert_eq!(ranges(&chunks), vec![(20, 50, false)]);
        assert_eq!(chunks[0].buffer_offset(), 20);
        assert!(!chunks[0].is_whole());
        assert!(Arc::ptr_eq(chunks[0].membuf(), &buf));
        put(chunks);
    }

    #[test]
    #[should_panic(expected = "exceeds max chunk size")]
    fn test_get_oversized_panics() {
        let cache = test_cache();
        let _ = cache.get(0, cache.context().config().max_chunk_size + 1);
    }

    #[test]
    fn test_release_edges_and_middle() {
        let cache = test_cache();
        put(cache.get(0, 300).unwrap());

        // Middle of a chunk: skipped.
        assert_eq!(cache.release(100, 100), 0);
        assert_eq!(cache.cached_ranges(), vec![0..300]);

        assert_eq!(cache.release(0, 100), 100);
        assert_eq!(cache.release(200, 100), 100);
        assert_eq!(cache.cached_ranges(), vec![100..200]);
        assert_eq!(cache.stats().bytes_cached, 100);
        assert_eq!(cache.stats().bytes_allocated, 300);

        assert_eq!(cache.release(100, 100), 100);
        assert_eq!(cache.num_chunks(), 0);
        assert_eq!(cache.stats().bytes_allocated, 0);
    }

    #[test]
    fn test_release_uncached_range() {
        let cache = test_cache();
        put(cache.get(0, 100).unwrap());
        assert_eq!(cache.release(500, 100), 0);
        assert_eq!(cache.cached_ranges(), vec![0..100]);
    }

    #[test]
    fn test_release_skips_inuse() {
        let cache = test_cache();
        let held = cache.get(0, 100).unwrap();
        assert_eq!(cache.release(0, 100), 0);
        put(held);
        assert_eq!(cache.release(0, 100), 100);
    }

    #[test]
    fn test_extent_grows_through_dirty_neighbours() {
        let cache = test_cache();

        let x = cache.getx(0, 100).unwrap();
        assert_eq!((x.extent_left, x.extent_right), (0, 100));
        let mb = x.chunks[0].membuf().clone();
        mb.set_locked();
        mb.set_uptodate();
        mb.set_dirty();
        mb.clear_locked();
        put(x.chunks);

        let x = cache.getx(100, 100).unwrap();
        assert_eq!((x.extent_left, x.extent_right), (0, 200));
        put(x.chunks);

        // Clean neighbour stops growth.
        let x = cache.getx(250, 50).unwrap();
        assert_eq!((x.extent_left, x.extent_right), (250, 300));
        put(x.chunks);

        // Flushing neighbour stops growth too.
        mb.set_inuse();
        mb.set_locked();
        mb.set_flushing();
        let x = cache.getx(100, 50).unwrap();
        assert_eq!((x.extent_left, x.extent_right), (100, 200));
        put(x.chunks);

        mb.clear_dirty();
        mb.clear_flushing();
        mb.clear_locked();
        mb.clear_inuse();
    }

    #[test]
    fn test_dirty_and_flushing_ranges() {
        let cache = test_cache();
        let chunks = cache.get(0, 300).unwrap();
        put(chunks);
        put(cache.get(300, 100).unwrap());

        let x = cache.get(0, 300).unwrap();
        let mb = x[0].membuf().clone();
        mb.set_locked();
        mb.set_uptodate();
        mb.set_dirty();
        mb.clear_locked();
        put(x);

        assert_eq!(cache.get_bytes_to_flush(), 300);

        let dirty = cache.get_dirty_bc_range(0, 1000).unwrap();
        assert_eq!(dirty.len(), 1);
        assert_eq!((dirty[0].offset(), dirty[0].end()), (0, 300));
        assert!(cache.get_flushing_bc_range(0, 1000).unwrap().is_empty());

        mb.set_locked();
        mb.set_flushing();
        assert_eq!(cache.get_bytes_to_flush(), 0);
        assert!(cache.get_dirty_bc_range(0, 1000).unwrap().is_empty());
        let flushing = cache.get_flushing_bc_range(100, 200).unwrap();
        assert_eq!(flushing.len(), 1);
        put(flushing);

        mb.clear_dirty();
        mb.clear_flushing();
        mb.clear_locked();
        put(dirty);
    }

    #[test]
    fn test_max_dirty_extent_bytes() {
        let cache = test_cache();
        // 4GB budget: 60% is far above 10 x 16MB.
        assert_eq!(cache.max_dirty_extent_bytes(), 160 * MIB);

        let context = CacheContext::new(CacheConfig::with_max_cache_size_mb(100)).unwrap();
        let small = ChunkCache::new(&context).unwrap();
        assert_eq!(small.max_dirty_extent_bytes(), 60 * MIB);
    }

    #[test]
    fn test_invalidate_applied_on_next_get() {
        let cache = test_cache();
        put(cache.get(0, 100).unwrap());
        put(cache.get(200, 100).unwrap());

        cache.invalidate();
        assert_eq!(cache.num_chunks(), 2);

        let chunks = cache.get(0, 50).unwrap();
        assert_eq!(ranges(&chunks), vec![(0, 50, true)]);
        assert_eq!(cache.cached_ranges(), vec![0..50]);
        put(chunks);
    }

    #[test]
    fn test_clear_keeps_busy_chunks() {
        let cache = test_cache();
        put(cache.get(0, 100).unwrap());
        let held = cache.get(100, 100).unwrap();
        put(cache.get(200, 100).unwrap());

        assert_eq!(cache.clear(), 200);
        assert_eq!(cache.cached_ranges(), vec![100..200]);
        put(held);
        assert_eq!(cache.clear(), 100);
    }

    #[test]
    fn test_drop_is_noop_for_heap() {
        let cache = test_cache();
        put(cache.get(0, 100).unwrap());
        assert_eq!(cache.dropall(), 0);
        assert_eq!(cache.stats().bytes_allocated, 100);
    }

    #[test]
    fn test_no_prune_goals_when_idle() {
        let cache = test_cache();
        put(cache.get(0, 100).unwrap());
        assert_eq!(cache.get_prune_goals(), PruneGoals::default());
        assert_eq!(cache.inline_prune(), 0);
        assert_eq!(cache.periodic_prune(), 0);
    }
}
