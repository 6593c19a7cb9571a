//! Client-side byte-range cache for a network filesystem.
//!
//! Each open file gets a [`ChunkCache`] mapping byte ranges to shared
//! [`MemoryBuffer`]s, plus an optional [`ReadaheadState`] that detects
//! sequential reads and prefetches into the same cache. All caches of a
//! mount share one [`CacheContext`] holding the configuration, the global
//! byte counters and the memory budget.
//!
//! # Architecture
//!
//! ```text
//! Layer 3: ReadaheadState (pattern detection, BackendRead seam)
//! Layer 2: ChunkCache (get/getx/release/clear/drop, pruning)
//! Layer 1: MemoryBuffer + ByteChunk (state machine, views)
//! Layer 0: BufferStorage (heap or mmap scratch file), counters, context
//! ```
//!
//! # Example
//!
//! ```ignore
//! use rusty_nfs_cache::{CacheConfig, CacheContext, ChunkCache};
//!
//! let context = CacheContext::new(CacheConfig::default())?;
//! let cache = ChunkCache::new(&context)?;
//!
//! for chunk in cache.get(0, 4096)? {
//!     let membuf = chunk.membuf().clone();
//!     membuf.set_locked();
//!     if chunk.is_new() {
//!         // fill from the backend, then:
//!         membuf.set_uptodate();
//!     }
//!     membuf.clear_locked();
//!     membuf.clear_inuse();
//! }
//! ```

pub mod chunk;
pub mod chunk_cache;
pub mod config;
pub mod context;
pub mod error;
pub mod membuf;
pub mod readahead;
pub mod stats;
pub mod storage;

pub use chunk::ByteChunk;
pub use chunk_cache::{CacheExtent, ChunkCache, PruneGoals, ReadaheadWindow};
pub use config::{CacheConfig, MAX_CHUNK_SIZE, MAX_FILE_SIZE};
pub use context::CacheContext;
pub use error::CacheError;
pub use membuf::{BufferFlags, MemoryBuffer};
pub use readahead::{BackendRead, ReadaheadRequest, ReadaheadState};
pub use stats::{ByteCounters, CacheStats};
pub use storage::{BufferStorage, FileStorage, HeapStorage, Region};
