//! Shared state for all chunk caches.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;

use crate::chunk_cache::ChunkCache;
use crate::config::CacheConfig;
use crate::error::CacheError;
use crate::stats::{ByteCounters, CacheStats};

/// Configuration, global byte counters and the registry of live caches.
///
/// One context is shared by every [`ChunkCache`] of a mount. Global counters
/// always equal the sum of the live caches' own counters.
#[derive(Debug)]
pub struct CacheContext {
    /// Validated configuration.
    config: CacheConfig,
    /// Totals across all caches.
    counters: Arc<ByteCounters>,
    /// Live caches by id.
    caches: DashMap<u64, Weak<ChunkCache>>,
    /// Next cache id to hand out.
    next_id: AtomicU64,
}

impl CacheContext {
    /// Create a context.
    ///
    /// # Arguments
    /// * `config` - Cache configuration, validated here
    pub fn new(config: CacheConfig) -> Result<Arc<Self>, CacheError> {
        config.validate()?;

        tracing::debug!(
            "Cache context: max {}MB, chunk {} bytes, readahead {}KB, backing {:?}",
            config.max_cache_size_mb,
            config.max_chunk_size,
            config.readahead_kb,
            config.backing_dir
        );

        Ok(Arc::new(Self {
            config,
            counters: Arc::new(ByteCounters::new()),
            caches: DashMap::new(),
            next_id: AtomicU64::new(1),
        }))
    }

    /// Get the configuration.
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Snapshot of the global counters.
    pub fn stats(&self) -> CacheStats {
        self.counters.snapshot()
    }

    pub(crate) fn counters(&self) -> &Arc<ByteCounters> {
        &self.counters
    }

    pub(crate) fn next_cache_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn register(&self, cache: &Arc<ChunkCache>) {
        self.caches.insert(cache.id(), Arc::downgrade(cache));
    }

    pub(crate) fn unregister(&self, id: u64) {
        self.caches.remove(&id);
    }

    /// Number of live caches.
    pub fn num_caches(&self) -> usize {
        self.caches.len()
    }

    /// Strong references to every live cache.
    pub fn live_caches(&self) -> Vec<Arc<ChunkCache>> {
        self.caches
            .iter()
            .filter_map(|entry| entry.value().upgrade())
            .collect()
    }

    /// Run one periodic pruning pass over all live caches.
    ///
    /// # Returns
    /// Total bytes of buffer memory released.
    pub fn periodic_prune(&self) -> u64 {
        // Collect first: a cache dropped during the pass unregisters itself,
        // which must not happen while the registry is being iterated.
        let caches: Vec<Arc<ChunkCache>> = self.live_caches();

        // Goals are taken before pruning anything, so each cache prunes its
        // share of the same overage.
        let goals: Vec<(Arc<ChunkCache>, u64)> = caches
            .into_iter()
            .map(|cache| {
                let goal: u64 = cache.get_prune_goals().periodic_bytes;
                (cache, goal)
            })
            .filter(|(_, goal)| *goal > 0)
            .collect();

        let pruned: u64 = goals.iter().map(|(cache, goal)| cache.prune(*goal)).sum();
        if pruned > 0 {
            tracing::debug!(
                "Periodic prune released {} bytes across {} caches",
                pruned,
                goals.len()
            );
        }
        pruned
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MIB;

    #[test]
    fn test_invalid_config_rejected() {
        let result = CacheContext::new(CacheConfig::with_max_cache_size_mb(0));
        assert!(matches!(result, Err(CacheError::InvalidConfig(_))));
    }

    #[test]
    fn test_registry_tracks_live_caches() {
        let context = CacheContext::new(CacheConfig::default()).unwrap();
        let a = ChunkCache::new(&context).unwrap();
        let b = ChunkCache::new(&context).unwrap();
        assert_ne!(a.id(), b.id());
        assert_eq!(context.num_caches(), 2);

        drop(a);
        assert_eq!(context.num_caches(), 1);
        assert_eq!(context.live_caches()[0].id(), b.id());
    }

    #[test]
    fn test_global_stats_sum_of_caches() {
        let context = CacheContext::new(CacheConfig::default()).unwrap();
        let a = ChunkCache::new(&context).unwrap();
        let b = ChunkCache::new(&context).unwrap();

        for bc in a.get(0, 1000).unwrap() {
            bc.membuf().clear_inuse();
        }
        for bc in b.get(0, 500).unwrap() {
            bc.membuf().clear_inuse();
        }

        let global: CacheStats = context.stats();
        assert_eq!(global.bytes_allocated, 1500);
        assert_eq!(global.bytes_cached, 1500);
        assert_eq!(global.num_chunks, 2);

        drop(b);
        assert_eq!(context.stats().bytes_allocated, 1000);
        assert_eq!(context.stats(), a.stats());
    }

    #[test]
    fn test_periodic_prune_under_pressure() {
        // 10MB budget, periodic pruning above 6MB down to 5MB.
        let context = CacheContext::new(CacheConfig::with_max_cache_size_mb(10)).unwrap();
        let cache = ChunkCache::new(&context).unwrap();

        for i in 0..7 {
            for bc in cache.get(i * MIB, MIB).unwrap() {
                bc.membuf().clear_inuse();
            }
        }
        assert_eq!(context.stats().bytes_allocated, 7 * MIB);

        // Overage is 2MB and this cache owns all of it.
        assert_eq!(cache.get_prune_goals().periodic_bytes, 2 * MIB);
        assert_eq!(context.periodic_prune(), 2 * MIB);
        assert_eq!(context.stats().bytes_allocated, 5 * MIB);
        assert_eq!(cache.cached_ranges().first(), Some(&(2 * MIB..3 * MIB)));

        assert_eq!(context.periodic_prune(), 0);
    }
}
