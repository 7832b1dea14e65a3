//! Decoded-block cache with LRU eviction and pinning

use std::collections::{BTreeMap, HashMap};
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::codec::DecodedBlock;

/// A key in the block cache: storage column plus block index
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct BlockCacheKey {
    /// Storage column (one per segment data file)
    pub column: u64,
    /// Block index within the storage column
    pub block: usize,
}

/// Cache counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Lookups served from memory
    pub hits: u64,
    /// Lookups that had to read and decode
    pub misses: u64,
    /// Entries dropped to stay within budget
    pub evictions: u64,
    /// Decoded bytes currently held
    pub bytes: usize,
    /// Entries currently held
    pub entries: usize,
}

struct Entry {
    block: Arc<DecodedBlock>,
    size: usize,
    last_used: u64,
    pins: usize,
}

#[derive(Default)]
struct Inner {
    entries: HashMap<BlockCacheKey, Entry>,
    /// last_used tick -> key, oldest first
    lru: BTreeMap<u64, BlockCacheKey>,
    tick: u64,
    used: usize,
}

impl Inner {
    fn touch(&mut self, key: BlockCacheKey) {
        self.tick += 1;
        let tick = self.tick;
        if let Some(entry) = self.entries.get_mut(&key) {
            self.lru.remove(&entry.last_used);
            entry.last_used = tick;
            self.lru.insert(tick, key);
        }
    }

    fn remove(&mut self, key: &BlockCacheKey) -> Option<Entry> {
        let entry = self.entries.remove(key)?;
        self.lru.remove(&entry.last_used);
        self.used -= entry.size;
        Some(entry)
    }
}

/// Bounded cache of decoded blocks.
///
/// Blocks handed out as [`PinnedBlock`] are never evicted while the guard
/// lives. The budget is soft: when every resident block is pinned the cache
/// grows past it until pins are released.
pub struct BlockCache {
    budget: usize,
    inner: Mutex<Inner>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl std::fmt::Debug for BlockCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockCache")
            .field("budget", &self.budget)
            .field("stats", &self.stats())
            .finish()
    }
}

impl BlockCache {
    /// Create a cache holding at most `budget` decoded bytes
    pub fn new(budget: usize) -> Arc<Self> {
        Arc::new(Self {
            budget,
            inner: Mutex::new(Inner::default()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        })
    }

    /// Look up and pin a block
    pub fn get(self: &Arc<Self>, key: BlockCacheKey) -> Option<PinnedBlock> {
        let mut inner = self.inner.lock();
        let block = match inner.entries.get_mut(&key) {
            Some(entry) => {
                entry.pins += 1;
                Arc::clone(&entry.block)
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        };
        inner.touch(key);
        self.hits.fetch_add(1, Ordering::Relaxed);
        Some(PinnedBlock {
            cache: Arc::clone(self),
            key,
            block,
        })
    }

    /// Insert a freshly decoded block and return it pinned. If another
    /// reader inserted the same block first, that copy is returned.
    pub fn insert(self: &Arc<Self>, key: BlockCacheKey, block: DecodedBlock) -> PinnedBlock {
        let size = block.memory_size();
        let mut inner = self.inner.lock();

        let block = if let Some(entry) = inner.entries.get_mut(&key) {
            entry.pins += 1;
            Arc::clone(&entry.block)
        } else {
            let block = Arc::new(block);
            inner.tick += 1;
            let tick = inner.tick;
            inner.entries.insert(
                key,
                Entry {
                    block: Arc::clone(&block),
                    size,
                    last_used: tick,
                    pins: 1,
                },
            );
            inner.lru.insert(tick, key);
            inner.used += size;
            block
        };
        inner.touch(key);
        self.evict(&mut inner);

        PinnedBlock {
            cache: Arc::clone(self),
            key,
            block,
        }
    }

    fn evict(&self, inner: &mut Inner) {
        if inner.used <= self.budget {
            return;
        }
        let victims: Vec<BlockCacheKey> = {
            let mut over = inner.used - self.budget;
            let mut victims = Vec::new();
            for key in inner.lru.values() {
                if over == 0 {
                    break;
                }
                let entry = &inner.entries[key];
                if entry.pins == 0 {
                    over = over.saturating_sub(entry.size);
                    victims.push(*key);
                }
            }
            victims
        };
        for key in victims {
            inner.remove(&key);
            self.evictions.fetch_add(1, Ordering::Relaxed);
            debug!(column = key.column, block = key.block, "evicted block");
        }
    }

    fn unpin(&self, key: BlockCacheKey) {
        let mut inner = self.inner.lock();
        if let Some(entry) = inner.entries.get_mut(&key) {
            entry.pins = entry.pins.saturating_sub(1);
        }
        self.evict(&mut inner);
    }

    /// Drop every cached block of a storage column
    pub fn invalidate_column(&self, column: u64) {
        let mut inner = self.inner.lock();
        let keys: Vec<BlockCacheKey> = inner
            .entries
            .keys()
            .filter(|k| k.column == column)
            .copied()
            .collect();
        for key in &keys {
            inner.remove(key);
        }
        if !keys.is_empty() {
            debug!(column, blocks = keys.len(), "invalidated cached blocks");
        }
    }

    /// Check if a block is resident
    pub fn contains(&self, key: &BlockCacheKey) -> bool {
        self.inner.lock().entries.contains_key(key)
    }

    /// Current counters
    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock();
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            bytes: inner.used,
            entries: inner.entries.len(),
        }
    }
}

/// A decoded block that cannot be evicted while this guard is alive
pub struct PinnedBlock {
    cache: Arc<BlockCache>,
    key: BlockCacheKey,
    block: Arc<DecodedBlock>,
}

impl PinnedBlock {
    /// Cache key of this block
    pub fn key(&self) -> BlockCacheKey {
        self.key
    }
}

impl Deref for PinnedBlock {
    type Target = DecodedBlock;

    fn deref(&self) -> &DecodedBlock {
        &self.block
    }
}

impl Drop for PinnedBlock {
    fn drop(&mut self) {
        self.cache.unpin(self.key);
    }
}

impl std::fmt::Debug for PinnedBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PinnedBlock")
            .field("key", &self.key)
            .field("len", &self.block.values.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Encoding;
    use crate::value::{DataType, Value};

    fn block(n: i64) -> DecodedBlock {
        DecodedBlock {
            data_type: DataType::Integer,
            encoding: Encoding::Plain,
            values: (0..n).map(Value::Integer).collect(),
        }
    }

    fn key(block: usize) -> BlockCacheKey {
        BlockCacheKey { column: 1, block }
    }

    #[test]
    fn test_hit_miss_and_lru_eviction() {
        let one = block(10).memory_size();
        let cache = BlockCache::new(one * 2);

        assert!(cache.get(key(0)).is_none());
        drop(cache.insert(key(0), block(10)));
        drop(cache.insert(key(1), block(10)));
        // touch 0 so that 1 becomes least recently used
        drop(cache.get(key(0)).unwrap());
        drop(cache.insert(key(2), block(10)));

        assert!(cache.contains(&key(0)));
        assert!(!cache.contains(&key(1)));
        assert!(cache.contains(&key(2)));

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.evictions, 1);
        assert_eq!(stats.entries, 2);
    }

    #[test]
    fn test_pinned_blocks_survive_eviction() {
        let one = block(10).memory_size();
        let cache = BlockCache::new(one);

        let pinned = cache.insert(key(0), block(10));
        drop(cache.insert(key(1), block(10)));

        // 0 is pinned, so 1 was the only candidate
        assert!(cache.contains(&key(0)));
        assert!(!cache.contains(&key(1)));
        assert_eq!(pinned.values.len(), 10);

        let other = cache.insert(key(2), block(10));
        assert!(cache.contains(&key(0)));
        assert!(cache.contains(&key(2)));
        assert!(cache.stats().bytes > one);

        drop(pinned);
        assert!(!cache.contains(&key(0)));
        drop(other);
        assert!(cache.stats().bytes <= one);
    }

    #[test]
    fn test_invalidate_column() {
        let cache = BlockCache::new(usize::MAX);
        drop(cache.insert(key(0), block(1)));
        drop(cache.insert(BlockCacheKey { column: 2, block: 0 }, block(1)));
        cache.invalidate_column(1);
        assert_eq!(cache.stats().entries, 1);
        assert_eq!(cache.stats().bytes, block(1).memory_size());
    }
}
