//! Block manager: append-only block files behind a shared cache and a
//! bounded handle pool

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use super::cache::{BlockCache, BlockCacheKey, CacheStats, PinnedBlock};
use super::handle_pool::HandlePool;
use crate::codec::{self, EncodedBlock};
use crate::config::StorageConfig;
use crate::error::{Error, Result};
use crate::io::{FileSystem, OpenMode};

/// Where a block lives inside its data file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockLocation {
    /// Byte offset of the block header
    pub offset: u64,
    /// Header plus payload length
    pub length: u64,
    /// Number of values in the block
    pub num_elements: u64,
}

#[derive(Debug)]
struct ColumnFile {
    path: PathBuf,
    blocks: Vec<BlockLocation>,
    end: u64,
    dirty: bool,
}

/// Serves block reads and writes for every storage column.
///
/// A storage column is one data file holding a sequence of blocks. Reads go
/// through the [`BlockCache`]; file access goes through the [`HandlePool`].
#[derive(Debug)]
pub struct BlockManager {
    pool: Arc<HandlePool>,
    cache: Arc<BlockCache>,
    columns: RwLock<HashMap<u64, ColumnFile>>,
    next_id: AtomicU64,
}

impl BlockManager {
    /// Create a block manager over `fs`
    pub fn new(fs: Arc<dyn FileSystem>, config: &StorageConfig) -> Self {
        Self {
            pool: HandlePool::new(fs, config.max_open_files),
            cache: BlockCache::new(config.cache_budget_bytes),
            columns: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    fn register(&self, file: ColumnFile) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        debug!(column = id, path = %file.path.display(), blocks = file.blocks.len(), "registered storage column");
        self.columns.write().insert(id, file);
        id
    }

    /// Create an empty data file at `path` and register it for writing
    pub fn create_column(&self, path: PathBuf) -> Result<u64> {
        let stream = self.pool.acquire(&path, OpenMode::Write)?;
        let end = stream.size()?;
        drop(stream);
        Ok(self.register(ColumnFile {
            path,
            blocks: Vec::new(),
            end,
            dirty: false,
        }))
    }

    /// Register an existing data file whose block layout is known from an index
    pub fn open_column(&self, path: PathBuf, blocks: Vec<BlockLocation>) -> u64 {
        let end = blocks.last().map(|b| b.offset + b.length).unwrap_or(0);
        self.register(ColumnFile {
            path,
            blocks,
            end,
            dirty: false,
        })
    }

    /// Append a block to a storage column, returning its block id
    pub fn write_block(&self, column: u64, block: &EncodedBlock) -> Result<usize> {
        // each storage column has a single writer, so `end` cannot move
        // between the read below and the update after the write
        let (path, offset) = {
            let columns = self.columns.read();
            let file = columns.get(&column).ok_or_else(|| unknown_column(column))?;
            (file.path.clone(), file.end)
        };
        let stream = self.pool.acquire(&path, OpenMode::Write)?;
        stream.write(offset, &block.bytes)?;
        drop(stream);

        let mut columns = self.columns.write();
        let file = columns.get_mut(&column).ok_or_else(|| unknown_column(column))?;
        file.end += block.len() as u64;
        file.dirty = true;
        file.blocks.push(BlockLocation {
            offset,
            length: block.len() as u64,
            num_elements: block.num_elements() as u64,
        });
        let block_id = file.blocks.len() - 1;
        trace!(column, block = block_id, bytes = block.len(), "wrote block");
        Ok(block_id)
    }

    /// Forget every block of a storage column past the first `keep`. The
    /// next write lands where the first dropped block started.
    pub fn truncate_column(&self, column: u64, keep: usize) -> Result<()> {
        let dropped = {
            let mut columns = self.columns.write();
            let file = columns.get_mut(&column).ok_or_else(|| unknown_column(column))?;
            match file.blocks.get(keep).map(|b| b.offset) {
                Some(end) => {
                    let dropped = file.blocks.len() - keep;
                    file.blocks.truncate(keep);
                    file.end = end;
                    dropped
                }
                None => 0,
            }
        };
        if dropped > 0 {
            self.cache.invalidate_column(column);
            debug!(column, keep, dropped, "truncated storage column");
        }
        Ok(())
    }

    /// Read, verify and decode a block, serving it from cache when possible
    pub fn read_block(&self, column: u64, block: usize) -> Result<PinnedBlock> {
        let key = BlockCacheKey { column, block };
        if let Some(hit) = self.cache.get(key) {
            return Ok(hit);
        }

        let (path, location) = {
            let columns = self.columns.read();
            let file = columns.get(&column).ok_or_else(|| unknown_column(column))?;
            let location = *file.blocks.get(block).ok_or(Error::OutOfRange {
                index: block as u64,
                len: file.blocks.len() as u64,
            })?;
            (file.path.clone(), location)
        };

        let stream = self.pool.acquire(&path, OpenMode::Read)?;
        let bytes = stream.read(location.offset, location.length as usize)?;
        drop(stream);

        let decoded = codec::decode(&bytes).map_err(|e| e.at_block(column, block))?;
        if decoded.values.len() as u64 != location.num_elements {
            return Err(Error::CorruptBlock {
                column,
                block,
                reason: format!(
                    "block holds {} values, index says {}",
                    decoded.values.len(),
                    location.num_elements
                ),
            });
        }
        trace!(column, block, "decoded block");
        Ok(self.cache.insert(key, decoded))
    }

    /// Flush every storage column with unflushed writes
    pub fn flush(&self) -> Result<()> {
        self.pool.flush_all()?;
        for file in self.columns.write().values_mut() {
            file.dirty = false;
        }
        Ok(())
    }

    /// Flush one storage column
    pub fn flush_column(&self, column: u64) -> Result<()> {
        let path = self.column_path(column)?;
        let dirty = self
            .columns
            .read()
            .get(&column)
            .map(|f| f.dirty)
            .unwrap_or(false);
        if dirty {
            self.pool.acquire(&path, OpenMode::Write)?.flush()?;
            if let Some(file) = self.columns.write().get_mut(&column) {
                file.dirty = false;
            }
        }
        // later reads must not see a stale writer handle
        self.pool.close(&path);
        Ok(())
    }

    /// Block layout of a storage column
    pub fn block_locations(&self, column: u64) -> Result<Vec<BlockLocation>> {
        self.columns
            .read()
            .get(&column)
            .map(|f| f.blocks.clone())
            .ok_or_else(|| unknown_column(column))
    }

    /// Data file of a storage column
    pub fn column_path(&self, column: u64) -> Result<PathBuf> {
        self.columns
            .read()
            .get(&column)
            .map(|f| f.path.clone())
            .ok_or_else(|| unknown_column(column))
    }

    /// Drop cached blocks, open handles and the registration of a storage
    /// column. The data file itself is left alone.
    pub fn forget_column(&self, column: u64) {
        self.cache.invalidate_column(column);
        if let Some(file) = self.columns.write().remove(&column) {
            self.pool.close(&file.path);
            debug!(column, path = %file.path.display(), "forgot storage column");
        }
    }

    /// Close any pooled handle on `path`
    pub fn close_path(&self, path: &Path) {
        self.pool.close(path);
    }

    /// Block cache counters
    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    /// Number of open streams
    pub fn open_handles(&self) -> usize {
        self.pool.open_count()
    }
}

fn unknown_column(column: u64) -> Error {
    Error::InvalidArgument(format!("unknown storage column {}", column))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{encode, CodecOptions};
    use crate::io::MemoryFileSystem;
    use crate::value::{DataType, Value};

    fn manager(fs: Arc<MemoryFileSystem>) -> BlockManager {
        let config = StorageConfig {
            max_open_files: 2,
            ..StorageConfig::default()
        };
        BlockManager::new(fs, &config)
    }

    fn ints(range: std::ops::Range<i64>) -> EncodedBlock {
        let values: Vec<Value> = range.map(Value::Integer).collect();
        encode(&values, DataType::Integer, &CodecOptions::default()).unwrap()
    }

    #[test]
    fn test_truncate_rewinds_the_write_position() {
        let fs = Arc::new(MemoryFileSystem::new());
        let bm = manager(fs);
        let col = bm.create_column(PathBuf::from("/s/t.tcol")).unwrap();
        bm.write_block(col, &ints(0..4)).unwrap();
        bm.write_block(col, &ints(4..8)).unwrap();
        let _cached = bm.read_block(col, 1).unwrap();

        bm.truncate_column(col, 1).unwrap();
        assert_eq!(bm.block_locations(col).unwrap().len(), 1);
        assert_eq!(bm.write_block(col, &ints(100..103)).unwrap(), 1);
        let locations = bm.block_locations(col).unwrap();
        assert_eq!(locations[1].offset, locations[0].length);
        assert_eq!(bm.read_block(col, 1).unwrap().values[0], Value::Integer(100));

        // keeping more blocks than exist is a no-op
        bm.truncate_column(col, 5).unwrap();
        assert_eq!(bm.block_locations(col).unwrap().len(), 2);
    }

    #[test]
    fn test_write_then_read_blocks() {
        let fs = Arc::new(MemoryFileSystem::new());
        let bm = manager(fs);
        let col = bm.create_column(PathBuf::from("/s/a.tcol")).unwrap();

        assert_eq!(bm.write_block(col, &ints(0..10)).unwrap(), 0);
        assert_eq!(bm.write_block(col, &ints(10..15)).unwrap(), 1);
        bm.flush_column(col).unwrap();

        let second = bm.read_block(col, 1).unwrap();
        assert_eq!(second.values[0], Value::Integer(10));
        drop(second);
        let _again = bm.read_block(col, 1).unwrap();

        let stats = bm.cache_stats();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits, 1);

        let locations = bm.block_locations(col).unwrap();
        assert_eq!(locations[1].offset, locations[0].length);
        assert!(matches!(
            bm.read_block(col, 2),
            Err(Error::OutOfRange { index: 2, len: 2 })
        ));
    }

    #[test]
    fn test_corrupt_block_reports_location() {
        let fs = Arc::new(MemoryFileSystem::new());
        let bm = manager(fs.clone());
        let path = PathBuf::from("/s/b.tcol");
        let col = bm.create_column(path.clone()).unwrap();
        let block = ints(0..100);
        bm.write_block(col, &block).unwrap();
        bm.flush_column(col).unwrap();

        fs.corrupt_byte(&path, block.len() - 1).unwrap();
        match bm.read_block(col, 0) {
            Err(Error::CorruptBlock { column, block, .. }) => {
                assert_eq!(column, col);
                assert_eq!(block, 0);
            }
            other => panic!("expected corrupt block, got {:?}", other),
        }
    }

    #[test]
    fn test_io_failure_propagates() {
        let fs = Arc::new(MemoryFileSystem::new());
        let bm = manager(fs.clone());
        let col = bm.create_column(PathBuf::from("/s/c.tcol")).unwrap();
        fs.fail_writes(true);
        assert!(matches!(
            bm.write_block(col, &ints(0..3)),
            Err(Error::StorageIo(_))
        ));
        assert!(bm.block_locations(col).unwrap().is_empty());
    }

    #[test]
    fn test_forget_column() {
        let fs = Arc::new(MemoryFileSystem::new());
        let bm = manager(fs);
        let col = bm.create_column(PathBuf::from("/s/d.tcol")).unwrap();
        bm.write_block(col, &ints(0..3)).unwrap();
        drop(bm.read_block(col, 0).unwrap());
        bm.forget_column(col);
        assert_eq!(bm.cache_stats().entries, 0);
        assert!(bm.read_block(col, 0).is_err());
    }
}
