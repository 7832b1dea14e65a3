//! Segments: sealed, immutable runs of a column's values, one data file each

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::codec::{self, CodecOptions};
use crate::error::{Error, Result};
use crate::storage::{BlockLocation, PinnedBlock, StorageRef};
use crate::value::{DataType, Value};

/// A sealed chunk of a column.
///
/// Temporary segments (written by a [`SegmentWriter`]) delete their data
/// file when the last reference drops; segments opened from a saved table
/// leave the file in place.
pub struct Segment {
    storage: StorageRef,
    storage_column: u64,
    path: PathBuf,
    data_type: DataType,
    /// Element offset of every block, plus the total length at the end
    block_starts: Vec<u64>,
    temporary: bool,
}

impl Segment {
    fn new(
        storage: StorageRef,
        storage_column: u64,
        path: PathBuf,
        data_type: DataType,
        blocks: &[BlockLocation],
        temporary: bool,
    ) -> Self {
        let mut block_starts = Vec::with_capacity(blocks.len() + 1);
        let mut start = 0u64;
        block_starts.push(0);
        for block in blocks {
            start += block.num_elements;
            block_starts.push(start);
        }
        Self {
            storage,
            storage_column,
            path,
            data_type,
            block_starts,
            temporary,
        }
    }

    /// Register a persisted segment file with the block manager
    pub fn open(
        storage: &StorageRef,
        path: PathBuf,
        data_type: DataType,
        blocks: Vec<BlockLocation>,
    ) -> Arc<Self> {
        let storage_column = storage.blocks().open_column(path.clone(), blocks.clone());
        Arc::new(Self::new(
            Arc::clone(storage),
            storage_column,
            path,
            data_type,
            &blocks,
            false,
        ))
    }

    /// Number of values
    pub fn len(&self) -> u64 {
        self.block_starts.last().copied().unwrap_or(0)
    }

    /// Check if the segment holds no values
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Declared element type
    pub fn data_type(&self) -> DataType {
        self.data_type
    }

    /// Data file path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Storage column id in the block manager
    pub fn storage_column(&self) -> u64 {
        self.storage_column
    }

    /// Number of blocks
    pub fn num_blocks(&self) -> usize {
        self.block_starts.len() - 1
    }

    /// Whether the data file is deleted on drop
    pub fn is_temporary(&self) -> bool {
        self.temporary
    }

    /// Block layout, as recorded by the block manager
    pub fn blocks(&self) -> Result<Vec<BlockLocation>> {
        self.storage.blocks().block_locations(self.storage_column)
    }

    /// Element offset of `block` within this segment
    pub fn block_start(&self, block: usize) -> u64 {
        self.block_starts[block]
    }

    /// Block holding element `index`, and the offset inside that block
    pub fn locate(&self, index: u64) -> Result<(usize, usize)> {
        if index >= self.len() {
            return Err(Error::OutOfRange {
                index,
                len: self.len(),
            });
        }
        let block = self.block_starts.partition_point(|&start| start <= index) - 1;
        Ok((block, (index - self.block_starts[block]) as usize))
    }

    /// Read one block through the cache
    pub fn read_block(&self, block: usize) -> Result<PinnedBlock> {
        self.storage.blocks().read_block(self.storage_column, block)
    }

    /// Read one value
    pub fn get(&self, index: u64) -> Result<Value> {
        let (block, offset) = self.locate(index)?;
        let pinned = self.read_block(block)?;
        Ok(pinned.values[offset].clone())
    }
}

impl Drop for Segment {
    fn drop(&mut self) {
        self.storage.blocks().forget_column(self.storage_column);
        if self.temporary {
            match self.storage.fs().remove(&self.path) {
                Ok(()) => debug!(path = %self.path.display(), "removed segment file"),
                Err(e) => warn!(path = %self.path.display(), error = %e, "failed to remove segment file"),
            }
        }
    }
}

impl fmt::Debug for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Segment")
            .field("path", &self.path)
            .field("data_type", &self.data_type)
            .field("len", &self.len())
            .field("blocks", &self.num_blocks())
            .field("temporary", &self.temporary)
            .finish()
    }
}

/// Writes exactly one segment. Independent writers can run in parallel;
/// the resulting segments are assembled with `Column::from_segments`.
///
/// Dropping a writer without calling [`SegmentWriter::finish`] deletes the
/// partial data file.
pub struct SegmentWriter {
    storage: StorageRef,
    storage_column: u64,
    path: PathBuf,
    data_type: DataType,
    options: CodecOptions,
    block_size: usize,
    buffer: Vec<Value>,
    written: u64,
    blocks: usize,
    finished: bool,
}

/// Writer state before an append, restored when the append fails
struct AppendMark {
    written: u64,
    blocks: usize,
    buffer_len: usize,
    saved: Option<Vec<Value>>,
}

impl SegmentWriter {
    /// Start a new temporary segment in the scratch directory
    pub fn new(storage: &StorageRef, data_type: DataType) -> Result<Self> {
        let path = storage.new_segment_path();
        let storage_column = storage.blocks().create_column(path.clone())?;
        debug!(path = %path.display(), %data_type, "segment writer opened");
        Ok(Self {
            storage: Arc::clone(storage),
            storage_column,
            path,
            data_type,
            options: storage.codec_options(),
            block_size: storage.config().block_size.max(1),
            buffer: Vec::new(),
            written: 0,
            blocks: 0,
            finished: false,
        })
    }

    /// Declared element type
    pub fn data_type(&self) -> DataType {
        self.data_type
    }

    /// Values appended so far
    pub fn len(&self) -> u64 {
        self.written + self.buffer.len() as u64
    }

    /// Check if nothing was appended
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Check that every value fits the declared type without appending anything
    pub fn validate(&self, values: &[Value]) -> Result<()> {
        match values.iter().find(|v| !self.data_type.accepts(v)) {
            Some(bad) => Err(Error::type_mismatch(&self.data_type, bad.type_name())),
            None => Ok(()),
        }
    }

    /// Append values. Either every value is appended or, on any error,
    /// none is.
    pub fn append(&mut self, values: &[Value]) -> Result<()> {
        self.append_owned(values.to_vec())
    }

    /// Append owned values, avoiding clones
    pub fn append_owned(&mut self, values: Vec<Value>) -> Result<()> {
        self.validate(&values)?;
        let mark = AppendMark {
            written: self.written,
            blocks: self.blocks,
            buffer_len: self.buffer.len(),
            // a block flush clears the buffer, so keep what was there
            saved: (self.buffer.len() + values.len() >= self.block_size).then(|| self.buffer.clone()),
        };
        let result = self.push_all(values);
        if result.is_err() {
            self.rollback(mark);
        }
        result
    }

    fn push_all(&mut self, values: Vec<Value>) -> Result<()> {
        for value in values {
            self.buffer.push(self.data_type.coerce(value)?);
            if self.buffer.len() >= self.block_size {
                self.flush_block()?;
            }
        }
        Ok(())
    }

    fn rollback(&mut self, mark: AppendMark) {
        if self.blocks > mark.blocks {
            if let Err(e) = self.storage.blocks().truncate_column(self.storage_column, mark.blocks) {
                warn!(path = %self.path.display(), error = %e, "failed to drop blocks of a failed append");
            }
            self.blocks = mark.blocks;
        }
        self.written = mark.written;
        match mark.saved {
            Some(saved) => self.buffer = saved,
            None => self.buffer.truncate(mark.buffer_len),
        }
        debug!(path = %self.path.display(), rows = self.len(), "append rolled back");
    }

    fn flush_block(&mut self) -> Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let block = codec::encode(&self.buffer, self.data_type, &self.options)?;
        self.storage.blocks().write_block(self.storage_column, &block)?;
        self.written += self.buffer.len() as u64;
        self.blocks += 1;
        self.buffer.clear();
        Ok(())
    }

    /// Write buffered values, flush the file and seal the segment
    pub fn finish(mut self) -> Result<Arc<Segment>> {
        self.flush_block()?;
        self.storage.blocks().flush_column(self.storage_column)?;
        let blocks = self.storage.blocks().block_locations(self.storage_column)?;
        self.finished = true;
        debug!(path = %self.path.display(), rows = self.written, blocks = blocks.len(), "segment sealed");
        Ok(Arc::new(Segment::new(
            Arc::clone(&self.storage),
            self.storage_column,
            self.path.clone(),
            self.data_type,
            &blocks,
            true,
        )))
    }

    /// Discard everything written so far
    pub fn abort(self) {
        drop(self)
    }
}

impl Drop for SegmentWriter {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        self.storage.blocks().forget_column(self.storage_column);
        if self.storage.fs().exists(&self.path) {
            if let Err(e) = self.storage.fs().remove(&self.path) {
                warn!(path = %self.path.display(), error = %e, "failed to remove aborted segment file");
            }
        }
        debug!(path = %self.path.display(), "segment writer discarded");
    }
}

impl fmt::Debug for SegmentWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SegmentWriter")
            .field("path", &self.path)
            .field("data_type", &self.data_type)
            .field("len", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageConfig;
    use crate::io::MemoryFileSystem;
    use crate::storage::StorageContext;

    fn storage() -> StorageRef {
        StorageContext::in_memory(StorageConfig {
            block_size: 4,
            ..StorageConfig::default()
        })
    }

    #[test]
    fn test_segment_blocks_and_get() {
        let storage = storage();
        let mut writer = SegmentWriter::new(&storage, DataType::Integer).unwrap();
        let values: Vec<Value> = (0..10).map(Value::Integer).collect();
        writer.append(&values).unwrap();
        let segment = writer.finish().unwrap();

        assert_eq!(segment.len(), 10);
        assert_eq!(segment.num_blocks(), 3);
        assert_eq!(segment.locate(9).unwrap(), (2, 1));
        assert_eq!(segment.get(5).unwrap(), Value::Integer(5));
        assert!(matches!(segment.get(10), Err(Error::OutOfRange { index: 10, len: 10 })));
    }

    #[test]
    fn test_rejected_append_leaves_writer_unchanged() {
        let storage = storage();
        let mut writer = SegmentWriter::new(&storage, DataType::Integer).unwrap();
        writer.append(&[Value::Integer(1)]).unwrap();
        let err = writer
            .append(&[Value::Integer(2), Value::from("three")])
            .unwrap_err();
        assert!(matches!(err, Error::TypeMismatch { .. }));
        assert_eq!(writer.len(), 1);
    }

    #[test]
    fn test_failed_flush_rolls_back_the_append() {
        let fs = Arc::new(MemoryFileSystem::new());
        let config = StorageConfig {
            block_size: 4,
            ..StorageConfig::default()
        };
        let storage = StorageContext::with_filesystem(fs.clone(), PathBuf::from("/scratch"), config).unwrap();
        let mut writer = SegmentWriter::new(&storage, DataType::Integer).unwrap();
        writer.append(&[Value::Integer(0), Value::Integer(1)]).unwrap();

        // the first block of the next append is written, the second is not
        fs.fail_writes_after(1);
        let tail: Vec<Value> = (2..12).map(Value::Integer).collect();
        assert!(matches!(writer.append(&tail), Err(Error::StorageIo(_))));
        assert_eq!(writer.len(), 2);
        fs.fail_writes(false);

        writer.append(&tail).unwrap();
        let segment = writer.finish().unwrap();
        assert_eq!(segment.len(), 12);
        assert_eq!(segment.num_blocks(), 3);
        for i in 0..12 {
            assert_eq!(segment.get(i).unwrap(), Value::Integer(i as i64));
        }
    }

    #[test]
    fn test_files_removed_on_drop_and_abort() {
        let storage = storage();
        let mut writer = SegmentWriter::new(&storage, DataType::String).unwrap();
        writer.append(&vec![Value::from("x"); 9]).unwrap();
        assert_eq!(storage.scratch_segment_files().unwrap().len(), 1);
        writer.abort();
        assert!(storage.scratch_segment_files().unwrap().is_empty());

        let mut writer = SegmentWriter::new(&storage, DataType::String).unwrap();
        writer.append(&[Value::from("y")]).unwrap();
        let segment = writer.finish().unwrap();
        let path = segment.path().to_path_buf();
        assert!(storage.fs().exists(&path));
        drop(segment);
        assert!(!storage.fs().exists(&path));
    }
}
