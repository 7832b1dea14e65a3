//! Typed, out-of-core columns
//!
//! A [`Column`] is an ordered list of sealed segments. Cloning a column is
//! O(1): clones share the segment list. A column is either open for writing
//! (exactly one [`ColumnWriter`]) or readable, never both.

use std::fmt;
use std::ops::Range;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::segment::{Segment, SegmentWriter};
use crate::storage::{PinnedBlock, StorageRef};
use crate::value::{DataType, Value};

const MODE_IDLE: u8 = 0;
const MODE_WRITING: u8 = 1;
const MODE_SEALED: u8 = 2;

struct ColumnInner {
    storage: StorageRef,
    data_type: DataType,
    mode: AtomicU8,
    segments: RwLock<Vec<Arc<Segment>>>,
    /// Rows in sealed segments plus rows buffered by an open writer
    len: AtomicU64,
}

/// A homogeneously (or dynamically) typed array stored in segments
#[derive(Clone)]
pub struct Column {
    inner: Arc<ColumnInner>,
}

impl Column {
    /// Create an empty column. Call [`Column::open_writer`] to fill it.
    pub fn create(storage: &StorageRef, data_type: DataType) -> Self {
        Self {
            inner: Arc::new(ColumnInner {
                storage: Arc::clone(storage),
                data_type,
                mode: AtomicU8::new(MODE_IDLE),
                segments: RwLock::new(Vec::new()),
                len: AtomicU64::new(0),
            }),
        }
    }

    /// Assemble a sealed column from independently written segments, in order
    pub fn from_segments(
        storage: &StorageRef,
        data_type: DataType,
        segments: Vec<Arc<Segment>>,
    ) -> Result<Self> {
        if let Some(bad) = segments.iter().find(|s| s.data_type() != data_type) {
            return Err(Error::type_mismatch(&data_type, bad.data_type()));
        }
        let len = segments.iter().map(|s| s.len()).sum();
        Ok(Self {
            inner: Arc::new(ColumnInner {
                storage: Arc::clone(storage),
                data_type,
                mode: AtomicU8::new(MODE_SEALED),
                segments: RwLock::new(segments),
                len: AtomicU64::new(len),
            }),
        })
    }

    /// Write `values` into a new sealed single-segment column
    pub fn from_values(storage: &StorageRef, data_type: DataType, values: Vec<Value>) -> Result<Self> {
        let column = Self::create(storage, data_type);
        let mut writer = column.open_writer()?;
        writer.append_owned(values)?;
        writer.close()
    }

    /// Open the single writer of this column.
    ///
    /// Fails with [`Error::WriterBusy`] while another writer is open and with
    /// [`Error::InvalidOperation`] once the column has been sealed.
    pub fn open_writer(&self) -> Result<ColumnWriter> {
        match self.inner.mode.compare_exchange(
            MODE_IDLE,
            MODE_WRITING,
            Ordering::SeqCst,
            Ordering::SeqCst,
        ) {
            Ok(_) => Ok(ColumnWriter {
                column: self.clone(),
                current: None,
                closed: false,
            }),
            Err(MODE_WRITING) => Err(Error::WriterBusy),
            Err(_) => Err(Error::InvalidOperation("column is sealed".into())),
        }
    }

    fn check_readable(&self) -> Result<()> {
        if self.inner.mode.load(Ordering::SeqCst) == MODE_WRITING {
            return Err(Error::InvalidOperation(
                "column is open for writing".into(),
            ));
        }
        Ok(())
    }

    /// Whether a writer is currently open
    pub fn is_writing(&self) -> bool {
        self.inner.mode.load(Ordering::SeqCst) == MODE_WRITING
    }

    /// Whether the column has been sealed
    pub fn is_sealed(&self) -> bool {
        self.inner.mode.load(Ordering::SeqCst) == MODE_SEALED
    }

    /// Declared element type
    pub fn data_type(&self) -> DataType {
        self.inner.data_type
    }

    /// Number of rows
    pub fn len(&self) -> u64 {
        self.inner.len.load(Ordering::SeqCst)
    }

    /// Check if the column has no rows
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of sealed segments
    pub fn num_segments(&self) -> usize {
        self.inner.segments.read().len()
    }

    /// Snapshot of the segment list
    pub fn segments(&self) -> Vec<Arc<Segment>> {
        self.inner.segments.read().clone()
    }

    /// Storage context the column lives in
    pub fn storage(&self) -> &StorageRef {
        &self.inner.storage
    }

    /// Whether two handles share the same underlying column
    pub fn ptr_eq(&self, other: &Column) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Random access to one row
    pub fn get(&self, row: u64) -> Result<Value> {
        self.check_readable()?;
        let segments = self.inner.segments.read();
        let mut start = 0u64;
        for segment in segments.iter() {
            if row < start + segment.len() {
                return segment.get(row - start);
            }
            start += segment.len();
        }
        Err(Error::OutOfRange {
            index: row,
            len: start,
        })
    }

    /// Lazy, restartable iteration over `range`
    pub fn iterate(&self, range: Range<u64>) -> Result<ColumnIter> {
        self.check_readable()?;
        let len = self.len();
        if range.start > range.end || range.end > len {
            return Err(Error::OutOfRange {
                index: range.end.max(range.start),
                len,
            });
        }
        Ok(ColumnIter::new(self.segments(), range))
    }

    /// Iterate over every row
    pub fn iter(&self) -> Result<ColumnIter> {
        self.iterate(0..self.len())
    }

    /// Read the whole column into memory
    pub fn to_vec(&self) -> Result<Vec<Value>> {
        self.iter()?.collect()
    }
}

impl fmt::Debug for Column {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Column")
            .field("data_type", &self.inner.data_type)
            .field("len", &self.len())
            .field("segments", &self.num_segments())
            .finish()
    }
}

/// The single writer of a [`Column`]
pub struct ColumnWriter {
    column: Column,
    current: Option<SegmentWriter>,
    closed: bool,
}

impl ColumnWriter {
    /// Rows written so far, including the open segment
    pub fn len(&self) -> u64 {
        self.column.len()
    }

    /// Check if nothing has been written
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn current(&mut self) -> Result<&mut SegmentWriter> {
        if self.current.is_none() {
            self.current = Some(SegmentWriter::new(
                self.column.storage(),
                self.column.data_type(),
            )?);
        }
        self.current
            .as_mut()
            .ok_or_else(|| Error::InvalidOperation("segment writer unavailable".into()))
    }

    /// Append values. Every value is validated first; on
    /// [`Error::TypeMismatch`] the column length is unchanged.
    pub fn append(&mut self, values: &[Value]) -> Result<()> {
        let data_type = self.column.data_type();
        if let Some(bad) = values.iter().find(|v| !data_type.accepts(v)) {
            return Err(Error::type_mismatch(&data_type, bad.type_name()));
        }
        self.current()?.append(values)?;
        self.column.inner.len.fetch_add(values.len() as u64, Ordering::SeqCst);
        Ok(())
    }

    /// Append owned values
    pub fn append_owned(&mut self, values: Vec<Value>) -> Result<()> {
        let n = values.len() as u64;
        self.current()?.append_owned(values)?;
        self.column.inner.len.fetch_add(n, Ordering::SeqCst);
        Ok(())
    }

    /// Seal the current segment; further appends start a new one
    pub fn start_segment(&mut self) -> Result<()> {
        if let Some(writer) = self.current.take() {
            if writer.is_empty() {
                writer.abort();
            } else {
                let segment = writer.finish()?;
                self.column.inner.segments.write().push(segment);
            }
        }
        Ok(())
    }

    /// Seal the column; no further appends are possible
    pub fn close(mut self) -> Result<Column> {
        self.start_segment()?;
        self.closed = true;
        self.column.inner.mode.store(MODE_SEALED, Ordering::SeqCst);
        debug!(
            rows = self.column.len(),
            segments = self.column.num_segments(),
            "column sealed"
        );
        Ok(self.column.clone())
    }
}

impl Drop for ColumnWriter {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        // unsealed rows are discarded and the column becomes readable with
        // whatever segments were sealed
        if let Some(writer) = self.current.take() {
            warn!(rows = writer.len(), "column writer dropped without close; discarding open segment");
            let sealed: u64 = self.column.inner.segments.read().iter().map(|s| s.len()).sum();
            self.column.inner.len.store(sealed, Ordering::SeqCst);
        }
        self.column.inner.mode.store(MODE_SEALED, Ordering::SeqCst);
    }
}

impl fmt::Debug for ColumnWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ColumnWriter")
            .field("column", &self.column)
            .field("open_segment", &self.current.as_ref().map(|w| w.len()))
            .finish()
    }
}

/// Iterator over a row range of a column.
///
/// Holds a snapshot of the segment list and at most one pinned block.
pub struct ColumnIter {
    segments: Vec<Arc<Segment>>,
    /// Start row of every segment, plus the total length
    segment_starts: Vec<u64>,
    range: Range<u64>,
    position: u64,
    current: Option<CurrentBlock>,
}

struct CurrentBlock {
    /// Absolute row range the block covers
    rows: Range<u64>,
    block: PinnedBlock,
}

impl ColumnIter {
    fn new(segments: Vec<Arc<Segment>>, range: Range<u64>) -> Self {
        let mut segment_starts = Vec::with_capacity(segments.len() + 1);
        let mut start = 0;
        segment_starts.push(0);
        for segment in &segments {
            start += segment.len();
            segment_starts.push(start);
        }
        Self {
            segments,
            segment_starts,
            position: range.start,
            range,
            current: None,
        }
    }

    /// Rewind to the start of the range
    pub fn restart(&mut self) {
        self.position = self.range.start;
    }

    /// Rows not yet returned
    pub fn remaining(&self) -> u64 {
        self.range.end - self.position
    }

    fn load_block(&mut self, row: u64) -> Result<()> {
        let segment_idx = self.segment_starts.partition_point(|&s| s <= row) - 1;
        let segment = &self.segments[segment_idx];
        let segment_start = self.segment_starts[segment_idx];
        let (block_idx, _) = segment.locate(row - segment_start)?;
        let block = segment.read_block(block_idx)?;
        let block_start = segment_start + segment.block_start(block_idx);
        let block_end = block_start + block.values.len() as u64;
        self.current = Some(CurrentBlock {
            rows: block_start..block_end,
            block,
        });
        Ok(())
    }

    /// Read up to `max` values in one go
    pub fn next_chunk(&mut self, max: usize) -> Result<Vec<Value>> {
        let want = (self.remaining() as usize).min(max);
        let mut out = Vec::with_capacity(want);
        while out.len() < want {
            let row = self.position;
            let hit = matches!(&self.current, Some(c) if c.rows.contains(&row));
            if !hit {
                self.load_block(row)?;
            }
            if let Some(current) = &self.current {
                let from = (row - current.rows.start) as usize;
                let until = ((current.rows.end - current.rows.start) as usize)
                    .min(from + (want - out.len()));
                out.extend_from_slice(&current.block.values[from..until]);
                self.position += (until - from) as u64;
            }
        }
        Ok(out)
    }
}

impl Iterator for ColumnIter {
    type Item = Result<Value>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.position >= self.range.end {
            // release the pin once exhausted
            self.current = None;
            return None;
        }
        match self.next_chunk(1) {
            Ok(mut values) => values.pop().map(Ok),
            Err(e) => {
                // stay terminal after an error
                self.position = self.range.end;
                Some(Err(e))
            }
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let n = self.remaining() as usize;
        (n, Some(n))
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
            block_size: 16,
            ..StorageConfig::default()
        })
    }

    fn ints(range: Range<i64>) -> Vec<Value> {
        range.map(Value::Integer).collect()
    }

    #[test]
    fn test_write_segments_and_read_back() {
        let storage = storage();
        let column = Column::create(&storage, DataType::Integer);
        let mut writer = column.open_writer().unwrap();
        for s in 0..4 {
            writer.append(&ints(s * 2500..(s + 1) * 2500)).unwrap();
            writer.start_segment().unwrap();
        }
        let column = writer.close().unwrap();

        assert_eq!(column.len(), 10_000);
        assert_eq!(column.num_segments(), 4);
        assert_eq!(column.get(2500).unwrap(), Value::Integer(2500));
        assert_eq!(column.get(9999).unwrap(), Value::Integer(9999));
        assert!(matches!(
            column.get(10_000),
            Err(Error::OutOfRange { index: 10_000, len: 10_000 })
        ));

        let middle: Vec<Value> = column.iterate(2490..2510).unwrap().map(|v| v.unwrap()).collect();
        assert_eq!(middle, ints(2490..2510));
    }

    #[test]
    fn test_iteration_is_restartable() {
        let storage = storage();
        let column = Column::from_values(&storage, DataType::Integer, ints(0..40)).unwrap();
        let mut it = column.iterate(5..35).unwrap();
        let first: Vec<Value> = it.by_ref().take(3).map(|v| v.unwrap()).collect();
        assert_eq!(first, ints(5..8));
        it.restart();
        assert_eq!(it.next_chunk(100).unwrap(), ints(5..35));
        assert!(it.next().is_none());
        assert!(it.next().is_none());
    }

    #[test]
    fn test_single_writer_and_mode_flag() {
        let storage = storage();
        let column = Column::create(&storage, DataType::String);
        let mut writer = column.open_writer().unwrap();
        assert!(matches!(column.open_writer(), Err(Error::WriterBusy)));
        assert!(matches!(column.get(0), Err(Error::InvalidOperation(_))));
        assert!(matches!(column.iter(), Err(Error::InvalidOperation(_))));

        writer.append(&[Value::from("a")]).unwrap();
        let column = writer.close().unwrap();
        assert_eq!(column.to_vec().unwrap(), vec![Value::from("a")]);
        assert!(matches!(column.open_writer(), Err(Error::InvalidOperation(_))));
    }

    #[test]
    fn test_type_mismatch_leaves_length_unchanged() {
        let storage = storage();
        let column = Column::create(&storage, DataType::Integer);
        let mut writer = column.open_writer().unwrap();
        writer.append(&ints(0..3)).unwrap();
        let err = writer.append(&[Value::Integer(4), Value::from("five")]).unwrap_err();
        assert!(matches!(err, Error::TypeMismatch { .. }));
        assert_eq!(writer.len(), 3);
        assert_eq!(column.len(), 3);
        let column = writer.close().unwrap();
        assert_eq!(column.len(), 3);
    }

    #[test]
    fn test_io_error_leaves_length_in_sync() {
        let fs = Arc::new(MemoryFileSystem::new());
        let config = StorageConfig {
            block_size: 4,
            ..StorageConfig::default()
        };
        let storage = StorageContext::with_filesystem(fs.clone(), "/scratch".into(), config).unwrap();
        let column = Column::create(&storage, DataType::Integer);
        let mut writer = column.open_writer().unwrap();
        writer.append(&ints(0..3)).unwrap();

        fs.fail_writes_after(1);
        assert!(writer.append_owned(ints(3..13)).is_err());
        fs.fail_writes(false);
        assert_eq!(writer.len(), 3);

        writer.append(&ints(3..6)).unwrap();
        let column = writer.close().unwrap();
        assert_eq!(column.to_vec().unwrap(), ints(0..6));
    }

    #[test]
    fn test_clone_shares_segments() {
        let storage = storage();
        let column = Column::from_values(&storage, DataType::Float, vec![Value::Integer(1)]).unwrap();
        let copy = column.clone();
        assert!(copy.ptr_eq(&column));
        assert_eq!(copy.get(0).unwrap(), Value::Float(1.0));
    }

    #[test]
    fn test_from_segments_checks_types() {
        let storage = storage();
        let mut writer = SegmentWriter::new(&storage, DataType::Integer).unwrap();
        writer.append(&ints(0..5)).unwrap();
        let segment = writer.finish().unwrap();
        assert!(Column::from_segments(&storage, DataType::String, vec![segment.clone()]).is_err());
        let column = Column::from_segments(&storage, DataType::Integer, vec![segment.clone(), segment]).unwrap();
        assert_eq!(column.len(), 10);
        assert_eq!(column.get(7).unwrap(), Value::Integer(2));
    }

    #[test]
    fn test_segment_files_deleted_with_last_reference() {
        let storage = storage();
        let column = Column::from_values(&storage, DataType::Integer, ints(0..3)).unwrap();
        assert_eq!(storage.scratch_segment_files().unwrap().len(), 1);
        let copy = column.clone();
        drop(column);
        assert_eq!(storage.scratch_segment_files().unwrap().len(), 1);
        drop(copy);
        assert!(storage.scratch_segment_files().unwrap().is_empty());
    }
}
