//! Self-describing on-disk layout of saved tables.
//!
//! A saved table is a directory holding one data file per segment, one JSON
//! index per column and a JSON table index listing the column indexes. Every
//! index carries a format version; an unknown version is rejected before
//! anything else in the file is interpreted.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::column::Column;
use crate::error::{Error, Result};
use crate::io::{FileSystem, OpenMode};
use crate::schema::{Field, Schema};
use crate::segment::Segment;
use crate::storage::{BlockLocation, StorageRef, SEGMENT_FILE_EXTENSION};
use crate::table::Table;
use crate::value::DataType;

/// Version written into every index file
pub const INDEX_FORMAT_VERSION: u32 = 1;

/// File name of the table index inside a saved table directory
pub const TABLE_INDEX_FILE: &str = "table.json";

/// One segment of a saved column
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentIndex {
    /// Data file, relative to the table directory
    pub file: String,
    /// Byte offset of the first block in the data file
    pub offset: u64,
    /// Number of blocks
    pub block_count: usize,
    /// Number of values
    pub num_elements: u64,
    /// Declared element type
    pub data_type: DataType,
    /// Block layout
    pub blocks: Vec<BlockLocation>,
}

/// Index of one saved column
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnIndex {
    /// Format version
    pub version: u32,
    /// Declared element type
    pub data_type: DataType,
    /// Number of rows
    pub len: u64,
    /// Segments in row order
    pub segments: Vec<SegmentIndex>,
}

/// A column entry in the table index
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnEntry {
    /// Column name
    pub name: String,
    /// Column index file, relative to the table directory
    pub index: String,
}

/// Index of a saved table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableIndex {
    /// Format version
    pub version: u32,
    /// Shared row count
    pub num_rows: u64,
    /// Columns in order
    pub columns: Vec<ColumnEntry>,
}

fn read_file(fs: &dyn FileSystem, path: &Path) -> Result<Vec<u8>> {
    let stream = fs.open(path, OpenMode::Read)?;
    let size = stream.size()?;
    Ok(stream.read(0, size as usize)?.to_vec())
}

fn write_file(fs: &dyn FileSystem, path: &Path, data: &[u8]) -> Result<()> {
    if fs.exists(path) {
        fs.remove(path)?;
    }
    let stream = fs.open(path, OpenMode::Write)?;
    stream.write(0, data)?;
    stream.flush()
}

/// Parse an index file, checking its version before its layout
fn read_index<T: DeserializeOwned>(fs: &dyn FileSystem, path: &Path, what: &'static str) -> Result<T> {
    let raw: serde_json::Value = serde_json::from_slice(&read_file(fs, path)?)?;
    let version = raw
        .get("version")
        .and_then(serde_json::Value::as_u64)
        .ok_or_else(|| Error::InvalidArgument(format!("{} has no format version", path.display())))?;
    if version != u64::from(INDEX_FORMAT_VERSION) {
        return Err(Error::UnsupportedFormatVersion {
            what,
            found: u32::try_from(version).unwrap_or(u32::MAX),
            supported: INDEX_FORMAT_VERSION,
        });
    }
    Ok(serde_json::from_value(raw)?)
}

fn inconsistent(path: &Path, detail: String) -> Error {
    Error::InvalidArgument(format!("inconsistent index {}: {}", path.display(), detail))
}

/// Segment files copied under a staging name, moved into place only once
/// every copy has succeeded. Staged files left behind are removed on drop.
struct StagedFiles<'a> {
    fs: &'a dyn FileSystem,
    moves: Vec<(PathBuf, PathBuf)>,
}

impl<'a> StagedFiles<'a> {
    fn new(fs: &'a dyn FileSystem) -> Self {
        Self { fs, moves: Vec::new() }
    }

    fn stage(&mut self, from: &Path, target: PathBuf) -> Result<()> {
        let file_name = target.file_name().and_then(|n| n.to_str()).unwrap_or_default();
        let staged = target.with_file_name(format!(".{}.partial", file_name));
        if self.fs.exists(&staged) {
            self.fs.remove(&staged)?;
        }
        self.moves.push((staged.clone(), target));
        self.fs.copy(from, &staged)?;
        Ok(())
    }

    /// Move every staged file over its target
    fn commit(mut self, storage: &StorageRef) -> Result<()> {
        while let Some((staged, target)) = self.moves.pop() {
            if let Err(e) = self.fs.rename(&staged, &target) {
                self.moves.push((staged, target));
                return Err(e);
            }
            // pooled streams on the old file must not serve later reads
            storage.blocks().close_path(&target);
        }
        Ok(())
    }
}

impl Drop for StagedFiles<'_> {
    fn drop(&mut self) {
        for (staged, _) in &self.moves {
            if self.fs.exists(staged) {
                if let Err(e) = self.fs.remove(staged) {
                    warn!(path = %staged.display(), error = %e, "failed to remove staged segment file");
                }
            }
        }
    }
}

impl Table {
    /// Persist the table into `dir`: segment files are copied next to a
    /// column index per column and a table index.
    ///
    /// Saving into the directory the table was opened from is allowed.
    /// Segments already at their target path are left untouched; every other
    /// segment is copied under a staging name first, so no source file is
    /// overwritten before all of them have been read.
    pub fn save(&self, dir: impl AsRef<Path>) -> Result<()> {
        let dir = dir.as_ref();
        let storage = match self.storage() {
            Some(storage) => Arc::clone(storage),
            None => {
                return Err(Error::InvalidOperation(
                    "cannot save a table without columns".into(),
                ))
            }
        };
        let fs = storage.fs().as_ref();
        fs.create_dir_all(dir)?;

        let mut staged = StagedFiles::new(fs);
        let mut indexes = Vec::with_capacity(self.num_columns());
        for (i, column) in self.columns().iter().enumerate() {
            let mut segments = Vec::with_capacity(column.num_segments());
            for (j, segment) in column.segments().iter().enumerate() {
                let file = format!("c{}-s{}.{}", i, j, SEGMENT_FILE_EXTENSION);
                let target = dir.join(&file);
                if segment.path() != target.as_path() {
                    staged.stage(segment.path(), target)?;
                }
                let blocks = segment.blocks()?;
                segments.push(SegmentIndex {
                    file,
                    offset: blocks.first().map(|b| b.offset).unwrap_or(0),
                    block_count: blocks.len(),
                    num_elements: segment.len(),
                    data_type: segment.data_type(),
                    blocks,
                });
            }
            indexes.push(ColumnIndex {
                version: INDEX_FORMAT_VERSION,
                data_type: column.data_type(),
                len: column.len(),
                segments,
            });
        }
        staged.commit(&storage)?;

        let mut entries = Vec::with_capacity(indexes.len());
        for (i, (field, index)) in self.schema().fields().iter().zip(indexes).enumerate() {
            let index_file = format!("c{}.json", i);
            write_file(fs, &dir.join(&index_file), &serde_json::to_vec_pretty(&index)?)?;
            entries.push(ColumnEntry {
                name: field.name.clone(),
                index: index_file,
            });
        }

        let table_index = TableIndex {
            version: INDEX_FORMAT_VERSION,
            num_rows: self.num_rows(),
            columns: entries,
        };
        write_file(
            fs,
            &dir.join(TABLE_INDEX_FILE),
            &serde_json::to_vec_pretty(&table_index)?,
        )?;
        info!(dir = %dir.display(), rows = self.num_rows(), columns = self.num_columns(), "saved table");
        Ok(())
    }
}

/// Load one saved column from its index file
pub fn open_column(storage: &StorageRef, index_path: &Path) -> Result<Column> {
    let fs = storage.fs().as_ref();
    let index: ColumnIndex = read_index(fs, index_path, "column index")?;
    let dir = index_path.parent().map(Path::to_path_buf).unwrap_or_default();

    let mut segments = Vec::with_capacity(index.segments.len());
    for entry in index.segments {
        if entry.data_type != index.data_type {
            return Err(inconsistent(
                index_path,
                format!("segment {} is {}, column is {}", entry.file, entry.data_type, index.data_type),
            ));
        }
        let counted: u64 = entry.blocks.iter().map(|b| b.num_elements).sum();
        if entry.blocks.len() != entry.block_count || counted != entry.num_elements {
            return Err(inconsistent(index_path, format!("block list of {} does not add up", entry.file)));
        }
        let path: PathBuf = dir.join(&entry.file);
        if !fs.exists(&path) {
            return Err(inconsistent(index_path, format!("missing data file {}", entry.file)));
        }
        segments.push(Segment::open(storage, path, entry.data_type, entry.blocks));
    }

    let column = Column::from_segments(storage, index.data_type, segments)?;
    if column.len() != index.len {
        return Err(inconsistent(
            index_path,
            format!("segments hold {} rows, index says {}", column.len(), index.len),
        ));
    }
    debug!(path = %index_path.display(), rows = column.len(), "opened column");
    Ok(column)
}

/// Load a table saved with [`Table::save`]
pub fn open_table(storage: &StorageRef, dir: impl AsRef<Path>) -> Result<Table> {
    let dir = dir.as_ref();
    let index_path = dir.join(TABLE_INDEX_FILE);
    let index: TableIndex = read_index(storage.fs().as_ref(), &index_path, "table index")?;

    let mut fields = Vec::with_capacity(index.columns.len());
    let mut columns = Vec::with_capacity(index.columns.len());
    for entry in &index.columns {
        let column = open_column(storage, &dir.join(&entry.index))?;
        fields.push(Field::new(entry.name.clone(), column.data_type()));
        columns.push(column);
    }
    let table = Table::from_columns(Arc::new(Schema::new(fields)?), columns)?;
    if !index.columns.is_empty() && table.num_rows() != index.num_rows {
        return Err(inconsistent(
            &index_path,
            format!("columns hold {} rows, index says {}", table.num_rows(), index.num_rows),
        ));
    }
    info!(dir = %dir.display(), rows = table.num_rows(), columns = table.num_columns(), "opened table");
    Ok(table)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageConfig;
    use crate::io::MemoryFileSystem;
    use crate::storage::StorageContext;
    use crate::value::Value;

    fn sample(storage: &StorageRef) -> Table {
        let column = Column::create(storage, DataType::Integer);
        let mut writer = column.open_writer().unwrap();
        writer.append(&(0..50).map(Value::Integer).collect::<Vec<_>>()).unwrap();
        writer.start_segment().unwrap();
        writer.append(&(50..70).map(Value::Integer).collect::<Vec<_>>()).unwrap();
        let ints = writer.close().unwrap();
        let text = Column::from_values(
            storage,
            DataType::String,
            (0..70).map(|i| Value::from(format!("row {}", i))).collect(),
        )
        .unwrap();
        Table::new(vec![("n", ints), ("s", text)]).unwrap()
    }

    #[test]
    fn test_save_and_open_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let config = StorageConfig {
            block_size: 16,
            scratch_dir: Some(dir.path().join("scratch")),
            ..StorageConfig::default()
        };
        let storage = StorageContext::new(config).unwrap();
        let table = sample(&storage);
        let saved = dir.path().join("saved");
        table.save(&saved).unwrap();

        let reopened = open_table(&storage, &saved).unwrap();
        assert_eq!(reopened.schema().names(), vec!["n", "s"]);
        assert_eq!(reopened.column("n").unwrap().num_segments(), 2);
        assert_eq!(reopened, table);

        // saved files outlive the in-memory handles
        drop(reopened);
        assert!(saved.join("c0-s0.tcol").exists());
    }

    #[test]
    fn test_resave_into_source_directory() {
        let dir = tempfile::tempdir().unwrap();
        let config = StorageConfig {
            block_size: 16,
            scratch_dir: Some(dir.path().join("scratch")),
            ..StorageConfig::default()
        };
        let storage = StorageContext::new(config).unwrap();
        let table = sample(&storage);
        let saved = dir.path().join("saved");
        table.save(&saved).unwrap();

        let reopened = open_table(&storage, &saved).unwrap();
        reopened.save(&saved).unwrap();
        let again = open_table(&storage, &saved).unwrap();
        assert_eq!(again, table);

        // swapping columns makes every segment file the source of another
        let swapped = again.select_columns(&["s", "n"]).unwrap();
        swapped.save(&saved).unwrap();
        let swapped_back = open_table(&storage, &saved).unwrap();
        assert_eq!(swapped_back.schema().names(), vec!["s", "n"]);
        for name in ["n", "s"] {
            assert_eq!(
                swapped_back.column(name).unwrap().to_vec().unwrap(),
                table.column(name).unwrap().to_vec().unwrap()
            );
        }

        let leftovers: Vec<_> = storage
            .fs()
            .list(&saved)
            .unwrap()
            .into_iter()
            .filter(|p| p.to_string_lossy().ends_with(".partial"))
            .collect();
        assert!(leftovers.is_empty(), "{:?}", leftovers);
    }

    #[test]
    fn test_failed_save_keeps_previous_copy() {
        let fs = Arc::new(MemoryFileSystem::new());
        let storage =
            StorageContext::with_filesystem(fs.clone(), PathBuf::from("/scratch"), StorageConfig::default()).unwrap();
        let table = sample(&storage);
        let dir = Path::new("/saved");
        table.save(dir).unwrap();
        let reopened = open_table(&storage, dir).unwrap();
        let swapped = reopened.select_columns(&["s", "n"]).unwrap();

        fs.fail_writes(true);
        assert!(swapped.save(dir).is_err());
        fs.fail_writes(false);

        assert_eq!(open_table(&storage, dir).unwrap(), table);
        assert!(!fs.list(dir).unwrap().iter().any(|p| p.to_string_lossy().ends_with(".partial")));
    }

    #[test]
    fn test_unknown_version_fails_closed() {
        let storage = StorageContext::in_memory(StorageConfig::default());
        let table = sample(&storage);
        let dir = Path::new("/saved");
        table.save(dir).unwrap();

        let fs = storage.fs().as_ref();
        let path = dir.join(TABLE_INDEX_FILE);
        let mut index: serde_json::Value = serde_json::from_slice(&read_file(fs, &path).unwrap()).unwrap();
        index["version"] = serde_json::json!(99);
        write_file(fs, &path, &serde_json::to_vec(&index).unwrap()).unwrap();

        match open_table(&storage, dir) {
            Err(Error::UnsupportedFormatVersion { found, supported, .. }) => {
                assert_eq!(found, 99);
                assert_eq!(supported, INDEX_FORMAT_VERSION);
            }
            other => panic!("expected a version error, got {:?}", other.map(|t| t.num_rows())),
        }
    }

    #[test]
    fn test_missing_data_file_is_reported() {
        let storage = StorageContext::in_memory(StorageConfig::default());
        let table = sample(&storage);
        let dir = Path::new("/saved");
        table.save(dir).unwrap();
        storage.fs().remove(&dir.join("c1-s0.tcol")).unwrap();
        assert!(matches!(open_table(&storage, dir), Err(Error::InvalidArgument(_))));
    }
}
