//! Writing batches into new segments

use std::sync::Arc;

use tabula_core::{Batch, Column, Error, Result, SchemaRef, Segment, SegmentWriter, StorageRef, Table, Value};

/// One segment writer per column of a schema. Dropping the sink before
/// finishing discards everything written.
pub struct TableSink {
    storage: StorageRef,
    schema: SchemaRef,
    writers: Vec<SegmentWriter>,
}

impl TableSink {
    /// Open a writer for every column of `schema`
    pub fn new(storage: &StorageRef, schema: SchemaRef) -> Result<Self> {
        let writers = schema
            .fields()
            .iter()
            .map(|field| SegmentWriter::new(storage, field.data_type))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            storage: Arc::clone(storage),
            schema,
            writers,
        })
    }

    /// Output schema
    pub fn schema(&self) -> &SchemaRef {
        &self.schema
    }

    /// Rows written so far
    pub fn rows(&self) -> u64 {
        self.writers.first().map_or(0, SegmentWriter::len)
    }

    /// Append every column of `batch`
    pub fn append(&mut self, batch: Batch) -> Result<()> {
        if batch.num_columns() != self.writers.len() {
            return Err(Error::SchemaMismatch(format!(
                "cannot write a {}-column batch into {}",
                batch.num_columns(),
                self.schema
            )));
        }
        for (writer, values) in self.writers.iter_mut().zip(batch.into_columns()) {
            writer.append_owned(values)?;
        }
        Ok(())
    }

    /// Append values to column `index` alone
    pub fn append_column(&mut self, index: usize, values: Vec<Value>) -> Result<()> {
        let len = self.writers.len();
        let writer = self.writers.get_mut(index).ok_or(Error::OutOfRange {
            index: index as u64,
            len: len as u64,
        })?;
        writer.append_owned(values)
    }

    /// Seal one segment per column, in schema order
    pub fn finish_segments(self) -> Result<Vec<Arc<Segment>>> {
        let rows = self.rows();
        if let Some(short) = self.writers.iter().position(|w| w.len() != rows) {
            return Err(Error::InvalidOperation(format!(
                "column '{}' has {} rows, expected {}",
                self.schema.field(short).name,
                self.writers[short].len(),
                rows
            )));
        }
        self.writers.into_iter().map(SegmentWriter::finish).collect()
    }

    /// Seal the written rows as a new table
    pub fn finish(self) -> Result<Table> {
        let storage = Arc::clone(&self.storage);
        let schema = Arc::clone(&self.schema);
        let columns = self
            .finish_segments()?
            .into_iter()
            .zip(schema.fields())
            .map(|(segment, field)| Column::from_segments(&storage, field.data_type, vec![segment]))
            .collect::<Result<Vec<_>>>()?;
        Table::from_columns(schema, columns)
    }
}
