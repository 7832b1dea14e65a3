//! In-memory batch of rows in columnar layout, the unit execution nodes
//! pass to each other

use std::fmt;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::schema::{Field, Schema, SchemaRef};
use crate::value::Value;

/// A collection of equal-length value vectors described by a schema
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    /// Schema describing the data
    schema: SchemaRef,

    /// Columns in this batch
    columns: Vec<Vec<Value>>,

    /// Number of rows; tracked separately so zero-column batches keep a length
    row_count: usize,
}

impl Batch {
    /// Create a new batch with the given schema and columns
    pub fn new(schema: SchemaRef, columns: Vec<Vec<Value>>) -> Result<Self> {
        let row_count = columns.first().map(Vec::len).unwrap_or(0);
        Self::with_row_count(schema, columns, row_count)
    }

    /// Create a batch with an explicit row count (needed when there are no columns)
    pub fn with_row_count(
        schema: SchemaRef,
        columns: Vec<Vec<Value>>,
        row_count: usize,
    ) -> Result<Self> {
        if columns.len() != schema.len() {
            return Err(Error::SchemaMismatch(format!(
                "batch has {} columns, schema has {}",
                columns.len(),
                schema.len()
            )));
        }
        for (field, column) in schema.fields().iter().zip(&columns) {
            if column.len() != row_count {
                return Err(Error::InvalidArgument(format!(
                    "column '{}' has {} rows, expected {}",
                    field.name,
                    column.len(),
                    row_count
                )));
            }
        }
        Ok(Self {
            schema,
            columns,
            row_count,
        })
    }

    /// Create a new empty batch with the given schema
    pub fn empty(schema: SchemaRef) -> Self {
        let columns = vec![Vec::new(); schema.len()];
        Self {
            schema,
            columns,
            row_count: 0,
        }
    }

    /// Build a batch from row-major values
    pub fn from_rows(schema: SchemaRef, rows: Vec<Vec<Value>>) -> Result<Self> {
        let row_count = rows.len();
        let mut columns: Vec<Vec<Value>> = (0..schema.len())
            .map(|_| Vec::with_capacity(row_count))
            .collect();
        for row in rows {
            if row.len() != schema.len() {
                return Err(Error::SchemaMismatch(format!(
                    "row has {} values, schema has {} fields",
                    row.len(),
                    schema.len()
                )));
            }
            for (column, value) in columns.iter_mut().zip(row) {
                column.push(value);
            }
        }
        Self::with_row_count(schema, columns, row_count)
    }

    /// Get the schema of this batch
    pub fn schema(&self) -> &SchemaRef {
        &self.schema
    }

    /// Get the number of rows in this batch
    pub fn num_rows(&self) -> usize {
        self.row_count
    }

    /// Get the number of columns in this batch
    pub fn num_columns(&self) -> usize {
        self.columns.len()
    }

    /// Check if this batch is empty
    pub fn is_empty(&self) -> bool {
        self.row_count == 0
    }

    /// Get a column by index
    pub fn column(&self, index: usize) -> &[Value] {
        &self.columns[index]
    }

    /// Get a column by name
    pub fn column_by_name(&self, name: &str) -> Result<&[Value]> {
        let index = self.schema.index_of(name)?;
        Ok(&self.columns[index])
    }

    /// All columns
    pub fn columns(&self) -> &[Vec<Value>] {
        &self.columns
    }

    /// Take the columns out of the batch
    pub fn into_columns(self) -> Vec<Vec<Value>> {
        self.columns
    }

    /// One row as owned values
    pub fn row(&self, index: usize) -> Vec<Value> {
        self.columns.iter().map(|c| c[index].clone()).collect()
    }

    /// All rows, row-major
    pub fn rows(&self) -> Vec<Vec<Value>> {
        (0..self.row_count).map(|i| self.row(i)).collect()
    }

    /// Rows `offset..offset + length`
    pub fn slice(&self, offset: usize, length: usize) -> Result<Self> {
        if offset + length > self.row_count {
            return Err(Error::OutOfRange {
                index: (offset + length) as u64,
                len: self.row_count as u64,
            });
        }
        let columns = self
            .columns
            .iter()
            .map(|c| c[offset..offset + length].to_vec())
            .collect();
        Self::with_row_count(Arc::clone(&self.schema), columns, length)
    }

    /// Keep the rows whose mask entry is true
    pub fn filter(&self, mask: &[bool]) -> Result<Self> {
        if mask.len() != self.row_count {
            return Err(Error::InvalidArgument(format!(
                "mask has {} entries for {} rows",
                mask.len(),
                self.row_count
            )));
        }
        let kept = mask.iter().filter(|&&m| m).count();
        let columns = self
            .columns
            .iter()
            .map(|c| {
                c.iter()
                    .zip(mask)
                    .filter(|(_, &m)| m)
                    .map(|(v, _)| v.clone())
                    .collect()
            })
            .collect();
        Self::with_row_count(Arc::clone(&self.schema), columns, kept)
    }

    /// Create a projection of this batch with only the specified columns
    pub fn project(&self, indices: &[usize]) -> Result<Self> {
        if let Some(&bad) = indices.iter().find(|&&i| i >= self.columns.len()) {
            return Err(Error::OutOfRange {
                index: bad as u64,
                len: self.columns.len() as u64,
            });
        }
        let fields: Vec<Field> = indices.iter().map(|&i| self.schema.field(i).clone()).collect();
        let columns = indices.iter().map(|&i| self.columns[i].clone()).collect();
        Self::with_row_count(Arc::new(Schema::new(fields)?), columns, self.row_count)
    }

    /// Concatenate batches sharing `schema`
    pub fn concat(schema: SchemaRef, batches: &[Batch]) -> Result<Self> {
        let total: usize = batches.iter().map(Batch::num_rows).sum();
        let mut columns: Vec<Vec<Value>> = (0..schema.len())
            .map(|_| Vec::with_capacity(total))
            .collect();
        for batch in batches {
            if batch.num_columns() != schema.len() {
                return Err(Error::SchemaMismatch(format!(
                    "cannot concatenate a {}-column batch into {}",
                    batch.num_columns(),
                    schema
                )));
            }
            for (out, column) in columns.iter_mut().zip(&batch.columns) {
                out.extend(column.iter().cloned());
            }
        }
        Self::with_row_count(schema, columns, total)
    }

    /// Approximate memory footprint in bytes
    pub fn memory_size(&self) -> usize {
        self.columns
            .iter()
            .flat_map(|c| c.iter())
            .map(Value::estimated_size)
            .sum::<usize>()
            + std::mem::size_of::<Self>()
    }
}

impl fmt::Display for Batch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Batch: {} rows, {} columns", self.row_count, self.columns.len())?;
        writeln!(f, "Schema: {}", self.schema)?;

        const MAX_ROWS: usize = 10;
        for row in 0..self.row_count.min(MAX_ROWS) {
            for (col, column) in self.columns.iter().enumerate() {
                if col > 0 {
                    write!(f, " | ")?;
                }
                write!(f, "{:15}", column[row].to_string())?;
            }
            writeln!(f)?;
        }
        if self.row_count > MAX_ROWS {
            writeln!(f, "... ({} more rows)", self.row_count - MAX_ROWS)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::DataType;

    fn schema() -> SchemaRef {
        Arc::new(
            Schema::new(vec![
                Field::new("id", DataType::Integer),
                Field::new("name", DataType::String),
            ])
            .unwrap(),
        )
    }

    fn batch() -> Batch {
        Batch::from_rows(
            schema(),
            vec![
                vec![Value::Integer(1), Value::from("a")],
                vec![Value::Integer(2), Value::from("b")],
                vec![Value::Integer(3), Value::Missing],
            ],
        )
        .unwrap()
    }

    #[test]
    fn test_batch_shape_checks() {
        let result = Batch::new(schema(), vec![vec![Value::Integer(1)], vec![]]);
        assert!(matches!(result, Err(Error::InvalidArgument(_))));
        let result = Batch::new(schema(), vec![vec![]]);
        assert!(matches!(result, Err(Error::SchemaMismatch(_))));
    }

    #[test]
    fn test_filter_slice_project() {
        let b = batch();
        let filtered = b.filter(&[true, false, true]).unwrap();
        assert_eq!(filtered.column(0), &[Value::Integer(1), Value::Integer(3)]);

        let sliced = b.slice(1, 2).unwrap();
        assert_eq!(sliced.row(0), vec![Value::Integer(2), Value::from("b")]);
        assert!(b.slice(2, 2).is_err());

        let projected = b.project(&[1]).unwrap();
        assert_eq!(projected.schema().names(), vec!["name"]);
        assert_eq!(projected.num_rows(), 3);
    }

    #[test]
    fn test_concat_keeps_order() {
        let b = batch();
        let joined = Batch::concat(schema(), &[b.clone(), b.slice(0, 1).unwrap()]).unwrap();
        assert_eq!(joined.num_rows(), 4);
        assert_eq!(joined.row(3), b.row(0));
    }

    #[test]
    fn test_zero_column_batch_keeps_length() {
        let empty_schema = Arc::new(Schema::empty());
        let b = Batch::with_row_count(empty_schema, vec![], 5).unwrap();
        assert_eq!(b.num_rows(), 5);
        assert_eq!(b.filter(&[true, false, true, false, false]).unwrap().num_rows(), 2);
    }
}
