//! Tables: named, ordered, equal-length columns
//!
//! Every structural operation returns a new [`Table`] sharing the untouched
//! columns with the original, so no operation here reads or writes segment
//! bytes.

use std::fmt;
use std::sync::Arc;

use crate::column::Column;
use crate::error::{Error, Result};
use crate::schema::{Field, Schema, SchemaRef};
use crate::storage::StorageRef;
use crate::value::Value;

/// A copy-on-write collection of equal-length columns
#[derive(Clone)]
pub struct Table {
    schema: SchemaRef,
    columns: Arc<Vec<Column>>,
    num_rows: u64,
}

impl Table {
    /// Build a table from `(name, column)` pairs
    pub fn new<S: Into<String>>(columns: Vec<(S, Column)>) -> Result<Self> {
        let (names, columns): (Vec<String>, Vec<Column>) =
            columns.into_iter().map(|(n, c)| (n.into(), c)).unzip();
        let fields = names
            .into_iter()
            .zip(&columns)
            .map(|(name, column)| Field::new(name, column.data_type()))
            .collect();
        Self::from_columns(Arc::new(Schema::new(fields)?), columns)
    }

    /// Build a table from a schema and one column per field
    pub fn from_columns(schema: SchemaRef, columns: Vec<Column>) -> Result<Self> {
        if schema.len() != columns.len() {
            return Err(Error::SchemaMismatch(format!(
                "{} columns for schema {}",
                columns.len(),
                schema
            )));
        }
        let num_rows = columns.first().map(Column::len).unwrap_or(0);
        for (field, column) in schema.fields().iter().zip(&columns) {
            check_column(field, column, num_rows)?;
        }
        Ok(Self {
            schema,
            columns: Arc::new(columns),
            num_rows,
        })
    }

    /// A table with no columns and no rows
    pub fn empty() -> Self {
        Self {
            schema: Arc::new(Schema::empty()),
            columns: Arc::new(Vec::new()),
            num_rows: 0,
        }
    }

    /// Column names and types
    pub fn schema(&self) -> &SchemaRef {
        &self.schema
    }

    /// Shared row count
    pub fn num_rows(&self) -> u64 {
        self.num_rows
    }

    /// Number of columns
    pub fn num_columns(&self) -> usize {
        self.columns.len()
    }

    /// Check if the table has no rows
    pub fn is_empty(&self) -> bool {
        self.num_rows == 0
    }

    /// All columns, in schema order
    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    /// Column by name
    pub fn column(&self, name: &str) -> Result<&Column> {
        Ok(&self.columns[self.schema.index_of(name)?])
    }

    /// Column by position
    pub fn column_at(&self, index: usize) -> Result<&Column> {
        self.columns.get(index).ok_or(Error::OutOfRange {
            index: index as u64,
            len: self.columns.len() as u64,
        })
    }

    /// Storage context of the first column, if any
    pub fn storage(&self) -> Option<&StorageRef> {
        self.columns.first().map(Column::storage)
    }

    fn with_parts(&self, fields: Vec<Field>, columns: Vec<Column>) -> Result<Self> {
        let num_rows = if columns.is_empty() { 0 } else { self.num_rows };
        Ok(Self {
            schema: Arc::new(Schema::new(fields)?),
            columns: Arc::new(columns),
            num_rows,
        })
    }

    /// New table with `column` appended under `name`
    pub fn add_column(&self, name: impl Into<String>, column: Column) -> Result<Self> {
        let field = Field::new(name, column.data_type());
        let expected = if self.columns.is_empty() {
            column.len()
        } else {
            self.num_rows
        };
        check_column(&field, &column, expected)?;

        let mut fields = self.schema.fields().to_vec();
        fields.push(field);
        let mut columns = self.columns.as_ref().clone();
        columns.push(column);
        Ok(Self {
            schema: Arc::new(Schema::new(fields)?),
            columns: Arc::new(columns),
            num_rows: expected,
        })
    }

    /// New table without the column `name`
    pub fn remove_column(&self, name: &str) -> Result<Self> {
        let index = self.schema.index_of(name)?;
        let mut fields = self.schema.fields().to_vec();
        let mut columns = self.columns.as_ref().clone();
        fields.remove(index);
        columns.remove(index);
        self.with_parts(fields, columns)
    }

    /// New table with only `names`, in the given order
    pub fn select_columns<S: AsRef<str>>(&self, names: &[S]) -> Result<Self> {
        let mut fields = Vec::with_capacity(names.len());
        let mut columns = Vec::with_capacity(names.len());
        for name in names {
            let index = self.schema.index_of(name.as_ref())?;
            fields.push(self.schema.field(index).clone());
            columns.push(self.columns[index].clone());
        }
        self.with_parts(fields, columns)
    }

    /// New table with column `from` renamed to `to`
    pub fn rename_column(&self, from: &str, to: impl Into<String>) -> Result<Self> {
        let index = self.schema.index_of(from)?;
        let mut fields = self.schema.fields().to_vec();
        fields[index].name = to.into();
        Ok(Self {
            schema: Arc::new(Schema::new(fields)?),
            columns: Arc::clone(&self.columns),
            num_rows: self.num_rows,
        })
    }

    /// One row as owned values
    pub fn row(&self, index: u64) -> Result<Vec<Value>> {
        if index >= self.num_rows {
            return Err(Error::OutOfRange {
                index,
                len: self.num_rows,
            });
        }
        self.columns.iter().map(|c| c.get(index)).collect()
    }

    /// The first `n` rows, row-major
    pub fn head(&self, n: u64) -> Result<Vec<Vec<Value>>> {
        let n = n.min(self.num_rows);
        let mut iters = self
            .columns
            .iter()
            .map(|c| c.iterate(0..n))
            .collect::<Result<Vec<_>>>()?;
        let mut columns = Vec::with_capacity(iters.len());
        for it in iters.iter_mut() {
            columns.push(it.next_chunk(n as usize)?);
        }
        Ok((0..n as usize)
            .map(|row| columns.iter().map(|c| c[row].clone()).collect())
            .collect())
    }

    /// Every row, row-major
    pub fn to_rows(&self) -> Result<Vec<Vec<Value>>> {
        self.head(self.num_rows)
    }
}

fn check_column(field: &Field, column: &Column, expected_rows: u64) -> Result<()> {
    if column.is_writing() {
        return Err(Error::InvalidOperation(format!(
            "column '{}' is still open for writing",
            field.name
        )));
    }
    if field.data_type != column.data_type() {
        return Err(Error::type_mismatch(&field.data_type, column.data_type()));
    }
    if column.len() != expected_rows {
        return Err(Error::InvalidArgument(format!(
            "column '{}' has {} rows, table has {}",
            field.name,
            column.len(),
            expected_rows
        )));
    }
    Ok(())
}

impl PartialEq for Table {
    /// Same schema and same values, wherever they are stored
    fn eq(&self, other: &Self) -> bool {
        if self.schema.as_ref() != other.schema.as_ref() || self.num_rows != other.num_rows {
            return false;
        }
        match (self.to_rows(), other.to_rows()) {
            (Ok(a), Ok(b)) => a == b,
            _ => false,
        }
    }
}

impl fmt::Debug for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Table")
            .field("schema", &self.schema.to_string())
            .field("num_rows", &self.num_rows)
            .finish()
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Table: {} rows, {} columns", self.num_rows, self.columns.len())?;
        writeln!(f, "Schema: {}", self.schema)?;

        const MAX_ROWS: u64 = 10;
        let rows = self.head(MAX_ROWS).map_err(|_| fmt::Error)?;
        for row in rows {
            let cells: Vec<String> = row.iter().map(|v| format!("{:15}", v.to_string())).collect();
            writeln!(f, "{}", cells.join(" | "))?;
        }
        if self.num_rows > MAX_ROWS {
            writeln!(f, "... ({} more rows)", self.num_rows - MAX_ROWS)?;
        }
        Ok(())
    }
}
