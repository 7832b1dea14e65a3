use std::ops::Range;
use std::sync::Arc;

use tabula_core::{Batch, ColumnIter, Result, SchemaRef, Table, Value};

use super::ExecNode;
use crate::context::QueryContext;

/// Reads a row range of a table, one batch of every column at a time
pub struct ScanExec {
    schema: SchemaRef,
    columns: Vec<ColumnIter>,
    remaining: u64,
    done: bool,
}

impl ScanExec {
    /// Scan `rows` of `table`; the range is clamped to the table length
    pub fn new(table: &Table, rows: Range<u64>) -> Result<Self> {
        let end = rows.end.min(table.num_rows());
        let start = rows.start.min(end);
        let columns = table
            .columns()
            .iter()
            .map(|c| c.iterate(start..end))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            schema: Arc::clone(table.schema()),
            columns,
            remaining: end - start,
            done: false,
        })
    }
}

impl ExecNode for ScanExec {
    fn name(&self) -> &'static str {
        "Scan"
    }

    fn schema(&self) -> &SchemaRef {
        &self.schema
    }

    fn next_batch(&mut self, ctx: &QueryContext) -> Result<Option<Batch>> {
        if self.done {
            return Ok(None);
        }
        ctx.check_cancelled()?;
        if self.remaining == 0 {
            self.done = true;
            // unpin the last blocks
            self.columns.clear();
            return Ok(None);
        }
        let rows = (ctx.batch_size() as u64).min(self.remaining) as usize;
        let columns = self
            .columns
            .iter_mut()
            .map(|c| c.next_chunk(rows))
            .collect::<Result<Vec<_>>>()?;
        self.remaining -= rows as u64;
        Batch::with_row_count(Arc::clone(&self.schema), columns, rows).map(Some)
    }
}

/// Generates the integers of a range
pub struct RangeExec {
    schema: SchemaRef,
    next: i64,
    end: i64,
    done: bool,
}

impl RangeExec {
    /// Values `values.start..values.end` in the single column of `schema`
    pub fn new(schema: SchemaRef, values: Range<i64>) -> Self {
        Self {
            schema,
            next: values.start,
            end: values.end,
            done: false,
        }
    }
}

impl ExecNode for RangeExec {
    fn name(&self) -> &'static str {
        "Range"
    }

    fn schema(&self) -> &SchemaRef {
        &self.schema
    }

    fn next_batch(&mut self, ctx: &QueryContext) -> Result<Option<Batch>> {
        if self.done {
            return Ok(None);
        }
        ctx.check_cancelled()?;
        if self.next >= self.end {
            self.done = true;
            return Ok(None);
        }
        let stop = self.next.saturating_add(ctx.batch_size() as i64).min(self.end);
        let values: Vec<Value> = (self.next..stop).map(Value::Integer).collect();
        self.next = stop;
        Batch::new(Arc::clone(&self.schema), vec![values]).map(Some)
    }
}
