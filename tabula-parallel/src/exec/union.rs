use tabula_core::{Batch, Result, SchemaRef};

use super::{BoxedExec, ExecNode};
use crate::context::QueryContext;

/// Drains its inputs one after the other
pub struct UnionExec {
    schema: SchemaRef,
    inputs: Vec<BoxedExec>,
    current: usize,
}

impl UnionExec {
    /// Concatenate `inputs`, which must share `schema`
    pub fn new(schema: SchemaRef, inputs: Vec<BoxedExec>) -> Self {
        Self {
            schema,
            inputs,
            current: 0,
        }
    }
}

impl ExecNode for UnionExec {
    fn name(&self) -> &'static str {
        "Union"
    }

    fn schema(&self) -> &SchemaRef {
        &self.schema
    }

    fn next_batch(&mut self, ctx: &QueryContext) -> Result<Option<Batch>> {
        while let Some(input) = self.inputs.get_mut(self.current) {
            ctx.check_cancelled()?;
            match input.next_batch(ctx)? {
                Some(batch) => return Ok(Some(batch)),
                None => self.current += 1,
            }
        }
        Ok(None)
    }
}
