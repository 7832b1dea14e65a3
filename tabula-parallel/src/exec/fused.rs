use std::sync::Arc;

use tabula_core::{Batch, Result, SchemaRef};
use tabula_query::BoundExpr;

use super::{BoxedExec, ExecNode};
use crate::context::QueryContext;

/// One row-streaming step of a fused pipeline
#[derive(Debug, Clone)]
pub enum Stage {
    /// Evaluate expressions into a new set of columns
    Map {
        /// One expression per output column
        exprs: Vec<BoundExpr>,
        /// Output schema
        schema: SchemaRef,
    },
    /// Keep rows where the predicate is present and truthy
    Filter {
        /// Row predicate
        predicate: BoundExpr,
    },
    /// Pick columns by position
    Project {
        /// Input positions, in output order
        indices: Vec<usize>,
        /// Output schema
        schema: SchemaRef,
    },
}

impl Stage {
    fn apply(&self, batch: Batch) -> Result<Batch> {
        match self {
            Stage::Map { exprs, schema } => {
                let columns = exprs
                    .iter()
                    .map(|e| e.evaluate(&batch))
                    .collect::<Result<Vec<_>>>()?;
                Batch::with_row_count(Arc::clone(schema), columns, batch.num_rows())
            }
            Stage::Filter { predicate } => {
                let mask = predicate.evaluate_mask(&batch)?;
                if mask.iter().all(|&keep| keep) {
                    return Ok(batch);
                }
                batch.filter(&mask)
            }
            Stage::Project { indices, schema } => {
                let rows = batch.num_rows();
                let mut columns = batch.into_columns();
                let picked = indices.iter().map(|&i| std::mem::take(&mut columns[i])).collect();
                Batch::with_row_count(Arc::clone(schema), picked, rows)
            }
        }
    }
}

/// Adjacent Map, Filter and Project nodes run as one node, so no
/// intermediate batches are handed between nodes
pub struct FusedExec {
    input: BoxedExec,
    stages: Vec<Stage>,
    schema: SchemaRef,
    done: bool,
}

impl FusedExec {
    /// Run `stages` in order over every batch of `input`
    pub fn new(input: BoxedExec, stages: Vec<Stage>, schema: SchemaRef) -> Self {
        Self {
            input,
            stages,
            schema,
            done: false,
        }
    }
}

impl ExecNode for FusedExec {
    fn name(&self) -> &'static str {
        "Fused"
    }

    fn schema(&self) -> &SchemaRef {
        &self.schema
    }

    fn next_batch(&mut self, ctx: &QueryContext) -> Result<Option<Batch>> {
        if self.done {
            return Ok(None);
        }
        loop {
            ctx.check_cancelled()?;
            let Some(mut batch) = self.input.next_batch(ctx)? else {
                self.done = true;
                return Ok(None);
            };
            for stage in &self.stages {
                batch = stage.apply(batch)?;
                if batch.is_empty() {
                    break;
                }
            }
            // fully filtered batches are skipped
            if !batch.is_empty() {
                return Ok(Some(batch));
            }
        }
    }
}
