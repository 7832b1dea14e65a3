//! Execution nodes: pull-based batch iterators built per partition
//!
//! Every query node has a row space. For sources it is the row count; a
//! Map, Filter or Project shares the row space of its input, a Union
//! concatenates the row spaces of its inputs, and a Join streams the row
//! space of its left input followed by its unmatched right rows. A
//! partition is a contiguous range of the root's row space and
//! [`build`] turns it into a pipeline reading only the matching input
//! ranges, so partitions never overlap and concatenate in order.

mod fused;
mod join;
mod scan;
mod union;

use std::ops::Range;
use std::sync::Arc;

use tabula_core::{Batch, Error, Result, SchemaRef};
use tabula_query::{range_value, NodeId, Operator, Plan};
use tracing::trace;

use crate::context::QueryContext;
use crate::prepare::Prepared;

pub use fused::{FusedExec, Stage};
pub use join::{JoinExec, JoinState};
pub use scan::{RangeExec, ScanExec};
pub use union::UnionExec;

/// A runtime iterator over batches
pub trait ExecNode: Send {
    /// Short name used in logs
    fn name(&self) -> &'static str;

    /// Schema of every produced batch
    fn schema(&self) -> &SchemaRef;

    /// Next batch; `None` once exhausted, and on every call after that.
    /// Fails with [`Error::Cancelled`] at a batch boundary once the
    /// context is cancelled.
    fn next_batch(&mut self, ctx: &QueryContext) -> Result<Option<Batch>>;
}

/// Owned execution node
pub type BoxedExec = Box<dyn ExecNode>;

/// Pull `exec` to exhaustion, handing each batch to `consume` while the
/// batch's size is reserved from the context's memory budget. `consume`
/// returns false to stop early.
pub fn drain(
    exec: &mut dyn ExecNode,
    ctx: &QueryContext,
    mut consume: impl FnMut(Batch) -> Result<bool>,
) -> Result<()> {
    while let Some(batch) = exec.next_batch(ctx)? {
        let _reservation = ctx
            .budget()
            .reserve_blocking(batch.memory_size(), || ctx.is_cancelled())?;
        trace!(node = exec.name(), rows = batch.num_rows(), "batch");
        if !consume(batch)? {
            break;
        }
    }
    Ok(())
}

/// Build the pipeline producing rows `rows` of node `id`'s row space
pub fn build(plan: &Plan, prepared: &Prepared, id: NodeId, rows: Range<u64>) -> Result<BoxedExec> {
    if let Some(table) = prepared.table(id) {
        return Ok(Box::new(ScanExec::new(table, rows)?));
    }
    match plan.operator(id) {
        Operator::Source { table } => Ok(Box::new(ScanExec::new(table, rows)?)),
        Operator::Range { start, end, .. } => {
            let from = range_value(*start, *end, rows.start);
            let to = range_value(*start, *end, rows.end);
            Ok(Box::new(RangeExec::new(Arc::clone(plan.schema(id)), from..to)))
        }
        Operator::Map { .. } | Operator::Filter { .. } | Operator::Project { .. } => {
            build_fused(plan, prepared, id, rows)
        }
        Operator::Union { inputs } => {
            let mut parts = Vec::new();
            let mut offset = 0u64;
            for input in inputs {
                let space = prepared.row_space(plan, *input)?;
                let from = rows.start.max(offset);
                let to = rows.end.min(offset + space);
                if from < to {
                    parts.push(build(plan, prepared, *input, from - offset..to - offset)?);
                }
                offset += space;
            }
            Ok(Box::new(UnionExec::new(Arc::clone(plan.schema(id)), parts)))
        }
        Operator::Join { left, .. } => {
            let state = prepared
                .join(id)
                .ok_or_else(|| Error::InvalidOperation(format!("join {} was not prepared", id)))?;
            let left_space = prepared.row_space(plan, *left)?;
            let probe = if rows.start < left_space {
                Some(build(plan, prepared, *left, rows.start..rows.end.min(left_space))?)
            } else {
                None
            };
            let unmatched = rows.start.max(left_space) - left_space..rows.end.max(left_space) - left_space;
            Ok(Box::new(JoinExec::new(
                Arc::clone(state),
                probe,
                unmatched.start as usize..unmatched.end as usize,
            )))
        }
        Operator::Slice { input, start, .. } => {
            let space = prepared.row_space(plan, *input)?;
            let offset = (*start).min(space);
            build(plan, prepared, *input, offset + rows.start..offset + rows.end)
        }
        Operator::Reduce { .. } | Operator::Window { .. } => Err(Error::InvalidOperation(format!(
            "{} {} was not prepared",
            plan.operator(id).name(),
            id
        ))),
    }
}

/// Collapse a chain of Map, Filter and Project nodes into one stage list
fn build_fused(plan: &Plan, prepared: &Prepared, id: NodeId, rows: Range<u64>) -> Result<BoxedExec> {
    let mut stages = Vec::new();
    let mut current = id;
    loop {
        let (stage, input) = match plan.operator(current) {
            Operator::Map { input, outputs } => {
                let input_schema = plan.schema(*input);
                let exprs = outputs
                    .iter()
                    .map(|(_, expr)| expr.bind(input_schema))
                    .collect::<Result<Vec<_>>>()?;
                let stage = Stage::Map {
                    exprs,
                    schema: Arc::clone(plan.schema(current)),
                };
                (stage, *input)
            }
            Operator::Filter { input, predicate } => {
                let stage = Stage::Filter {
                    predicate: predicate.bind(plan.schema(*input))?,
                };
                (stage, *input)
            }
            Operator::Project { input, columns } => {
                let input_schema = plan.schema(*input);
                let indices = columns
                    .iter()
                    .map(|c| input_schema.index_of(c))
                    .collect::<Result<Vec<_>>>()?;
                let stage = Stage::Project {
                    indices,
                    schema: Arc::clone(plan.schema(current)),
                };
                (stage, *input)
            }
            _ => break,
        };
        stages.push(stage);
        current = input;
    }
    // collected top-down, applied bottom-up
    stages.reverse();
    let input = build(plan, prepared, current, rows)?;
    Ok(Box::new(FusedExec::new(input, stages, Arc::clone(plan.schema(id)))))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ExecutionConfig;
    use crate::pool::WorkerPool;
    use tabula_core::{Column, DataType, StorageConfig, StorageContext, StorageRef, Table, Value};
    use tabula_query::{col, lit, JoinKind};

    fn context(storage: &StorageRef, batch_size: usize) -> QueryContext {
        let config = ExecutionConfig {
            batch_size,
            ..ExecutionConfig::default()
        };
        QueryContext::new(Arc::clone(storage), WorkerPool::new(1).unwrap(), config)
    }

    fn ints(storage: &StorageRef, values: impl IntoIterator<Item = i64>) -> Column {
        Column::from_values(storage, DataType::Integer, values.into_iter().map(Value::Integer).collect()).unwrap()
    }

    fn collect(exec: &mut dyn ExecNode, ctx: &QueryContext) -> Vec<Vec<Value>> {
        let mut rows = Vec::new();
        drain(exec, ctx, |batch| {
            rows.extend(batch.rows());
            Ok(true)
        })
        .unwrap();
        rows
    }

    #[test]
    fn test_none_is_sticky() {
        let storage = StorageContext::in_memory(StorageConfig::default());
        let ctx = context(&storage, 4);
        let table = Table::new(vec![("x", ints(&storage, 0..6))]).unwrap();
        let mut scan = ScanExec::new(&table, 0..6).unwrap();
        assert_eq!(scan.next_batch(&ctx).unwrap().unwrap().num_rows(), 4);
        assert_eq!(scan.next_batch(&ctx).unwrap().unwrap().num_rows(), 2);
        assert!(scan.next_batch(&ctx).unwrap().is_none());
        ctx.cancel();
        assert!(scan.next_batch(&ctx).unwrap().is_none());
    }

    #[test]
    fn test_cancel_stops_at_next_batch() {
        let storage = StorageContext::in_memory(StorageConfig::default());
        let ctx = context(&storage, 2);
        let mut plan = Plan::new();
        let r = plan.range(0, 10, "x").unwrap();
        let m = plan.map(r, vec![("y", col("x").mul(lit(2i64)))]).unwrap();
        let mut exec = build(&plan, &Prepared::default(), m, 0..10).unwrap();

        assert!(exec.next_batch(&ctx).unwrap().is_some());
        ctx.cancel();
        assert!(matches!(exec.next_batch(&ctx), Err(Error::Cancelled)));
    }

    #[test]
    fn test_fused_chain_over_partition() {
        let storage = StorageContext::in_memory(StorageConfig::default());
        let ctx = context(&storage, 3);
        let mut plan = Plan::new();
        let table = Table::new(vec![("x", ints(&storage, 0..20)), ("y", ints(&storage, 100..120))]).unwrap();
        let src = plan.source(table);
        let f = plan.filter(src, col("x").modulo(lit(2i64)).eq(lit(0i64))).unwrap();
        let m = plan.map(f, vec![("z", col("x").add(col("y"))), ("x", col("x"))]).unwrap();
        let p = plan.project(m, &["z"]).unwrap();

        let mut exec = build(&plan, &Prepared::default(), p, 5..11).unwrap();
        assert_eq!(exec.name(), "Fused");
        let rows = collect(exec.as_mut(), &ctx);
        let expected: Vec<Vec<Value>> = [6i64, 8, 10].iter().map(|x| vec![Value::Integer(2 * x + 100)]).collect();
        assert_eq!(rows, expected);
    }

    #[test]
    fn test_union_range_spans_inputs() {
        let storage = StorageContext::in_memory(StorageConfig::default());
        let ctx = context(&storage, 8);
        let mut plan = Plan::new();
        let a = plan.range(0, 3, "x").unwrap();
        let b = plan.range(10, 15, "x").unwrap();
        let u = plan.union(vec![a, b]).unwrap();

        let mut exec = build(&plan, &Prepared::default(), u, 2..5).unwrap();
        let rows = collect(exec.as_mut(), &ctx);
        assert_eq!(rows, vec![vec![Value::Integer(2)], vec![Value::Integer(10)], vec![Value::Integer(11)]]);
    }

    #[test]
    fn test_range_rows_at_integer_bounds() {
        let storage = StorageContext::in_memory(StorageConfig::default());
        let ctx = context(&storage, 8);
        let mut plan = Plan::new();
        let full = plan.range(i64::MIN, i64::MAX, "x").unwrap();
        assert_eq!(Prepared::default().row_space(&plan, full).unwrap(), u64::MAX);

        let mut exec = build(&plan, &Prepared::default(), full, u64::MAX - 3..u64::MAX).unwrap();
        let rows = collect(exec.as_mut(), &ctx);
        let expected: Vec<Vec<Value>> = (i64::MAX - 3..i64::MAX).map(|x| vec![Value::Integer(x)]).collect();
        assert_eq!(rows, expected);

        let mut head = build(&plan, &Prepared::default(), full, 0..2).unwrap();
        assert_eq!(
            collect(head.as_mut(), &ctx),
            vec![vec![Value::Integer(i64::MIN)], vec![Value::Integer(i64::MIN + 1)]]
        );

        let u = plan.union(vec![full, full]).unwrap();
        assert!(matches!(
            Prepared::default().row_space(&plan, u),
            Err(Error::InvalidOperation(_))
        ));
    }

    #[test]
    fn test_join_keeps_left_order_then_unmatched_right() {
        let storage = StorageContext::in_memory(StorageConfig::default());
        let ctx = context(&storage, 2);
        let mut plan = Plan::new();
        let left = Table::new(vec![("k", ints(&storage, [1, 2, 3])), ("v", ints(&storage, [10, 20, 30]))]).unwrap();
        let right = Table::new(vec![("k", ints(&storage, [2, 4, 2])), ("w", ints(&storage, [200, 400, 201]))]).unwrap();
        let l = plan.source(left);
        let r = plan.source(right);
        let j = plan.join(l, r, vec![("k", "k")], JoinKind::Outer).unwrap();

        let prepared = Prepared::run(&plan, j, &ctx).unwrap();
        let space = prepared.row_space(&plan, j).unwrap();
        assert_eq!(space, 4);
        let mut exec = build(&plan, &prepared, j, 0..space).unwrap();
        let rows = collect(exec.as_mut(), &ctx);
        let i = |v: i64| Value::Integer(v);
        assert_eq!(
            rows,
            vec![
                vec![i(1), i(10), Value::Missing],
                vec![i(2), i(20), i(200)],
                vec![i(2), i(20), i(201)],
                vec![i(3), i(30), Value::Missing],
                vec![i(4), Value::Missing, i(400)],
            ]
        );
    }
}
