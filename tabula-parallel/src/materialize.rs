//! Driving a plan to completion into a new table

use std::fmt;
use std::ops::Range;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tabula_core::{Column, Error, Result, Segment, Table};
use tabula_query::{NodeId, Optimizer, Plan};
use tracing::{debug, info, instrument, trace};

use crate::context::QueryContext;
use crate::exec::{build, drain};
use crate::prepare::Prepared;
use crate::sink::TableSink;

/// Statistics from one materialization
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MaterializeStats {
    /// Rows written
    pub rows: u64,

    /// Batches written
    pub batches: u64,

    /// Partitions the row space was split into
    pub partitions: usize,

    /// Wall time, pre-passes included
    pub elapsed: Duration,
}

impl fmt::Display for MaterializeStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} rows in {} batches over {} partitions in {:?}",
            self.rows, self.batches, self.partitions, self.elapsed
        )
    }
}

/// Output of one partition: a sealed segment per column
struct PartitionOutput {
    segments: Vec<Arc<Segment>>,
    rows: u64,
    batches: u64,
}

/// Split `0..total` into at most `parts` contiguous, ascending ranges
pub fn partition_ranges(total: u64, parts: usize) -> Vec<Range<u64>> {
    if total == 0 {
        return Vec::new();
    }
    let parts = (parts.max(1) as u64).min(total);
    let chunk = total.div_ceil(parts);
    (0..parts)
        .map(|i| (i * chunk).min(total)..((i + 1) * chunk).min(total))
        .filter(|r| !r.is_empty())
        .collect()
}

/// Evaluate the plan below `root` into a new table
pub fn materialize(plan: &Plan, root: NodeId, ctx: &QueryContext) -> Result<Table> {
    materialize_with_stats(plan, root, ctx).map(|(table, _)| table)
}

/// Evaluate the plan below `root` into a new table.
///
/// The plan is optimized (unless disabled), the pre-passes run, and the
/// root's row space is split into one contiguous range per partition. The
/// partitions run on the worker pool and each writes its own segment per
/// output column. Only when every partition succeeded are the segments
/// assembled, in range order, into the output columns; on any error every
/// segment written so far is dropped, which deletes its file.
#[instrument(skip_all, fields(root = %root))]
pub fn materialize_with_stats(plan: &Plan, root: NodeId, ctx: &QueryContext) -> Result<(Table, MaterializeStats)> {
    let started = Instant::now();
    ctx.check_cancelled()?;

    let (plan, root) = if ctx.config().optimize {
        Optimizer::new(ctx.config().optimizer_max_iterations).optimize(plan, root)?
    } else {
        plan.compact(root)
    };
    debug!(plan = %plan.explain(root), "executing plan");

    let prepared = Prepared::run(&plan, root, ctx)?;
    let total = prepared.row_space(&plan, root)?;
    let ranges = partition_ranges(total, ctx.parallelism());
    let schema = Arc::clone(plan.schema(root));

    let plan = Arc::new(plan);
    let prepared = Arc::new(prepared);
    let failed = Arc::new(AtomicBool::new(false));
    let (tx, rx) = crossbeam::channel::unbounded();
    for (index, rows) in ranges.iter().cloned().enumerate() {
        let plan = Arc::clone(&plan);
        let prepared = Arc::clone(&prepared);
        let failed = Arc::clone(&failed);
        let ctx = ctx.clone();
        let tx = tx.clone();
        let pool = ctx.pool().clone();
        pool.spawn(move || {
            let result = run_partition(&plan, &prepared, root, rows, &ctx, &failed);
            if result.is_err() {
                failed.store(true, Ordering::SeqCst);
            }
            // release shared state before the coordinator can return
            drop(prepared);
            drop(plan);
            let _ = tx.send((index, result));
        });
    }
    drop(tx);

    let mut outputs: Vec<Option<PartitionOutput>> = ranges.iter().map(|_| None).collect();
    let mut error: Option<Error> = None;
    for (index, result) in rx.iter() {
        match result {
            Ok(output) => outputs[index] = Some(output),
            // partitions stopped because a sibling failed report Cancelled;
            // keep the error that caused it
            Err(e) => {
                if !error.as_ref().is_some_and(|kept| !kept.is_cancelled()) {
                    error = Some(e);
                }
            }
        }
    }
    drop(prepared);
    if let Some(e) = error {
        debug!(error = %e, "materialization failed, discarding partition output");
        return Err(e);
    }
    let outputs = outputs
        .into_iter()
        .collect::<Option<Vec<_>>>()
        .ok_or_else(|| Error::InvalidOperation("a partition worker exited without reporting".into()))?;

    let mut stats = MaterializeStats {
        partitions: outputs.len(),
        ..MaterializeStats::default()
    };
    let mut per_column: Vec<Vec<Arc<Segment>>> = vec![Vec::with_capacity(outputs.len()); schema.len()];
    for output in outputs {
        stats.rows += output.rows;
        stats.batches += output.batches;
        for (column, segment) in per_column.iter_mut().zip(output.segments) {
            if !segment.is_empty() {
                column.push(segment);
            }
        }
    }
    let columns = per_column
        .into_iter()
        .zip(schema.fields())
        .map(|(segments, field)| Column::from_segments(ctx.storage(), field.data_type, segments))
        .collect::<Result<Vec<_>>>()?;
    let table = Table::from_columns(schema, columns)?;
    stats.elapsed = started.elapsed();
    info!(
        rows = stats.rows,
        batches = stats.batches,
        partitions = stats.partitions,
        elapsed_ms = stats.elapsed.as_millis() as u64,
        "materialized"
    );
    Ok((table, stats))
}

fn run_partition(
    plan: &Plan,
    prepared: &Prepared,
    root: NodeId,
    rows: Range<u64>,
    ctx: &QueryContext,
    failed: &AtomicBool,
) -> Result<PartitionOutput> {
    trace!(start = rows.start, end = rows.end, "partition started");
    let mut exec = build(plan, prepared, root, rows)?;
    let mut sink = TableSink::new(ctx.storage(), Arc::clone(plan.schema(root)))?;
    let mut batches = 0;
    drain(exec.as_mut(), ctx, |batch| {
        if failed.load(Ordering::SeqCst) {
            return Err(Error::Cancelled);
        }
        sink.append(batch)?;
        batches += 1;
        Ok(true)
    })?;
    let rows = sink.rows();
    Ok(PartitionOutput {
        segments: sink.finish_segments()?,
        rows,
        batches,
    })
}
