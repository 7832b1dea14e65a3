//! Sequential pre-passes for nodes that need to see their whole input
//!
//! Before the parallel phase every Reduce, Window and Join node reachable
//! from the root is prepared, inputs first. Reduce and Window results, and
//! Slices over inputs whose row space does not match their row count, are
//! written to scratch tables that the partitions then scan. A Join hashes
//! its right input and, for Right and Outer joins, finds the right rows no
//! left row matches. This is the synchronization point of a
//! materialization: no partition starts until every pre-pass is done.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use tabula_core::{Batch, DataType, Error, Result, SchemaRef, Table, Value};
use tabula_query::{
    range_len, Accumulator, AggregateExpr, AggregateFunction, JoinKind, JoinLayout, NodeId, Operator, Plan,
    WindowFrame, WindowFunction,
};
use tracing::debug;

use crate::context::QueryContext;
use crate::exec::{build, drain, JoinState};
use crate::sink::TableSink;

/// Shared state produced by the pre-passes of one plan
#[derive(Debug, Default)]
pub struct Prepared {
    tables: HashMap<NodeId, Table>,
    joins: HashMap<NodeId, Arc<JoinState>>,
}

impl Prepared {
    /// Run the pre-passes of every node reachable from `root`
    pub fn run(plan: &Plan, root: NodeId, ctx: &QueryContext) -> Result<Self> {
        let mut prepared = Self::default();
        for id in plan.reachable(root) {
            let start = Instant::now();
            match plan.operator(id) {
                Operator::Reduce {
                    input,
                    group_by,
                    aggregates,
                } => {
                    let table = prepared.reduce(plan, id, *input, group_by, aggregates, ctx)?;
                    prepared.tables.insert(id, table);
                }
                Operator::Window {
                    input,
                    column,
                    function,
                    frame,
                    ..
                } => {
                    let table = prepared.window(plan, id, *input, column, *function, frame, ctx)?;
                    prepared.tables.insert(id, table);
                }
                Operator::Slice { input, start, end } if !prepared.is_exact(plan, *input) => {
                    let table = prepared.slice(plan, id, *input, *start, *end, ctx)?;
                    prepared.tables.insert(id, table);
                }
                Operator::Join {
                    left,
                    right,
                    on,
                    kind,
                } => {
                    let state = prepared.join_state(plan, id, *left, *right, on, *kind, ctx)?;
                    prepared.joins.insert(id, Arc::new(state));
                }
                _ => continue,
            }
            debug!(
                node = %id,
                op = plan.operator(id).name(),
                elapsed_ms = start.elapsed().as_millis() as u64,
                "pre-pass finished"
            );
        }
        Ok(prepared)
    }

    /// Scratch table holding the output of node `id`, if it was prepared
    pub fn table(&self, id: NodeId) -> Option<&Table> {
        self.tables.get(&id)
    }

    /// Build side of join `id`
    pub fn join(&self, id: NodeId) -> Option<&Arc<JoinState>> {
        self.joins.get(&id)
    }

    /// Whether the row space of `id` equals its row count
    pub fn is_exact(&self, plan: &Plan, id: NodeId) -> bool {
        if self.tables.contains_key(&id) {
            return true;
        }
        match plan.operator(id) {
            Operator::Source { .. } | Operator::Range { .. } | Operator::Slice { .. } => true,
            Operator::Map { input, .. } | Operator::Project { input, .. } => self.is_exact(plan, *input),
            Operator::Union { inputs } => inputs.iter().all(|i| self.is_exact(plan, *i)),
            Operator::Filter { .. } | Operator::Join { .. } => false,
            Operator::Reduce { .. } | Operator::Window { .. } => true,
        }
    }

    /// Size of the row space of `id`
    pub fn row_space(&self, plan: &Plan, id: NodeId) -> Result<u64> {
        if let Some(table) = self.tables.get(&id) {
            return Ok(table.num_rows());
        }
        Ok(match plan.operator(id) {
            Operator::Source { table } => table.num_rows(),
            Operator::Range { start, end, .. } => range_len(*start, *end),
            Operator::Map { input, .. } | Operator::Filter { input, .. } | Operator::Project { input, .. } => {
                self.row_space(plan, *input)?
            }
            Operator::Union { inputs } => {
                let mut total = 0u64;
                for input in inputs {
                    total = total
                        .checked_add(self.row_space(plan, *input)?)
                        .ok_or_else(|| too_many_rows(plan, id))?;
                }
                total
            }
            Operator::Join { left, .. } => {
                let state = self
                    .join(id)
                    .ok_or_else(|| Error::InvalidOperation(format!("join {} was not prepared", id)))?;
                self.row_space(plan, *left)?
                    .checked_add(state.unmatched_rows() as u64)
                    .ok_or_else(|| too_many_rows(plan, id))?
            }
            Operator::Slice { input, start, end } => {
                let n = self.row_space(plan, *input)?;
                (*end).min(n).saturating_sub((*start).min(n))
            }
            Operator::Reduce { .. } | Operator::Window { .. } => {
                return Err(Error::InvalidOperation(format!(
                    "{} {} was not prepared",
                    plan.operator(id).name(),
                    id
                )))
            }
        })
    }

    /// Pull every row of `id` through `consume`, on the calling thread
    fn scan_all(
        &self,
        plan: &Plan,
        id: NodeId,
        ctx: &QueryContext,
        consume: impl FnMut(Batch) -> Result<bool>,
    ) -> Result<()> {
        let rows = self.row_space(plan, id)?;
        let mut exec = build(plan, self, id, 0..rows)?;
        drain(exec.as_mut(), ctx, consume)
    }

    fn reduce(
        &self,
        plan: &Plan,
        id: NodeId,
        input: NodeId,
        group_by: &[String],
        aggregates: &[AggregateExpr],
        ctx: &QueryContext,
    ) -> Result<Table> {
        let schema = plan.schema(input);
        let keys = group_by
            .iter()
            .map(|name| schema.index_of(name))
            .collect::<Result<Vec<_>>>()?;
        let mut inputs = Vec::with_capacity(aggregates.len());
        for agg in aggregates {
            let value = agg.input.as_deref().map(|name| schema.index_of(name)).transpose()?;
            let extra = match &agg.func {
                AggregateFunction::ArgMin { value } | AggregateFunction::ArgMax { value } => {
                    Some(schema.index_of(value)?)
                }
                _ => None,
            };
            let input_type: Option<DataType> = value.map(|i| schema.field(i).data_type);
            inputs.push((value, extra, input_type));
        }
        let fresh = || -> Vec<Box<dyn Accumulator>> {
            aggregates
                .iter()
                .zip(&inputs)
                .map(|(agg, (_, _, input_type))| agg.func.accumulator(*input_type))
                .collect()
        };

        // groups in order of first appearance
        let mut groups: Vec<(Vec<Value>, Vec<Box<dyn Accumulator>>)> = Vec::new();
        let mut index: HashMap<Vec<Value>, usize> = HashMap::new();
        if keys.is_empty() {
            groups.push((Vec::new(), fresh()));
            index.insert(Vec::new(), 0);
        }
        let missing = Value::Missing;
        self.scan_all(plan, input, ctx, |batch| {
            for row in 0..batch.num_rows() {
                let key: Vec<Value> = keys.iter().map(|&k| batch.column(k)[row].clone()).collect();
                let group = match index.get(&key) {
                    Some(&g) => g,
                    None => {
                        groups.push((key.clone(), fresh()));
                        index.insert(key, groups.len() - 1);
                        groups.len() - 1
                    }
                };
                for (acc, (value, extra, _)) in groups[group].1.iter_mut().zip(&inputs) {
                    let v = value.map_or(&missing, |i| &batch.column(i)[row]);
                    let e = extra.map_or(&missing, |i| &batch.column(i)[row]);
                    acc.update(v, e)?;
                }
            }
            Ok(true)
        })?;
        debug!(node = %id, groups = groups.len(), "reduce grouped input");

        let out_schema = Arc::clone(plan.schema(id));
        let mut sink = TableSink::new(ctx.storage(), Arc::clone(&out_schema))?;
        for chunk in groups.chunks(ctx.batch_size()) {
            let mut columns: Vec<Vec<Value>> = vec![Vec::with_capacity(chunk.len()); out_schema.len()];
            for (key, accs) in chunk {
                for (c, value) in key.iter().enumerate() {
                    columns[c].push(value.clone());
                }
                for (a, acc) in accs.iter().enumerate() {
                    columns[keys.len() + a].push(acc.finish());
                }
            }
            sink.append(Batch::with_row_count(Arc::clone(&out_schema), columns, chunk.len())?)?;
        }
        sink.finish()
    }

    #[allow(clippy::too_many_arguments)]
    fn window(
        &self,
        plan: &Plan,
        id: NodeId,
        input: NodeId,
        column: &str,
        function: WindowFunction,
        frame: &WindowFrame,
        ctx: &QueryContext,
    ) -> Result<Table> {
        let index = plan.schema(input).index_of(column)?;
        let out_schema: SchemaRef = Arc::clone(plan.schema(id));
        let output = out_schema.len() - 1;
        let mut sink = TableSink::new(ctx.storage(), out_schema)?;
        let mut values = Vec::new();
        self.scan_all(plan, input, ctx, |batch| {
            values.extend_from_slice(batch.column(index));
            for (c, column) in batch.into_columns().into_iter().enumerate() {
                sink.append_column(c, column)?;
            }
            Ok(true)
        })?;
        sink.append_column(output, frame.compute(function, &values)?)?;
        sink.finish()
    }

    fn slice(&self, plan: &Plan, id: NodeId, input: NodeId, start: u64, end: u64, ctx: &QueryContext) -> Result<Table> {
        let mut sink = TableSink::new(ctx.storage(), Arc::clone(plan.schema(id)))?;
        let mut position = 0u64;
        self.scan_all(plan, input, ctx, |batch| {
            let rows = batch.num_rows() as u64;
            let from = start.max(position).min(position + rows);
            let to = end.max(position).min(position + rows);
            if from < to {
                sink.append(batch.slice((from - position) as usize, (to - from) as usize)?)?;
            }
            position += rows;
            Ok(position < end)
        })?;
        sink.finish()
    }

    #[allow(clippy::too_many_arguments)]
    fn join_state(
        &self,
        plan: &Plan,
        id: NodeId,
        left: NodeId,
        right: NodeId,
        on: &[(String, String)],
        kind: JoinKind,
        ctx: &QueryContext,
    ) -> Result<JoinState> {
        let left_schema = plan.schema(left);
        let right_schema = plan.schema(right);
        let layout = JoinLayout::new(left_schema, right_schema, on)?;

        let mut batches = Vec::new();
        self.scan_all(plan, right, ctx, |batch| {
            batches.push(batch);
            Ok(true)
        })?;
        let right_rows = Batch::concat(Arc::clone(right_schema), &batches)?;
        drop(batches);

        let mut state = JoinState::new(
            Arc::clone(plan.schema(id)),
            kind,
            layout,
            left_schema.len(),
            right_rows,
        );
        if state.keeps_unmatched_right() {
            self.scan_all(plan, left, ctx, |batch| {
                state.mark_matches(&batch);
                Ok(true)
            })?;
        }
        state.finish_matching();
        debug!(node = %id, state = ?state, "join build side ready");
        Ok(state)
    }
}

fn too_many_rows(plan: &Plan, id: NodeId) -> Error {
    Error::InvalidOperation(format!("{} {} has more than {} rows", plan.operator(id).name(), id, u64::MAX))
}
