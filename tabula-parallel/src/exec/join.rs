use std::collections::HashMap;
use std::fmt;
use std::ops::Range;
use std::sync::Arc;

use tabula_core::{Batch, Result, SchemaRef, Value};
use tabula_query::{JoinKind, JoinLayout};

use super::{BoxedExec, ExecNode};
use crate::context::QueryContext;

/// Build side of a hash join, shared by every partition
pub struct JoinState {
    schema: SchemaRef,
    kind: JoinKind,
    layout: JoinLayout,
    left_width: usize,
    right: Batch,
    table: HashMap<Vec<Value>, Vec<usize>>,
    matched: Vec<bool>,
    unmatched: Vec<usize>,
}

impl fmt::Debug for JoinState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JoinState")
            .field("kind", &self.kind)
            .field("right_rows", &self.right.num_rows())
            .field("distinct_keys", &self.table.len())
            .field("unmatched", &self.unmatched.len())
            .finish()
    }
}

fn key_of(batch: &Batch, keys: &[usize], row: usize) -> Vec<Value> {
    keys.iter().map(|&k| batch.column(k)[row].clone()).collect()
}

impl JoinState {
    /// Hash the right input by its key columns. Missing keys are ordinary
    /// key values and match each other.
    pub fn new(schema: SchemaRef, kind: JoinKind, layout: JoinLayout, left_width: usize, right: Batch) -> Self {
        let mut table: HashMap<Vec<Value>, Vec<usize>> = HashMap::new();
        for row in 0..right.num_rows() {
            table.entry(key_of(&right, &layout.right_keys, row)).or_default().push(row);
        }
        let matched = vec![false; right.num_rows()];
        Self {
            schema,
            kind,
            layout,
            left_width,
            right,
            table,
            matched,
            unmatched: Vec::new(),
        }
    }

    /// Whether right rows without a match are emitted
    pub fn keeps_unmatched_right(&self) -> bool {
        matches!(self.kind, JoinKind::Right | JoinKind::Outer)
    }

    /// Record which right rows the left rows of `batch` match
    pub fn mark_matches(&mut self, batch: &Batch) {
        for row in 0..batch.num_rows() {
            let key = key_of(batch, &self.layout.left_keys, row);
            if let Some(rows) = self.table.get(&key) {
                for &r in rows {
                    self.matched[r] = true;
                }
            }
        }
    }

    /// Fix the unmatched right rows once every left row has been marked
    pub fn finish_matching(&mut self) {
        self.unmatched = if self.keeps_unmatched_right() {
            (0..self.matched.len()).filter(|&r| !self.matched[r]).collect()
        } else {
            Vec::new()
        };
        self.matched = Vec::new();
    }

    /// Right rows emitted after the probe phase
    pub fn unmatched_rows(&self) -> usize {
        self.unmatched.len()
    }

    fn push_right(&self, out: &mut [Vec<Value>], row: Option<usize>) {
        for (slot, (i, _)) in out[self.left_width..].iter_mut().zip(&self.layout.right_outputs) {
            slot.push(row.map_or(Value::Missing, |r| self.right.column(*i)[r].clone()));
        }
    }

    fn probe(&self, batch: &Batch) -> Result<Batch> {
        let mut out: Vec<Vec<Value>> = vec![Vec::with_capacity(batch.num_rows()); self.schema.len()];
        let keep_left = matches!(self.kind, JoinKind::Left | JoinKind::Outer);
        for row in 0..batch.num_rows() {
            let key = key_of(batch, &self.layout.left_keys, row);
            let matches = self.table.get(&key).map(Vec::as_slice).unwrap_or(&[]);
            if matches.is_empty() && !keep_left {
                continue;
            }
            let repeat = matches.len().max(1);
            for c in 0..self.left_width {
                let value = &batch.column(c)[row];
                out[c].extend(std::iter::repeat(value).take(repeat).cloned());
            }
            if matches.is_empty() {
                self.push_right(&mut out, None);
            } else {
                for &r in matches {
                    self.push_right(&mut out, Some(r));
                }
            }
        }
        Batch::new(Arc::clone(&self.schema), out)
    }

    /// Unmatched right rows `range`; the left key columns carry the right
    /// key values and the other left columns are missing
    fn unmatched_batch(&self, range: Range<usize>) -> Result<Batch> {
        let rows = &self.unmatched[range];
        let mut out: Vec<Vec<Value>> = vec![Vec::with_capacity(rows.len()); self.schema.len()];
        for &r in rows {
            for (c, column) in out[..self.left_width].iter_mut().enumerate() {
                let value = match self.layout.left_keys.iter().position(|&k| k == c) {
                    Some(k) => self.right.column(self.layout.right_keys[k])[r].clone(),
                    None => Value::Missing,
                };
                column.push(value);
            }
            self.push_right(&mut out, Some(r));
        }
        Batch::with_row_count(Arc::clone(&self.schema), out, rows.len())
    }
}

/// Probes a range of the left input against the shared build side, then
/// emits a range of the unmatched right rows
pub struct JoinExec {
    state: Arc<JoinState>,
    probe: Option<BoxedExec>,
    unmatched: Range<usize>,
}

impl JoinExec {
    /// Probe `probe`'s rows, then emit unmatched right rows `unmatched`
    pub fn new(state: Arc<JoinState>, probe: Option<BoxedExec>, unmatched: Range<usize>) -> Self {
        let end = unmatched.end.min(state.unmatched_rows());
        let start = unmatched.start.min(end);
        Self {
            state,
            probe,
            unmatched: start..end,
        }
    }
}

impl ExecNode for JoinExec {
    fn name(&self) -> &'static str {
        "Join"
    }

    fn schema(&self) -> &SchemaRef {
        &self.state.schema
    }

    fn next_batch(&mut self, ctx: &QueryContext) -> Result<Option<Batch>> {
        while let Some(probe) = self.probe.as_mut() {
            ctx.check_cancelled()?;
            match probe.next_batch(ctx)? {
                Some(batch) => {
                    let out = self.state.probe(&batch)?;
                    if !out.is_empty() {
                        return Ok(Some(out));
                    }
                }
                None => self.probe = None,
            }
        }
        if self.unmatched.is_empty() {
            return Ok(None);
        }
        ctx.check_cancelled()?;
        let end = self.unmatched.end.min(self.unmatched.start + ctx.batch_size());
        let batch = self.state.unmatched_batch(self.unmatched.start..end)?;
        self.unmatched.start = end;
        Ok(Some(batch))
    }
}
