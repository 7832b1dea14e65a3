//! Logical plans: an arena of immutable query nodes
//!
//! Every builder validates its operator against the input schemas and
//! records the output schema, so a malformed plan is rejected when it is
//! built rather than when it runs.

use std::collections::HashSet;
use std::fmt::Write as _;
use std::sync::Arc;

use tabula_core::{DataType, Error, Field, Result, Schema, SchemaRef, Table};

use crate::aggregate::AggregateExpr;
use crate::expr::Expr;
use crate::node::{range_len, JoinKind, NodeId, Operator};
use crate::window::{WindowFrame, WindowFunction};

#[derive(Debug, Clone)]
struct PlanNode {
    op: Operator,
    schema: SchemaRef,
}

/// Arena of query nodes addressed by [`NodeId`]
#[derive(Debug, Clone, Default)]
pub struct Plan {
    nodes: Vec<PlanNode>,
}

/// How a join lays out its output columns
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinLayout {
    /// Key positions in the left schema
    pub left_keys: Vec<usize>,
    /// Key positions in the right schema
    pub right_keys: Vec<usize>,
    /// Right non-key columns: position in the right schema and output name
    pub right_outputs: Vec<(usize, String)>,
}

impl JoinLayout {
    /// Resolve keys and output names. Right columns whose name is taken get
    /// a `.1` suffix.
    pub fn new(left: &Schema, right: &Schema, on: &[(String, String)]) -> Result<Self> {
        if on.is_empty() {
            return Err(Error::InvalidArgument("join needs at least one key".into()));
        }
        let mut left_keys = Vec::with_capacity(on.len());
        let mut right_keys = Vec::with_capacity(on.len());
        for (l, r) in on {
            let li = left.index_of(l)?;
            let ri = right.index_of(r)?;
            let lt = left.field(li).data_type;
            let rt = right.field(ri).data_type;
            if lt != rt && lt != DataType::Dynamic && rt != DataType::Dynamic {
                return Err(Error::SchemaMismatch(format!(
                    "join key {} is {} but {} is {}",
                    l, lt, r, rt
                )));
            }
            left_keys.push(li);
            right_keys.push(ri);
        }

        let mut taken: HashSet<String> = left.names().into_iter().collect();
        let mut right_outputs = Vec::new();
        for (i, field) in right.fields().iter().enumerate() {
            if right_keys.contains(&i) {
                continue;
            }
            let mut name = field.name.clone();
            while taken.contains(&name) {
                name.push_str(".1");
            }
            taken.insert(name.clone());
            right_outputs.push((i, name));
        }
        Ok(Self {
            left_keys,
            right_keys,
            right_outputs,
        })
    }

    /// Output schema: left columns, then the right non-key columns.
    ///
    /// Joins that emit unmatched right rows fill the left key columns with
    /// right key values, so a left key whose type differs from its right key
    /// is declared `Dynamic`.
    pub fn schema(&self, left: &Schema, right: &Schema, kind: JoinKind) -> Result<Schema> {
        let mut fields = left.fields().to_vec();
        if matches!(kind, JoinKind::Right | JoinKind::Outer) {
            for (&l, &r) in self.left_keys.iter().zip(&self.right_keys) {
                if fields[l].data_type != right.field(r).data_type {
                    fields[l].data_type = DataType::Dynamic;
                }
            }
        }
        for (i, name) in &self.right_outputs {
            fields.push(Field::new(name.clone(), right.field(*i).data_type));
        }
        Schema::new(fields)
    }
}

fn predicate_type_ok(t: DataType) -> Result<()> {
    if t.is_numeric() || t == DataType::Dynamic {
        Ok(())
    } else {
        Err(Error::type_mismatch(&DataType::Integer, t))
    }
}

impl Plan {
    /// Empty plan
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of nodes in the arena, reachable or not
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Check if the arena is empty
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Operator of node `id`.
    ///
    /// # Panics
    ///
    /// When `id` does not belong to this plan.
    pub fn operator(&self, id: NodeId) -> &Operator {
        &self.nodes[id.0].op
    }

    /// Output schema of node `id`
    pub fn schema(&self, id: NodeId) -> &SchemaRef {
        &self.nodes[id.0].schema
    }

    fn check_id(&self, id: NodeId) -> Result<()> {
        if id.0 < self.nodes.len() {
            Ok(())
        } else {
            Err(Error::InvalidArgument(format!("{} is not a node of this plan", id)))
        }
    }

    /// Validate `op` and compute its output schema
    fn derive_schema(&self, op: &Operator) -> Result<SchemaRef> {
        for input in op.inputs() {
            self.check_id(input)?;
        }
        let schema = match op {
            Operator::Source { table } => return Ok(Arc::clone(table.schema())),
            Operator::Range { start, end, column } => {
                if end < start {
                    return Err(Error::InvalidArgument(format!("empty range {}..{}", start, end)));
                }
                Schema::new(vec![Field::new(column.clone(), DataType::Integer)])?
            }
            Operator::Map { input, outputs } => {
                if outputs.is_empty() {
                    return Err(Error::InvalidArgument("map needs at least one output".into()));
                }
                let input = self.schema(*input);
                let fields = outputs
                    .iter()
                    .map(|(name, expr)| Ok(Field::new(name.clone(), expr.data_type(input)?)))
                    .collect::<Result<Vec<_>>>()?;
                Schema::new(fields)?
            }
            Operator::Filter { input, predicate } => {
                predicate_type_ok(predicate.data_type(self.schema(*input))?)?;
                return Ok(Arc::clone(self.schema(*input)));
            }
            Operator::Project { input, columns } => self.schema(*input).project(columns)?,
            Operator::Union { inputs } => {
                let first = inputs
                    .first()
                    .ok_or_else(|| Error::InvalidArgument("union needs at least one input".into()))?;
                let schema = self.schema(*first);
                if let Some(other) = inputs.iter().map(|i| self.schema(*i)).find(|s| s != &schema) {
                    return Err(Error::SchemaMismatch(format!(
                        "cannot union {} with {}",
                        schema, other
                    )));
                }
                return Ok(Arc::clone(schema));
            }
            Operator::Join { left, right, on, kind } => {
                let (l, r) = (self.schema(*left), self.schema(*right));
                JoinLayout::new(l, r, on)?.schema(l, r, *kind)?
            }
            Operator::Reduce {
                input,
                group_by,
                aggregates,
            } => {
                let input = self.schema(*input);
                let mut fields = group_by
                    .iter()
                    .map(|name| input.field_by_name(name).cloned())
                    .collect::<Result<Vec<_>>>()?;
                for agg in aggregates {
                    fields.push(Field::new(agg.output.clone(), agg.output_type(input)?));
                }
                if fields.is_empty() {
                    return Err(Error::InvalidArgument("reduce produces no columns".into()));
                }
                Schema::new(fields)?
            }
            Operator::Window {
                input,
                column,
                function,
                frame,
                output,
            } => {
                frame.validate()?;
                let input = self.schema(*input);
                let data_type = function.output_type(input.field_by_name(column)?.data_type)?;
                let mut fields = input.fields().to_vec();
                fields.push(Field::new(output.clone(), data_type));
                Schema::new(fields)?
            }
            Operator::Slice { input, start, end } => {
                if end < start {
                    return Err(Error::InvalidArgument(format!("empty slice {}..{}", start, end)));
                }
                return Ok(Arc::clone(self.schema(*input)));
            }
        };
        Ok(Arc::new(schema))
    }

    /// Validate and append a node
    pub fn add(&mut self, op: Operator) -> Result<NodeId> {
        let schema = self.derive_schema(&op)?;
        self.nodes.push(PlanNode { op, schema });
        Ok(NodeId(self.nodes.len() - 1))
    }

    /// Swap the operator of `id` for an equivalent one with the same output
    /// schema
    pub(crate) fn replace(&mut self, id: NodeId, op: Operator) -> Result<()> {
        let schema = self.derive_schema(&op)?;
        if schema != self.nodes[id.0].schema {
            return Err(Error::InvalidOperation(format!(
                "rewrite of {} changes its schema from {} to {}",
                id, self.nodes[id.0].schema, schema
            )));
        }
        self.nodes[id.0] = PlanNode { op, schema };
        Ok(())
    }

    /// Rows of a table
    pub fn source(&mut self, table: Table) -> NodeId {
        let schema = Arc::clone(table.schema());
        self.nodes.push(PlanNode {
            op: Operator::Source { table },
            schema,
        });
        NodeId(self.nodes.len() - 1)
    }

    /// Integers `start..end` in column `column`
    pub fn range(&mut self, start: i64, end: i64, column: impl Into<String>) -> Result<NodeId> {
        self.add(Operator::Range {
            start,
            end,
            column: column.into(),
        })
    }

    /// Row-wise expressions
    pub fn map<S: Into<String>>(&mut self, input: NodeId, outputs: Vec<(S, Expr)>) -> Result<NodeId> {
        self.add(Operator::Map {
            input,
            outputs: outputs.into_iter().map(|(n, e)| (n.into(), e)).collect(),
        })
    }

    /// Keep rows where `predicate` holds
    pub fn filter(&mut self, input: NodeId, predicate: Expr) -> Result<NodeId> {
        self.add(Operator::Filter { input, predicate })
    }

    /// Keep and reorder columns
    pub fn project<S: AsRef<str>>(&mut self, input: NodeId, columns: &[S]) -> Result<NodeId> {
        self.add(Operator::Project {
            input,
            columns: columns.iter().map(|c| c.as_ref().to_string()).collect(),
        })
    }

    /// Concatenate same-schema inputs
    pub fn union(&mut self, inputs: Vec<NodeId>) -> Result<NodeId> {
        self.add(Operator::Union { inputs })
    }

    /// Equality join
    pub fn join<L: Into<String>, R: Into<String>>(
        &mut self,
        left: NodeId,
        right: NodeId,
        on: Vec<(L, R)>,
        kind: JoinKind,
    ) -> Result<NodeId> {
        self.add(Operator::Join {
            left,
            right,
            on: on.into_iter().map(|(l, r)| (l.into(), r.into())).collect(),
            kind,
        })
    }

    /// Grouped (or, with no keys, global) aggregation
    pub fn reduce<S: AsRef<str>>(
        &mut self,
        input: NodeId,
        group_by: &[S],
        aggregates: Vec<AggregateExpr>,
    ) -> Result<NodeId> {
        self.add(Operator::Reduce {
            input,
            group_by: group_by.iter().map(|c| c.as_ref().to_string()).collect(),
            aggregates,
        })
    }

    /// Window aggregate appended as column `output`
    pub fn window(
        &mut self,
        input: NodeId,
        column: impl Into<String>,
        function: WindowFunction,
        frame: WindowFrame,
        output: impl Into<String>,
    ) -> Result<NodeId> {
        self.add(Operator::Window {
            input,
            column: column.into(),
            function,
            frame,
            output: output.into(),
        })
    }

    /// Rows `start..end`
    pub fn slice(&mut self, input: NodeId, start: u64, end: u64) -> Result<NodeId> {
        self.add(Operator::Slice { input, start, end })
    }

    /// Row count when it follows from the plan alone
    pub fn known_rows(&self, id: NodeId) -> Option<u64> {
        match self.operator(id) {
            Operator::Source { table } => Some(table.num_rows()),
            Operator::Range { start, end, .. } => Some(range_len(*start, *end)),
            Operator::Map { input, .. } | Operator::Project { input, .. } | Operator::Window { input, .. } => {
                self.known_rows(*input)
            }
            Operator::Filter { input, predicate } => {
                if predicate.is_always_false() {
                    Some(0)
                } else {
                    self.known_rows(*input).filter(|&n| n == 0)
                }
            }
            Operator::Union { inputs } => inputs
                .iter()
                .try_fold(0u64, |total, i| total.checked_add(self.known_rows(*i)?)),
            Operator::Join { left, right, kind, .. } => {
                let l = self.known_rows(*left);
                let r = self.known_rows(*right);
                match kind {
                    _ if l == Some(0) && r == Some(0) => Some(0),
                    JoinKind::Inner if l == Some(0) || r == Some(0) => Some(0),
                    JoinKind::Left if l == Some(0) => Some(0),
                    JoinKind::Right if r == Some(0) => Some(0),
                    _ => None,
                }
            }
            Operator::Reduce { input, group_by, .. } => {
                if group_by.is_empty() {
                    Some(1)
                } else {
                    self.known_rows(*input).filter(|&n| n == 0)
                }
            }
            Operator::Slice { input, start, end } => {
                let n = self.known_rows(*input)?;
                Some(end.min(&n).saturating_sub(*start.min(&n)))
            }
        }
    }

    /// Nodes reachable from `root`, inputs before the nodes reading them
    pub fn reachable(&self, root: NodeId) -> Vec<NodeId> {
        let mut order = Vec::new();
        let mut visited = HashSet::new();
        // (node, inputs already pushed)
        let mut stack = vec![(root, false)];
        while let Some((id, expanded)) = stack.pop() {
            if expanded {
                order.push(id);
                continue;
            }
            if !visited.insert(id) {
                continue;
            }
            stack.push((id, true));
            for input in self.operator(id).inputs().into_iter().rev() {
                if !visited.contains(&input) {
                    stack.push((input, false));
                }
            }
        }
        order
    }

    /// Copy of the plan holding only nodes reachable from `root`
    pub fn compact(&self, root: NodeId) -> (Plan, NodeId) {
        let order = self.reachable(root);
        let mut remap = vec![None; self.nodes.len()];
        let mut nodes = Vec::with_capacity(order.len());
        for id in order {
            let op = self.nodes[id.0]
                .op
                .map_inputs(|input| remap[input.0].unwrap_or(input));
            remap[id.0] = Some(NodeId(nodes.len()));
            nodes.push(PlanNode {
                op,
                schema: Arc::clone(&self.nodes[id.0].schema),
            });
        }
        let new_root = remap[root.0].unwrap_or(NodeId(0));
        (Plan { nodes }, new_root)
    }

    /// Render the tree below `root`
    pub fn explain(&self, root: NodeId) -> String {
        let mut out = String::new();
        self.explain_into(root, 0, &mut out);
        out
    }

    fn explain_into(&self, id: NodeId, depth: usize, out: &mut String) {
        let _ = writeln!(out, "{:indent$}{} {}", "", self.operator(id), id, indent = depth * 2);
        for input in self.operator(id).inputs() {
            self.explain_into(input, depth + 1, out);
        }
    }
}
