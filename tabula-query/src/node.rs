//! Query node operators

use std::fmt;

use tabula_core::Table;

use crate::aggregate::AggregateExpr;
use crate::expr::Expr;
use crate::window::{WindowFrame, WindowFunction};

/// Handle of a node inside a [`Plan`](crate::Plan)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub(crate) usize);

impl NodeId {
    /// Position in the plan arena
    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Join flavours
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JoinKind {
    /// Only matching rows
    Inner,
    /// Every left row, matched or not
    Left,
    /// Every right row, matched or not
    Right,
    /// Every row of both sides
    Outer,
}

impl fmt::Display for JoinKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JoinKind::Inner => "inner",
            JoinKind::Left => "left",
            JoinKind::Right => "right",
            JoinKind::Outer => "outer",
        };
        f.write_str(s)
    }
}

/// One lazy relational operation. Nodes never hold data besides the
/// tables wrapped by `Source`.
#[derive(Debug, Clone)]
pub enum Operator {
    /// Rows of an existing table
    Source {
        /// The table
        table: Table,
    },
    /// Integers `start..end` in a single column
    Range {
        /// First value
        start: i64,
        /// One past the last value
        end: i64,
        /// Output column name
        column: String,
    },
    /// Row-wise expressions; the output holds exactly these columns
    Map {
        /// Input node
        input: NodeId,
        /// Output name and expression, in order
        outputs: Vec<(String, Expr)>,
    },
    /// Rows for which the predicate is present and truthy
    Filter {
        /// Input node
        input: NodeId,
        /// Row predicate
        predicate: Expr,
    },
    /// Column subset and reorder
    Project {
        /// Input node
        input: NodeId,
        /// Kept columns, in output order
        columns: Vec<String>,
    },
    /// Concatenation of same-schema inputs, in input order
    Union {
        /// Inputs
        inputs: Vec<NodeId>,
    },
    /// Equality join on key columns
    Join {
        /// Left input
        left: NodeId,
        /// Right input
        right: NodeId,
        /// `(left column, right column)` key pairs
        on: Vec<(String, String)>,
        /// Join flavour
        kind: JoinKind,
    },
    /// Grouped or global aggregation
    Reduce {
        /// Input node
        input: NodeId,
        /// Key columns; empty for a single global group
        group_by: Vec<String>,
        /// Aggregates appended after the keys
        aggregates: Vec<AggregateExpr>,
    },
    /// Rolling or cumulative aggregate appended as a new column
    Window {
        /// Input node
        input: NodeId,
        /// Aggregated column
        column: String,
        /// Function
        function: WindowFunction,
        /// Frame
        frame: WindowFrame,
        /// Output column name
        output: String,
    },
    /// Rows `start..end` of the input
    Slice {
        /// Input node
        input: NodeId,
        /// First row
        start: u64,
        /// One past the last row; clamped to the input length
        end: u64,
    },
}

/// Number of integers in `start..end`; zero when `end < start`
pub fn range_len(start: i64, end: i64) -> u64 {
    u64::try_from(i128::from(end) - i128::from(start)).unwrap_or(0)
}

/// The `offset`-th integer of `start..end`, clamped to `end`
pub fn range_value(start: i64, end: i64, offset: u64) -> i64 {
    let value = (i128::from(start) + i128::from(offset)).min(i128::from(end));
    i64::try_from(value).unwrap_or(end)
}

impl Operator {
    /// Input nodes, in order
    pub fn inputs(&self) -> Vec<NodeId> {
        match self {
            Operator::Source { .. } | Operator::Range { .. } => Vec::new(),
            Operator::Map { input, .. }
            | Operator::Filter { input, .. }
            | Operator::Project { input, .. }
            | Operator::Reduce { input, .. }
            | Operator::Window { input, .. }
            | Operator::Slice { input, .. } => vec![*input],
            Operator::Union { inputs } => inputs.clone(),
            Operator::Join { left, right, .. } => vec![*left, *right],
        }
    }

    /// Rewrite input handles through `f`
    pub(crate) fn map_inputs(&self, mut f: impl FnMut(NodeId) -> NodeId) -> Operator {
        let mut op = self.clone();
        match &mut op {
            Operator::Source { .. } | Operator::Range { .. } => {}
            Operator::Map { input, .. }
            | Operator::Filter { input, .. }
            | Operator::Project { input, .. }
            | Operator::Reduce { input, .. }
            | Operator::Window { input, .. }
            | Operator::Slice { input, .. } => *input = f(*input),
            Operator::Union { inputs } => inputs.iter_mut().for_each(|i| *i = f(*i)),
            Operator::Join { left, right, .. } => {
                *left = f(*left);
                *right = f(*right);
            }
        }
        op
    }

    /// Whether every output row comes from exactly one input row at the
    /// same relative position, so a row range of the output maps onto a
    /// row range of the input
    pub fn is_row_streaming(&self) -> bool {
        matches!(
            self,
            Operator::Map { .. } | Operator::Filter { .. } | Operator::Project { .. }
        )
    }

    /// Short operator name
    pub fn name(&self) -> &'static str {
        match self {
            Operator::Source { .. } => "Source",
            Operator::Range { .. } => "Range",
            Operator::Map { .. } => "Map",
            Operator::Filter { .. } => "Filter",
            Operator::Project { .. } => "Project",
            Operator::Union { .. } => "Union",
            Operator::Join { .. } => "Join",
            Operator::Reduce { .. } => "Reduce",
            Operator::Window { .. } => "Window",
            Operator::Slice { .. } => "Slice",
        }
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operator::Source { table } => write!(f, "Source: {} rows {}", table.num_rows(), table.schema()),
            Operator::Range { start, end, column } => write!(f, "Range: {} in {}..{}", column, start, end),
            Operator::Map { outputs, .. } => {
                write!(f, "Map: ")?;
                for (i, (name, expr)) in outputs.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{} := {}", name, expr)?;
                }
                Ok(())
            }
            Operator::Filter { predicate, .. } => write!(f, "Filter: {}", predicate),
            Operator::Project { columns, .. } => write!(f, "Project: {}", columns.join(", ")),
            Operator::Union { inputs } => write!(f, "Union: {} inputs", inputs.len()),
            Operator::Join { on, kind, .. } => {
                let keys: Vec<String> = on.iter().map(|(l, r)| format!("{} = {}", l, r)).collect();
                write!(f, "Join ({}): {}", kind, keys.join(", "))
            }
            Operator::Reduce {
                group_by,
                aggregates,
                ..
            } => {
                let aggs: Vec<String> = aggregates.iter().map(ToString::to_string).collect();
                write!(f, "Reduce: by [{}] {}", group_by.join(", "), aggs.join(", "))
            }
            Operator::Window {
                column,
                function,
                frame,
                output,
                ..
            } => write!(f, "Window: {} := {}({}) over {:?}", output, function, column, frame),
            Operator::Slice { start, end, .. } => write!(f, "Slice: {}..{}", start, end),
        }
    }
}
