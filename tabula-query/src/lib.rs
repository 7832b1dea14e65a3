//! Lazy query layer for tabula
//!
//! Queries are built as a [`Plan`]: an arena of immutable operator nodes
//! over tables, validated as they are added. Nothing is read until the plan
//! is handed to an executor. The [`Optimizer`] rewrites a plan into an
//! equivalent one before execution.

#![warn(missing_docs)]

pub mod aggregate;
pub mod expr;
pub mod node;
pub mod optimizer;
pub mod plan;
pub mod window;

pub use aggregate::{Accumulator, AggregateExpr, AggregateFunction};
pub use expr::{call, col, compare_values, lit, BinaryOp, BoundExpr, Expr, FnUdf, ScalarUdf, UnaryOp};
pub use node::{range_len, range_value, JoinKind, NodeId, Operator};
pub use optimizer::{OptimizeRule, Optimizer, DEFAULT_MAX_ITERATIONS};
pub use plan::{JoinLayout, Plan};
pub use window::{WindowFrame, WindowFunction};
