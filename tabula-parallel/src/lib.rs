//! Parallel execution of tabula query plans
//!
//! A plan is materialized in three steps: the optimizer rewrites it, the
//! sequential pre-passes build the state of nodes that must see their whole
//! input, and the root's row space is split into partitions that run as
//! independent pull pipelines on a shared worker pool. Each partition
//! writes its own segments; they become the output table only once every
//! partition has succeeded.

#![warn(missing_docs)]

pub mod context;
pub mod engine;
pub mod exec;
pub mod materialize;
pub mod pool;
pub mod prepare;
pub mod sink;

pub use context::{CancelHandle, ExecutionConfig, QueryContext};
pub use engine::{Engine, EngineConfig};
pub use exec::{ExecNode, FusedExec};
pub use materialize::{materialize, materialize_with_stats, MaterializeStats};
pub use pool::WorkerPool;
pub use prepare::Prepared;
pub use sink::TableSink;
