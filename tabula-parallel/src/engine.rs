//! Composition root: owns the storage context and the worker pool

use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tabula_core::config::load_json;
use tabula_core::{open_table, Result, StorageConfig, StorageContext, StorageRef, Table};
use tabula_query::{NodeId, Plan};
use tracing::info;

use crate::context::{ExecutionConfig, QueryContext};
use crate::materialize::{materialize_with_stats, MaterializeStats};
use crate::pool::WorkerPool;

/// Storage and execution settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Block, cache and file settings
    pub storage: StorageConfig,

    /// Partitioning, batching and optimizer settings
    pub execution: ExecutionConfig,
}

impl EngineConfig {
    /// Load from a JSON file; absent keys keep their defaults
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        load_json(path.as_ref())
    }
}

/// Owns the process-wide storage state and workers. Every query context
/// it hands out shares them.
#[derive(Debug)]
pub struct Engine {
    storage: StorageRef,
    pool: WorkerPool,
    execution: ExecutionConfig,
}

impl Engine {
    /// Open storage on the local filesystem and start the worker pool
    pub fn new(config: EngineConfig) -> Result<Self> {
        let storage = StorageContext::new(config.storage)?;
        Self::with_storage(storage, config.execution)
    }

    /// Use an existing storage context, e.g. an in-memory one
    pub fn with_storage(storage: StorageRef, execution: ExecutionConfig) -> Result<Self> {
        let pool = WorkerPool::new(execution.worker_threads)?;
        info!(
            workers = pool.num_threads(),
            parallelism = execution.parallelism,
            scratch = %storage.scratch_dir().display(),
            "engine started"
        );
        Ok(Self {
            storage,
            pool,
            execution,
        })
    }

    /// The storage context
    pub fn storage(&self) -> &StorageRef {
        &self.storage
    }

    /// The shared worker pool
    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    /// Execution settings used for new query contexts
    pub fn execution_config(&self) -> &ExecutionConfig {
        &self.execution
    }

    /// Open a table saved with [`Table::save`]
    pub fn open_table(&self, dir: impl AsRef<Path>) -> Result<Table> {
        open_table(&self.storage, dir)
    }

    /// Fresh context with the engine's settings
    pub fn query_context(&self) -> QueryContext {
        self.query_context_with(self.execution.clone())
    }

    /// Fresh context with custom settings; storage and workers are shared
    pub fn query_context_with(&self, execution: ExecutionConfig) -> QueryContext {
        QueryContext::new(Arc::clone(&self.storage), self.pool.clone(), execution)
    }

    /// Evaluate the plan below `root` into a new table
    pub fn materialize(&self, plan: &Plan, root: NodeId) -> Result<Table> {
        self.materialize_with_stats(plan, root).map(|(table, _)| table)
    }

    /// Evaluate the plan below `root`, also returning statistics
    pub fn materialize_with_stats(&self, plan: &Plan, root: NodeId) -> Result<(Table, MaterializeStats)> {
        materialize_with_stats(plan, root, &self.query_context())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tabula_core::{Column, DataType, Value};

    #[test]
    fn test_config_loads_partial_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.json");
        fs::write(&path, r#"{"storage": {"block_size": 16}, "execution": {"parallelism": 3}}"#).unwrap();
        let config = EngineConfig::from_json_file(&path).unwrap();
        assert_eq!(config.storage.block_size, 16);
        assert_eq!(config.execution.parallelism, 3);
        assert_eq!(config.execution.batch_size, ExecutionConfig::default().batch_size);
    }

    #[test]
    fn test_saved_table_reopens_through_engine() {
        let dir = tempfile::tempdir().unwrap();
        let config = EngineConfig {
            storage: StorageConfig {
                scratch_dir: Some(dir.path().join("scratch")),
                ..StorageConfig::default()
            },
            execution: ExecutionConfig {
                worker_threads: 2,
                parallelism: 2,
                ..ExecutionConfig::default()
            },
        };
        let engine = Engine::new(config).unwrap();
        let values: Vec<Value> = (0..100).map(Value::Integer).collect();
        let column = Column::from_values(engine.storage(), DataType::Integer, values.clone()).unwrap();
        let table = Table::new(vec![("x", column)]).unwrap();
        table.save(dir.path().join("t")).unwrap();

        let reopened = engine.open_table(dir.path().join("t")).unwrap();
        let mut plan = Plan::new();
        let root = plan.source(reopened);
        let (out, stats) = engine.materialize_with_stats(&plan, root).unwrap();
        assert_eq!(stats.rows, 100);
        assert_eq!(stats.partitions, 2);
        assert_eq!(out.column("x").unwrap().to_vec().unwrap(), values);
    }
}
