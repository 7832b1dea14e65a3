//! Materialization throughput benchmarks

use std::fmt;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tabula_core::{Column, DataType, Error, Result, Table, Value};
use tabula_parallel::{Engine, ExecutionConfig};
use tabula_query::{col, lit, AggregateExpr, AggregateFunction, JoinKind, NodeId, Plan, WindowFrame, WindowFunction};
use tracing::info;

/// Benchmark configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BenchConfig {
    /// Measured iterations per workload
    pub iterations: usize,

    /// Unmeasured iterations run first
    pub warmup_iterations: usize,

    /// Rows in the generated input table
    pub rows: u64,

    /// Partitions per materialization
    pub parallelism: usize,

    /// Rows per batch
    pub batch_size: usize,
}

impl Default for BenchConfig {
    fn default() -> Self {
        Self {
            iterations: 5,
            warmup_iterations: 1,
            rows: 1_000_000,
            parallelism: ExecutionConfig::default().parallelism,
            batch_size: 4096,
        }
    }
}

impl BenchConfig {
    /// Execution settings derived from this configuration
    pub fn execution(&self) -> ExecutionConfig {
        ExecutionConfig {
            parallelism: self.parallelism,
            batch_size: self.batch_size,
            ..ExecutionConfig::default()
        }
    }
}

/// Benchmark result
#[derive(Debug, Clone)]
pub struct BenchResult {
    /// Name of the benchmark
    pub name: String,

    /// Total time taken
    pub total_time: Duration,

    /// Average time per iteration
    pub avg_time: Duration,

    /// Min time per iteration
    pub min_time: Duration,

    /// Max time per iteration
    pub max_time: Duration,

    /// Rows produced by one iteration
    pub rows_out: u64,

    /// Input rows per second
    pub throughput: f64,
}

impl fmt::Display for BenchResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Benchmark: {}", self.name)?;
        writeln!(f, "  Rows out:     {}", self.rows_out)?;
        writeln!(f, "  Total time:   {:?}", self.total_time)?;
        writeln!(f, "  Average time: {:?}", self.avg_time)?;
        writeln!(f, "  Min time:     {:?}", self.min_time)?;
        writeln!(f, "  Max time:     {:?}", self.max_time)?;
        write!(f, "  Throughput:   {:.2} rows/sec", self.throughput)
    }
}

/// Run `func` `warmup_iterations + iterations` times, timing the latter.
/// `func` returns the number of rows it produced.
pub fn run_benchmark<F>(name: &str, config: &BenchConfig, input_rows: u64, mut func: F) -> Result<BenchResult>
where
    F: FnMut() -> Result<u64>,
{
    if config.iterations == 0 {
        return Err(Error::InvalidArgument("at least one iteration is required".into()));
    }
    for _ in 0..config.warmup_iterations {
        func()?;
    }

    let mut times = Vec::with_capacity(config.iterations);
    let mut rows_out = 0;
    let start_total = Instant::now();
    for _ in 0..config.iterations {
        let start = Instant::now();
        rows_out = func()?;
        times.push(start.elapsed());
    }
    let total_time = start_total.elapsed();

    let avg_time = times.iter().sum::<Duration>() / times.len() as u32;
    let min_time = times.iter().min().copied().unwrap_or_default();
    let max_time = times.iter().max().copied().unwrap_or_default();
    let throughput = (input_rows * config.iterations as u64) as f64 / total_time.as_secs_f64().max(f64::EPSILON);

    Ok(BenchResult {
        name: name.to_string(),
        total_time,
        avg_time,
        min_time,
        max_time,
        rows_out,
        throughput,
    })
}

/// Generate the input table: `id` counts up, `key` cycles through 97
/// groups and `value` is a float derived from the id
pub fn generate_input(engine: &Engine, rows: u64) -> Result<Table> {
    const CHUNK: u64 = 65_536;
    let columns = [
        ("id", DataType::Integer),
        ("key", DataType::Integer),
        ("value", DataType::Float),
    ]
    .map(|(name, data_type)| (name, Column::create(engine.storage(), data_type)));
    let mut writers = columns
        .iter()
        .map(|(_, column)| column.open_writer())
        .collect::<Result<Vec<_>>>()?;

    let mut start = 0;
    while start < rows {
        let end = (start + CHUNK).min(rows);
        let ids = start as i64..end as i64;
        writers[0].append_owned(ids.clone().map(Value::Integer).collect())?;
        writers[1].append_owned(ids.clone().map(|i| Value::Integer(i % 97)).collect())?;
        writers[2].append_owned(ids.map(|i| Value::Float((i * 31 % 1000) as f64 / 10.0)).collect())?;
        start = end;
    }
    let mut sealed = Vec::with_capacity(columns.len());
    for ((name, _), writer) in columns.iter().zip(writers) {
        sealed.push((*name, writer.close()?));
    }
    Table::new(sealed)
}

/// The plans the runner measures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Workload {
    /// Selective filter straight over the source
    FilterScan,
    /// Map, filter and project fused into one pass
    FusedMap,
    /// The source concatenated with itself
    Union,
    /// Per-key sum and mean
    GroupedReduce,
    /// Inner join against a small dimension table
    HashJoin,
    /// Three-row rolling mean
    RollingWindow,
}

impl Workload {
    /// Every workload, in run order
    pub const ALL: [Workload; 6] = [
        Workload::FilterScan,
        Workload::FusedMap,
        Workload::Union,
        Workload::GroupedReduce,
        Workload::HashJoin,
        Workload::RollingWindow,
    ];

    /// Display name
    pub fn name(self) -> &'static str {
        match self {
            Workload::FilterScan => "filter scan",
            Workload::FusedMap => "fused map",
            Workload::Union => "union",
            Workload::GroupedReduce => "grouped reduce",
            Workload::HashJoin => "hash join",
            Workload::RollingWindow => "rolling window",
        }
    }

    /// Build this workload's plan over `input`
    pub fn plan(self, engine: &Engine, input: &Table) -> Result<(Plan, NodeId)> {
        let mut plan = Plan::new();
        let source = plan.source(input.clone());
        let root = match self {
            Workload::FilterScan => plan.filter(source, col("key").lt(lit(10i64)))?,
            Workload::FusedMap => {
                let scaled = plan.map(
                    source,
                    vec![
                        ("id", col("id")),
                        ("key", col("key")),
                        ("scaled", col("value").mul(lit(2.0))),
                    ],
                )?;
                let kept = plan.filter(scaled, col("scaled").gt(lit(100.0)))?;
                plan.project(kept, &["id", "scaled"])?
            }
            Workload::Union => plan.union(vec![source, source])?,
            Workload::GroupedReduce => plan.reduce(
                source,
                &["key"],
                vec![
                    AggregateExpr::new(AggregateFunction::Sum, "value", "total"),
                    AggregateExpr::new(AggregateFunction::Mean, "value", "mean"),
                    AggregateExpr::count("n"),
                ],
            )?,
            Workload::HashJoin => {
                let keys = (0..97).map(Value::Integer).collect();
                let labels = (0..97).map(|k| Value::from(format!("group-{}", k))).collect();
                let dims = Table::new(vec![
                    ("k", Column::from_values(engine.storage(), DataType::Integer, keys)?),
                    ("label", Column::from_values(engine.storage(), DataType::String, labels)?),
                ])?;
                let right = plan.source(dims);
                plan.join(source, right, vec![("key", "k")], JoinKind::Inner)?
            }
            Workload::RollingWindow => plan.window(
                source,
                "value",
                WindowFunction::Mean,
                WindowFrame::Rolling {
                    start: -2,
                    end: 0,
                    min_observations: Some(1),
                },
                "rolling",
            )?,
        };
        Ok((plan, root))
    }
}

/// Measure one workload
pub fn bench_workload(engine: &Engine, input: &Table, workload: Workload, config: &BenchConfig) -> Result<BenchResult> {
    let (plan, root) = workload.plan(engine, input)?;
    let result = run_benchmark(workload.name(), config, input.num_rows(), || {
        let ctx = engine.query_context_with(config.execution());
        let (table, _) = tabula_parallel::materialize_with_stats(&plan, root, &ctx)?;
        Ok(table.num_rows())
    })?;
    info!(
        workload = workload.name(),
        avg_ms = result.avg_time.as_millis() as u64,
        rows_out = result.rows_out,
        "benchmark finished"
    );
    Ok(result)
}
