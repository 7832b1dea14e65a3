//! Benchmark runner for tabula materialization
//!
//! Usage: `tabula-bench [engine.json [bench.json]]`. Log verbosity follows
//! `RUST_LOG`.

use std::env;
use std::fs;

use anyhow::{Context, Result};
use tabula_bench::{bench_workload, generate_input, BenchConfig, Workload};
use tabula_parallel::{Engine, EngineConfig};
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let mut args = env::args().skip(1);
    let engine_config = match args.next() {
        Some(path) => EngineConfig::from_json_file(&path).with_context(|| format!("loading engine config {}", path))?,
        None => EngineConfig::default(),
    };
    let bench_config: BenchConfig = match args.next() {
        Some(path) => {
            let text = fs::read_to_string(&path).with_context(|| format!("reading {}", path))?;
            serde_json::from_str(&text).with_context(|| format!("parsing {}", path))?
        }
        None => BenchConfig::default(),
    };

    println!("=== Tabula Materialization Benchmarks ===");
    let engine = Engine::new(engine_config).context("starting engine")?;
    let input = generate_input(&engine, bench_config.rows).context("generating input")?;
    println!(
        "input: {} rows, parallelism {}, batch size {}",
        input.num_rows(),
        bench_config.parallelism,
        bench_config.batch_size
    );

    for workload in Workload::ALL {
        let result = bench_workload(&engine, &input, workload, &bench_config)
            .with_context(|| format!("running {}", workload.name()))?;
        println!("\n{}", result);
    }
    Ok(())
}
