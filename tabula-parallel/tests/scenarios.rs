//! End-to-end materialization over real scratch storage

use std::collections::HashSet;
use std::path::PathBuf;

use tabula_core::{Column, DataType, Error, StorageConfig, Table, Value};
use tabula_parallel::{Engine, EngineConfig, ExecutionConfig};
use tabula_query::{call, col, lit, AggregateExpr, AggregateFunction, FnUdf, JoinKind, Plan, WindowFrame, WindowFunction};
use tempfile::TempDir;
use tracing_subscriber::EnvFilter;

fn engine(parallelism: usize, batch_size: usize) -> (TempDir, Engine) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
    let dir = tempfile::tempdir().unwrap();
    let config = EngineConfig {
        storage: StorageConfig {
            scratch_dir: Some(dir.path().join("scratch")),
            block_size: 256,
            ..StorageConfig::default()
        },
        execution: ExecutionConfig {
            parallelism,
            batch_size,
            worker_threads: 4,
            ..ExecutionConfig::default()
        },
    };
    (dir, Engine::new(config).unwrap())
}

fn ints(values: impl IntoIterator<Item = i64>) -> Vec<Value> {
    values.into_iter().map(Value::Integer).collect()
}

fn int_column(engine: &Engine, values: impl IntoIterator<Item = i64>) -> Column {
    Column::from_values(engine.storage(), DataType::Integer, ints(values)).unwrap()
}

/// Column written in `segments` sealed segments of equal size
fn segmented_column(engine: &Engine, values: &[Value], segments: usize) -> Column {
    let column = Column::create(engine.storage(), DataType::Integer);
    let mut writer = column.open_writer().unwrap();
    for chunk in values.chunks(values.len().div_ceil(segments)) {
        writer.append(chunk).unwrap();
        writer.start_segment().unwrap();
    }
    writer.close().unwrap()
}

fn scratch_files(engine: &Engine) -> HashSet<PathBuf> {
    engine.storage().scratch_segment_files().unwrap().into_iter().collect()
}

#[test]
fn test_filter_keeps_row_order_across_segments() {
    let (_dir, engine) = engine(4, 512);
    // a permutation of 0..10_000 so output order is observable
    let values = ints((0..10_000).map(|i| (i * 7919) % 10_000));
    let column = segmented_column(&engine, &values, 4);
    assert_eq!(column.num_segments(), 4);

    let mut plan = Plan::new();
    let source = plan.source(Table::new(vec![("x", column)]).unwrap());
    let root = plan.filter(source, col("x").gt(lit(5000i64))).unwrap();
    let (out, stats) = engine.materialize_with_stats(&plan, root).unwrap();

    let expected: Vec<Value> = values
        .iter()
        .filter(|v| matches!(v, Value::Integer(x) if *x > 5000))
        .cloned()
        .collect();
    assert_eq!(expected.len(), 4999);
    assert_eq!(out.num_rows(), 4999);
    assert_eq!(stats.rows, 4999);
    assert_eq!(stats.partitions, 4);
    assert_eq!(out.column("x").unwrap().to_vec().unwrap(), expected);
}

#[test]
fn test_union_concatenates_in_input_order() {
    let (_dir, engine) = engine(3, 2);
    let mut plan = Plan::new();
    let a = plan.source(Table::new(vec![("x", int_column(&engine, [1, 2, 3]))]).unwrap());
    let b = plan.source(Table::new(vec![("x", int_column(&engine, [10, 20, 30, 40, 50]))]).unwrap());
    let root = plan.union(vec![a, b]).unwrap();

    let out = engine.materialize(&plan, root).unwrap();
    assert_eq!(out.num_rows(), 8);
    assert_eq!(
        out.column("x").unwrap().to_vec().unwrap(),
        ints([1, 2, 3, 10, 20, 30, 40, 50])
    );
}

#[test]
fn test_cancel_discards_partial_output() {
    let (_dir, engine) = engine(4, 100);
    let mut plan = Plan::new();
    let source = plan.source(Table::new(vec![("x", int_column(&engine, 0..10_000))]).unwrap());
    let ctx = engine.query_context();
    let handle = ctx.cancel_handle();
    let trip = FnUdf::new("trip", DataType::Integer, move |args: &[Value]| {
        if args[0] == Value::Integer(5000) {
            handle.cancel();
        }
        Ok(args[0].clone())
    });
    let root = plan.map(source, vec![("y", call(trip, vec![col("x")]))]).unwrap();

    let before = scratch_files(&engine);
    let result = tabula_parallel::materialize(&plan, root, &ctx);
    assert!(matches!(result, Err(Error::Cancelled)));
    assert!(ctx.is_cancelled());
    assert_eq!(scratch_files(&engine), before);
}

#[test]
fn test_failed_partition_fails_the_query() {
    let (_dir, engine) = engine(4, 64);
    let mut plan = Plan::new();
    let source = plan.source(Table::new(vec![("x", int_column(&engine, 0..2000))]).unwrap());
    let strict = FnUdf::new("strict", DataType::Integer, |args: &[Value]| match &args[0] {
        Value::Integer(1500) => Err(Error::InvalidArgument("1500 is not allowed".into())),
        other => Ok(other.clone()),
    });
    let root = plan.map(source, vec![("y", call(strict, vec![col("x")]))]).unwrap();

    let before = scratch_files(&engine);
    let result = engine.materialize(&plan, root);
    assert!(matches!(result, Err(Error::Udf { ref name, .. }) if name == "strict"));
    assert_eq!(scratch_files(&engine), before);
}

#[test]
fn test_type_mismatch_leaves_column_unchanged() {
    let (_dir, engine) = engine(1, 16);
    let column = Column::create(engine.storage(), DataType::Integer);
    let mut writer = column.open_writer().unwrap();
    writer.append(&ints([1, 2, 3])).unwrap();
    let err = writer.append(&[Value::Integer(4), Value::from("five")]).unwrap_err();
    assert!(matches!(err, Error::TypeMismatch { .. }));
    assert_eq!(writer.len(), 3);

    let column = writer.close().unwrap();
    assert_eq!(column.to_vec().unwrap(), ints([1, 2, 3]));
}

#[test]
fn test_grouped_reduce_then_join() {
    let (_dir, engine) = engine(2, 4);
    let mut plan = Plan::new();
    let sales = plan.source(
        Table::new(vec![
            ("store", int_column(&engine, [2, 1, 2, 3, 1, 2])),
            ("amount", int_column(&engine, [5, 7, 1, 4, 3, 2])),
        ])
        .unwrap(),
    );
    let stores = plan.source(
        Table::new(vec![
            ("id", int_column(&engine, [1, 2, 3])),
            ("region", int_column(&engine, [100, 200, 300])),
        ])
        .unwrap(),
    );
    let totals = plan
        .reduce(
            sales,
            &["store"],
            vec![
                AggregateExpr::new(AggregateFunction::Sum, "amount", "total"),
                AggregateExpr::count("n"),
            ],
        )
        .unwrap();
    let root = plan.join(totals, stores, vec![("store", "id")], JoinKind::Inner).unwrap();

    let out = engine.materialize(&plan, root).unwrap();
    assert_eq!(out.schema().names(), vec!["store", "total", "n", "region"]);
    assert_eq!(
        out.to_rows().unwrap(),
        vec![ints([2, 8, 3, 200]), ints([1, 10, 2, 100]), ints([3, 4, 1, 300])]
    );
}

#[test]
fn test_outer_join_on_dynamic_right_key() {
    let (_dir, engine) = engine(2, 2);
    let mut plan = Plan::new();
    let left = plan.source(
        Table::new(vec![("k", int_column(&engine, [1, 2])), ("v", int_column(&engine, [10, 20]))]).unwrap(),
    );
    let right_keys = Column::from_values(
        engine.storage(),
        DataType::Dynamic,
        vec![Value::from("z"), Value::Integer(2)],
    )
    .unwrap();
    let right = plan.source(Table::new(vec![("k", right_keys), ("w", int_column(&engine, [7, 8]))]).unwrap());
    let root = plan.join(left, right, vec![("k", "k")], JoinKind::Outer).unwrap();

    let out = engine.materialize(&plan, root).unwrap();
    assert_eq!(out.column("k").unwrap().data_type(), DataType::Dynamic);
    assert_eq!(
        out.to_rows().unwrap(),
        vec![
            vec![Value::Integer(1), Value::Integer(10), Value::Missing],
            vec![Value::Integer(2), Value::Integer(20), Value::Integer(8)],
            vec![Value::from("z"), Value::Missing, Value::Integer(7)],
        ]
    );
}

#[test]
fn test_cumulative_window_spans_partitions() {
    let (_dir, engine) = engine(3, 2);
    let mut plan = Plan::new();
    let range = plan.range(1, 8, "x").unwrap();
    let root = plan
        .window(range, "x", WindowFunction::Sum, WindowFrame::Cumulative, "running")
        .unwrap();

    let out = engine.materialize(&plan, root).unwrap();
    assert_eq!(
        out.column("running").unwrap().to_vec().unwrap(),
        ints([1, 3, 6, 10, 15, 21, 28])
    );
}

#[test]
fn test_slice_of_filter() {
    let (_dir, engine) = engine(2, 3);
    let mut plan = Plan::new();
    let range = plan.range(0, 100, "x").unwrap();
    let odd = plan.filter(range, col("x").modulo(lit(2i64)).eq(lit(1i64))).unwrap();
    let root = plan.slice(odd, 10, 15).unwrap();

    let out = engine.materialize(&plan, root).unwrap();
    assert_eq!(out.column("x").unwrap().to_vec().unwrap(), ints([21, 23, 25, 27, 29]));
}

#[test]
fn test_materialized_table_survives_save_and_reopen() {
    let (dir, engine) = engine(2, 8);
    let mut plan = Plan::new();
    let range = plan.range(0, 50, "x").unwrap();
    let root = plan
        .map(range, vec![("x", col("x")), ("sq", col("x").mul(col("x")))])
        .unwrap();
    let out = engine.materialize(&plan, root).unwrap();
    out.save(dir.path().join("squares")).unwrap();

    let reopened = engine.open_table(dir.path().join("squares")).unwrap();
    assert_eq!(reopened.num_rows(), 50);
    assert_eq!(reopened.row(7).unwrap(), ints([7, 49]));
}
