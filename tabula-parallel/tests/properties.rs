//! Randomized pipelines checked against a row-at-a-time reference

use std::collections::HashMap;

use proptest::prelude::*;
use tabula_core::{Column, DataType, StorageConfig, StorageContext, StorageRef, Table, Value};
use tabula_parallel::{Engine, ExecutionConfig};
use tabula_query::{col, lit, AggregateExpr, AggregateFunction, JoinKind, NodeId, Optimizer, Plan, DEFAULT_MAX_ITERATIONS};

type Row = (Value, Value);

/// One pipeline stage over a two-column `[x, y]` input; every stage keeps
/// that shape
#[derive(Debug, Clone)]
enum Step {
    FilterGt(i64),
    AddToX(i64),
    Swap,
    Reproject,
    UnionSelf,
    UnionEmpty,
    AlwaysTrue,
    Slice(u64, u64),
    SumByX,
    JoinDims { left: bool },
}

const DIM_KEYS: i64 = 50;

fn step() -> impl Strategy<Value = Step> {
    prop_oneof![
        (-10i64..50).prop_map(Step::FilterGt),
        (-5i64..5).prop_map(Step::AddToX),
        Just(Step::Swap),
        Just(Step::Reproject),
        Just(Step::UnionSelf),
        Just(Step::UnionEmpty),
        Just(Step::AlwaysTrue),
        (0u64..30, 0u64..30).prop_map(|(start, len)| Step::Slice(start, len)),
        Just(Step::SumByX),
        any::<bool>().prop_map(|left| Step::JoinDims { left }),
    ]
}

fn table(storage: &StorageRef, columns: Vec<(&str, Vec<Value>)>) -> Table {
    Table::new(
        columns
            .into_iter()
            .map(|(name, values)| (name, Column::from_values(storage, DataType::Integer, values).unwrap()))
            .collect(),
    )
    .unwrap()
}

fn dims(storage: &StorageRef) -> Table {
    table(
        storage,
        vec![
            ("k", (0..DIM_KEYS).map(Value::Integer).collect()),
            ("w", (0..DIM_KEYS).map(|k| Value::Integer(k * 10)).collect()),
        ],
    )
}

fn add_step(plan: &mut Plan, node: NodeId, step: &Step, dims: &Table) -> NodeId {
    match step {
        Step::FilterGt(k) => plan.filter(node, col("x").gt(lit(*k))).unwrap(),
        Step::AddToX(c) => plan
            .map(node, vec![("x", col("x").add(lit(*c))), ("y", col("y"))])
            .unwrap(),
        Step::Swap => plan.map(node, vec![("x", col("y")), ("y", col("x"))]).unwrap(),
        Step::Reproject => {
            let swapped = plan.project(node, &["y", "x"]).unwrap();
            plan.project(swapped, &["x", "y"]).unwrap()
        }
        Step::UnionSelf => plan.union(vec![node, node]).unwrap(),
        Step::UnionEmpty => {
            let never = plan.filter(node, lit(0i64)).unwrap();
            plan.union(vec![node, never]).unwrap()
        }
        Step::AlwaysTrue => plan.filter(node, lit(1i64)).unwrap(),
        Step::Slice(start, len) => plan.slice(node, *start, start + len).unwrap(),
        Step::SumByX => plan
            .reduce(node, &["x"], vec![AggregateExpr::new(AggregateFunction::Sum, "y", "y")])
            .unwrap(),
        Step::JoinDims { left } => {
            let right = plan.source(dims.clone());
            let kind = if *left { JoinKind::Left } else { JoinKind::Inner };
            let joined = plan.join(node, right, vec![("x", "k")], kind).unwrap();
            plan.map(joined, vec![("x", col("x")), ("y", col("w"))]).unwrap()
        }
    }
}

fn dim_value(x: &Value) -> Option<Value> {
    match x {
        Value::Integer(k) if (0..DIM_KEYS).contains(k) => Some(Value::Integer(k * 10)),
        _ => None,
    }
}

fn reference(rows: Vec<Row>, step: &Step) -> Vec<Row> {
    match step {
        Step::FilterGt(k) => rows
            .into_iter()
            .filter(|(x, _)| matches!(x, Value::Integer(v) if v > k))
            .collect(),
        Step::AddToX(c) => rows
            .into_iter()
            .map(|(x, y)| match x {
                Value::Integer(v) => (Value::Integer(v + c), y),
                other => (other, y),
            })
            .collect(),
        Step::Swap => rows.into_iter().map(|(x, y)| (y, x)).collect(),
        Step::Reproject | Step::UnionEmpty | Step::AlwaysTrue => rows,
        Step::UnionSelf => rows.iter().chain(rows.iter()).cloned().collect(),
        Step::Slice(start, len) => {
            let start = (*start as usize).min(rows.len());
            let end = (start + *len as usize).min(rows.len());
            rows[start..end].to_vec()
        }
        Step::SumByX => {
            let mut order: Vec<Value> = Vec::new();
            let mut sums: HashMap<Value, i64> = HashMap::new();
            for (x, y) in rows {
                let sum = sums.entry(x.clone()).or_insert_with(|| {
                    order.push(x);
                    0
                });
                if let Value::Integer(v) = y {
                    *sum += v;
                }
            }
            order
                .into_iter()
                .map(|x| {
                    let sum = sums[&x];
                    (x, Value::Integer(sum))
                })
                .collect()
        }
        Step::JoinDims { left } => rows
            .into_iter()
            .filter_map(|(x, _)| match dim_value(&x) {
                Some(w) => Some((x, w)),
                None if *left => Some((x, Value::Missing)),
                None => None,
            })
            .collect(),
    }
}

fn build(storage: &StorageRef, base: &[(i64, i64)], steps: &[Step]) -> (Plan, NodeId, Vec<Row>) {
    let mut rows: Vec<Row> = base
        .iter()
        .map(|&(x, y)| (Value::Integer(x), Value::Integer(y)))
        .collect();
    let source = table(
        storage,
        vec![
            ("x", rows.iter().map(|(x, _)| x.clone()).collect()),
            ("y", rows.iter().map(|(_, y)| y.clone()).collect()),
        ],
    );
    let dims = dims(storage);
    let mut plan = Plan::new();
    let mut node = plan.source(source);
    for step in steps {
        node = add_step(&mut plan, node, step, &dims);
        rows = reference(rows, step);
    }
    (plan, node, rows)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn prop_materialize_matches_reference(
        base in prop::collection::vec((-20i64..60, -5i64..5), 0..40),
        steps in prop::collection::vec(step(), 0..6),
        parallelism in 1usize..5,
        batch_size in 1usize..9,
    ) {
        let storage = StorageContext::in_memory(StorageConfig::default());
        let engine = Engine::with_storage(
            storage,
            ExecutionConfig { worker_threads: 2, ..ExecutionConfig::default() },
        )
        .unwrap();
        let (plan, root, expected) = build(engine.storage(), &base, &steps);
        let expected: Vec<Vec<Value>> = expected.into_iter().map(|(x, y)| vec![x, y]).collect();

        for optimize in [false, true] {
            let ctx = engine.query_context_with(ExecutionConfig {
                parallelism,
                batch_size,
                optimize,
                worker_threads: 2,
                ..ExecutionConfig::default()
            });
            let out = tabula_parallel::materialize(&plan, root, &ctx).unwrap();
            prop_assert_eq!(out.schema().names(), vec!["x", "y"]);
            prop_assert_eq!(out.to_rows().unwrap(), expected.clone());
        }
    }

    #[test]
    fn prop_optimizer_is_idempotent(
        base in prop::collection::vec((-20i64..60, -5i64..5), 0..8),
        steps in prop::collection::vec(step(), 0..6),
    ) {
        let storage = StorageContext::in_memory(StorageConfig::default());
        let (plan, root, _) = build(&storage, &base, &steps);
        let optimizer = Optimizer::new(DEFAULT_MAX_ITERATIONS);
        let (once, once_root) = optimizer.optimize(&plan, root).unwrap();
        let (twice, twice_root) = optimizer.optimize(&once, once_root).unwrap();
        prop_assert_eq!(once.explain(once_root), twice.explain(twice_root));
        prop_assert_eq!(once.schema(once_root).names(), plan.schema(root).names());
    }
}
