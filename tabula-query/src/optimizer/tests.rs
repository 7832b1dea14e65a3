use super::*;
use crate::expr::{col, lit};
use crate::node::{JoinKind, Operator};
use tabula_core::{Column, DataType, StorageConfig, StorageContext, Table, Value};
use test_case::test_case;

fn table(names: &[&str], rows: i64) -> Table {
    let storage = StorageContext::in_memory(StorageConfig::default());
    let columns = names
        .iter()
        .map(|name| {
            let values = (0..rows).map(Value::Integer).collect();
            (*name, Column::from_values(&storage, DataType::Integer, values).unwrap())
        })
        .collect();
    Table::new(columns).unwrap()
}

fn names(plan: &Plan, root: NodeId) -> Vec<&'static str> {
    plan.reachable(root)
        .into_iter()
        .rev()
        .map(|id| plan.operator(id).name())
        .collect()
}

#[test]
fn test_filter_pushed_below_union_and_project() {
    let mut plan = Plan::new();
    let a = plan.source(table(&["x", "y"], 3));
    let b = plan.source(table(&["x", "y"], 5));
    let u = plan.union(vec![a, b]).unwrap();
    let p = plan.project(u, &["x"]).unwrap();
    let f = plan.filter(p, col("x").gt(lit(1i64))).unwrap();

    let (opt, root) = Optimizer::default().optimize(&plan, f).unwrap();
    assert_eq!(opt.schema(root).names(), vec!["x"]);
    match opt.operator(root) {
        Operator::Union { inputs } => {
            assert_eq!(inputs.len(), 2);
            for input in inputs {
                assert_eq!(names(&opt, *input), vec!["Project", "Filter", "Source"]);
            }
        }
        other => panic!("expected a union at the root, got {}", other),
    }
    // the original plan is untouched
    assert!(matches!(plan.operator(f), Operator::Filter { .. }));
}

#[test]
fn test_adjacent_filters_and_projects_fuse() {
    let mut plan = Plan::new();
    let r = plan.range(0, 100, "x").unwrap();
    let m = plan.map(r, vec![("x", col("x")), ("y", col("x").mul(lit(2i64)))]).unwrap();
    let f1 = plan.filter(m, col("x").gt(lit(10i64))).unwrap();
    let f2 = plan.filter(f1, col("x").lt(lit(50i64))).unwrap();
    let p1 = plan.project(f2, &["y", "x"]).unwrap();
    let p2 = plan.project(p1, &["y"]).unwrap();

    let (opt, root) = Optimizer::default().optimize(&plan, p2).unwrap();
    assert_eq!(names(&opt, root), vec!["Map", "Filter", "Range"]);
    match opt.operator(root) {
        Operator::Map { outputs, .. } => assert_eq!(outputs.len(), 1),
        other => panic!("expected a map, got {}", other),
    }
}

#[test]
fn test_identity_nodes_and_empty_branches_removed() {
    let mut plan = Plan::new();
    let a = plan.source(table(&["x"], 4));
    let empty = plan.source(table(&["x"], 0));
    let never = plan.filter(a, lit(0i64)).unwrap();
    let u = plan.union(vec![a, empty, never]).unwrap();
    let always = plan.filter(u, lit(1i64)).unwrap();
    let ident = plan.map(always, vec![("x", col("x"))]).unwrap();
    let full = plan.slice(ident, 0, 100).unwrap();

    let (opt, root) = Optimizer::default().optimize(&plan, full).unwrap();
    assert_eq!(opt.len(), 1);
    assert!(matches!(opt.operator(root), Operator::Source { table } if table.num_rows() == 4));
}

#[test_case(JoinKind::Inner, "v", Some(true) ; "inner left column")]
#[test_case(JoinKind::Inner, "w", Some(false) ; "inner right column")]
#[test_case(JoinKind::Left, "w", None ; "left join keeps right filter above")]
#[test_case(JoinKind::Right, "w", Some(false) ; "right join right column")]
#[test_case(JoinKind::Outer, "v", None ; "outer join keeps filter above")]
fn test_filter_pushed_into_owning_join_side(kind: JoinKind, column: &str, left_side: Option<bool>) {
    let mut plan = Plan::new();
    let l = plan.source(table(&["k", "v"], 4));
    let r = plan.source(table(&["k", "w"], 4));
    let j = plan.join(l, r, vec![("k", "k")], kind).unwrap();
    let f = plan.filter(j, col(column).gt(lit(1i64))).unwrap();

    let (opt, root) = Optimizer::default().optimize(&plan, f).unwrap();
    match (opt.operator(root), left_side) {
        (Operator::Join { left, right, .. }, Some(true)) => {
            assert!(matches!(opt.operator(*left), Operator::Filter { .. }));
            assert!(matches!(opt.operator(*right), Operator::Source { .. }));
        }
        (Operator::Join { left, right, .. }, Some(false)) => {
            assert!(matches!(opt.operator(*left), Operator::Source { .. }));
            assert!(matches!(opt.operator(*right), Operator::Filter { .. }));
        }
        (Operator::Filter { .. }, None) => {}
        (other, _) => panic!("unexpected root {}", other),
    }
}

#[test]
fn test_map_fusion_refuses_duplicate_evaluation() {
    let mut plan = Plan::new();
    let r = plan.range(0, 10, "x").unwrap();
    let inner = plan.map(r, vec![("y", col("x").add(lit(1i64)))]).unwrap();
    let outer = plan.map(inner, vec![("z", col("y").mul(col("y")))]).unwrap();
    let (opt, root) = Optimizer::default().optimize(&plan, outer).unwrap();
    assert_eq!(names(&opt, root), vec!["Map", "Map", "Range"]);

    let single = plan.map(inner, vec![("z", col("y").mul(lit(3i64)))]).unwrap();
    let (opt, root) = Optimizer::default().optimize(&plan, single).unwrap();
    assert_eq!(names(&opt, root), vec!["Map", "Range"]);
}

#[test]
fn test_iteration_cap_bounds_work() {
    let mut plan = Plan::new();
    let r = plan.range(0, 10, "x").unwrap();
    let f1 = plan.filter(r, col("x").gt(lit(1i64))).unwrap();
    let f2 = plan.filter(f1, col("x").gt(lit(2i64))).unwrap();
    let (opt, root) = Optimizer::new(0).optimize(&plan, f2).unwrap();
    assert_eq!(names(&opt, root), vec!["Filter", "Filter", "Range"]);
    let (opt, root) = Optimizer::new(1).optimize(&plan, f2).unwrap();
    assert_eq!(names(&opt, root), vec!["Filter", "Range"]);
}
