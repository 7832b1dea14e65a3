//! Moving filters and projections toward the sources

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tabula_core::Result;

use super::OptimizeRule;
use crate::expr::{col, Expr};
use crate::node::{JoinKind, NodeId, Operator};
use crate::plan::{JoinLayout, Plan};

/// Filter below Union, Project, pass-through Map and the owning side of a
/// Join
#[derive(Debug, Clone, Copy, Default)]
pub struct FilterPushdown;

impl OptimizeRule for FilterPushdown {
    fn name(&self) -> &'static str {
        "filter_pushdown"
    }

    fn apply(&self, plan: &mut Plan, id: NodeId) -> Result<bool> {
        let (input, predicate) = match plan.operator(id) {
            Operator::Filter { input, predicate } => (*input, predicate.clone()),
            _ => return Ok(false),
        };
        match plan.operator(input).clone() {
            Operator::Union { inputs } => {
                let inputs = inputs
                    .into_iter()
                    .map(|i| {
                        plan.add(Operator::Filter {
                            input: i,
                            predicate: predicate.clone(),
                        })
                    })
                    .collect::<Result<Vec<_>>>()?;
                plan.replace(id, Operator::Union { inputs })?;
                Ok(true)
            }
            Operator::Project { input: inner, columns } => {
                let filtered = plan.add(Operator::Filter {
                    input: inner,
                    predicate,
                })?;
                plan.replace(
                    id,
                    Operator::Project {
                        input: filtered,
                        columns,
                    },
                )?;
                Ok(true)
            }
            Operator::Map { input: inner, outputs } => {
                let mut mapping = HashMap::new();
                for name in predicate.columns() {
                    let source = outputs
                        .iter()
                        .find(|(out, _)| *out == name)
                        .and_then(|(_, expr)| expr.as_column());
                    match source {
                        Some(source) => {
                            mapping.insert(name, col(source));
                        }
                        None => return Ok(false),
                    }
                }
                let filtered = plan.add(Operator::Filter {
                    input: inner,
                    predicate: predicate.substitute(&mapping),
                })?;
                plan.replace(
                    id,
                    Operator::Map {
                        input: filtered,
                        outputs,
                    },
                )?;
                Ok(true)
            }
            Operator::Join {
                left,
                right,
                on,
                kind,
            } => push_into_join(plan, id, predicate, left, right, on, kind),
            _ => Ok(false),
        }
    }
}

fn push_into_join(
    plan: &mut Plan,
    id: NodeId,
    predicate: Expr,
    left: NodeId,
    right: NodeId,
    on: Vec<(String, String)>,
    kind: JoinKind,
) -> Result<bool> {
    let columns = predicate.columns();
    let left_names: HashSet<String> = plan.schema(left).names().into_iter().collect();

    if matches!(kind, JoinKind::Inner | JoinKind::Left) && columns.iter().all(|c| left_names.contains(c)) {
        let filtered = plan.add(Operator::Filter {
            input: left,
            predicate,
        })?;
        plan.replace(
            id,
            Operator::Join {
                left: filtered,
                right,
                on,
                kind,
            },
        )?;
        return Ok(true);
    }

    if matches!(kind, JoinKind::Inner | JoinKind::Right) {
        let right_schema = Arc::clone(plan.schema(right));
        let layout = JoinLayout::new(plan.schema(left), &right_schema, &on)?;
        let mapping: HashMap<String, Expr> = layout
            .right_outputs
            .iter()
            .map(|(i, out)| (out.clone(), col(right_schema.field(*i).name.clone())))
            .collect();
        if !columns.is_empty() && columns.iter().all(|c| mapping.contains_key(c)) {
            let filtered = plan.add(Operator::Filter {
                input: right,
                predicate: predicate.substitute(&mapping),
            })?;
            plan.replace(
                id,
                Operator::Join {
                    left,
                    right: filtered,
                    on,
                    kind,
                },
            )?;
            return Ok(true);
        }
    }
    Ok(false)
}

/// Project below Union
#[derive(Debug, Clone, Copy, Default)]
pub struct ProjectPushdown;

impl OptimizeRule for ProjectPushdown {
    fn name(&self) -> &'static str {
        "project_pushdown"
    }

    fn apply(&self, plan: &mut Plan, id: NodeId) -> Result<bool> {
        let (input, columns) = match plan.operator(id) {
            Operator::Project { input, columns } => (*input, columns.clone()),
            _ => return Ok(false),
        };
        let inputs = match plan.operator(input) {
            Operator::Union { inputs } => inputs.clone(),
            _ => return Ok(false),
        };
        let inputs = inputs
            .into_iter()
            .map(|i| {
                plan.add(Operator::Project {
                    input: i,
                    columns: columns.clone(),
                })
            })
            .collect::<Result<Vec<_>>>()?;
        plan.replace(id, Operator::Union { inputs })?;
        Ok(true)
    }
}
