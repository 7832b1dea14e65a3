//! Merging adjacent row-streaming operators

use std::collections::HashMap;

use tabula_core::Result;

use super::OptimizeRule;
use crate::expr::Expr;
use crate::node::{NodeId, Operator};
use crate::plan::Plan;

/// Filter∘Filter, Project∘Project, Map∘Map, Project∘Map and Map∘Project
#[derive(Debug, Clone, Copy, Default)]
pub struct Fusion;

impl OptimizeRule for Fusion {
    fn name(&self) -> &'static str {
        "fusion"
    }

    fn apply(&self, plan: &mut Plan, id: NodeId) -> Result<bool> {
        let outer = plan.operator(id).clone();
        let input = match outer.inputs().as_slice() {
            [input] => *input,
            _ => return Ok(false),
        };
        let inner = plan.operator(input).clone();

        let fused = match (outer, inner) {
            (
                Operator::Filter { predicate: p2, .. },
                Operator::Filter {
                    input,
                    predicate: p1,
                },
            ) => Some(Operator::Filter {
                input,
                predicate: p1.and(p2),
            }),
            (Operator::Project { columns, .. }, Operator::Project { input, .. }) => {
                Some(Operator::Project { input, columns })
            }
            (Operator::Map { outputs: outer, .. }, Operator::Map { input, outputs: inner }) => {
                fuse_maps(&outer, &inner).map(|outputs| Operator::Map { input, outputs })
            }
            (Operator::Project { columns, .. }, Operator::Map { input, outputs }) => {
                project_map(&columns, outputs).map(|outputs| Operator::Map { input, outputs })
            }
            (Operator::Map { outputs, .. }, Operator::Project { input, .. }) => {
                Some(Operator::Map { input, outputs })
            }
            _ => None,
        };

        match fused {
            Some(op) => {
                plan.replace(id, op)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

/// Inline the inner outputs into the outer expressions. Refused when an
/// inner expression would be evaluated more than once, or a dropped inner
/// expression calls a user function.
fn fuse_maps(outer: &[(String, Expr)], inner: &[(String, Expr)]) -> Option<Vec<(String, Expr)>> {
    let mut mapping = HashMap::with_capacity(inner.len());
    for (name, expr) in inner {
        let uses: usize = outer.iter().map(|(_, e)| e.count_references(name)).sum();
        let trivial = matches!(expr, Expr::Column(_) | Expr::Literal(_));
        if uses > 1 && !trivial {
            return None;
        }
        if uses == 0 && expr.has_function() {
            return None;
        }
        mapping.insert(name.clone(), expr.clone());
    }
    Some(
        outer
            .iter()
            .map(|(name, expr)| (name.clone(), expr.substitute(&mapping)))
            .collect(),
    )
}

/// Keep only the projected outputs of a map, in projection order
fn project_map(columns: &[String], outputs: Vec<(String, Expr)>) -> Option<Vec<(String, Expr)>> {
    let dropped_calls = outputs
        .iter()
        .any(|(name, expr)| !columns.contains(name) && expr.has_function());
    if dropped_calls {
        return None;
    }
    let mut by_name: HashMap<String, Expr> = outputs.into_iter().collect();
    columns
        .iter()
        .map(|c| by_name.remove(c).map(|e| (c.clone(), e)))
        .collect()
}
