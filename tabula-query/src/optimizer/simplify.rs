//! Removing no-op nodes and provably empty branches

use tabula_core::Result;

use super::OptimizeRule;
use crate::node::{NodeId, Operator};
use crate::plan::Plan;

/// Identity Project, Map, Filter(true) and full Slice are replaced by their
/// input; Project over Source becomes a Source over the selected columns
#[derive(Debug, Clone, Copy, Default)]
pub struct SourceSpecialization;

impl OptimizeRule for SourceSpecialization {
    fn name(&self) -> &'static str {
        "source_specialization"
    }

    fn apply(&self, plan: &mut Plan, id: NodeId) -> Result<bool> {
        let op = plan.operator(id).clone();
        let passthrough = match &op {
            Operator::Project { input, columns } => {
                if let Operator::Source { table } = plan.operator(*input) {
                    let table = table.select_columns(columns)?;
                    plan.replace(id, Operator::Source { table })?;
                    return Ok(true);
                }
                (plan.schema(*input).names() == *columns).then_some(*input)
            }
            Operator::Map { input, outputs } => {
                let names = plan.schema(*input).names();
                let identity = names.len() == outputs.len()
                    && names
                        .iter()
                        .zip(outputs)
                        .all(|(n, (out, expr))| n == out && expr.as_column() == Some(n.as_str()));
                identity.then_some(*input)
            }
            Operator::Filter { input, predicate } => predicate.is_always_true().then_some(*input),
            Operator::Slice { input, start, end } => {
                let full = *start == 0 && plan.known_rows(*input).is_some_and(|n| n <= *end);
                full.then_some(*input)
            }
            _ => None,
        };
        match passthrough {
            Some(input) => {
                let replacement = plan.operator(input).clone();
                plan.replace(id, replacement)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

/// Drops provably empty Union inputs and collapses single-input unions
#[derive(Debug, Clone, Copy, Default)]
pub struct DeadBranchElimination;

impl OptimizeRule for DeadBranchElimination {
    fn name(&self) -> &'static str {
        "dead_branch_elimination"
    }

    fn apply(&self, plan: &mut Plan, id: NodeId) -> Result<bool> {
        let inputs = match plan.operator(id) {
            Operator::Union { inputs } => inputs.clone(),
            _ => return Ok(false),
        };
        if let [only] = inputs.as_slice() {
            let op = plan.operator(*only).clone();
            plan.replace(id, op)?;
            return Ok(true);
        }
        let live: Vec<NodeId> = inputs
            .iter()
            .copied()
            .filter(|i| plan.known_rows(*i) != Some(0))
            .collect();
        if live.len() == inputs.len() {
            return Ok(false);
        }
        // an all-empty union keeps one branch to carry the schema
        let kept = if live.is_empty() { vec![inputs[0]] } else { live };
        plan.replace(id, Operator::Union { inputs: kept })?;
        Ok(true)
    }
}
