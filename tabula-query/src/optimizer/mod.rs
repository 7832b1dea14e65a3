//! Rule-based plan optimizer
//!
//! Rules rewrite one node at a time, in place, into an equivalent operator
//! with the same output schema. The optimizer sweeps the reachable nodes
//! until a sweep changes nothing or `max_iterations` sweeps have run, then
//! drops the nodes that are no longer reachable.

mod fusion;
mod pushdown;
mod simplify;

use std::fmt;

use tabula_core::Result;
use tracing::{debug, trace};

use crate::node::NodeId;
use crate::plan::Plan;

pub use fusion::Fusion;
pub use pushdown::{FilterPushdown, ProjectPushdown};
pub use simplify::{DeadBranchElimination, SourceSpecialization};

/// Default cap on optimizer sweeps
pub const DEFAULT_MAX_ITERATIONS: usize = 16;

/// A local rewrite
pub trait OptimizeRule: Send + Sync + fmt::Debug {
    /// Name used in logs
    fn name(&self) -> &'static str;

    /// Rewrite node `id` if the rule matches; returns whether it did
    fn apply(&self, plan: &mut Plan, id: NodeId) -> Result<bool>;
}

/// Fixed-point driver over a rule set
#[derive(Debug)]
pub struct Optimizer {
    rules: Vec<Box<dyn OptimizeRule>>,
    max_iterations: usize,
}

impl Default for Optimizer {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ITERATIONS)
    }
}

impl Optimizer {
    /// The standard rule set
    pub fn new(max_iterations: usize) -> Self {
        Self::with_rules(
            vec![
                Box::new(SourceSpecialization),
                Box::new(DeadBranchElimination),
                Box::new(FilterPushdown),
                Box::new(ProjectPushdown),
                Box::new(Fusion),
            ],
            max_iterations,
        )
    }

    /// A custom rule set
    pub fn with_rules(rules: Vec<Box<dyn OptimizeRule>>, max_iterations: usize) -> Self {
        Self {
            rules,
            max_iterations,
        }
    }

    /// Sweep cap
    pub fn max_iterations(&self) -> usize {
        self.max_iterations
    }

    /// Optimize the plan below `root`. The input plan is left untouched; the
    /// result holds only nodes reachable from the returned root.
    pub fn optimize(&self, plan: &Plan, root: NodeId) -> Result<(Plan, NodeId)> {
        let mut plan = plan.clone();
        let mut sweeps = 0;
        loop {
            if sweeps == self.max_iterations {
                debug!(sweeps, "optimizer stopped at iteration cap");
                break;
            }
            sweeps += 1;
            let mut changed = false;
            // parents first, so a pushed-down node is revisited next sweep
            for id in plan.reachable(root).into_iter().rev() {
                for rule in &self.rules {
                    if rule.apply(&mut plan, id)? {
                        trace!(rule = rule.name(), node = %id, "rewrote node");
                        changed = true;
                    }
                }
            }
            if !changed {
                break;
            }
        }
        let before = plan.len();
        let (plan, root) = plan.compact(root);
        debug!(sweeps, nodes_before = before, nodes_after = plan.len(), "optimized plan");
        Ok((plan, root))
    }
}

#[cfg(test)]
mod tests;
