// ABOUTME: Coverage instrumentation: observed values per node, propagation, branch gaps

use crate::ast::{operators, CheckedAst, Expr, ExprId, ExprKind};
use crate::types::CelType;
use crate::value::Value;
use std::collections::HashMap;
use std::sync::Mutex;

/// Records, per node identifier, the distinct values observed during
/// evaluation. Attached to a Program when tracking is enabled and
/// shared by the observer decorator; recording is mutex-guarded, the
/// accumulated map spans all evaluations of the program.
#[derive(Debug, Default)]
pub struct CoverageTracker {
    values: Mutex<HashMap<ExprId, Vec<Value>>>,
}

impl CoverageTracker {
    pub fn new() -> Self {
        CoverageTracker::default()
    }

    /// Record one observed value. Distinctness is the engine's own
    /// equality: a value equal to one already recorded is dropped.
    pub fn record(&self, id: ExprId, v: &Value) {
        let mut m = self.values.lock().unwrap_or_else(|e| e.into_inner());
        let seen = m.entry(id).or_default();
        if !seen.iter().any(|s| s.equal(v).is_true()) {
            seen.push(v.clone());
        }
    }

    pub fn snapshot(&self) -> HashMap<ExprId, Vec<Value>> {
        self.values
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

#[derive(Debug, Default, Clone)]
pub struct NodeCoverage {
    pub values: Vec<Value>,
    pub visited: bool,
}

/// Post-processed coverage for one program: per-node observed values
/// extended by ancestor propagation and single-child descent, plus the
/// boolean nodes missing a branch.
#[derive(Debug, Default)]
pub struct CoverageReport {
    nodes: HashMap<ExprId, NodeCoverage>,
    missing_branches: Vec<ExprId>,
    unvisited: Vec<ExprId>,
}

impl CoverageReport {
    pub fn generate(checked: &CheckedAst, tracker: &CoverageTracker) -> Self {
        let mut nodes: HashMap<ExprId, NodeCoverage> = HashMap::new();
        for (id, values) in tracker.snapshot() {
            nodes.insert(
                id,
                NodeCoverage {
                    visited: true,
                    values,
                },
            );
        }

        propagate_ancestors(&checked.ast.expr, &mut nodes);
        descend_single_children(&checked.ast.expr, &mut nodes);

        let mut missing_branches = Vec::new();
        let mut unvisited = Vec::new();
        checked.ast.expr.visit(&mut |e| {
            let visited = nodes.get(&e.id).map(|n| n.visited).unwrap_or(false);
            if !visited {
                unvisited.push(e.id);
                return;
            }
            // Literals and the block container are excluded from
            // missing-branch reporting.
            if matches!(e.kind, ExprKind::Literal(_)) || is_block(e) {
                return;
            }
            if checked.types.get(&e.id) == Some(&CelType::Bool) {
                let values = nodes.get(&e.id).map(|n| n.values.as_slice()).unwrap_or(&[]);
                let saw_true = values.iter().any(|v| matches!(v, Value::Bool(true)));
                let saw_false = values.iter().any(|v| matches!(v, Value::Bool(false)));
                if !saw_true || !saw_false {
                    missing_branches.push(e.id);
                }
            }
        });
        missing_branches.sort_unstable();
        unvisited.sort_unstable();

        CoverageReport {
            nodes,
            missing_branches,
            unvisited,
        }
    }

    pub fn visited(&self, id: ExprId) -> bool {
        self.nodes.get(&id).map(|n| n.visited).unwrap_or(false)
    }

    pub fn values(&self, id: ExprId) -> &[Value] {
        self.nodes
            .get(&id)
            .map(|n| n.values.as_slice())
            .unwrap_or(&[])
    }

    /// Boolean nodes whose observed set lacks `true` or `false`.
    pub fn missing_branches(&self) -> &[ExprId] {
        &self.missing_branches
    }

    /// Nodes no evaluation ever traversed.
    pub fn unvisited(&self) -> &[ExprId] {
        &self.unvisited
    }
}

fn is_block(e: &Expr) -> bool {
    matches!(&e.kind, ExprKind::Call { function, .. } if function == operators::BLOCK)
}

fn mark(nodes: &mut HashMap<ExprId, NodeCoverage>, id: ExprId) {
    nodes.entry(id).or_default().visited = true;
}

/// Post-order pass: a parent is visited when any direct child is; the
/// block container inherits from its body, a ternary additionally
/// absorbs both branches' observed values, and a member call's target
/// is marked when the call is.
fn propagate_ancestors(e: &Expr, nodes: &mut HashMap<ExprId, NodeCoverage>) -> bool {
    let mut any_child = false;
    for child in e.children() {
        if propagate_ancestors(child, nodes) {
            any_child = true;
        }
    }
    if any_child {
        mark(nodes, e.id);
    }
    match &e.kind {
        ExprKind::Call {
            function,
            args,
            target,
        } => {
            if function == operators::CONDITIONAL && args.len() == 3 {
                let mut inherited: Vec<Value> = Vec::new();
                for branch in &args[1..] {
                    if let Some(n) = nodes.get(&branch.id) {
                        inherited.extend(n.values.iter().cloned());
                    }
                }
                let own = nodes.entry(e.id).or_default();
                for v in inherited {
                    if !own.values.iter().any(|s| s.equal(&v).is_true()) {
                        own.values.push(v);
                    }
                }
            }
            if function == operators::BLOCK && args.len() == 2 {
                if nodes.get(&args[1].id).map(|n| n.visited).unwrap_or(false) {
                    mark(nodes, e.id);
                }
            }
            if let Some(t) = target {
                if nodes.get(&e.id).map(|n| n.visited).unwrap_or(false) {
                    mark(nodes, t.id);
                }
            }
        }
        _ => {}
    }
    nodes.get(&e.id).map(|n| n.visited).unwrap_or(false)
}

/// Pre-order pass: a select operand and the single argument of `!` or
/// unary minus inherit visitedness from their parent.
fn descend_single_children(e: &Expr, nodes: &mut HashMap<ExprId, NodeCoverage>) {
    let self_visited = nodes.get(&e.id).map(|n| n.visited).unwrap_or(false);
    if self_visited {
        match &e.kind {
            ExprKind::Select { operand, .. } => mark(nodes, operand.id),
            ExprKind::Call { function, args, .. }
                if args.len() == 1
                    && (function == operators::LOGICAL_NOT || function == operators::NEGATE) =>
            {
                mark(nodes, args[0].id)
            }
            _ => {}
        }
    }
    for child in e.children() {
        descend_single_children(child, nodes);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tracker_dedupes_by_engine_equality() {
        let t = CoverageTracker::new();
        t.record(1, &Value::Int(1));
        t.record(1, &Value::Int(1));
        t.record(1, &Value::Int(2));
        let snap = t.snapshot();
        assert_eq!(snap.get(&1).map(Vec::len), Some(2));
    }

    #[test]
    fn test_bool_values_recorded_for_branches() {
        let t = CoverageTracker::new();
        t.record(4, &Value::Bool(true));
        t.record(4, &Value::Bool(false));
        t.record(4, &Value::Bool(true));
        let snap = t.snapshot();
        assert_eq!(snap.get(&4).map(Vec::len), Some(2));
    }
}
