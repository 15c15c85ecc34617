// ABOUTME: Activations: per-evaluation name resolution, partial inputs, interrupts

use crate::functions::FunctionImpl;
use crate::value::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// A name-to-value resolver for the duration of one evaluation.
///
/// Activations may be partial: a name can be declared present-or-unknown
/// so that references to it evaluate to an unknown value instead of
/// failing. Activations may also supply per-call function overloads and
/// a cooperative interrupt signal, both consulted during evaluation.
pub trait Activation: Send + Sync {
    fn resolve(&self, name: &str) -> Option<Value>;

    /// Whether the name is declared present-or-unknown.
    fn is_unknown(&self, _name: &str) -> bool {
        false
    }

    /// A late-bound implementation for the given overload id, if any.
    fn function_override(&self, _overload_id: &str) -> Option<FunctionImpl> {
        None
    }

    /// Cooperative cancellation, checked at comprehension loop
    /// boundaries.
    fn interrupted(&self) -> bool {
        false
    }
}

/// The empty activation: resolves nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct EmptyActivation;

impl Activation for EmptyActivation {
    fn resolve(&self, _name: &str) -> Option<Value> {
        None
    }
}

/// A flat map of bindings.
#[derive(Debug, Clone, Default)]
pub struct MapActivation {
    values: HashMap<String, Value>,
}

impl MapActivation {
    pub fn new() -> Self {
        MapActivation::default()
    }

    pub fn bind(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.values.insert(name.into(), value.into());
        self
    }

    pub fn bind_value(mut self, name: impl Into<String>, value: Value) -> Self {
        self.values.insert(name.into(), value);
        self
    }
}

impl From<HashMap<String, Value>> for MapActivation {
    fn from(values: HashMap<String, Value>) -> Self {
        MapActivation { values }
    }
}

impl Activation for MapActivation {
    fn resolve(&self, name: &str) -> Option<Value> {
        self.values.get(name).cloned()
    }
}

/// Child-over-parent chaining: the child shadows the parent for names it
/// binds; everything else falls through, including unknown declarations,
/// overrides, and interrupts.
pub struct HierarchicalActivation {
    parent: Arc<dyn Activation>,
    child: Arc<dyn Activation>,
}

impl HierarchicalActivation {
    pub fn new(parent: Arc<dyn Activation>, child: Arc<dyn Activation>) -> Self {
        HierarchicalActivation { parent, child }
    }
}

impl Activation for HierarchicalActivation {
    fn resolve(&self, name: &str) -> Option<Value> {
        self.child.resolve(name).or_else(|| self.parent.resolve(name))
    }

    fn is_unknown(&self, name: &str) -> bool {
        self.child.is_unknown(name) || self.parent.is_unknown(name)
    }

    fn function_override(&self, overload_id: &str) -> Option<FunctionImpl> {
        self.child
            .function_override(overload_id)
            .or_else(|| self.parent.function_override(overload_id))
    }

    fn interrupted(&self) -> bool {
        self.child.interrupted() || self.parent.interrupted()
    }
}

/// An activation that additionally marks a set of names as
/// present-or-unknown: resolving such a name yields an unknown value
/// carrying the referencing node's id rather than a missing-attribute
/// error.
#[derive(Debug, Clone, Default)]
pub struct PartialActivation {
    base: MapActivation,
    unknown_names: Vec<String>,
}

impl PartialActivation {
    pub fn new(base: MapActivation, unknown_names: Vec<String>) -> Self {
        PartialActivation {
            base,
            unknown_names,
        }
    }
}

impl Activation for PartialActivation {
    fn resolve(&self, name: &str) -> Option<Value> {
        self.base.resolve(name)
    }

    fn is_unknown(&self, name: &str) -> bool {
        self.unknown_names.iter().any(|n| n == name)
    }
}

/// Wraps an activation with a shared interrupt flag. Setting the flag
/// makes the evaluation return an interrupted error at the next
/// comprehension loop boundary.
pub struct InterruptibleActivation<A: Activation> {
    inner: A,
    flag: Arc<AtomicBool>,
}

impl<A: Activation> InterruptibleActivation<A> {
    pub fn new(inner: A) -> (Self, Arc<AtomicBool>) {
        let flag = Arc::new(AtomicBool::new(false));
        (
            InterruptibleActivation {
                inner,
                flag: flag.clone(),
            },
            flag,
        )
    }
}

impl<A: Activation> Activation for InterruptibleActivation<A> {
    fn resolve(&self, name: &str) -> Option<Value> {
        self.inner.resolve(name)
    }

    fn is_unknown(&self, name: &str) -> bool {
        self.inner.is_unknown(name)
    }

    fn function_override(&self, overload_id: &str) -> Option<FunctionImpl> {
        self.inner.function_override(overload_id)
    }

    fn interrupted(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }
}

/// Wraps an activation with per-call function overloads, keyed by
/// overload id. The planned program is never mutated; the late-binding
/// decorator consults these at each call.
pub struct OverrideActivation<A: Activation> {
    inner: A,
    overrides: HashMap<String, FunctionImpl>,
}

impl<A: Activation> OverrideActivation<A> {
    pub fn new(inner: A) -> Self {
        OverrideActivation {
            inner,
            overrides: HashMap::new(),
        }
    }

    pub fn with_override(mut self, overload_id: impl Into<String>, imp: FunctionImpl) -> Self {
        self.overrides.insert(overload_id.into(), imp);
        self
    }
}

impl<A: Activation> Activation for OverrideActivation<A> {
    fn resolve(&self, name: &str) -> Option<Value> {
        self.inner.resolve(name)
    }

    fn is_unknown(&self, name: &str) -> bool {
        self.inner.is_unknown(name)
    }

    fn function_override(&self, overload_id: &str) -> Option<FunctionImpl> {
        self.overrides
            .get(overload_id)
            .cloned()
            .or_else(|| self.inner.function_override(overload_id))
    }

    fn interrupted(&self) -> bool {
        self.inner.interrupted()
    }
}

/// Comprehension scratch scope: the iteration variable and accumulator
/// overlay the parent for the duration of one fold.
pub(crate) struct FoldScope<'a> {
    pub parent: &'a dyn Activation,
    pub iter_name: &'a str,
    pub iter_value: Option<Value>,
    pub accu_name: &'a str,
    pub accu_value: Value,
}

impl Activation for FoldScope<'_> {
    fn resolve(&self, name: &str) -> Option<Value> {
        if name == self.accu_name {
            return Some(self.accu_value.clone());
        }
        if name == self.iter_name {
            if let Some(v) = &self.iter_value {
                return Some(v.clone());
            }
        }
        self.parent.resolve(name)
    }

    fn is_unknown(&self, name: &str) -> bool {
        if name == self.accu_name || name == self.iter_name {
            return false;
        }
        self.parent.is_unknown(name)
    }

    fn function_override(&self, overload_id: &str) -> Option<FunctionImpl> {
        self.parent.function_override(overload_id)
    }

    fn interrupted(&self) -> bool {
        self.parent.interrupted()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_activation() {
        let act = MapActivation::new().bind("x", 42i64).bind("s", "hi");
        assert!(matches!(act.resolve("x"), Some(Value::Int(42))));
        assert!(act.resolve("missing").is_none());
    }

    #[test]
    fn test_hierarchical_shadowing() {
        let parent = MapActivation::new().bind("x", 1i64).bind("y", 2i64);
        let child = MapActivation::new().bind("x", 10i64);
        let act = HierarchicalActivation::new(Arc::new(parent), Arc::new(child));
        assert!(matches!(act.resolve("x"), Some(Value::Int(10))));
        assert!(matches!(act.resolve("y"), Some(Value::Int(2))));
    }

    #[test]
    fn test_partial_unknown_names() {
        let act = PartialActivation::new(
            MapActivation::new().bind("present", true),
            vec!["absent".to_string()],
        );
        assert!(act.is_unknown("absent"));
        assert!(!act.is_unknown("present"));
        assert!(act.resolve("absent").is_none());
    }

    #[test]
    fn test_interrupt_flag() {
        let (act, flag) = InterruptibleActivation::new(EmptyActivation);
        assert!(!act.interrupted());
        flag.store(true, Ordering::Relaxed);
        assert!(act.interrupted());
    }

    #[test]
    fn test_fold_scope_shadows_parent() {
        let parent = MapActivation::new().bind("x", 1i64);
        let scope = FoldScope {
            parent: &parent,
            iter_name: "x",
            iter_value: Some(Value::Int(5)),
            accu_name: "__result__",
            accu_value: Value::Bool(true),
        };
        assert!(matches!(scope.resolve("x"), Some(Value::Int(5))));
        assert!(matches!(scope.resolve("__result__"), Some(Value::Bool(true))));
    }
}
