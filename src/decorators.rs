// ABOUTME: Plan-time decorators: constant folding, set rewrite, regex, exhaustive, late bind, observer

use crate::ast::operators;
use crate::coverage::CoverageTracker;
use crate::error::ErrorKind;
use crate::functions::Overload;
use crate::interp::{self, Interp};
use crate::types::CelType;
use crate::value::{MapKey, Value};
use log::debug;
use regex::Regex;
use std::collections::HashSet;
use std::sync::Arc;

/// The constant value a node produces, looking through wrappers earlier
/// decorators may have applied to children.
fn as_const(i: &Interp) -> Option<Value> {
    match i {
        Interp::Const { value, .. } => Some(value.clone()),
        Interp::Observed { inner, .. } | Interp::LateCall { inner, .. } => as_const(inner),
        _ => None,
    }
}

/// Fold calls over constant arguments, collapse all-literal collection
/// constructors, and rewrite constant `in` lists to hashed set
/// membership.
pub fn optimize(node: Interp) -> Interp {
    match node {
        Interp::Call {
            id,
            function,
            overloads,
            args,
            non_strict,
        } => optimize_call(id, function, overloads, args, non_strict),
        Interp::MakeList {
            id,
            elems,
            optional_indices,
            max_size,
        } => {
            if optional_indices.is_empty() {
                let consts: Option<Vec<Value>> = elems.iter().map(as_const).collect();
                if let Some(values) = consts {
                    if max_size.map_or(true, |m| values.len() <= m) {
                        return Interp::Const {
                            id,
                            value: Value::list(values),
                        };
                    }
                }
            }
            Interp::MakeList {
                id,
                elems,
                optional_indices,
                max_size,
            }
        }
        Interp::MakeMap {
            id,
            entries,
            max_size,
        } => {
            let foldable = entries.iter().all(|e| {
                !e.optional && as_const(&e.key).is_some() && as_const(&e.value).is_some()
            });
            if foldable && max_size.map_or(true, |m| entries.len() <= m) {
                let mut m = crate::value::CelMap::new();
                let mut ok = true;
                for e in &entries {
                    let (k, v) = match (as_const(&e.key), as_const(&e.value)) {
                        (Some(k), Some(v)) => (k, v),
                        _ => {
                            ok = false;
                            break;
                        }
                    };
                    match MapKey::for_insert(&k) {
                        Ok(key) => {
                            if !m.insert(key, v) {
                                // Duplicate key: keep the constructor so
                                // evaluation reports the error.
                                ok = false;
                                break;
                            }
                        }
                        Err(_) => {
                            ok = false;
                            break;
                        }
                    }
                }
                if ok {
                    return Interp::Const {
                        id,
                        value: Value::map(m),
                    };
                }
            }
            Interp::MakeMap {
                id,
                entries,
                max_size,
            }
        }
        other => other,
    }
}

fn optimize_call(
    id: crate::ast::ExprId,
    function: String,
    overloads: Vec<Arc<Overload>>,
    args: Vec<Interp>,
    non_strict: bool,
) -> Interp {
    // `x in <constant primitive list>` becomes a pre-hashed membership
    // test. Key normalization covers cross-numeric equality, so each
    // integral element stands in for its int/uint/double spellings.
    if function == operators::IN && args.len() == 2 {
        if let Some(Value::List(items)) = as_const(&args[1]) {
            if let Some(keys) = build_key_set(&items) {
                debug!(
                    "rewrote 'in' over {} constant elements to set membership",
                    items.len()
                );
                let mut args = args;
                let arg = args.remove(0);
                return Interp::InSet {
                    id,
                    arg: Box::new(arg),
                    keys: Arc::new(keys),
                };
            }
        }
    }

    let consts: Option<Vec<Value>> = args.iter().map(as_const).collect();
    if let Some(vals) = consts {
        let out = interp::dispatch(&function, &overloads, &vals, non_strict);
        // Errors are left in place so evaluation surfaces them with the
        // original call shape.
        if !out.is_error() && !out.is_unknown() {
            debug!("folded constant call '{}' at node {}", function, id);
            return Interp::Const { id, value: out };
        }
    }
    Interp::Call {
        id,
        function,
        overloads,
        args,
        non_strict,
    }
}

/// All elements must be hashable primitives (no bytes, no fractional
/// doubles) for the set rewrite to preserve semantics.
fn build_key_set(items: &[Value]) -> Option<HashSet<MapKey>> {
    let mut keys = HashSet::with_capacity(items.len());
    for item in items {
        match MapKey::for_lookup(item) {
            Ok(Some(k)) => {
                keys.insert(k);
            }
            _ => return None,
        }
    }
    Some(keys)
}

/// Pre-compile constant `matches` patterns; an invalid constant pattern
/// collapses to the error it would produce at runtime.
pub fn compile_regex(node: Interp) -> Interp {
    if let Interp::Call {
        id,
        function,
        overloads,
        args,
        non_strict,
    } = node
    {
        if function == "matches" && args.len() == 2 {
            if let Some(Value::String(pattern)) = as_const(&args[1]) {
                return match Regex::new(&pattern) {
                    Ok(re) => {
                        debug!("pre-compiled constant pattern at node {}", id);
                        let re = Arc::new(re);
                        let compiled = Overload::member(
                            "matches_precompiled",
                            vec![CelType::String, CelType::String],
                            CelType::Bool,
                        )
                        .with_impl(move |args: &[Value]| match &args[0] {
                            Value::String(s) => Value::Bool(re.is_match(s)),
                            other => {
                                Value::no_such_overload("matches", std::slice::from_ref(other))
                            }
                        });
                        Interp::Call {
                            id,
                            function,
                            overloads: vec![Arc::new(compiled)],
                            args,
                            non_strict,
                        }
                    }
                    Err(e) => Interp::Const {
                        id,
                        value: Value::error(
                            ErrorKind::InvalidArgument,
                            format!("invalid pattern: {}", e),
                        ),
                    },
                };
            }
        }
        return Interp::Call {
            id,
            function,
            overloads,
            args,
            non_strict,
        };
    }
    node
}

/// Replace short-circuit nodes with exhaustive ones: both logical
/// operands, both ternary branches, and full comprehension ranges are
/// evaluated.
pub fn exhaustive(node: Interp) -> Interp {
    match node {
        Interp::And { id, lhs, rhs, .. } => Interp::And {
            id,
            lhs,
            rhs,
            exhaustive: true,
        },
        Interp::Or { id, lhs, rhs, .. } => Interp::Or {
            id,
            lhs,
            rhs,
            exhaustive: true,
        },
        Interp::Ternary {
            id,
            cond,
            truthy,
            falsy,
            ..
        } => Interp::Ternary {
            id,
            cond,
            truthy,
            falsy,
            exhaustive: true,
        },
        Interp::Fold(mut f) => {
            f.exhaustive = true;
            Interp::Fold(f)
        }
        other => other,
    }
}

/// Wrap calls so the activation may supply an alternate implementation
/// per evaluation. The wrapped node is never mutated; a node already
/// wrapped stays wrapped.
pub fn late_bind(node: Interp) -> Interp {
    let key = match &node {
        Interp::Call {
            function,
            overloads,
            ..
        } => Some(if overloads.len() == 1 {
            overloads[0].id.clone()
        } else {
            function.clone()
        }),
        _ => None,
    };
    match key {
        Some(key) => Interp::LateCall {
            key,
            inner: Box::new(node),
        },
        None => node,
    }
}

/// Observer wrapper; applied last so it sees final node shapes.
pub fn observe(node: Interp, tracker: Arc<CoverageTracker>) -> Interp {
    match node {
        Interp::Observed { .. } => node,
        other => Interp::Observed {
            inner: Box::new(other),
            tracker,
        },
    }
}
