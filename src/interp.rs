// ABOUTME: Interpretable nodes and the evaluator that drives them

use crate::activation::{Activation, FoldScope};
use crate::ast::ExprId;
use crate::attributes::Attr;
use crate::coverage::CoverageTracker;
use crate::error::ErrorKind;
use crate::functions::Overload;
use crate::provider::TypeProvider;
use crate::value::{propagate, CelMap, MapKey, Value};
use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex};

/// A planned, executable expression node. Every AST node lowers to
/// exactly one interpretable; interpretables carry the originating node
/// id for diagnostics and coverage. The tree is immutable and shared
/// freely across concurrent evaluations.
pub enum Interp {
    Const {
        id: ExprId,
        value: Value,
    },
    Attr(Attr),
    /// Presence test: the expansion of `has(operand.field)`.
    TestOnly {
        id: ExprId,
        operand: Box<Interp>,
        field: String,
    },
    And {
        id: ExprId,
        lhs: Box<Interp>,
        rhs: Box<Interp>,
        exhaustive: bool,
    },
    Or {
        id: ExprId,
        lhs: Box<Interp>,
        rhs: Box<Interp>,
        exhaustive: bool,
    },
    Ternary {
        id: ExprId,
        cond: Box<Interp>,
        truthy: Box<Interp>,
        falsy: Box<Interp>,
        exhaustive: bool,
    },
    Call {
        id: ExprId,
        function: String,
        overloads: Vec<Arc<Overload>>,
        args: Vec<Interp>,
        non_strict: bool,
    },
    MakeList {
        id: ExprId,
        elems: Vec<Interp>,
        optional_indices: Vec<usize>,
        max_size: Option<usize>,
    },
    MakeMap {
        id: ExprId,
        entries: Vec<MapEntryInterp>,
        max_size: Option<usize>,
    },
    MakeStruct {
        id: ExprId,
        type_name: String,
        fields: Vec<FieldInterp>,
        provider: Arc<dyn TypeProvider>,
    },
    Fold(Box<FoldInterp>),
    /// Optimized membership test over a pre-hashed constant set.
    InSet {
        id: ExprId,
        arg: Box<Interp>,
        keys: Arc<HashSet<MapKey>>,
    },
    /// `cel.@block`: lazily-bound locals addressed as `@index0..N`.
    Block {
        id: ExprId,
        inits: Arc<Vec<Interp>>,
        body: Box<Interp>,
    },
    /// A call wrapped for late binding: the activation may supply an
    /// alternate implementation per evaluation, keyed by overload id.
    LateCall {
        key: String,
        inner: Box<Interp>,
    },
    /// Observer wrapper recording each produced value against the node.
    Observed {
        inner: Box<Interp>,
        tracker: Arc<CoverageTracker>,
    },
}

pub struct MapEntryInterp {
    pub key: Interp,
    pub value: Interp,
    pub optional: bool,
}

pub struct FieldInterp {
    pub name: String,
    pub value: Interp,
    pub optional: bool,
}

pub struct FoldInterp {
    pub id: ExprId,
    pub iter_var: String,
    pub accu_var: String,
    pub range: Interp,
    pub init: Interp,
    pub cond: Interp,
    pub step: Interp,
    pub result: Interp,
    pub exhaustive: bool,
    pub max_iters: Option<u64>,
}

impl fmt::Debug for Interp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Interp::Const { id, value } => write!(f, "Const#{}({})", id, value),
            Interp::Attr(a) => write!(f, "Attr#{}", a.id()),
            Interp::TestOnly { id, field, .. } => write!(f, "TestOnly#{}(.{})", id, field),
            Interp::And { id, .. } => write!(f, "And#{}", id),
            Interp::Or { id, .. } => write!(f, "Or#{}", id),
            Interp::Ternary { id, .. } => write!(f, "Ternary#{}", id),
            Interp::Call { id, function, .. } => write!(f, "Call#{}({})", id, function),
            Interp::MakeList { id, .. } => write!(f, "MakeList#{}", id),
            Interp::MakeMap { id, .. } => write!(f, "MakeMap#{}", id),
            Interp::MakeStruct { id, type_name, .. } => {
                write!(f, "MakeStruct#{}({})", id, type_name)
            }
            Interp::Fold(c) => write!(f, "Fold#{}", c.id),
            Interp::InSet { id, .. } => write!(f, "InSet#{}", id),
            Interp::Block { id, .. } => write!(f, "Block#{}", id),
            Interp::LateCall { inner, .. } => write!(f, "Late({:?})", inner),
            Interp::Observed { inner, .. } => write!(f, "Observed({:?})", inner),
        }
    }
}

impl Interp {
    pub fn id(&self) -> ExprId {
        match self {
            Interp::Const { id, .. }
            | Interp::TestOnly { id, .. }
            | Interp::And { id, .. }
            | Interp::Or { id, .. }
            | Interp::Ternary { id, .. }
            | Interp::Call { id, .. }
            | Interp::MakeList { id, .. }
            | Interp::MakeMap { id, .. }
            | Interp::MakeStruct { id, .. }
            | Interp::InSet { id, .. }
            | Interp::Block { id, .. } => *id,
            Interp::Attr(a) => a.id(),
            Interp::Fold(c) => c.id,
            Interp::LateCall { inner, .. } => inner.id(),
            Interp::Observed { inner, .. } => inner.id(),
        }
    }

    pub fn eval(&self, act: &dyn Activation) -> Value {
        match self {
            Interp::Const { value, .. } => value.clone(),
            Interp::Attr(a) => a.eval(act),
            Interp::TestOnly { operand, field, .. } => {
                let v = operand.eval(act);
                if let Some(p) = propagate(&[&v]) {
                    return p;
                }
                match &v {
                    Value::Struct(s) => s.has_field(field),
                    Value::Map(m) => {
                        Value::Bool(m.contains_key(&MapKey::String(Arc::from(field.as_str()))))
                    }
                    other => Value::error(
                        ErrorKind::NoSuchOverload,
                        format!("has() is not supported on {}", other.kind_name()),
                    ),
                }
            }
            Interp::And {
                lhs,
                rhs,
                exhaustive,
                ..
            } => {
                let l = lhs.eval(act);
                if !exhaustive && matches!(l, Value::Bool(false)) {
                    return Value::Bool(false);
                }
                let r = rhs.eval(act);
                combine_logical(l, r, true)
            }
            Interp::Or {
                lhs,
                rhs,
                exhaustive,
                ..
            } => {
                let l = lhs.eval(act);
                if !exhaustive && matches!(l, Value::Bool(true)) {
                    return Value::Bool(true);
                }
                let r = rhs.eval(act);
                combine_logical(l, r, false)
            }
            Interp::Ternary {
                cond,
                truthy,
                falsy,
                exhaustive,
                ..
            } => {
                let c = cond.eval(act);
                if *exhaustive {
                    let t = truthy.eval(act);
                    let f = falsy.eval(act);
                    return match c {
                        Value::Bool(true) => t,
                        Value::Bool(false) => f,
                        v @ (Value::Error(_) | Value::Unknown(_)) => v,
                        other => Value::no_such_overload("_?_:_", &[other]),
                    };
                }
                match c {
                    Value::Bool(true) => truthy.eval(act),
                    Value::Bool(false) => falsy.eval(act),
                    v @ (Value::Error(_) | Value::Unknown(_)) => v,
                    other => Value::no_such_overload("_?_:_", &[other]),
                }
            }
            Interp::Call {
                function,
                overloads,
                args,
                non_strict,
                ..
            } => {
                let vals: Vec<Value> = args.iter().map(|a| a.eval(act)).collect();
                dispatch(function, overloads, &vals, *non_strict)
            }
            Interp::MakeList {
                elems,
                optional_indices,
                max_size,
                ..
            } => {
                let vals: Vec<Value> = elems.iter().map(|e| e.eval(act)).collect();
                let refs: Vec<&Value> = vals.iter().collect();
                if let Some(p) = propagate(&refs) {
                    return p;
                }
                let mut out = Vec::with_capacity(vals.len());
                for (i, v) in vals.into_iter().enumerate() {
                    if optional_indices.contains(&i) {
                        match v {
                            Value::Optional(o) => match o.as_ref() {
                                Some(inner) => out.push(inner.clone()),
                                None => {}
                            },
                            other => {
                                return Value::error(
                                    ErrorKind::InvalidArgument,
                                    format!(
                                        "optional list entry must be optional, got {}",
                                        other.kind_name()
                                    ),
                                )
                            }
                        }
                    } else {
                        out.push(v);
                    }
                }
                if let Some(max) = max_size {
                    if out.len() > *max {
                        return Value::error(
                            ErrorKind::InvalidArgument,
                            format!("list construction exceeds size limit {}", max),
                        );
                    }
                }
                Value::list(out)
            }
            Interp::MakeMap {
                entries, max_size, ..
            } => {
                let mut pairs = Vec::with_capacity(entries.len());
                for e in entries {
                    pairs.push((e.key.eval(act), e.value.eval(act), e.optional));
                }
                let refs: Vec<&Value> = pairs
                    .iter()
                    .flat_map(|(k, v, _)| [k, v])
                    .collect();
                if let Some(p) = propagate(&refs) {
                    return p;
                }
                let mut m = CelMap::new();
                for (k, v, optional) in pairs {
                    let v = if optional {
                        match v {
                            Value::Optional(o) => match o.as_ref() {
                                Some(inner) => inner.clone(),
                                None => continue,
                            },
                            other => {
                                return Value::error(
                                    ErrorKind::InvalidArgument,
                                    format!(
                                        "optional map entry must be optional, got {}",
                                        other.kind_name()
                                    ),
                                )
                            }
                        }
                    } else {
                        v
                    };
                    let key = match MapKey::for_insert(&k) {
                        Ok(key) => key,
                        Err(e) => return Value::Error(Arc::new(e)),
                    };
                    if !m.insert(key, v) {
                        return Value::error(
                            ErrorKind::InvalidArgument,
                            format!("duplicate map key: {}", k),
                        );
                    }
                }
                if let Some(max) = max_size {
                    if m.len() > *max {
                        return Value::error(
                            ErrorKind::InvalidArgument,
                            format!("map construction exceeds size limit {}", max),
                        );
                    }
                }
                Value::map(m)
            }
            Interp::MakeStruct {
                type_name,
                fields,
                provider,
                ..
            } => {
                let mut vals = Vec::with_capacity(fields.len());
                for fl in fields {
                    vals.push((fl.name.clone(), fl.value.eval(act), fl.optional));
                }
                let refs: Vec<&Value> = vals.iter().map(|(_, v, _)| v).collect();
                if let Some(p) = propagate(&refs) {
                    return p;
                }
                let mut resolved = Vec::with_capacity(vals.len());
                for (name, v, optional) in vals {
                    if optional {
                        match v {
                            Value::Optional(o) => match o.as_ref() {
                                Some(inner) => resolved.push((name, inner.clone())),
                                None => {}
                            },
                            other => {
                                return Value::error(
                                    ErrorKind::InvalidArgument,
                                    format!(
                                        "optional field '{}' must be optional, got {}",
                                        name,
                                        other.kind_name()
                                    ),
                                )
                            }
                        }
                    } else {
                        resolved.push((name, v));
                    }
                }
                match provider.new_value(type_name, resolved) {
                    Ok(v) => v,
                    Err(e) => Value::Error(Arc::new(e)),
                }
            }
            Interp::Fold(f) => f.eval(act),
            Interp::InSet { arg, keys, .. } => {
                let v = arg.eval(act);
                if let Some(p) = propagate(&[&v]) {
                    return p;
                }
                match MapKey::for_lookup(&v) {
                    Ok(Some(key)) => Value::Bool(keys.contains(&key)),
                    _ => Value::Bool(false),
                }
            }
            Interp::Block { inits, body, .. } => {
                let scope = BlockScope {
                    parent: act,
                    inits,
                    memo: Mutex::new(vec![None; inits.len()]),
                };
                body.eval(&scope)
            }
            Interp::LateCall { key, inner } => {
                if let Some(imp) = act.function_override(key) {
                    if let Interp::Call {
                        args, non_strict, ..
                    } = inner.as_ref()
                    {
                        let vals: Vec<Value> = args.iter().map(|a| a.eval(act)).collect();
                        if !non_strict {
                            let refs: Vec<&Value> = vals.iter().collect();
                            if let Some(p) = propagate(&refs) {
                                return p;
                            }
                        }
                        return imp(&vals);
                    }
                }
                inner.eval(act)
            }
            Interp::Observed { inner, tracker } => {
                let v = inner.eval(act);
                tracker.record(inner.id(), &v);
                v
            }
        }
    }
}

/// Overload dispatch shared by calls and late-bound calls: propagate
/// errors/unknowns for strict functions, then select the first overload
/// whose declared parameter types accept the runtime arguments.
pub(crate) fn dispatch(
    function: &str,
    overloads: &[Arc<Overload>],
    vals: &[Value],
    non_strict: bool,
) -> Value {
    if !non_strict {
        let refs: Vec<&Value> = vals.iter().collect();
        if let Some(p) = propagate(&refs) {
            return p;
        }
    }
    for ov in overloads {
        if ov.params.len() != vals.len() {
            continue;
        }
        // A non-strict overload receives errors and unknowns as
        // arguments, so those satisfy any declared parameter type.
        let accepts = vals.iter().zip(ov.params.iter()).all(|(v, p)| {
            v.matches_type(p) || (non_strict && (v.is_error() || v.is_unknown()))
        });
        if accepts {
            if let Some(imp) = &ov.imp {
                return imp(vals);
            }
        }
    }
    Value::no_such_overload(function, vals)
}

/// Combine logical operands per the commutatively absorbing rules:
/// the absorbing element wins over errors and unknowns on either side,
/// unknowns win over errors, and anything else is a dispatch error.
fn combine_logical(l: Value, r: Value, is_and: bool) -> Value {
    let absorbing = !is_and;
    if matches!(&l, Value::Bool(b) if *b == absorbing)
        || matches!(&r, Value::Bool(b) if *b == absorbing)
    {
        return Value::Bool(absorbing);
    }
    match (&l, &r) {
        (Value::Bool(a), Value::Bool(b)) => {
            Value::Bool(if is_and { *a && *b } else { *a || *b })
        }
        (Value::Unknown(x), Value::Unknown(y)) => Value::Unknown(Arc::new(x.merge(y))),
        (Value::Unknown(_), _) => l,
        (_, Value::Unknown(_)) => r,
        (Value::Error(_), _) => l,
        (_, Value::Error(_)) => r,
        _ => Value::no_such_overload(if is_and { "_&&_" } else { "_||_" }, &[l, r]),
    }
}

impl FoldInterp {
    fn eval(&self, act: &dyn Activation) -> Value {
        let range = self.range.eval(act);
        if let Some(p) = propagate(&[&range]) {
            return p;
        }
        let iter = match range.iter_elems() {
            Ok(it) => it,
            Err(e) => return Value::Error(Arc::new(e)),
        };
        let mut accu = self.init.eval(act);
        let mut steps: u64 = 0;
        for item in iter {
            if act.interrupted() {
                return Value::error(ErrorKind::Interrupted, "evaluation interrupted");
            }
            steps += 1;
            if let Some(max) = self.max_iters {
                if steps > max {
                    return Value::error(
                        ErrorKind::InvalidArgument,
                        format!("comprehension exceeded step limit {}", max),
                    );
                }
            }
            let scope = FoldScope {
                parent: act,
                iter_name: &self.iter_var,
                iter_value: Some(item),
                accu_name: &self.accu_var,
                accu_value: accu.clone(),
            };
            if !self.exhaustive {
                match self.cond.eval(&scope) {
                    Value::Bool(true) => {}
                    Value::Bool(false) => break,
                    v @ (Value::Error(_) | Value::Unknown(_)) => return v,
                    other => return Value::no_such_overload("<loop condition>", &[other]),
                }
            }
            accu = self.step.eval(&scope);
        }
        let scope = FoldScope {
            parent: act,
            iter_name: &self.iter_var,
            iter_value: None,
            accu_name: &self.accu_var,
            accu_value: accu,
        };
        self.result.eval(&scope)
    }
}

/// Scope for `cel.@block`: indexed locals computed on first reference
/// and memoized for the remainder of the evaluation.
struct BlockScope<'a> {
    parent: &'a dyn Activation,
    inits: &'a [Interp],
    memo: Mutex<Vec<Option<Value>>>,
}

impl Activation for BlockScope<'_> {
    fn resolve(&self, name: &str) -> Option<Value> {
        if let Some(idx) = name
            .strip_prefix("@index")
            .and_then(|s| s.parse::<usize>().ok())
        {
            if idx < self.inits.len() {
                {
                    let memo = self.memo.lock().unwrap_or_else(|e| e.into_inner());
                    if let Some(v) = &memo[idx] {
                        return Some(v.clone());
                    }
                }
                let v = self.inits[idx].eval(self);
                self.memo.lock().unwrap_or_else(|e| e.into_inner())[idx] = Some(v.clone());
                return Some(v);
            }
        }
        self.parent.resolve(name)
    }

    fn is_unknown(&self, name: &str) -> bool {
        self.parent.is_unknown(name)
    }

    fn function_override(&self, overload_id: &str) -> Option<crate::functions::FunctionImpl> {
        self.parent.function_override(overload_id)
    }

    fn interrupted(&self) -> bool {
        self.parent.interrupted()
    }
}
