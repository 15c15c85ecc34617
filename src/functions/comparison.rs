//! Comparison operators: `_==_`, `_!=_`, `_<_`, `_<=_`, `_>_`, `_>=_`
//!
//! Equality is total over the value set and never errors on mismatched
//! types. The orderings are declared per comparable type, with explicit
//! cross-numeric overloads so `1 < 1.5` and `2u >= 1` type-check.

use crate::env::Env;
use crate::functions::Overload;
use crate::types::CelType;
use crate::value::Value;
use std::cmp::Ordering;
use std::sync::Arc;

fn equals(args: &[Value]) -> Value {
    args[0].equal(&args[1])
}

fn not_equals(args: &[Value]) -> Value {
    match args[0].equal(&args[1]) {
        Value::Bool(b) => Value::Bool(!b),
        other => other,
    }
}

fn compare_with(args: &[Value], pred: fn(Ordering) -> bool) -> Value {
    match args[0].compare(&args[1]) {
        Ok(o) => Value::Bool(pred(o)),
        Err(e) => Value::Error(Arc::new(e)),
    }
}

fn ordering_overloads(id_prefix: &str, pred: fn(Ordering) -> bool) -> Vec<Overload> {
    let mut overloads = Vec::new();
    let numerics = [
        (CelType::Int, "int64"),
        (CelType::Uint, "uint64"),
        (CelType::Double, "double"),
    ];
    for (lt, ln) in &numerics {
        for (rt, rn) in &numerics {
            let id = if ln == rn {
                format!("{}_{}", id_prefix, ln)
            } else {
                format!("{}_{}_{}", id_prefix, ln, rn)
            };
            overloads.push(
                Overload::global(&id, vec![lt.clone(), rt.clone()], CelType::Bool)
                    .with_impl(move |args| compare_with(args, pred)),
            );
        }
    }
    let simple = [
        (CelType::Bool, "bool"),
        (CelType::String, "string"),
        (CelType::Bytes, "bytes"),
        (CelType::Timestamp, "timestamp"),
        (CelType::Duration, "duration"),
    ];
    for (t, n) in simple {
        overloads.push(
            Overload::global(
                &format!("{}_{}", id_prefix, n),
                vec![t.clone(), t],
                CelType::Bool,
            )
            .with_impl(move |args| compare_with(args, pred)),
        );
    }
    overloads
}

/// Register equality and the orderings.
pub fn register(env: &mut Env) {
    env.register_function(
        "_==_",
        vec![
            Overload::global("equals", vec![CelType::Dyn, CelType::Dyn], CelType::Bool)
                .with_impl(equals),
        ],
    );
    env.register_function(
        "_!=_",
        vec![
            Overload::global("not_equals", vec![CelType::Dyn, CelType::Dyn], CelType::Bool)
                .with_impl(not_equals),
        ],
    );
    env.register_function("_<_", ordering_overloads("less", |o| o == Ordering::Less));
    env.register_function(
        "_<=_",
        ordering_overloads("less_equals", |o| o != Ordering::Greater),
    );
    env.register_function(
        "_>_",
        ordering_overloads("greater", |o| o == Ordering::Greater),
    );
    env.register_function(
        "_>=_",
        ordering_overloads("greater_equals", |o| o != Ordering::Less),
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_equals_mismatched_types_false() {
        let r = equals(&[Value::Int(1), Value::string("1")]);
        assert!(matches!(r, Value::Bool(false)));
        let r = not_equals(&[Value::Int(1), Value::string("1")]);
        assert!(matches!(r, Value::Bool(true)));
    }

    #[test]
    fn test_cross_numeric_ordering() {
        let lt = |args: &[Value]| compare_with(args, |o| o == Ordering::Less);
        assert!(matches!(
            lt(&[Value::Int(1), Value::Double(1.5)]),
            Value::Bool(true)
        ));
        assert!(matches!(
            lt(&[Value::Uint(2), Value::Int(1)]),
            Value::Bool(false)
        ));
    }

    #[test]
    fn test_incomparable_is_error() {
        let r = compare_with(&[Value::Int(1), Value::string("a")], |o| o == Ordering::Less);
        assert!(r.is_error());
    }
}
