//! Optional values: `optional.of`, `optional.none`, `optional.ofNonZeroValue`,
//! and the member functions `hasValue`, `value`, `or`, `orValue`
//!
//! The policy compiler leans on these to preserve optionality through
//! composed rule outputs.

use crate::env::Env;
use crate::error::ErrorKind;
use crate::functions::Overload;
use crate::types::CelType;
use crate::value::Value;

fn of(args: &[Value]) -> Value {
    Value::optional_of(args[0].clone())
}

fn none(_args: &[Value]) -> Value {
    Value::optional_none()
}

fn of_non_zero(args: &[Value]) -> Value {
    let zero = match &args[0] {
        Value::Int(0) | Value::Uint(0) | Value::Bool(false) | Value::Null => true,
        Value::Double(d) => *d == 0.0,
        Value::String(s) => s.is_empty(),
        Value::Bytes(b) => b.is_empty(),
        Value::List(items) => items.is_empty(),
        Value::Map(m) => m.is_empty(),
        _ => false,
    };
    if zero {
        Value::optional_none()
    } else {
        Value::optional_of(args[0].clone())
    }
}

fn has_value(args: &[Value]) -> Value {
    match &args[0] {
        Value::Optional(o) => Value::Bool(o.is_some()),
        _ => Value::no_such_overload("hasValue", args),
    }
}

fn value(args: &[Value]) -> Value {
    match &args[0] {
        Value::Optional(o) => match o.as_ref() {
            Some(v) => v.clone(),
            None => Value::error(ErrorKind::InvalidArgument, "optional.none() dereference"),
        },
        _ => Value::no_such_overload("value", args),
    }
}

fn or(args: &[Value]) -> Value {
    match (&args[0], &args[1]) {
        (Value::Optional(a), Value::Optional(_)) => {
            if a.is_some() {
                args[0].clone()
            } else {
                args[1].clone()
            }
        }
        _ => Value::no_such_overload("or", args),
    }
}

fn or_value(args: &[Value]) -> Value {
    match &args[0] {
        Value::Optional(o) => match o.as_ref() {
            Some(v) => v.clone(),
            None => args[1].clone(),
        },
        _ => Value::no_such_overload("orValue", args),
    }
}

pub fn register(env: &mut Env) {
    let a = || CelType::type_param("A");
    let opt_a = || CelType::optional_of(CelType::type_param("A"));

    env.register_function(
        "optional.of",
        vec![Overload::global("optional_of", vec![a()], opt_a())
            .with_type_params(&["A"])
            .with_impl(of)],
    );
    env.register_function(
        "optional.none",
        vec![Overload::global("optional_none", vec![], CelType::optional_of(CelType::Dyn))
            .with_impl(none)],
    );
    env.register_function(
        "optional.ofNonZeroValue",
        vec![Overload::global("optional_of_non_zero_value", vec![a()], opt_a())
            .with_type_params(&["A"])
            .with_impl(of_non_zero)],
    );
    env.register_function(
        "hasValue",
        vec![Overload::member("optional_has_value", vec![opt_a()], CelType::Bool)
            .with_type_params(&["A"])
            .with_impl(has_value)],
    );
    env.register_function(
        "value",
        vec![Overload::member("optional_value", vec![opt_a()], a())
            .with_type_params(&["A"])
            .with_impl(value)],
    );
    env.register_function(
        "or",
        vec![Overload::member("optional_or", vec![opt_a(), opt_a()], opt_a())
            .with_type_params(&["A"])
            .with_impl(or)],
    );
    env.register_function(
        "orValue",
        vec![Overload::member("optional_or_value", vec![opt_a(), a()], a())
            .with_type_params(&["A"])
            .with_impl(or_value)],
    );
}
