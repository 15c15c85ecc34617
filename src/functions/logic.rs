//! Logical negation and the comprehension short-circuit helper
//!
//! `&&`, `||`, and the ternary are structural in the planner, not
//! dispatched functions; only `!_` and `@not_strictly_false` live here.

use crate::env::Env;
use crate::functions::Overload;
use crate::types::CelType;
use crate::value::Value;

fn logical_not(args: &[Value]) -> Value {
    match &args[0] {
        Value::Bool(b) => Value::Bool(!b),
        _ => Value::no_such_overload("!_", args),
    }
}

/// True unless the argument is the literal `false`. Declared non-strict:
/// errors and unknowns flowing out of an individual element must not
/// abort an `all`/`exists` fold that can still reach a definite outcome.
fn not_strictly_false(args: &[Value]) -> Value {
    match &args[0] {
        Value::Bool(false) => Value::Bool(false),
        _ => Value::Bool(true),
    }
}

pub fn register(env: &mut Env) {
    env.register_function(
        "!_",
        vec![Overload::global("logical_not", vec![CelType::Bool], CelType::Bool)
            .with_impl(logical_not)],
    );
    env.register_function(
        "@not_strictly_false",
        vec![
            Overload::global("not_strictly_false", vec![CelType::Bool], CelType::Bool)
                .non_strict()
                .with_impl(not_strictly_false),
        ],
    );
}
