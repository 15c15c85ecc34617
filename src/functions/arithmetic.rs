//! Arithmetic operators: `_+_`, `_-_`, `_*_`, `_/_`, `_%_`, unary `-_`
//!
//! Integer and unsigned arithmetic is checked: anything that leaves the
//! 64-bit range is an overflow error, division and remainder by zero
//! are errors. Double arithmetic follows IEEE-754 (division by zero
//! yields an infinity, not an error). Addition doubles as concatenation
//! for string, bytes, and list, and composes timestamps with durations.

use crate::env::Env;
use crate::error::ErrorKind;
use crate::functions::Overload;
use crate::types::CelType;
use crate::value::Value;

fn add(args: &[Value]) -> Value {
    args[0].add(&args[1])
}

fn sub(args: &[Value]) -> Value {
    match (&args[0], &args[1]) {
        (Value::Int(a), Value::Int(b)) => match a.checked_sub(*b) {
            Some(n) => Value::Int(n),
            None => Value::error(ErrorKind::Overflow, "integer subtraction overflow"),
        },
        (Value::Uint(a), Value::Uint(b)) => match a.checked_sub(*b) {
            Some(n) => Value::Uint(n),
            None => Value::error(ErrorKind::Overflow, "unsigned subtraction underflow"),
        },
        (Value::Double(a), Value::Double(b)) => Value::Double(a - b),
        (Value::Timestamp(a), Value::Timestamp(b)) => Value::Duration(*a - *b),
        (Value::Timestamp(t), Value::Duration(d)) => match t.checked_sub_signed(*d) {
            Some(ts) => Value::Timestamp(ts),
            None => Value::error(ErrorKind::Overflow, "timestamp subtraction overflow"),
        },
        (Value::Duration(a), Value::Duration(b)) => match a.checked_sub(b) {
            Some(d) => Value::Duration(d),
            None => Value::error(ErrorKind::Overflow, "duration subtraction overflow"),
        },
        _ => Value::no_such_overload("_-_", args),
    }
}

fn mul(args: &[Value]) -> Value {
    match (&args[0], &args[1]) {
        (Value::Int(a), Value::Int(b)) => match a.checked_mul(*b) {
            Some(n) => Value::Int(n),
            None => Value::error(ErrorKind::Overflow, "integer multiplication overflow"),
        },
        (Value::Uint(a), Value::Uint(b)) => match a.checked_mul(*b) {
            Some(n) => Value::Uint(n),
            None => Value::error(ErrorKind::Overflow, "unsigned multiplication overflow"),
        },
        (Value::Double(a), Value::Double(b)) => Value::Double(a * b),
        _ => Value::no_such_overload("_*_", args),
    }
}

fn div(args: &[Value]) -> Value {
    match (&args[0], &args[1]) {
        (Value::Int(a), Value::Int(b)) => {
            if *b == 0 {
                return Value::error(ErrorKind::DivisionByZero, "division by zero");
            }
            match a.checked_div(*b) {
                Some(n) => Value::Int(n),
                None => Value::error(ErrorKind::Overflow, "integer division overflow"),
            }
        }
        (Value::Uint(a), Value::Uint(b)) => {
            if *b == 0 {
                return Value::error(ErrorKind::DivisionByZero, "division by zero");
            }
            Value::Uint(a / b)
        }
        (Value::Double(a), Value::Double(b)) => Value::Double(a / b),
        _ => Value::no_such_overload("_/_", args),
    }
}

fn rem(args: &[Value]) -> Value {
    match (&args[0], &args[1]) {
        (Value::Int(a), Value::Int(b)) => {
            if *b == 0 {
                return Value::error(ErrorKind::DivisionByZero, "modulo by zero");
            }
            match a.checked_rem(*b) {
                Some(n) => Value::Int(n),
                None => Value::error(ErrorKind::Overflow, "integer remainder overflow"),
            }
        }
        (Value::Uint(a), Value::Uint(b)) => {
            if *b == 0 {
                return Value::error(ErrorKind::DivisionByZero, "modulo by zero");
            }
            Value::Uint(a % b)
        }
        _ => Value::no_such_overload("_%_", args),
    }
}

fn neg(args: &[Value]) -> Value {
    match &args[0] {
        Value::Int(i) => match i.checked_neg() {
            Some(n) => Value::Int(n),
            None => Value::error(ErrorKind::Overflow, "integer negation overflow"),
        },
        Value::Double(d) => Value::Double(-d),
        _ => Value::no_such_overload("-_", args),
    }
}

/// Register the arithmetic operators.
pub fn register(env: &mut Env) {
    use CelType::{Bytes, Double, Duration, Int, String, Timestamp, Uint};

    let a = || CelType::type_param("A");
    env.register_function(
        "_+_",
        vec![
            Overload::global("add_int64", vec![Int, Int], Int).with_impl(add),
            Overload::global("add_uint64", vec![Uint, Uint], Uint).with_impl(add),
            Overload::global("add_double", vec![Double, Double], Double).with_impl(add),
            Overload::global("add_string", vec![String, String], String).with_impl(add),
            Overload::global("add_bytes", vec![Bytes, Bytes], Bytes).with_impl(add),
            Overload::global(
                "add_list",
                vec![CelType::list_of(a()), CelType::list_of(a())],
                CelType::list_of(a()),
            )
            .with_type_params(&["A"])
            .with_impl(add),
            Overload::global("add_timestamp_duration", vec![Timestamp, Duration], Timestamp)
                .with_impl(add),
            Overload::global("add_duration_timestamp", vec![Duration, Timestamp], Timestamp)
                .with_impl(add),
            Overload::global("add_duration_duration", vec![Duration, Duration], Duration)
                .with_impl(add),
        ],
    );

    env.register_function(
        "_-_",
        vec![
            Overload::global("subtract_int64", vec![Int, Int], Int).with_impl(sub),
            Overload::global("subtract_uint64", vec![Uint, Uint], Uint).with_impl(sub),
            Overload::global("subtract_double", vec![Double, Double], Double).with_impl(sub),
            Overload::global(
                "subtract_timestamp_timestamp",
                vec![Timestamp, Timestamp],
                Duration,
            )
            .with_impl(sub),
            Overload::global(
                "subtract_timestamp_duration",
                vec![Timestamp, Duration],
                Timestamp,
            )
            .with_impl(sub),
            Overload::global(
                "subtract_duration_duration",
                vec![Duration, Duration],
                Duration,
            )
            .with_impl(sub),
        ],
    );

    env.register_function(
        "_*_",
        vec![
            Overload::global("multiply_int64", vec![Int, Int], Int).with_impl(mul),
            Overload::global("multiply_uint64", vec![Uint, Uint], Uint).with_impl(mul),
            Overload::global("multiply_double", vec![Double, Double], Double).with_impl(mul),
        ],
    );

    env.register_function(
        "_/_",
        vec![
            Overload::global("divide_int64", vec![Int, Int], Int).with_impl(div),
            Overload::global("divide_uint64", vec![Uint, Uint], Uint).with_impl(div),
            Overload::global("divide_double", vec![Double, Double], Double).with_impl(div),
        ],
    );

    env.register_function(
        "_%_",
        vec![
            Overload::global("modulo_int64", vec![Int, Int], Int).with_impl(rem),
            Overload::global("modulo_uint64", vec![Uint, Uint], Uint).with_impl(rem),
        ],
    );

    env.register_function(
        "-_",
        vec![
            Overload::global("negate_int64", vec![Int], Int).with_impl(neg),
            Overload::global("negate_double", vec![Double], Double).with_impl(neg),
        ],
    );
}
