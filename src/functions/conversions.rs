//! Type conversion functions: `int`, `uint`, `double`, `string`, `bytes`,
//! `bool`, `duration`, `timestamp`, plus `type` and `dyn`
//!
//! Conversions are checked: anything lossy or out of range is a
//! conversion error (`uint(-1)`, `int(1e19)`, `string(b"\xff")`).

use crate::env::Env;
use crate::error::{ErrorKind, ErrorValue};
use crate::functions::Overload;
use crate::types::CelType;
use crate::value::Value;
use chrono::{DateTime, Utc};
use std::sync::Arc;

fn conversion_error(msg: impl Into<String>) -> Value {
    Value::error(ErrorKind::Conversion, msg)
}

fn to_int(args: &[Value]) -> Value {
    match &args[0] {
        Value::Int(_) => args[0].clone(),
        Value::Uint(u) => {
            if *u > i64::MAX as u64 {
                conversion_error(format!("uint {} out of int range", u))
            } else {
                Value::Int(*u as i64)
            }
        }
        Value::Double(d) => {
            if d.is_finite() && *d >= -9.223372036854776e18 && *d < 9.223372036854776e18 {
                Value::Int(d.trunc() as i64)
            } else {
                conversion_error(format!("double {} out of int range", d))
            }
        }
        Value::String(s) => match s.parse::<i64>() {
            Ok(i) => Value::Int(i),
            Err(_) => conversion_error(format!("cannot parse '{}' as int", s)),
        },
        Value::Timestamp(t) => Value::Int(t.timestamp()),
        _ => Value::no_such_overload("int", args),
    }
}

fn to_uint(args: &[Value]) -> Value {
    match &args[0] {
        Value::Uint(_) => args[0].clone(),
        Value::Int(i) => {
            if *i < 0 {
                conversion_error(format!("int {} out of uint range", i))
            } else {
                Value::Uint(*i as u64)
            }
        }
        Value::Double(d) => {
            if d.is_finite() && *d >= 0.0 && *d < 1.8446744073709552e19 {
                Value::Uint(d.trunc() as u64)
            } else {
                conversion_error(format!("double {} out of uint range", d))
            }
        }
        Value::String(s) => match s.parse::<u64>() {
            Ok(u) => Value::Uint(u),
            Err(_) => conversion_error(format!("cannot parse '{}' as uint", s)),
        },
        _ => Value::no_such_overload("uint", args),
    }
}

fn to_double(args: &[Value]) -> Value {
    match &args[0] {
        Value::Double(_) => args[0].clone(),
        Value::Int(i) => Value::Double(*i as f64),
        Value::Uint(u) => Value::Double(*u as f64),
        Value::String(s) => match s.parse::<f64>() {
            Ok(d) => Value::Double(d),
            Err(_) => conversion_error(format!("cannot parse '{}' as double", s)),
        },
        _ => Value::no_such_overload("double", args),
    }
}

fn to_string_value(args: &[Value]) -> Value {
    match &args[0] {
        Value::String(_) => args[0].clone(),
        Value::Int(i) => Value::string(i.to_string()),
        Value::Uint(u) => Value::string(u.to_string()),
        Value::Double(d) => Value::string(format!("{}", d)),
        Value::Bool(b) => Value::string(b.to_string()),
        Value::Bytes(b) => match std::str::from_utf8(b) {
            Ok(s) => Value::string(s),
            Err(_) => conversion_error("bytes are not valid UTF-8"),
        },
        Value::Timestamp(t) => {
            Value::string(t.to_rfc3339_opts(chrono::SecondsFormat::AutoSi, true))
        }
        Value::Duration(d) => {
            let nanos = d.num_nanoseconds().unwrap_or(0);
            if nanos % 1_000_000_000 == 0 {
                Value::string(format!("{}s", nanos / 1_000_000_000))
            } else {
                Value::string(format!("{}s", nanos as f64 / 1e9))
            }
        }
        _ => Value::no_such_overload("string", args),
    }
}

fn to_bytes(args: &[Value]) -> Value {
    match &args[0] {
        Value::Bytes(_) => args[0].clone(),
        Value::String(s) => Value::bytes(s.as_bytes()),
        _ => Value::no_such_overload("bytes", args),
    }
}

fn to_bool(args: &[Value]) -> Value {
    match &args[0] {
        Value::Bool(_) => args[0].clone(),
        Value::String(s) => match s.as_ref() {
            "1" | "t" | "true" | "TRUE" | "True" => Value::Bool(true),
            "0" | "f" | "false" | "FALSE" | "False" => Value::Bool(false),
            other => conversion_error(format!("cannot parse '{}' as bool", other)),
        },
        _ => Value::no_such_overload("bool", args),
    }
}

fn to_type(args: &[Value]) -> Value {
    Value::Type(args[0].type_of())
}

fn to_dyn(args: &[Value]) -> Value {
    args[0].clone()
}

/// Parse a duration literal like `1h30m`, `2.5s`, `-300ms`. Recognized
/// units: h, m, s, ms, us, ns.
pub(crate) fn parse_duration(s: &str) -> Result<chrono::Duration, ErrorValue> {
    let bad = |msg: &str| ErrorValue::new(ErrorKind::Conversion, format!("{}: '{}'", msg, s));
    let (neg, mut rest) = match s.strip_prefix('-') {
        Some(r) => (true, r),
        None => (false, s),
    };
    if rest.is_empty() {
        return Err(bad("empty duration"));
    }
    let mut total_nanos: i128 = 0;
    while !rest.is_empty() {
        let num_end = rest
            .find(|c: char| !c.is_ascii_digit() && c != '.')
            .unwrap_or(rest.len());
        if num_end == 0 {
            return Err(bad("expected a number in duration"));
        }
        let num: f64 = rest[..num_end]
            .parse()
            .map_err(|_| bad("malformed number in duration"))?;
        rest = &rest[num_end..];
        let (unit_nanos, unit_len) = if rest.starts_with("ms") {
            (1e6, 2)
        } else if rest.starts_with("us") {
            (1e3, 2)
        } else if rest.starts_with("ns") {
            (1.0, 2)
        } else if rest.starts_with('h') {
            (3.6e12, 1)
        } else if rest.starts_with('m') {
            (6e10, 1)
        } else if rest.starts_with('s') {
            (1e9, 1)
        } else {
            return Err(bad("missing unit in duration"));
        };
        total_nanos += (num * unit_nanos) as i128;
        rest = &rest[unit_len..];
    }
    if neg {
        total_nanos = -total_nanos;
    }
    if total_nanos > i64::MAX as i128 || total_nanos < i64::MIN as i128 {
        return Err(bad("duration out of range"));
    }
    Ok(chrono::Duration::nanoseconds(total_nanos as i64))
}

fn to_duration(args: &[Value]) -> Value {
    match &args[0] {
        Value::Duration(_) => args[0].clone(),
        Value::String(s) => match parse_duration(s) {
            Ok(d) => Value::Duration(d),
            Err(e) => Value::Error(Arc::new(e)),
        },
        _ => Value::no_such_overload("duration", args),
    }
}

fn to_timestamp(args: &[Value]) -> Value {
    match &args[0] {
        Value::Timestamp(_) => args[0].clone(),
        Value::String(s) => match DateTime::parse_from_rfc3339(s) {
            Ok(t) => Value::Timestamp(t.with_timezone(&Utc)),
            Err(e) => conversion_error(format!("cannot parse timestamp: {}", e)),
        },
        Value::Int(i) => match DateTime::from_timestamp(*i, 0) {
            Some(t) => Value::Timestamp(t),
            None => conversion_error(format!("epoch seconds {} out of range", i)),
        },
        _ => Value::no_such_overload("timestamp", args),
    }
}

pub fn register(env: &mut Env) {
    use CelType::{Bool, Bytes, Double, Duration, Int, String, Timestamp, Uint};
    let a = || CelType::type_param("A");

    env.register_function(
        "int",
        vec![
            Overload::global("int64_identity", vec![Int], Int).with_impl(to_int),
            Overload::global("uint64_to_int64", vec![Uint], Int).with_impl(to_int),
            Overload::global("double_to_int64", vec![Double], Int).with_impl(to_int),
            Overload::global("string_to_int64", vec![String], Int).with_impl(to_int),
            Overload::global("timestamp_to_int64", vec![Timestamp], Int).with_impl(to_int),
        ],
    );
    env.register_function(
        "uint",
        vec![
            Overload::global("uint64_identity", vec![Uint], Uint).with_impl(to_uint),
            Overload::global("int64_to_uint64", vec![Int], Uint).with_impl(to_uint),
            Overload::global("double_to_uint64", vec![Double], Uint).with_impl(to_uint),
            Overload::global("string_to_uint64", vec![String], Uint).with_impl(to_uint),
        ],
    );
    env.register_function(
        "double",
        vec![
            Overload::global("double_identity", vec![Double], Double).with_impl(to_double),
            Overload::global("int64_to_double", vec![Int], Double).with_impl(to_double),
            Overload::global("uint64_to_double", vec![Uint], Double).with_impl(to_double),
            Overload::global("string_to_double", vec![String], Double).with_impl(to_double),
        ],
    );
    env.register_function(
        "string",
        vec![
            Overload::global("string_identity", vec![String], String).with_impl(to_string_value),
            Overload::global("int64_to_string", vec![Int], String).with_impl(to_string_value),
            Overload::global("uint64_to_string", vec![Uint], String).with_impl(to_string_value),
            Overload::global("double_to_string", vec![Double], String).with_impl(to_string_value),
            Overload::global("bool_to_string", vec![Bool], String).with_impl(to_string_value),
            Overload::global("bytes_to_string", vec![Bytes], String).with_impl(to_string_value),
            Overload::global("timestamp_to_string", vec![Timestamp], String)
                .with_impl(to_string_value),
            Overload::global("duration_to_string", vec![Duration], String)
                .with_impl(to_string_value),
        ],
    );
    env.register_function(
        "bytes",
        vec![
            Overload::global("bytes_identity", vec![Bytes], Bytes).with_impl(to_bytes),
            Overload::global("string_to_bytes", vec![String], Bytes).with_impl(to_bytes),
        ],
    );
    env.register_function(
        "bool",
        vec![
            Overload::global("bool_identity", vec![Bool], Bool).with_impl(to_bool),
            Overload::global("string_to_bool", vec![String], Bool).with_impl(to_bool),
        ],
    );
    env.register_function(
        "type",
        vec![Overload::global("type", vec![a()], CelType::type_of(a()))
            .with_type_params(&["A"])
            .with_impl(to_type)],
    );
    env.register_function(
        "dyn",
        vec![Overload::global("to_dyn", vec![a()], CelType::Dyn)
            .with_type_params(&["A"])
            .with_impl(to_dyn)],
    );
    env.register_function(
        "duration",
        vec![
            Overload::global("duration_identity", vec![Duration], Duration)
                .with_impl(to_duration),
            Overload::global("string_to_duration", vec![String], Duration)
                .with_impl(to_duration),
        ],
    );
    env.register_function(
        "timestamp",
        vec![
            Overload::global("timestamp_identity", vec![Timestamp], Timestamp)
                .with_impl(to_timestamp),
            Overload::global("string_to_timestamp", vec![String], Timestamp)
                .with_impl(to_timestamp),
            Overload::global("int64_to_timestamp", vec![Int], Timestamp).with_impl(to_timestamp),
        ],
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uint_of_negative_is_error() {
        assert!(to_uint(&[Value::Int(-1)]).is_error());
        assert!(matches!(to_uint(&[Value::Int(5)]), Value::Uint(5)));
    }

    #[test]
    fn test_int_range_checks() {
        assert!(to_int(&[Value::Double(1e19)]).is_error());
        assert!(to_int(&[Value::Double(f64::NAN)]).is_error());
        assert!(matches!(to_int(&[Value::Double(-2.9)]), Value::Int(-2)));
        assert!(to_int(&[Value::Uint(u64::MAX)]).is_error());
    }

    #[test]
    fn test_string_conversions() {
        assert!(matches!(to_int(&[Value::string("42")]), Value::Int(42)));
        assert!(to_int(&[Value::string("4x")]).is_error());
        match to_string_value(&[Value::Double(2.5)]) {
            Value::String(s) => assert_eq!(&*s, "2.5"),
            other => panic!("unexpected {}", other),
        }
    }

    #[test]
    fn test_duration_parse() {
        assert_eq!(parse_duration("1h30m").unwrap().num_minutes(), 90);
        assert_eq!(parse_duration("2.5s").unwrap().num_milliseconds(), 2500);
        assert_eq!(parse_duration("-300ms").unwrap().num_milliseconds(), -300);
        assert!(parse_duration("12").is_err());
        assert!(parse_duration("").is_err());
    }

    #[test]
    fn test_timestamp_round_trip() {
        let v = to_timestamp(&[Value::string("2024-06-01T12:30:00Z")]);
        match &v {
            Value::Timestamp(t) => assert_eq!(t.timestamp(), 1717245000),
            other => panic!("unexpected {}", other),
        }
        match to_string_value(&[v]) {
            Value::String(s) => assert!(s.starts_with("2024-06-01T12:30:00")),
            other => panic!("unexpected {}", other),
        }
    }

    #[test]
    fn test_type_of() {
        match to_type(&[Value::Int(1)]) {
            Value::Type(t) => assert_eq!(t, CelType::Int),
            other => panic!("unexpected {}", other),
        }
    }
}
