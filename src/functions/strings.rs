//! String member functions: `contains`, `startsWith`, `endsWith`, `matches`
//!
//! `matches` interprets its pattern with the regex crate; constant
//! patterns are pre-compiled by the planner's regex decorator, so the
//! compile cost here is only paid for dynamic patterns.

use crate::env::Env;
use crate::error::ErrorKind;
use crate::functions::Overload;
use crate::types::CelType;
use crate::value::Value;
use regex::Regex;

fn str_args<'a>(args: &'a [Value], function: &str) -> Result<(&'a str, &'a str), Value> {
    match (&args[0], &args[1]) {
        (Value::String(a), Value::String(b)) => Ok((a, b)),
        _ => Err(Value::no_such_overload(function, args)),
    }
}

fn contains(args: &[Value]) -> Value {
    match str_args(args, "contains") {
        Ok((s, sub)) => Value::Bool(s.contains(sub)),
        Err(e) => e,
    }
}

fn starts_with(args: &[Value]) -> Value {
    match str_args(args, "startsWith") {
        Ok((s, prefix)) => Value::Bool(s.starts_with(prefix)),
        Err(e) => e,
    }
}

fn ends_with(args: &[Value]) -> Value {
    match str_args(args, "endsWith") {
        Ok((s, suffix)) => Value::Bool(s.ends_with(suffix)),
        Err(e) => e,
    }
}

pub(crate) fn matches(args: &[Value]) -> Value {
    match str_args(args, "matches") {
        Ok((s, pattern)) => match Regex::new(pattern) {
            Ok(re) => Value::Bool(re.is_match(s)),
            Err(e) => Value::error(ErrorKind::InvalidArgument, format!("invalid pattern: {}", e)),
        },
        Err(e) => e,
    }
}

pub fn register(env: &mut Env) {
    use CelType::{Bool, String};

    env.register_function(
        "contains",
        vec![Overload::member("contains_string", vec![String, String], Bool).with_impl(contains)],
    );
    env.register_function(
        "startsWith",
        vec![
            Overload::member("starts_with_string", vec![String, String], Bool)
                .with_impl(starts_with),
        ],
    );
    env.register_function(
        "endsWith",
        vec![Overload::member("ends_with_string", vec![String, String], Bool)
            .with_impl(ends_with)],
    );
    env.register_function(
        "matches",
        vec![
            Overload::global("matches", vec![String, String], Bool).with_impl(matches),
            Overload::member("matches_string", vec![String, String], Bool).with_impl(matches),
        ],
    );
}
