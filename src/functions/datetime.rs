//! Timestamp and duration accessors
//!
//! Timestamp accessors default to UTC and accept an optional timezone
//! argument: an IANA name (`America/New_York`, `UTC`) or a fixed offset
//! (`+05:30`, `-08:00`). Duration accessors return totals.

use crate::env::Env;
use crate::error::{ErrorKind, ErrorValue};
use crate::functions::Overload;
use crate::types::CelType;
use crate::value::Value;
use chrono::{DateTime, Datelike, FixedOffset, Timelike, Utc};
use std::sync::Arc;

/// Shift a UTC instant into the named zone. Fixed offsets parse as
/// `±HH:MM`; anything else resolves through the IANA database.
fn zoned(ts: &DateTime<Utc>, tz: &str) -> Result<DateTime<FixedOffset>, ErrorValue> {
    let invalid = || ErrorValue::new(ErrorKind::InvalidArgument, format!("invalid timezone '{}'", tz));
    if (tz.starts_with('+') || tz.starts_with('-')) && tz.len() == 6 && tz.as_bytes()[3] == b':' {
        let hours: i32 = tz[1..3].parse().map_err(|_| invalid())?;
        let minutes: i32 = tz[4..6].parse().map_err(|_| invalid())?;
        let seconds = hours * 3600 + minutes * 60;
        let offset = if tz.starts_with('-') {
            FixedOffset::west_opt(seconds)
        } else {
            FixedOffset::east_opt(seconds)
        };
        return match offset {
            Some(o) => Ok(ts.with_timezone(&o)),
            None => Err(invalid()),
        };
    }
    let zone: chrono_tz::Tz = tz.parse().map_err(|_| invalid())?;
    Ok(ts.with_timezone(&zone).fixed_offset())
}

fn ts_accessor(args: &[Value], f: fn(&DateTime<FixedOffset>) -> i64) -> Value {
    let ts = match &args[0] {
        Value::Timestamp(t) => t,
        _ => return Value::no_such_overload("<timestamp accessor>", args),
    };
    let tz = if args.len() == 2 {
        match &args[1] {
            Value::String(s) => s.as_ref(),
            _ => return Value::no_such_overload("<timestamp accessor>", args),
        }
    } else {
        "UTC"
    };
    match zoned(ts, tz) {
        Ok(z) => Value::Int(f(&z)),
        Err(e) => Value::Error(Arc::new(e)),
    }
}

fn dur_accessor(args: &[Value], f: fn(&chrono::Duration) -> i64) -> Value {
    match &args[0] {
        Value::Duration(d) => Value::Int(f(d)),
        _ => Value::no_such_overload("<duration accessor>", args),
    }
}

/// Register one accessor name with its timestamp (with and without
/// timezone) and optional duration overloads.
fn accessor(
    env: &mut Env,
    name: &str,
    ts_f: fn(&DateTime<FixedOffset>) -> i64,
    dur_f: Option<fn(&chrono::Duration) -> i64>,
) {
    use CelType::{Duration, Int, String, Timestamp};
    let base = name.trim_start_matches("get").to_lowercase();
    let mut overloads = vec![
        Overload::member(&format!("timestamp_to_{}", base), vec![Timestamp], Int)
            .with_impl(move |args| ts_accessor(args, ts_f)),
        Overload::member(
            &format!("timestamp_to_{}_with_tz", base),
            vec![Timestamp, String],
            Int,
        )
        .with_impl(move |args| ts_accessor(args, ts_f)),
    ];
    if let Some(f) = dur_f {
        overloads.push(
            Overload::member(&format!("duration_to_{}", base), vec![Duration], Int)
                .with_impl(move |args| dur_accessor(args, f)),
        );
    }
    env.register_function(name, overloads);
}

pub fn register(env: &mut Env) {
    accessor(env, "getFullYear", |z| z.year() as i64, None);
    // months and days-of-month/year are zero-based; getDate is one-based
    accessor(env, "getMonth", |z| z.month0() as i64, None);
    accessor(env, "getDayOfMonth", |z| z.day0() as i64, None);
    accessor(env, "getDate", |z| z.day() as i64, None);
    accessor(env, "getDayOfYear", |z| z.ordinal0() as i64, None);
    accessor(
        env,
        "getDayOfWeek",
        |z| z.weekday().num_days_from_sunday() as i64,
        None,
    );
    accessor(
        env,
        "getHours",
        |z| z.hour() as i64,
        Some(|d| d.num_hours()),
    );
    accessor(
        env,
        "getMinutes",
        |z| z.minute() as i64,
        Some(|d| d.num_minutes()),
    );
    accessor(
        env,
        "getSeconds",
        |z| z.second() as i64,
        Some(|d| d.num_seconds()),
    );
    accessor(
        env,
        "getMilliseconds",
        |z| z.timestamp_subsec_millis() as i64,
        Some(|d| d.num_milliseconds()),
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(s: &str) -> Value {
        Value::Timestamp(
            DateTime::parse_from_rfc3339(s)
                .expect("bad test timestamp")
                .with_timezone(&Utc),
        )
    }

    #[test]
    fn test_utc_default() {
        let v = ts_accessor(&[ts("2024-03-15T23:30:00Z")], |z| z.hour() as i64);
        assert!(matches!(v, Value::Int(23)));
    }

    #[test]
    fn test_fixed_offset() {
        let v = ts_accessor(
            &[ts("2024-03-15T23:30:00Z"), Value::string("+02:00")],
            |z| z.hour() as i64,
        );
        assert!(matches!(v, Value::Int(1)));

        let v = ts_accessor(
            &[ts("2024-03-15T23:30:00Z"), Value::string("-01:30")],
            |z| z.hour() as i64,
        );
        assert!(matches!(v, Value::Int(22)));
    }

    #[test]
    fn test_iana_zone() {
        // UTC-5 in mid-March (EDT is UTC-4; March 15 2024 is after the
        // DST switch, so 23:30Z is 19:30 local)
        let v = ts_accessor(
            &[ts("2024-03-15T23:30:00Z"), Value::string("America/New_York")],
            |z| z.hour() as i64,
        );
        assert!(matches!(v, Value::Int(19)));
    }

    #[test]
    fn test_invalid_zone_is_error() {
        let v = ts_accessor(
            &[ts("2024-03-15T23:30:00Z"), Value::string("Not/AZone")],
            |z| z.hour() as i64,
        );
        assert!(v.is_error());
    }

    #[test]
    fn test_duration_totals() {
        let d = Value::Duration(chrono::Duration::seconds(3725));
        assert!(matches!(dur_accessor(&[d.clone()], |d| d.num_hours()), Value::Int(1)));
        assert!(matches!(
            dur_accessor(&[d.clone()], |d| d.num_minutes()),
            Value::Int(62)
        ));
        assert!(matches!(
            dur_accessor(&[d], |d| d.num_seconds()),
            Value::Int(3725)
        ));
    }

    #[test]
    fn test_zero_based_calendar_fields() {
        let v = ts("2024-01-01T00:00:00Z");
        assert!(matches!(
            ts_accessor(&[v.clone()], |z| z.month0() as i64),
            Value::Int(0)
        ));
        assert!(matches!(
            ts_accessor(&[v.clone()], |z| z.day0() as i64),
            Value::Int(0)
        ));
        assert!(matches!(
            ts_accessor(&[v], |z| z.day() as i64),
            Value::Int(1)
        ));
    }
}
