//! Coercions for raw field values returned by the remote list store.
//!
//! Remote JSON is loosely typed: numbers arrive as strings, booleans as
//! `"1"`/`"yes"`, dates either as ISO-8601 or the legacy `/Date(ms±tz)/`
//! envelope. Every helper here is total over `serde_json::Value` and returns
//! `None` rather than guessing.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde_json::Value;

/// Invariant string conversion: scalars render without localization,
/// everything else is `None`.
pub fn as_string(v: &Value) -> Option<String> {
    match v {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Integer ladder: i64, then u64, then f64 truncated. Strings take the
/// same ladder after trimming.
pub fn as_i64(v: &Value) -> Option<i64> {
    match v {
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Some(i)
            } else {
                n.as_f64().map(|f| f as i64)
            }
        }
        Value::String(s) => {
            let s = s.trim();
            if let Ok(i) = s.parse::<i64>() {
                Some(i)
            } else {
                s.parse::<f64>().ok().map(|f| f as i64)
            }
        }
        Value::Bool(b) => Some(i64::from(*b)),
        _ => None,
    }
}

pub fn as_f64(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

/// Accepts `true|false|1|0|yes|no` in any case, plus native booleans and
/// numbers.
pub fn as_bool(v: &Value) -> Option<bool> {
    match v {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => n.as_i64().map(|i| i != 0),
        Value::String(s) => {
            let s = s.trim();
            if s.eq_ignore_ascii_case("true") || s == "1" || s.eq_ignore_ascii_case("yes") {
                Some(true)
            } else if s.eq_ignore_ascii_case("false") || s == "0" || s.eq_ignore_ascii_case("no") {
                Some(false)
            } else {
                None
            }
        }
        _ => None,
    }
}

/// Parses a remote datetime and normalizes it to UTC. Handles the legacy
/// `/Date(1700000000000+0100)/` envelope (the millisecond count is already
/// a UTC epoch; the offset suffix is display-only), RFC 3339, and bare
/// `YYYY-MM-DDTHH:MM:SS[.fff]` which the server emits as UTC.
pub fn as_datetime_utc(v: &Value) -> Option<DateTime<Utc>> {
    match v {
        Value::String(s) => parse_datetime_str(s.trim()),
        Value::Number(n) => n.as_i64().and_then(DateTime::<Utc>::from_timestamp_millis),
        _ => None,
    }
}

fn parse_datetime_str(s: &str) -> Option<DateTime<Utc>> {
    if let Some(rest) = s.strip_prefix("/Date(") {
        let inner = rest.strip_suffix(")/")?;
        // keep the leading signed millisecond run, drop any ±hhmm suffix
        let mut end = 0;
        for (i, b) in inner.bytes().enumerate() {
            if b.is_ascii_digit() || (i == 0 && b == b'-') {
                end = i + 1;
            } else {
                break;
            }
        }
        let ms: i64 = inner[..end].parse().ok()?;
        return DateTime::<Utc>::from_timestamp_millis(ms);
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%d"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(naive.and_utc());
        }
        if fmt == "%Y-%m-%d" {
            if let Ok(d) = chrono::NaiveDate::parse_from_str(s, fmt) {
                return d.and_hms_opt(0, 0, 0).map(|n| n.and_utc());
            }
        }
    }
    None
}

/// ISO-8601 text used everywhere a datetime is persisted locally. Seconds
/// precision survives a round-trip unchanged.
pub fn to_iso8601(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(chrono::SecondsFormat::Micros, true)
}

pub fn parse_iso8601(s: &str) -> Option<DateTime<Utc>> {
    parse_datetime_str(s.trim())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    #[test]
    fn string_coercion_is_invariant() {
        assert_eq!(as_string(&json!("x")).as_deref(), Some("x"));
        assert_eq!(as_string(&json!(12)).as_deref(), Some("12"));
        assert_eq!(as_string(&json!(true)).as_deref(), Some("true"));
        assert_eq!(as_string(&json!([1])), None);
    }

    #[test]
    fn number_ladder() {
        assert_eq!(as_i64(&json!(7)), Some(7));
        assert_eq!(as_i64(&json!(7.9)), Some(7));
        assert_eq!(as_i64(&json!(" 42 ")), Some(42));
        assert_eq!(as_i64(&json!("3.5")), Some(3));
        assert_eq!(as_i64(&json!("abc")), None);
    }

    #[test]
    fn bool_accepts_remote_spellings() {
        for v in [json!(true), json!(1), json!("1"), json!("Yes"), json!("TRUE")] {
            assert_eq!(as_bool(&v), Some(true), "{v}");
        }
        for v in [json!(false), json!(0), json!("0"), json!("no"), json!("False")] {
            assert_eq!(as_bool(&v), Some(false), "{v}");
        }
        assert_eq!(as_bool(&json!("maybe")), None);
    }

    #[test]
    fn datetime_parses_wcf_envelope_and_iso() {
        let expected = Utc.with_ymd_and_hms(2023, 11, 14, 22, 13, 20).unwrap();
        let ms = expected.timestamp_millis();
        assert_eq!(
            as_datetime_utc(&json!(format!("/Date({ms})/"))),
            Some(expected)
        );
        assert_eq!(
            as_datetime_utc(&json!(format!("/Date({ms}+0530)/"))),
            Some(expected)
        );
        assert_eq!(
            as_datetime_utc(&json!("2023-11-14T22:13:20Z")),
            Some(expected)
        );
        assert_eq!(
            as_datetime_utc(&json!("2023-11-14T23:13:20+01:00")),
            Some(expected)
        );
        assert_eq!(
            as_datetime_utc(&json!("2023-11-14T22:13:20")),
            Some(expected)
        );
    }

    #[test]
    fn iso8601_round_trip_is_idempotent() {
        let dt = Utc.with_ymd_and_hms(2024, 2, 29, 6, 30, 5).unwrap()
            + chrono::Duration::microseconds(123_456);
        let text = to_iso8601(&dt);
        let back = parse_iso8601(&text).unwrap();
        assert_eq!(back, dt);
        assert_eq!(to_iso8601(&back), text);
    }
}
