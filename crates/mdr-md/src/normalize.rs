//! Field-level parsing shared by every raw schema.
//!
//! Each helper takes a JSON value as found in a payload and returns either
//! the parsed value or a short reason string. The caller attaches the field
//! name. `null` and the empty string mean "absent" for optional fields.

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use mdr_schemas::PriceE8;
use serde_json::Value;

const NAIVE_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M:%S",
];

/// `true` when the value counts as absent.
pub fn is_absent(v: Option<&Value>) -> bool {
    match v {
        None | Some(Value::Null) => true,
        Some(Value::String(s)) => s.trim().is_empty(),
        Some(_) => false,
    }
}

/// Trimmed non-empty string, or `None`. Numbers are rendered as text.
pub fn text(v: Option<&Value>) -> Option<String> {
    match v? {
        Value::String(s) => {
            let t = s.trim();
            (!t.is_empty()).then(|| t.to_string())
        }
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Parse a timestamp into UTC.
///
/// Accepts RFC 3339 with any offset, naive ISO-like date-times (taken as
/// UTC) and integer epoch seconds (as a number or a digit string).
pub fn parse_timestamp(v: &Value) -> Result<DateTime<Utc>, String> {
    match v {
        Value::Number(n) => {
            let secs = n
                .as_i64()
                .ok_or_else(|| "epoch timestamp must be an integer".to_string())?;
            epoch(secs)
        }
        Value::String(s) => {
            let s = s.trim();
            if s.is_empty() {
                return Err("empty timestamp".to_string());
            }
            if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
                return Ok(dt.with_timezone(&Utc));
            }
            for f in NAIVE_FORMATS {
                if let Ok(n) = NaiveDateTime::parse_from_str(s, f) {
                    return Ok(Utc.from_utc_datetime(&n));
                }
            }
            if s.bytes().all(|b| b.is_ascii_digit()) {
                let secs: i64 = s.parse().map_err(|_| "epoch out of range".to_string())?;
                return epoch(secs);
            }
            Err("unrecognized timestamp format".to_string())
        }
        _ => Err("timestamp must be a string or integer".to_string()),
    }
}

fn epoch(secs: i64) -> Result<DateTime<Utc>, String> {
    Utc.timestamp_opt(secs, 0)
        .single()
        .ok_or_else(|| format!("epoch seconds out of range: {secs}"))
}

/// Parse a price from a JSON number or decimal string.
pub fn parse_price(v: &Value) -> Result<PriceE8, String> {
    match v {
        Value::Number(n) => match (n.as_u64(), n.as_f64()) {
            (Some(u), _) => PriceE8::parse_decimal(&u.to_string()).map_err(|e| e.to_string()),
            (None, Some(f)) => PriceE8::from_f64(f).map_err(|e| e.to_string()),
            (None, None) => Err("price not representable".to_string()),
        },
        Value::String(s) => PriceE8::parse_decimal(s.trim()).map_err(|e| e.to_string()),
        _ => Err("price must be a number or decimal string".to_string()),
    }
}

/// Parse an optional finite float. Absent values yield `Ok(None)`.
pub fn parse_opt_f64(v: Option<&Value>) -> Result<Option<f64>, String> {
    if is_absent(v) {
        return Ok(None);
    }
    let x = match v {
        Some(Value::Number(n)) => n
            .as_f64()
            .ok_or_else(|| "number not representable as f64".to_string())?,
        Some(Value::String(s)) => s
            .trim()
            .parse::<f64>()
            .map_err(|_| "not a number".to_string())?,
        _ => return Err("must be a number or numeric string".to_string()),
    };
    if !x.is_finite() {
        return Err("must be finite".to_string());
    }
    Ok(Some(x))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn rfc3339_offsets_convert_to_utc() {
        let a = parse_timestamp(&json!("2024-03-01T12:00:00Z")).unwrap();
        let b = parse_timestamp(&json!("2024-03-01T14:00:00+02:00")).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn naive_and_epoch_forms_are_utc() {
        let want = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        assert_eq!(parse_timestamp(&json!("2024-03-01T12:00:00")).unwrap(), want);
        assert_eq!(parse_timestamp(&json!("2024-03-01 12:00:00")).unwrap(), want);
        assert_eq!(parse_timestamp(&json!(want.timestamp())).unwrap(), want);
        assert_eq!(
            parse_timestamp(&json!(want.timestamp().to_string())).unwrap(),
            want
        );
        let frac = parse_timestamp(&json!("2024-03-01T12:00:00.250")).unwrap();
        assert_eq!(frac.timestamp_subsec_millis(), 250);
    }

    #[test]
    fn garbage_timestamps_are_rejected() {
        assert!(parse_timestamp(&json!("yesterday")).is_err());
        assert!(parse_timestamp(&json!("")).is_err());
        assert!(parse_timestamp(&json!(true)).is_err());
        assert!(parse_timestamp(&json!(1.5)).is_err());
    }

    #[test]
    fn price_from_number_and_string_agree() {
        assert_eq!(
            parse_price(&json!(101.5)).unwrap(),
            parse_price(&json!("101.50")).unwrap()
        );
        assert!(parse_price(&json!("-1")).is_err());
        assert!(parse_price(&json!(null)).is_err());
    }

    #[test]
    fn optional_numbers() {
        assert_eq!(parse_opt_f64(None).unwrap(), None);
        assert_eq!(parse_opt_f64(Some(&json!(null))).unwrap(), None);
        assert_eq!(parse_opt_f64(Some(&json!(" "))).unwrap(), None);
        assert_eq!(parse_opt_f64(Some(&json!("2.5"))).unwrap(), Some(2.5));
        assert_eq!(parse_opt_f64(Some(&json!(-3))).unwrap(), Some(-3.0));
        assert!(parse_opt_f64(Some(&json!("abc"))).is_err());
        assert!(parse_opt_f64(Some(&json!("NaN"))).is_err());
        assert!(parse_opt_f64(Some(&json!([1]))).is_err());
    }
}
