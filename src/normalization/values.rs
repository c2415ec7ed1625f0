//! Coercion of loosely-typed vendor values into amounts, rates, timestamps and strings.

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde_json::Value;

use super::schema::AmountConvention;

/// Parses a number from a JSON number or from a string with currency symbols,
/// thousands separators or percent signs mixed in.
pub fn parse_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => {
            let cleaned: String = text
                .chars()
                .filter(|c| c.is_ascii_digit() || *c == '.' || *c == '-')
                .collect();
            cleaned.parse::<f64>().ok()
        }
        _ => None,
    }
}

/// Normalizes a monetary value to major currency units.
///
/// Bare numbers follow the system's convention (minor units are divided by 100),
/// strings are taken as already formatted amounts, and `{ "amount": .. }` objects
/// recurse into their `amount` field.
pub fn normalize_amount(value: &Value, convention: AmountConvention) -> Option<f64> {
    match value {
        Value::Number(number) => {
            let raw = number.as_f64()?;
            Some(match convention {
                AmountConvention::MinorUnits => raw / 100.0,
                AmountConvention::MajorUnits => raw,
            })
        }
        Value::String(_) => parse_number(value),
        Value::Object(map) => map
            .get("amount")
            .and_then(|inner| normalize_amount(inner, convention)),
        _ => None,
    }
}

/// Normalizes a tax rate to a decimal fraction. Values above 1 are read as percentages.
pub fn normalize_rate(value: &Value) -> Option<f64> {
    let raw = parse_number(value)?;
    Some(if raw > 1.0 { raw / 100.0 } else { raw })
}

/// Accepts RFC 3339 strings, naive `YYYY-MM-DD HH:MM:SS` strings (read as UTC) and
/// epoch numbers in seconds or milliseconds.
pub fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(text) => DateTime::parse_from_rfc3339(text)
            .map(|dt| dt.with_timezone(&Utc))
            .ok()
            .or_else(|| {
                NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S")
                    .ok()
                    .map(|naive| naive.and_utc())
            })
            .or_else(|| text.parse::<i64>().ok().and_then(from_epoch)),
        Value::Number(number) => number.as_i64().and_then(from_epoch),
        _ => None,
    }
}

fn from_epoch(raw: i64) -> Option<DateTime<Utc>> {
    if raw.abs() >= 100_000_000_000 {
        Utc.timestamp_millis_opt(raw).single()
    } else {
        Utc.timestamp_opt(raw, 0).single()
    }
}

pub fn as_string(value: &Value) -> Option<String> {
    match value {
        Value::String(text) if !text.trim().is_empty() => Some(text.trim().to_string()),
        Value::Number(number) => Some(number.to_string()),
        _ => None,
    }
}

pub fn as_bool(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(flag) => Some(*flag),
        Value::String(text) => match text.trim().to_ascii_lowercase().as_str() {
            "true" | "yes" | "1" => Some(true),
            "false" | "no" | "0" => Some(false),
            _ => None,
        },
        Value::Number(number) => number.as_i64().map(|n| n != 0),
        _ => None,
    }
}

/// Rounds to whole cents.
pub fn round_cents(amount: f64) -> f64 {
    (amount * 100.0).round() / 100.0
}
