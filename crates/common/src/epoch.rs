use std::sync::OnceLock;

use chrono::NaiveDateTime;
use regex::Regex;
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NormalizeError {
    NotATimestamp(String),
    BadDateTime(String),
}

impl std::fmt::Display for NormalizeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotATimestamp(v) => write!(f, "not a timestamp value: {v}"),
            Self::BadDateTime(v) => write!(f, "unparseable date-time: {v}"),
        }
    }
}

impl std::error::Error for NormalizeError {}

fn date_prefix() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^[0-9]{4}-([1-9]|0[1-9]|1[0-2])-([1-9]|0[1-9]|[12][0-9]|3[01])").unwrap()
    })
}

fn utc_offset() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r".*[+-]([0-1][0-9]|2[0-3]):[0-5][0-9]$").unwrap())
}

/// Normalizes any supported time representation to fractional epoch seconds.
pub fn normalize(value: &Value) -> Result<f64, NormalizeError> {
    match value {
        Value::Number(n) => n
            .as_f64()
            .ok_or_else(|| NormalizeError::NotATimestamp(n.to_string())),
        Value::String(s) => normalize_str(s),
        other => Err(NormalizeError::NotATimestamp(other.to_string())),
    }
}

/// String form of [`normalize`]. Epoch-number strings pass through; date-time
/// strings are reconciled to UTC epoch seconds.
///
/// A trailing `+HH:MM` offset is SUBTRACTED and `-HH:MM` is ADDED, matching
/// the convention of the feeds this poller consumes.
pub fn normalize_str(raw: &str) -> Result<f64, NormalizeError> {
    if let Ok(n) = raw.parse::<i64>() {
        return Ok(n as f64);
    }
    if let Ok(n) = raw.parse::<f64>() {
        if n.is_finite() {
            return Ok(n);
        }
    }

    // Hyphenated dates become slash-separated so the residual-hyphen truncation
    // below only ever removes a timezone suffix.
    let mut val = if date_prefix().is_match(raw) {
        raw.replacen('-', "/", 2)
    } else {
        raw.to_string()
    };

    val = val.replace('T', " ").replace('Z', "");

    let mut offset_hours: i64 = 0;
    let mut offset_minutes: i64 = 0;
    if utc_offset().is_match(&val) {
        let tail = val
            .split(['+', '-'])
            .nth(1)
            .ok_or_else(|| NormalizeError::BadDateTime(raw.into()))?;
        let mut parts = tail.split(':');
        offset_hours = parts
            .next()
            .and_then(|h| h.parse().ok())
            .ok_or_else(|| NormalizeError::BadDateTime(raw.into()))?;
        offset_minutes = parts
            .next()
            .and_then(|m| m.parse().ok())
            .ok_or_else(|| NormalizeError::BadDateTime(raw.into()))?;

        if val.contains('+') {
            offset_hours = -offset_hours;
            offset_minutes = -offset_minutes;
        }
    }

    // Truncate the offset and any sub-second fraction before parsing.
    let head = val.split('+').next().unwrap_or_default();
    let head = head.split('-').next().unwrap_or_default();
    let head = head.split('.').next().unwrap_or_default();

    let parsed = NaiveDateTime::parse_from_str(head, "%Y/%m/%d %H:%M:%S")
        .map_err(|_| NormalizeError::BadDateTime(raw.into()))?;

    let epoch = parsed.and_utc().timestamp() + offset_hours * 3600 + offset_minutes * 60;
    Ok(epoch as f64)
}
