//! Timestamps, normalized to ISO-8601 UTC with an explicit `+00:00` offset.
//!
//! Sub-second precision is kept to the microsecond and only printed when
//! non-zero: `2016-11-12T15:02:00+00:00`, `2016-11-12T15:02:00.250000+00:00`.

use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use chrono::{
    DateTime as ChronoDateTime, Datelike, NaiveDate, NaiveDateTime, NaiveTime, SubsecRound, Utc,
};
use regex::Regex;
use serde_json::Value;

use super::HarmonizationType;
use crate::error::SanitizeError;

static NUMERIC_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^-?\d+(?:\.\d+)?$").expect("numeric pattern is valid"));

/// Epoch values at or above this magnitude are read as milliseconds.
const EPOCH_MILLIS_THRESHOLD: f64 = 1e11;

/// Seconds between 1601-01-01 (Windows NT epoch) and 1970-01-01.
const WINDOWS_NT_EPOCH_OFFSET: i64 = 11_644_473_600;
const WINDOWS_NT_TICKS_PER_SECOND: i64 = 10_000_000;

/// Patterns carrying their own UTC offset.
const OFFSET_PATTERNS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S%.f%z",
    "%Y-%m-%d %H:%M:%S%.f %z",
    "%Y-%m-%dT%H:%M:%S%.f%z",
    "%Y-%m-%dT%H:%M%z",
    "%d/%b/%Y:%H:%M:%S %z",
    "%a %b %d %H:%M:%S %z %Y",
];

/// Patterns without an offset; the time is taken as UTC.
const NAIVE_PATTERNS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M",
    "%Y/%m/%d %H:%M:%S",
    "%Y/%m/%d %H:%M",
    "%d.%m.%Y %H:%M:%S",
    "%d.%m.%Y %H:%M",
    "%m/%d/%Y %H:%M:%S",
    "%a %b %d %H:%M:%S %Y",
    "%b %d %Y %H:%M:%S",
    "%d %b %Y %H:%M:%S",
];

/// Date-only patterns; the time is midnight UTC.
const DATE_PATTERNS: &[&str] = &["%Y-%m-%d", "%Y/%m/%d", "%d.%m.%Y", "%d %b %Y", "%b %d %Y"];

const UTC_SUFFIXES: &[&str] = &[" UTC", " GMT", "UTC", "GMT", "Z"];

/// How a parser bot should read a source timestamp.
///
/// Textual form (as found in bot configuration): `auto`, `timestamp`,
/// `epoch_millis`, `windows_nt` or `from_format|<strftime pattern>`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum DateTimeFormat {
    /// Recognize common textual forms and epoch numbers.
    #[default]
    Auto,
    /// Seconds since the Unix epoch.
    EpochSeconds,
    /// Milliseconds since the Unix epoch.
    EpochMillis,
    /// 100-nanosecond ticks since 1601-01-01.
    WindowsNt,
    /// An explicit strftime pattern.
    Pattern(String),
}

impl FromStr for DateTimeFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "" | "auto" => Ok(Self::Auto),
            "timestamp" | "epoch" => Ok(Self::EpochSeconds),
            "epoch_millis" => Ok(Self::EpochMillis),
            "windows_nt" => Ok(Self::WindowsNt),
            other => match other.strip_prefix("from_format|") {
                Some(pattern) if !pattern.is_empty() => Ok(Self::Pattern(pattern.to_owned())),
                _ => Err(format!("unknown datetime format '{other}'")),
            },
        }
    }
}

impl fmt::Display for DateTimeFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Auto => write!(f, "auto"),
            Self::EpochSeconds => write!(f, "timestamp"),
            Self::EpochMillis => write!(f, "epoch_millis"),
            Self::WindowsNt => write!(f, "windows_nt"),
            Self::Pattern(pattern) => write!(f, "from_format|{pattern}"),
        }
    }
}

/// UTC timestamps.
pub struct DateTime;

impl DateTime {
    /// Renders a timestamp in canonical form.
    pub fn format(dt: &ChronoDateTime<Utc>) -> String {
        let micros = dt.timestamp_subsec_micros();
        let base = dt.format("%Y-%m-%dT%H:%M:%S");
        if micros == 0 {
            format!("{base}+00:00")
        } else {
            format!("{base}.{micros:06}+00:00")
        }
    }

    /// Current time in canonical form, whole seconds.
    pub fn now() -> String {
        Self::format(&Utc::now().trunc_subsecs(0))
    }

    /// Seconds since the Unix epoch, fractional part kept.
    pub fn from_timestamp(secs: f64) -> Option<String> {
        epoch_seconds(secs).map(|dt| Self::format(&dt))
    }

    /// Milliseconds since the Unix epoch.
    pub fn from_epoch_millis(millis: i64) -> Option<String> {
        ChronoDateTime::from_timestamp_millis(millis).map(|dt| Self::format(&dt))
    }

    /// Windows NT file time (100 ns ticks since 1601-01-01).
    pub fn from_windows_nt(ticks: i64) -> Option<String> {
        windows_nt(ticks).map(|dt| Self::format(&dt))
    }

    /// Parses `value` with an explicit format.
    pub fn parse(value: &Value, format: &DateTimeFormat) -> Option<ChronoDateTime<Utc>> {
        match format {
            DateTimeFormat::Auto => match value {
                Value::Number(n) => n.as_f64().and_then(epoch_auto),
                Value::String(s) => parse_auto(s.trim()),
                _ => None,
            },
            DateTimeFormat::EpochSeconds => number_of(value).and_then(epoch_seconds),
            DateTimeFormat::EpochMillis => number_of(value).and_then(epoch_millis),
            DateTimeFormat::WindowsNt => {
                let ticks = match value {
                    Value::Number(n) => n.as_i64(),
                    Value::String(s) => s.trim().parse::<i64>().ok(),
                    _ => None,
                }?;
                windows_nt(ticks)
            }
            DateTimeFormat::Pattern(pattern) => parse_pattern(value.as_str()?.trim(), pattern),
        }
    }

    /// Sanitizes `value` with an explicit format. Years outside 1..=9999
    /// are rejected.
    pub fn sanitize_with_format(
        value: &Value,
        format: &DateTimeFormat,
    ) -> Result<Value, SanitizeError> {
        Self::parse(value, format)
            .filter(|dt| (1..=9999).contains(&dt.year()))
            .map(|dt| Value::String(Self::format(&dt)))
            .ok_or_else(|| {
                SanitizeError::new("DateTime", value, format!("unparseable timestamp ({format})"))
            })
    }
}

impl HarmonizationType for DateTime {
    fn type_name(&self) -> &str {
        "DateTime"
    }

    fn sanitize(&self, value: &Value) -> Result<Value, SanitizeError> {
        Self::sanitize_with_format(value, &DateTimeFormat::Auto)
    }

    fn is_valid(&self, value: &Value) -> bool {
        // only strings can be canonical; numbers always get rewritten
        value.is_string() && matches!(self.sanitize(value), Ok(ref s) if s == value)
    }
}

fn number_of(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

fn epoch_seconds(secs: f64) -> Option<ChronoDateTime<Utc>> {
    if !secs.is_finite() {
        return None;
    }
    let whole = secs.floor();
    let nanos = ((secs - whole) * 1e9).round() as u32;
    ChronoDateTime::from_timestamp(whole as i64, nanos.min(999_999_999))
}

fn epoch_millis(millis: f64) -> Option<ChronoDateTime<Utc>> {
    epoch_seconds(millis / 1000.0)
}

fn epoch_auto(n: f64) -> Option<ChronoDateTime<Utc>> {
    if n.abs() >= EPOCH_MILLIS_THRESHOLD {
        epoch_millis(n)
    } else {
        epoch_seconds(n)
    }
}

fn windows_nt(ticks: i64) -> Option<ChronoDateTime<Utc>> {
    let secs = ticks.div_euclid(WINDOWS_NT_TICKS_PER_SECOND) - WINDOWS_NT_EPOCH_OFFSET;
    let nanos = ticks.rem_euclid(WINDOWS_NT_TICKS_PER_SECOND) * 100;
    ChronoDateTime::from_timestamp(secs, u32::try_from(nanos).ok()?)
}

fn midnight(date: NaiveDate) -> ChronoDateTime<Utc> {
    date.and_time(NaiveTime::default()).and_utc()
}

fn parse_auto(text: &str) -> Option<ChronoDateTime<Utc>> {
    if text.is_empty() {
        return None;
    }

    if text.bytes().all(|b| b.is_ascii_digit()) {
        match text.len() {
            8 => return NaiveDate::parse_from_str(text, "%Y%m%d").ok().map(midnight),
            14 => {
                return NaiveDateTime::parse_from_str(text, "%Y%m%d%H%M%S")
                    .ok()
                    .map(|naive| naive.and_utc());
            }
            _ => {}
        }
    }
    if NUMERIC_RE.is_match(text) {
        return text.parse::<f64>().ok().and_then(epoch_auto);
    }

    if let Ok(dt) = ChronoDateTime::parse_from_rfc3339(text) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = ChronoDateTime::parse_from_rfc2822(text) {
        return Some(dt.with_timezone(&Utc));
    }
    for pattern in OFFSET_PATTERNS {
        if let Ok(dt) = ChronoDateTime::parse_from_str(text, pattern) {
            return Some(dt.with_timezone(&Utc));
        }
    }

    let naive_text = UTC_SUFFIXES
        .iter()
        .find_map(|suffix| text.strip_suffix(suffix))
        .map(str::trim_end)
        .unwrap_or(text);
    for pattern in NAIVE_PATTERNS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(naive_text, pattern) {
            return Some(naive.and_utc());
        }
    }
    for pattern in DATE_PATTERNS {
        if let Ok(date) = NaiveDate::parse_from_str(naive_text, pattern) {
            return Some(midnight(date));
        }
    }
    None
}

fn parse_pattern(text: &str, pattern: &str) -> Option<ChronoDateTime<Utc>> {
    if let Ok(dt) = ChronoDateTime::parse_from_str(text, pattern) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(text, pattern) {
        return Some(naive.and_utc());
    }
    NaiveDate::parse_from_str(text, pattern).ok().map(midnight)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn auto(value: Value) -> Value {
        DateTime.sanitize(&value).unwrap()
    }

    #[test]
    fn textual_forms_normalize_to_utc() {
        assert_eq!(auto(json!("2016-11-12 15:02")), json!("2016-11-12T15:02:00+00:00"));
        assert_eq!(
            auto(json!("2016-11-12T17:02:00+02:00")),
            json!("2016-11-12T15:02:00+00:00")
        );
        assert_eq!(
            auto(json!("Sat, 12 Nov 2016 15:02:00 GMT")),
            json!("2016-11-12T15:02:00+00:00")
        );
        assert_eq!(auto(json!("2016-11-12 15:02:00 UTC")), json!("2016-11-12T15:02:00+00:00"));
        assert_eq!(
            auto(json!("12/Nov/2016:16:02:00 +0100")),
            json!("2016-11-12T15:02:00+00:00")
        );
        assert_eq!(auto(json!("2016-11-12")), json!("2016-11-12T00:00:00+00:00"));
        assert_eq!(auto(json!("20161112")), json!("2016-11-12T00:00:00+00:00"));
        assert_eq!(auto(json!("20161112150200")), json!("2016-11-12T15:02:00+00:00"));
    }

    #[test]
    fn epoch_numbers() {
        assert_eq!(auto(json!(1_478_962_920)), json!("2016-11-12T15:02:00+00:00"));
        assert_eq!(auto(json!("1478962920")), json!("2016-11-12T15:02:00+00:00"));
        assert_eq!(auto(json!(1_478_962_920_250_i64)), json!("2016-11-12T15:02:00.250000+00:00"));
        assert_eq!(auto(json!(1_478_962_920.5)), json!("2016-11-12T15:02:00.500000+00:00"));
    }

    #[test]
    fn explicit_formats() {
        let nt = DateTime::sanitize_with_format(&json!("131234365200000000"), &DateTimeFormat::WindowsNt)
            .unwrap();
        assert_eq!(nt, json!("2016-11-12T15:02:00+00:00"));

        let pattern = DateTimeFormat::Pattern("%d.%m.%y %H.%M".to_owned());
        assert_eq!(
            DateTime::sanitize_with_format(&json!("12.11.16 15.02"), &pattern).unwrap(),
            json!("2016-11-12T15:02:00+00:00")
        );
        assert!(DateTime::sanitize_with_format(&json!("garbage"), &pattern).is_err());

        assert_eq!(
            DateTime::sanitize_with_format(&json!(1_478_962_920_000_i64), &DateTimeFormat::EpochMillis)
                .unwrap(),
            json!("2016-11-12T15:02:00+00:00")
        );
    }

    #[test]
    fn format_parses_from_config_text() {
        assert_eq!("auto".parse::<DateTimeFormat>().unwrap(), DateTimeFormat::Auto);
        assert_eq!("timestamp".parse::<DateTimeFormat>().unwrap(), DateTimeFormat::EpochSeconds);
        assert_eq!(
            "from_format|%Y".parse::<DateTimeFormat>().unwrap(),
            DateTimeFormat::Pattern("%Y".to_owned())
        );
        assert!("from_format|".parse::<DateTimeFormat>().is_err());
        assert!("weekly".parse::<DateTimeFormat>().is_err());
    }

    #[test]
    fn helpers() {
        assert_eq!(
            DateTime::from_timestamp(0.0).as_deref(),
            Some("1970-01-01T00:00:00+00:00")
        );
        assert_eq!(
            DateTime::from_epoch_millis(1_500).as_deref(),
            Some("1970-01-01T00:00:01.500000+00:00")
        );
        assert_eq!(
            DateTime::from_windows_nt(116_444_736_000_000_000).as_deref(),
            Some("1970-01-01T00:00:00+00:00")
        );
        assert!(DateTime.is_valid(&json!(DateTime::now())));
    }

    #[test]
    fn validity_is_canonical_form_only() {
        assert!(DateTime.is_valid(&json!("2016-11-12T15:02:00+00:00")));
        assert!(!DateTime.is_valid(&json!("2016-11-12T15:02:00Z")));
        assert!(!DateTime.is_valid(&json!("2016-11-12 15:02")));
        assert!(!DateTime.is_valid(&json!(1_478_962_920)));
        assert!(DateTime.sanitize(&json!("not a date")).is_err());
        assert!(DateTime.sanitize(&json!("")).is_err());
        assert!(DateTime.sanitize(&json!(true)).is_err());
    }
}
