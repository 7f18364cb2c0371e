//! Scalar types: strings, booleans, numbers, accuracy, UUID.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::{Number, Value};

use super::{HarmonizationType, trimmed_str};
use crate::error::SanitizeError;

static UUID_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12}$")
        .expect("UUID pattern is valid")
});

/// Converts strings and numbers into a trimmed, non-empty string.
fn generic_string(type_name: &str, value: &Value) -> Result<String, SanitizeError> {
    let text = match value {
        Value::String(s) => s.trim().to_owned(),
        Value::Number(n) => n.to_string(),
        _ => return Err(SanitizeError::new(type_name, value, "expected a string")),
    };
    if text.is_empty() {
        return Err(SanitizeError::new(type_name, value, "empty string"));
    }
    Ok(text)
}

/// Generic text: trimmed, non-empty.
pub struct GenericString;

impl HarmonizationType for GenericString {
    fn type_name(&self) -> &str {
        "String"
    }

    fn sanitize(&self, value: &Value) -> Result<Value, SanitizeError> {
        generic_string(self.type_name(), value).map(Value::String)
    }
}

/// Lower-cased text. Also registered as `MalwareName`.
pub struct LowercaseString {
    name: &'static str,
}

impl LowercaseString {
    /// The `LowercaseString` type.
    pub fn new() -> Self {
        Self::named("LowercaseString")
    }

    /// The same rule under another name.
    pub fn named(name: &'static str) -> Self {
        Self { name }
    }
}

impl Default for LowercaseString {
    fn default() -> Self {
        Self::new()
    }
}

impl HarmonizationType for LowercaseString {
    fn type_name(&self) -> &str {
        self.name
    }

    fn sanitize(&self, value: &Value) -> Result<Value, SanitizeError> {
        generic_string(self.name, value).map(|s| Value::String(s.to_lowercase()))
    }
}

/// Upper-cased text.
pub struct UppercaseString;

impl HarmonizationType for UppercaseString {
    fn type_name(&self) -> &str {
        "UppercaseString"
    }

    fn sanitize(&self, value: &Value) -> Result<Value, SanitizeError> {
        generic_string(self.type_name(), value).map(|s| Value::String(s.to_uppercase()))
    }
}

/// JSON booleans; `"true"`/`"false"` and `0`/`1` are coerced.
pub struct Boolean;

impl HarmonizationType for Boolean {
    fn type_name(&self) -> &str {
        "Boolean"
    }

    fn sanitize(&self, value: &Value) -> Result<Value, SanitizeError> {
        let parsed = match value {
            Value::Bool(b) => Some(*b),
            Value::String(s) => match s.trim().to_lowercase().as_str() {
                "true" => Some(true),
                "false" => Some(false),
                _ => None,
            },
            Value::Number(n) => match n.as_i64() {
                Some(0) => Some(false),
                Some(1) => Some(true),
                _ => None,
            },
            _ => None,
        };
        parsed
            .map(Value::Bool)
            .ok_or_else(|| SanitizeError::new(self.type_name(), value, "not a boolean"))
    }

    fn is_valid(&self, value: &Value) -> bool {
        value.is_boolean()
    }
}

/// Signed 64-bit integers. Booleans are rejected.
pub struct Integer;

impl Integer {
    pub(crate) fn parse(value: &Value) -> Option<i64> {
        match value {
            Value::Number(n) => n.as_i64().or_else(|| {
                n.as_f64()
                    .filter(|f| f.fract() == 0.0 && f.abs() < 9.0e15)
                    .map(|f| f as i64)
            }),
            Value::String(s) => s.trim().parse::<i64>().ok(),
            _ => None,
        }
    }
}

impl HarmonizationType for Integer {
    fn type_name(&self) -> &str {
        "Integer"
    }

    fn sanitize(&self, value: &Value) -> Result<Value, SanitizeError> {
        Self::parse(value)
            .map(Value::from)
            .ok_or_else(|| SanitizeError::new(self.type_name(), value, "not an integer"))
    }
}

/// Parses numbers and numeric strings into a finite `f64`.
fn parse_f64(value: &Value) -> Option<f64> {
    let f = match value {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.trim().parse::<f64>().ok()?,
        _ => return None,
    };
    f.is_finite().then_some(f)
}

fn float_value(f: f64) -> Option<Value> {
    Number::from_f64(f).map(Value::Number)
}

/// Floating point numbers. Booleans are rejected.
pub struct Float;

impl HarmonizationType for Float {
    fn type_name(&self) -> &str {
        "Float"
    }

    fn sanitize(&self, value: &Value) -> Result<Value, SanitizeError> {
        parse_f64(value)
            .and_then(float_value)
            .ok_or_else(|| SanitizeError::new(self.type_name(), value, "not a float"))
    }

    /// Integers are not canonical: they sanitize to a float.
    fn is_valid(&self, value: &Value) -> bool {
        value.is_f64() && value.as_f64().is_some_and(f64::is_finite)
    }
}

/// A float within `[0, 100]`; out-of-range numbers are clamped.
/// `true`/`false` map to `100.0`/`0.0`.
pub struct Accuracy;

impl HarmonizationType for Accuracy {
    fn type_name(&self) -> &str {
        "Accuracy"
    }

    fn sanitize(&self, value: &Value) -> Result<Value, SanitizeError> {
        let accuracy = match value {
            Value::Bool(true) => Some(100.0),
            Value::Bool(false) => Some(0.0),
            other => parse_f64(other),
        }
        .ok_or_else(|| SanitizeError::new(self.type_name(), value, "not a number"))?;

        float_value(accuracy.clamp(0.0, 100.0))
            .ok_or_else(|| SanitizeError::new(self.type_name(), value, "not a finite number"))
    }

    fn is_valid(&self, value: &Value) -> bool {
        value
            .as_f64()
            .is_some_and(|f| (0.0..=100.0).contains(&f))
    }
}

/// Lower-case hyphenated UUIDs.
pub struct Uuid;

impl HarmonizationType for Uuid {
    fn type_name(&self) -> &str {
        "UUID"
    }

    fn sanitize(&self, value: &Value) -> Result<Value, SanitizeError> {
        let text = trimmed_str(value)
            .ok_or_else(|| SanitizeError::new(self.type_name(), value, "expected a string"))?
            .to_lowercase();
        if !UUID_RE.is_match(&text) {
            return Err(SanitizeError::new(self.type_name(), value, "not a UUID"));
        }
        Ok(Value::String(text))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn generic_string_trims_and_rejects_empty() {
        assert_eq!(GenericString.sanitize(&json!("  abc ")).unwrap(), json!("abc"));
        assert_eq!(GenericString.sanitize(&json!(42)).unwrap(), json!("42"));
        assert!(GenericString.sanitize(&json!("   ")).is_err());
        assert!(GenericString.sanitize(&json!(true)).is_err());
        assert!(!GenericString.is_valid(&json!(" abc")));
    }

    #[test]
    fn lowercase_and_uppercase() {
        assert_eq!(LowercaseString::new().sanitize(&json!("Zeus")).unwrap(), json!("zeus"));
        assert_eq!(UppercaseString.sanitize(&json!("de")).unwrap(), json!("DE"));
        assert!(LowercaseString::named("MalwareName").is_valid(&json!("zeus")));
        assert!(!LowercaseString::named("MalwareName").is_valid(&json!("Zeus")));
    }

    #[test]
    fn boolean_coercion() {
        assert_eq!(Boolean.sanitize(&json!("TRUE")).unwrap(), json!(true));
        assert_eq!(Boolean.sanitize(&json!(0)).unwrap(), json!(false));
        assert!(Boolean.sanitize(&json!(2)).is_err());
        assert!(Boolean.is_valid(&json!(false)));
        assert!(!Boolean.is_valid(&json!("false")));
    }

    #[test]
    fn integer_rejects_bool_and_fraction() {
        assert_eq!(Integer.sanitize(&json!("17")).unwrap(), json!(17));
        assert_eq!(Integer.sanitize(&json!(17.0)).unwrap(), json!(17));
        assert!(Integer.sanitize(&json!(17.5)).is_err());
        assert!(Integer.sanitize(&json!(true)).is_err());
    }

    #[test]
    fn float_accepts_numbers_and_strings() {
        assert_eq!(Float.sanitize(&json!("1.5")).unwrap(), json!(1.5));
        assert_eq!(Float.sanitize(&json!(3)).unwrap(), json!(3.0));
        assert!(Float.sanitize(&json!("nan")).is_err());
        assert!(Float.is_valid(&json!(3.0)));
        assert!(!Float.is_valid(&json!(3)));
        assert!(!Float.is_valid(&json!("1.5")));
        for input in [json!(3), json!("2.5"), json!(-0.25)] {
            let sanitized = Float.sanitize(&input).unwrap();
            assert!(Float.is_valid(&sanitized), "{input} -> {sanitized}");
        }
    }

    #[test]
    fn accuracy_range() {
        assert_eq!(Accuracy.sanitize(&json!(true)).unwrap(), json!(100.0));
        assert_eq!(Accuracy.sanitize(&json!("50")).unwrap(), json!(50.0));
        assert_eq!(Accuracy.sanitize(&json!(100.5)).unwrap(), json!(100.0));
        assert_eq!(Accuracy.sanitize(&json!(-1)).unwrap(), json!(0.0));
        assert!(Accuracy.sanitize(&json!("high")).is_err());
        assert!(Accuracy.is_valid(&json!(0.0)));
        assert!(!Accuracy.is_valid(&json!(101)));
    }

    #[test]
    fn uuid_lowercases() {
        let upper = "6F9619FF-8B86-D011-B42D-00C04FC964FF";
        assert_eq!(
            Uuid.sanitize(&json!(upper)).unwrap(),
            json!("6f9619ff-8b86-d011-b42d-00c04fc964ff")
        );
        assert!(Uuid.sanitize(&json!("not-a-uuid")).is_err());
    }
}
