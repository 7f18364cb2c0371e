//! Encoded payload types: base64 binary and embedded JSON structures.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use serde_json::Value;

use super::HarmonizationType;
use crate::error::SanitizeError;

/// Binary payloads carried as standard (padded) base64 text.
///
/// Text that already decodes as base64 is re-encoded canonically; any other
/// text is taken as the payload itself and encoded. Arrays of byte values
/// are encoded as raw bytes. Text is never trimmed: surrounding whitespace
/// is part of a payload.
pub struct Base64;

impl Base64 {
    /// Encodes raw bytes.
    pub fn encode(bytes: impl AsRef<[u8]>) -> String {
        STANDARD.encode(bytes)
    }

    /// Decodes base64 text, ignoring embedded line breaks and spaces.
    pub fn decode(text: &str) -> Option<Vec<u8>> {
        let compact: String = text.chars().filter(|c| !c.is_ascii_whitespace()).collect();
        STANDARD.decode(compact).ok()
    }

    fn bytes_of(value: &Value) -> Option<Vec<u8>> {
        value
            .as_array()?
            .iter()
            .map(|b| b.as_u64().and_then(|b| u8::try_from(b).ok()))
            .collect()
    }
}

impl HarmonizationType for Base64 {
    fn type_name(&self) -> &str {
        "Base64"
    }

    fn sanitize(&self, value: &Value) -> Result<Value, SanitizeError> {
        let encoded = match value {
            Value::String(text) => match Self::decode(text) {
                Some(bytes) if !text.trim().is_empty() => Self::encode(bytes),
                _ => Self::encode(text.as_bytes()),
            },
            Value::Array(_) => Self::bytes_of(value).map(Self::encode).ok_or_else(|| {
                SanitizeError::new(self.type_name(), value, "array is not a byte sequence")
            })?,
            _ => {
                return Err(SanitizeError::new(
                    self.type_name(),
                    value,
                    "expected text or bytes",
                ));
            }
        };
        Ok(Value::String(encoded))
    }
}

/// Parses JSON text if `value` is a string, otherwise passes it through.
fn embedded_json(value: &Value) -> Value {
    match value {
        Value::String(text) => serde_json::from_str(text).unwrap_or(Value::Null),
        other => other.clone(),
    }
}

/// A JSON object, given either as a structure or as JSON text.
pub struct JsonDict;

impl HarmonizationType for JsonDict {
    fn type_name(&self) -> &str {
        "JSONDict"
    }

    fn sanitize(&self, value: &Value) -> Result<Value, SanitizeError> {
        match embedded_json(value) {
            dict @ Value::Object(_) => Ok(dict),
            _ => Err(SanitizeError::new(self.type_name(), value, "not a JSON object")),
        }
    }

    fn is_valid(&self, value: &Value) -> bool {
        value.is_object()
    }
}

/// A JSON array, given either as a structure or as JSON text.
pub struct JsonList;

impl HarmonizationType for JsonList {
    fn type_name(&self) -> &str {
        "JSONList"
    }

    fn sanitize(&self, value: &Value) -> Result<Value, SanitizeError> {
        match embedded_json(value) {
            list @ Value::Array(_) => Ok(list),
            _ => Err(SanitizeError::new(self.type_name(), value, "not a JSON array")),
        }
    }

    fn is_valid(&self, value: &Value) -> bool {
        value.is_array()
    }
}
