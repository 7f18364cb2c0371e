//! Error types -- one enum per domain, folded into [`IntelflowError`].
//!
//! Harmonization and message errors are returned synchronously at the point
//! of mutation so the calling bot can decide whether to drop the field, drop
//! the record or give up on the whole message.

use serde_json::Value;

/// Top-level intelflow error.
#[derive(Debug, thiserror::Error)]
pub enum IntelflowError {
    /// Configuration loading or validation failed.
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    /// Type registry misuse.
    #[error("harmonization error: {0}")]
    Harmonization(#[from] HarmonizationError),

    /// Field schema could not be built.
    #[error("schema error: {0}")]
    Schema(#[from] SchemaError),

    /// Message mutation or (de)serialization failed.
    #[error("message error: {0}")]
    Message(#[from] MessageError),

    /// Queue, pipeline or bot runtime failure.
    #[error("pipeline error: {0}")]
    Pipeline(String),

    /// I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Configuration file does not exist.
    #[error("config file not found: {path}")]
    FileNotFound { path: String },

    /// Configuration could not be parsed.
    #[error("failed to parse config: {reason}")]
    ParseFailed { reason: String },

    /// A configuration value is out of range or malformed.
    #[error("invalid config value for '{field}': {reason}")]
    InvalidValue { field: String, reason: String },
}

/// Type registry errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HarmonizationError {
    /// A type with this name is already registered.
    #[error("harmonization type '{0}' is already registered")]
    DuplicateType(String),

    /// No type with this name is registered.
    #[error("unknown harmonization type '{0}'")]
    UnknownType(String),
}

/// A value could not be coerced into the canonical form of a type.
///
/// Returned by [`HarmonizationType::sanitize`](crate::harmonization::HarmonizationType::sanitize);
/// never a panic.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("invalid value {value} for type {type_name}: {reason}")]
pub struct SanitizeError {
    /// Name of the type that rejected the value.
    pub type_name: String,
    /// The rejected input.
    pub value: Value,
    /// Why the value was rejected.
    pub reason: String,
}

impl SanitizeError {
    /// Creates a new sanitize error.
    pub fn new(type_name: impl Into<String>, value: &Value, reason: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            value: value.clone(),
            reason: reason.into(),
        }
    }
}

/// Field schema errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SchemaError {
    /// A non-`extra.*` field name that is not part of the schema.
    #[error("unknown field '{0}'")]
    UnknownField(String),

    /// A field refers to a type the registry does not know.
    #[error("field '{field}' uses unknown type '{type_name}'")]
    UnknownType { field: String, type_name: String },

    /// One key is the namespace prefix of another (`source` vs `source.ip`).
    #[error("field '{key}' collides with namespace '{prefix}'")]
    ConflictingKey { key: String, prefix: String },

    /// `required` was set on a report field.
    #[error("report field '{0}' cannot be required")]
    RequiredInReport(String),

    /// Keys under `extra.` are never declared in the schema.
    #[error("field '{0}' is in the reserved extra namespace")]
    ReservedKey(String),

    /// The declarative schema source could not be parsed.
    #[error("failed to parse harmonization schema: {reason}")]
    ParseFailed { reason: String },
}

/// Message mutation and serialization errors.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum MessageError {
    /// The value failed the field's type sanitization.
    #[error("invalid value {value} for field '{field}': {reason}")]
    InvalidValue {
        field: String,
        value: Value,
        reason: String,
    },

    /// The field is not part of the schema and not under `extra.`.
    #[error("unknown field '{0}'")]
    UnknownField(String),

    /// `add` without overwrite on a key that is already set.
    #[error("key '{0}' already exists")]
    KeyExists(String),

    /// `change` or `value` on a key that is not set.
    #[error("key '{0}' does not exist")]
    KeyNotExists(String),

    /// Input is not a JSON object with a valid `__type`.
    #[error("malformed serialized message: {0}")]
    MalformedSerialization(String),

    /// Two keys cannot both be nested (`extra.a` and `extra.a.b`).
    #[error("cannot nest field '{0}': parent is already a value")]
    HierarchyConflict(String),
}

impl MessageError {
    /// Builds an `InvalidValue` error from a type-level sanitize failure.
    pub fn invalid_value(field: impl Into<String>, err: SanitizeError) -> Self {
        MessageError::InvalidValue {
            field: field.into(),
            value: err.value,
            reason: err.reason,
        }
    }
}

impl From<SchemaError> for MessageError {
    fn from(err: SchemaError) -> Self {
        match err {
            SchemaError::UnknownField(field) => MessageError::UnknownField(field),
            other => MessageError::MalformedSerialization(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn sanitize_error_display_names_type_and_value() {
        let err = SanitizeError::new("IPAddress", &json!("not-an-ip"), "not an IP literal");
        let msg = err.to_string();
        assert!(msg.contains("IPAddress"));
        assert!(msg.contains("not-an-ip"));
    }

    #[test]
    fn invalid_value_keeps_field_and_reason() {
        let err = MessageError::invalid_value(
            "source.fqdn",
            SanitizeError::new("FQDN", &json!("1.2.3.4"), "IP literal"),
        );
        match err {
            MessageError::InvalidValue { field, value, reason } => {
                assert_eq!(field, "source.fqdn");
                assert_eq!(value, json!("1.2.3.4"));
                assert_eq!(reason, "IP literal");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn unknown_field_schema_error_maps_to_message_error() {
        let err: MessageError = SchemaError::UnknownField("source.nope".to_owned()).into();
        assert_eq!(err, MessageError::UnknownField("source.nope".to_owned()));
    }

    #[test]
    fn converts_to_top_level_error() {
        let err: IntelflowError = MessageError::KeyExists("raw".to_owned()).into();
        assert!(matches!(err, IntelflowError::Message(_)));
        let err: IntelflowError = ConfigError::ParseFailed {
            reason: "bad".to_owned(),
        }
        .into();
        assert!(err.to_string().contains("bad"));
    }
}
