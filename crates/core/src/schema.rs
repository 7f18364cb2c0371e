//! Field schema -- maps dot-namespaced field names to harmonization types.
//!
//! The schema is loaded once at startup from a declarative TOML source and
//! then shared read-only. Each message kind has its own field table:
//!
//! ```toml
//! [event."source.ip"]
//! type = "IPAddress"
//! description = "IP address of the source."
//!
//! [event."feed.name"]
//! type = "String"
//! required = true
//! ```
//!
//! Names under `extra.` are never declared; any such key is accepted with an
//! arbitrary JSON value.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value;

use crate::error::{MessageError, SchemaError};
use crate::harmonization::TypeRegistry;
use crate::message::MessageKind;

/// Prefix of the free-form namespace.
pub const EXTRA_PREFIX: &str = "extra.";

/// Discriminator key of the wire format; never a field.
pub const TYPE_KEY: &str = "__type";

const BUILTIN_SCHEMA: &str = include_str!("../harmonization.toml");

/// Returns whether `name` lives in the free-form `extra.` namespace.
pub fn is_extra(name: &str) -> bool {
    name.starts_with(EXTRA_PREFIX)
}

/// One schema entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldSpec {
    /// Dot-namespaced name, e.g. `time.source`.
    pub name: String,
    /// Name of the harmonization type in the registry.
    pub type_name: String,
    /// Only meaningful for events.
    pub required: bool,
    pub description: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawField {
    #[serde(rename = "type")]
    type_name: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    required: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawSchema {
    #[serde(default)]
    event: BTreeMap<String, RawField>,
    #[serde(default)]
    report: BTreeMap<String, RawField>,
}

/// Immutable field catalog for both message kinds.
#[derive(Debug, Clone)]
pub struct FieldSchema {
    registry: Arc<TypeRegistry>,
    event: BTreeMap<String, FieldSpec>,
    report: BTreeMap<String, FieldSpec>,
}

impl FieldSchema {
    /// The built-in schema over the built-in types.
    pub fn builtin() -> Result<Self, SchemaError> {
        Self::from_toml_str(BUILTIN_SCHEMA, Arc::new(TypeRegistry::with_builtin_types()))
    }

    /// Loads a schema file, resolving types against `registry`.
    pub fn load(path: impl AsRef<Path>, registry: Arc<TypeRegistry>) -> Result<Self, SchemaError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| SchemaError::ParseFailed {
            reason: format!("{}: {e}", path.display()),
        })?;
        Self::from_toml_str(&text, registry)
    }

    /// Parses and checks a schema from TOML text.
    pub fn from_toml_str(text: &str, registry: Arc<TypeRegistry>) -> Result<Self, SchemaError> {
        let raw: RawSchema = toml::from_str(text).map_err(|e| SchemaError::ParseFailed {
            reason: e.to_string(),
        })?;

        let event = build_table(raw.event, &registry, MessageKind::Event)?;
        let report = build_table(raw.report, &registry, MessageKind::Report)?;

        tracing::debug!(
            event_fields = event.len(),
            report_fields = report.len(),
            "harmonization schema loaded"
        );

        Ok(Self {
            registry,
            event,
            report,
        })
    }

    /// Type registry backing this schema.
    pub fn registry(&self) -> &TypeRegistry {
        &self.registry
    }

    fn table(&self, kind: MessageKind) -> &BTreeMap<String, FieldSpec> {
        match kind {
            MessageKind::Event => &self.event,
            MessageKind::Report => &self.report,
        }
    }

    /// Looks up a field.
    ///
    /// `Ok(None)` for `extra.*` names; any other unknown name is an
    /// [`SchemaError::UnknownField`].
    pub fn lookup(&self, kind: MessageKind, name: &str) -> Result<Option<&FieldSpec>, SchemaError> {
        if is_extra(name) {
            return Ok(None);
        }
        self.table(kind)
            .get(name)
            .map(Some)
            .ok_or_else(|| SchemaError::UnknownField(name.to_owned()))
    }

    /// Returns whether `name` is declared for `kind` (or is an `extra.*` name).
    pub fn is_known(&self, kind: MessageKind, name: &str) -> bool {
        is_extra(name) || self.table(kind).contains_key(name)
    }

    /// Returns whether `prefix` is a namespace holding declared fields
    /// (`source` for `source.ip`). `extra` always is one.
    pub fn is_namespace(&self, kind: MessageKind, prefix: &str) -> bool {
        if prefix == "extra" {
            return true;
        }
        let lower = format!("{prefix}.");
        self.table(kind)
            .range(lower.clone()..)
            .next()
            .is_some_and(|(name, _)| name.starts_with(&lower))
    }

    /// Declared fields of a kind, sorted by name.
    pub fn fields(&self, kind: MessageKind) -> impl Iterator<Item = &FieldSpec> {
        self.table(kind).values()
    }

    /// Declared required fields of a kind.
    pub fn required_fields(&self, kind: MessageKind) -> impl Iterator<Item = &FieldSpec> {
        self.fields(kind).filter(|spec| spec.required)
    }

    /// Sanitizes `value` for field `name`.
    ///
    /// `extra.*` values are stored as given.
    pub fn sanitize(&self, kind: MessageKind, name: &str, value: &Value) -> Result<Value, MessageError> {
        match self.lookup(kind, name)? {
            None => Ok(value.clone()),
            Some(spec) => self
                .registry
                .sanitize(&spec.type_name, value)
                .map_err(|err| MessageError::invalid_value(name, err)),
        }
    }

    /// Returns whether `value` is already canonical for field `name`.
    pub fn validate(&self, kind: MessageKind, name: &str, value: &Value) -> Result<bool, SchemaError> {
        Ok(match self.lookup(kind, name)? {
            None => true,
            Some(spec) => self.registry.validate(&spec.type_name, value),
        })
    }
}

fn build_table(
    raw: BTreeMap<String, RawField>,
    registry: &TypeRegistry,
    kind: MessageKind,
) -> Result<BTreeMap<String, FieldSpec>, SchemaError> {
    let mut table = BTreeMap::new();
    for (name, field) in raw {
        if name.is_empty() || name.split('.').any(str::is_empty) {
            return Err(SchemaError::ParseFailed {
                reason: format!("malformed field name '{name}'"),
            });
        }
        if is_extra(&name) || name == "extra" || name == TYPE_KEY {
            return Err(SchemaError::ReservedKey(name));
        }
        if !registry.contains(&field.type_name) {
            return Err(SchemaError::UnknownType {
                field: name,
                type_name: field.type_name,
            });
        }
        if field.required && kind == MessageKind::Report {
            return Err(SchemaError::RequiredInReport(name));
        }
        table.insert(
            name.clone(),
            FieldSpec {
                name,
                type_name: field.type_name,
                required: field.required,
                description: field.description,
            },
        );
    }

    // `source` and `source.ip` cannot both be values: nested output collides
    for name in table.keys() {
        for (idx, _) in name.match_indices('.') {
            let prefix = &name[..idx];
            if table.contains_key(prefix) {
                return Err(SchemaError::ConflictingKey {
                    key: name.clone(),
                    prefix: prefix.to_owned(),
                });
            }
        }
    }
    Ok(table)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn registry() -> Arc<TypeRegistry> {
        Arc::new(TypeRegistry::with_builtin_types())
    }

    #[test]
    fn builtin_schema_loads() {
        let schema = FieldSchema::builtin().unwrap();
        let spec = schema.lookup(MessageKind::Event, "source.ip").unwrap().unwrap();
        assert_eq!(spec.type_name, "IPAddress");
        assert!(!spec.required);
        assert!(schema.lookup(MessageKind::Report, "raw").unwrap().is_some());
        assert!(schema.lookup(MessageKind::Report, "source.ip").is_err());
    }

    #[test]
    fn builtin_required_fields() {
        let schema = FieldSchema::builtin().unwrap();
        let required: Vec<_> = schema
            .required_fields(MessageKind::Event)
            .map(|spec| spec.name.as_str())
            .collect();
        assert_eq!(required, vec!["feed.name"]);
        assert_eq!(schema.required_fields(MessageKind::Report).count(), 0);
    }

    #[test]
    fn extra_names_are_unconstrained() {
        let schema = FieldSchema::builtin().unwrap();
        assert!(is_extra("extra.foo.bar"));
        assert!(!is_extra("extras"));
        assert_eq!(schema.lookup(MessageKind::Event, "extra.anything").unwrap(), None);
        let value = json!({"nested": [1, 2]});
        assert_eq!(
            schema.sanitize(MessageKind::Event, "extra.x", &value).unwrap(),
            value
        );
    }

    #[test]
    fn unknown_field_is_an_error() {
        let schema = FieldSchema::builtin().unwrap();
        assert_eq!(
            schema.lookup(MessageKind::Event, "source.nope").unwrap_err(),
            SchemaError::UnknownField("source.nope".to_owned())
        );
        assert_eq!(
            schema.sanitize(MessageKind::Event, "nope", &json!(1)).unwrap_err(),
            MessageError::UnknownField("nope".to_owned())
        );
    }

    #[test]
    fn sanitize_reports_invalid_value() {
        let schema = FieldSchema::builtin().unwrap();
        let err = schema
            .sanitize(MessageKind::Event, "source.fqdn", &json!("93.184.216.34"))
            .unwrap_err();
        assert!(matches!(err, MessageError::InvalidValue { ref field, .. } if field == "source.fqdn"));
    }

    #[test]
    fn rejects_unknown_type() {
        let err = FieldSchema::from_toml_str(
            "[event.\"source.ip\"]\ntype = \"Nope\"\n",
            registry(),
        )
        .unwrap_err();
        assert!(matches!(err, SchemaError::UnknownType { .. }));
    }

    #[test]
    fn rejects_namespace_collision() {
        let text = "[event.source]\ntype = \"String\"\n[event.\"source.ip\"]\ntype = \"IPAddress\"\n";
        let err = FieldSchema::from_toml_str(text, registry()).unwrap_err();
        assert_eq!(
            err,
            SchemaError::ConflictingKey {
                key: "source.ip".to_owned(),
                prefix: "source".to_owned(),
            }
        );
    }

    #[test]
    fn rejects_required_report_field() {
        let text = "[report.raw]\ntype = \"Base64\"\nrequired = true\n";
        assert_eq!(
            FieldSchema::from_toml_str(text, registry()).unwrap_err(),
            SchemaError::RequiredInReport("raw".to_owned())
        );
    }

    #[test]
    fn rejects_reserved_and_malformed_names() {
        let text = "[event.\"extra.foo\"]\ntype = \"String\"\n";
        assert!(matches!(
            FieldSchema::from_toml_str(text, registry()).unwrap_err(),
            SchemaError::ReservedKey(_)
        ));
        let text = "[event.\"source..ip\"]\ntype = \"String\"\n";
        assert!(matches!(
            FieldSchema::from_toml_str(text, registry()).unwrap_err(),
            SchemaError::ParseFailed { .. }
        ));
        let text = "[event.raw]\ntype = \"Base64\"\ncolour = \"blue\"\n";
        assert!(matches!(
            FieldSchema::from_toml_str(text, registry()).unwrap_err(),
            SchemaError::ParseFailed { .. }
        ));
    }

    #[test]
    fn load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("harmonization.toml");
        std::fs::write(&path, "[event.\"source.asn\"]\ntype = \"ASN\"\n").unwrap();
        let schema = FieldSchema::load(&path, registry()).unwrap();
        assert!(schema.is_known(MessageKind::Event, "source.asn"));
        assert!(!schema.is_known(MessageKind::Event, "source.ip"));
        assert!(schema.is_namespace(MessageKind::Event, "source"));
        assert!(!schema.is_namespace(MessageKind::Event, "source.asn"));
        assert!(!schema.is_namespace(MessageKind::Event, "sour"));
        assert!(FieldSchema::load(dir.path().join("missing.toml"), registry()).is_err());
    }
}
