//! Message model -- validated field documents flowing through the pipeline.
//!
//! A [`Message`] is either a `Report` (a raw payload fetched by a collector,
//! plus feed metadata) or an `Event` (a harmonized record). Both share one
//! representation: a sorted map from field name to sanitized JSON value and
//! a handle on the shared [`FieldSchema`].
//!
//! Every mutation goes through the schema, so a stored value has always
//! passed its field type's `sanitize`. Keys outside the schema are rejected
//! unless they live under `extra.`.
//!
//! # Usage
//! ```
//! use std::sync::Arc;
//! use intelflow_core::message::{JsonOptions, Message};
//! use intelflow_core::schema::FieldSchema;
//!
//! let schema = Arc::new(FieldSchema::builtin().unwrap());
//! let mut event = Message::new_event(schema);
//! event.add("source.ip", " 1.2.3.4 ").unwrap();
//! let json = event.to_json(&JsonOptions::hierarchical()).unwrap();
//! assert_eq!(json, r#"{"__type": "Event", "source": {"ip": "1.2.3.4"}}"#);
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::codec;
use crate::error::MessageError;
use crate::harmonization::Base64;
use crate::metrics as names;
use crate::schema::{FieldSchema, TYPE_KEY, is_extra};

/// Fields an event inherits from the report it was parsed from.
const INHERITED_PREFIXES: &[&str] = &["feed.", "time.observation", "rtir_id"];

/// Message discriminator, serialized as the `__type` key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageKind {
    Report,
    Event,
}

impl MessageKind {
    /// Wire name (`"Report"` / `"Event"`).
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Report => "Report",
            MessageKind::Event => "Event",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageKind {
    type Err = MessageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Report" => Ok(MessageKind::Report),
            "Event" => Ok(MessageKind::Event),
            other => Err(MessageError::MalformedSerialization(format!(
                "unknown message type '{other}'"
            ))),
        }
    }
}

/// Options for [`Message::add_with`].
#[derive(Debug, Clone, PartialEq)]
pub struct AddOptions {
    /// Replace an existing value instead of failing.
    pub overwrite: bool,
    /// Return `InvalidValue` / `KeyExists` as errors. When `false` these
    /// become `Ok(false)` and the message is left unchanged.
    pub raise_failure: bool,
    /// Run the type's `sanitize`. When `false` the value must already be
    /// canonical.
    pub sanitize: bool,
    /// Values treated like an empty value: nothing is stored.
    pub ignore: Vec<Value>,
}

impl Default for AddOptions {
    fn default() -> Self {
        Self {
            overwrite: false,
            raise_failure: true,
            sanitize: true,
            ignore: Vec::new(),
        }
    }
}

impl AddOptions {
    pub fn with_overwrite(mut self, overwrite: bool) -> Self {
        self.overwrite = overwrite;
        self
    }

    pub fn with_raise_failure(mut self, raise_failure: bool) -> Self {
        self.raise_failure = raise_failure;
        self
    }

    pub fn with_sanitize(mut self, sanitize: bool) -> Self {
        self.sanitize = sanitize;
        self
    }

    pub fn with_ignore(mut self, ignore: impl IntoIterator<Item = Value>) -> Self {
        self.ignore = ignore.into_iter().collect();
        self
    }
}

/// Options for [`Message::to_json`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JsonOptions {
    /// Nest dotted keys into objects.
    pub hierarchical: bool,
    /// Spaces per level; `None` for single-line output.
    pub indent: Option<usize>,
}

impl JsonOptions {
    /// Flat, single-line: the wire format.
    pub fn flat() -> Self {
        Self::default()
    }

    /// Nested, single-line.
    pub fn hierarchical() -> Self {
        Self {
            hierarchical: true,
            indent: None,
        }
    }

    pub fn with_indent(mut self, indent: usize) -> Self {
        self.indent = Some(indent);
        self
    }
}

/// A report or event.
#[derive(Clone)]
pub struct Message {
    kind: MessageKind,
    fields: BTreeMap<String, Value>,
    schema: Arc<FieldSchema>,
}

impl Message {
    /// Creates an empty message of `kind`.
    pub fn new(kind: MessageKind, schema: Arc<FieldSchema>) -> Self {
        Self {
            kind,
            fields: BTreeMap::new(),
            schema,
        }
    }

    pub fn new_report(schema: Arc<FieldSchema>) -> Self {
        Self::new(MessageKind::Report, schema)
    }

    pub fn new_event(schema: Arc<FieldSchema>) -> Self {
        Self::new(MessageKind::Event, schema)
    }

    /// Creates an event seeded with the feed metadata of `report`
    /// (`feed.*`, `time.observation`, `rtir_id`).
    ///
    /// Fields the event schema does not accept are skipped.
    pub fn event_from_report(report: &Message) -> Self {
        let mut event = Self::new_event(Arc::clone(&report.schema));
        let soft = AddOptions::default().with_raise_failure(false);
        for (key, value) in &report.fields {
            if !INHERITED_PREFIXES.iter().any(|p| key.starts_with(p)) {
                continue;
            }
            if !event.schema.is_known(MessageKind::Event, key) {
                continue;
            }
            if let Err(err) = event.add_with(key, value.clone(), &soft) {
                tracing::debug!(field = %key, error = %err, "field not inherited from report");
            }
        }
        event
    }

    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    pub fn schema(&self) -> &Arc<FieldSchema> {
        &self.schema
    }

    /// Adds a field with default options: sanitized, no overwrite, errors raised.
    ///
    /// Collected payloads go through [`set_raw`](Self::set_raw), not
    /// `add("raw", ..)`: `Base64` keeps text that already decodes as base64,
    /// so plain text such as `"test"` would not round-trip through
    /// [`raw_bytes`](Self::raw_bytes).
    pub fn add(&mut self, key: &str, value: impl Into<Value>) -> Result<bool, MessageError> {
        self.add_with(key, value, &AddOptions::default())
    }

    /// Adds a field.
    ///
    /// Returns `Ok(true)` when the value was stored. `null`, `""` and values
    /// listed in `options.ignore` store nothing and return `Ok(false)`.
    /// `UnknownField` is always an error, regardless of `raise_failure`.
    pub fn add_with(
        &mut self,
        key: &str,
        value: impl Into<Value>,
        options: &AddOptions,
    ) -> Result<bool, MessageError> {
        let value = value.into();

        // unknown names are a bug in the caller, never soft-failed
        if !self.schema.is_known(self.kind, key) {
            return Err(MessageError::UnknownField(key.to_owned()));
        }
        if !options.overwrite && self.fields.contains_key(key) {
            return soft_fail(options, MessageError::KeyExists(key.to_owned()));
        }
        if is_empty_value(&value) || options.ignore.contains(&value) {
            return Ok(false);
        }

        let stored = if options.sanitize {
            self.schema.sanitize(self.kind, key, &value)
        } else if self.schema.validate(self.kind, key, &value)? {
            Ok(value)
        } else {
            Err(MessageError::InvalidValue {
                field: key.to_owned(),
                value,
                reason: "value is not canonical".to_owned(),
            })
        };

        match stored {
            Ok(stored) => {
                self.fields.insert(key.to_owned(), stored);
                Ok(true)
            }
            Err(err) => {
                metrics::counter!(names::SANITIZE_FAILURES_TOTAL).increment(1);
                soft_fail(options, err)
            }
        }
    }

    /// Replaces the value of an existing field.
    pub fn change(&mut self, key: &str, value: impl Into<Value>) -> Result<bool, MessageError> {
        if !self.fields.contains_key(key) {
            return Err(MessageError::KeyNotExists(key.to_owned()));
        }
        self.add_with(key, value, &AddOptions::default().with_overwrite(true))
    }

    /// Adds every pair, overwriting existing values. Stops at the first error.
    pub fn update<I, K, V>(&mut self, pairs: I) -> Result<(), MessageError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<Value>,
    {
        let options = AddOptions::default().with_overwrite(true);
        for (key, value) in pairs {
            self.add_with(key.as_ref(), value, &options)?;
        }
        Ok(())
    }

    /// Removes a field; returns the old value, if any.
    pub fn discard(&mut self, key: &str) -> Option<Value> {
        self.fields.remove(key)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    /// String value of a field, if present and a string.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(Value::as_str)
    }

    /// Value of a field that must be present.
    pub fn value(&self, key: &str) -> Result<&Value, MessageError> {
        self.get(key)
            .ok_or_else(|| MessageError::KeyNotExists(key.to_owned()))
    }

    pub fn contains(&self, key: &str) -> bool {
        self.fields.contains_key(key)
    }

    /// Deep copy of the message.
    pub fn copy(&self) -> Message {
        self.clone()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Fields whose name starts with `prefix`.
    pub fn finditems<'a>(&'a self, prefix: &'a str) -> impl Iterator<Item = (&'a str, &'a Value)> {
        self.iter().filter(move |(key, _)| key.starts_with(prefix))
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Stores `bytes` base64-encoded under `raw`, replacing any previous payload.
    pub fn set_raw(&mut self, bytes: impl AsRef<[u8]>) -> Result<bool, MessageError> {
        let encoded = Base64::encode(bytes);
        self.add_with(
            "raw",
            encoded,
            &AddOptions::default().with_overwrite(true).with_sanitize(false),
        )
    }

    /// Decoded `raw` payload.
    pub fn raw_bytes(&self) -> Option<Vec<u8>> {
        self.get_str("raw").and_then(Base64::decode)
    }

    /// Required fields of this kind that are not set.
    pub fn missing_required(&self) -> Vec<String> {
        self.schema
            .required_fields(self.kind)
            .filter(|spec| !self.fields.contains_key(&spec.name))
            .map(|spec| spec.name.clone())
            .collect()
    }

    /// Mapping form including the `__type` discriminator.
    ///
    /// With `hierarchical`, `source.ip` becomes `{"source": {"ip": ...}}`.
    /// Fails with `HierarchyConflict` when one key is the namespace of
    /// another (`extra.a` and `extra.a.b`).
    pub fn to_dict(&self, hierarchical: bool) -> Result<Map<String, Value>, MessageError> {
        let mut dict = Map::new();
        dict.insert(TYPE_KEY.to_owned(), Value::from(self.kind.as_str()));
        for (key, value) in &self.fields {
            if hierarchical {
                insert_nested(&mut dict, key, value.clone())?;
            } else {
                dict.insert(key.clone(), value.clone());
            }
        }
        Ok(dict)
    }

    /// Canonical JSON text.
    pub fn to_json(&self, options: &JsonOptions) -> Result<String, MessageError> {
        let dict = Value::Object(self.to_dict(options.hierarchical)?);
        codec::to_canonical_string(&dict, options.indent)
            .map_err(|e| MessageError::MalformedSerialization(e.to_string()))
    }

    /// Wire form: flat, single-line canonical JSON.
    pub fn serialize(&self) -> Result<String, MessageError> {
        self.to_json(&JsonOptions::flat())
    }

    /// Rebuilds a message from JSON text.
    ///
    /// Accepts flat and hierarchical documents. Nested objects are unfolded
    /// while their path is a schema namespace; `extra` is unfolded one level.
    /// Every value is sanitized again on the way in.
    pub fn unserialize(text: &str, schema: Arc<FieldSchema>) -> Result<Self, MessageError> {
        let document: Value = serde_json::from_str(text)
            .map_err(|e| MessageError::MalformedSerialization(e.to_string()))?;
        let Value::Object(mut map) = document else {
            return Err(MessageError::MalformedSerialization(
                "expected a JSON object".to_owned(),
            ));
        };
        let kind = match map.remove(TYPE_KEY) {
            Some(Value::String(kind)) => kind.parse::<MessageKind>()?,
            Some(other) => {
                return Err(MessageError::MalformedSerialization(format!(
                    "'{TYPE_KEY}' must be a string, got {other}"
                )));
            }
            None => {
                return Err(MessageError::MalformedSerialization(format!(
                    "missing '{TYPE_KEY}'"
                )));
            }
        };

        let mut flat = Vec::with_capacity(map.len());
        unfold(&schema, kind, None, map, &mut flat);

        let mut message = Self::new(kind, schema);
        for (key, value) in flat {
            message.add(&key, value)?;
        }
        Ok(message)
    }

    /// [`unserialize`](Self::unserialize) for raw queue payloads.
    pub fn unserialize_bytes(bytes: &[u8], schema: Arc<FieldSchema>) -> Result<Self, MessageError> {
        let text = std::str::from_utf8(bytes)
            .map_err(|e| MessageError::MalformedSerialization(e.to_string()))?;
        Self::unserialize(text, schema)
    }
}

fn soft_fail(options: &AddOptions, err: MessageError) -> Result<bool, MessageError> {
    if options.raise_failure {
        Err(err)
    } else {
        tracing::debug!(error = %err, "field not added");
        Ok(false)
    }
}

fn is_empty_value(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        _ => false,
    }
}

fn insert_nested(root: &mut Map<String, Value>, key: &str, value: Value) -> Result<(), MessageError> {
    let conflict = || MessageError::HierarchyConflict(key.to_owned());
    let mut parts = key.split('.').peekable();
    let mut node = root;
    while let Some(part) = parts.next() {
        if parts.peek().is_none() {
            if node.contains_key(part) {
                return Err(conflict());
            }
            node.insert(part.to_owned(), value);
            return Ok(());
        }
        let child = node
            .entry(part.to_owned())
            .or_insert_with(|| Value::Object(Map::new()));
        node = child.as_object_mut().ok_or_else(conflict)?;
    }
    Ok(())
}

fn unfold(
    schema: &FieldSchema,
    kind: MessageKind,
    prefix: Option<&str>,
    map: Map<String, Value>,
    out: &mut Vec<(String, Value)>,
) {
    for (key, value) in map {
        let name = match prefix {
            Some(prefix) => format!("{prefix}.{key}"),
            None => key,
        };
        match value {
            Value::Object(inner)
                if !schema.is_known(kind, &name) && schema.is_namespace(kind, &name) =>
            {
                unfold(schema, kind, Some(&name), inner, out);
            }
            other => out.push((name, other)),
        }
    }
}

impl PartialEq for Message {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind && self.fields == other.fields
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("kind", &self.kind)
            .field("fields", &self.fields)
            .finish()
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = self.serialize().map_err(|_| fmt::Error)?;
        f.write_str(&text)
    }
}
