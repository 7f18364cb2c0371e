//! Harmonization type registry -- named validators and normalizers.
//!
//! Every schema field points at a [`HarmonizationType`] by name. A type
//! answers two questions about a JSON value:
//!
//! - [`is_valid`](HarmonizationType::is_valid): is the value already in
//!   canonical form? Pure predicate, no side effects.
//! - [`sanitize`](HarmonizationType::sanitize): coerce the value into
//!   canonical form or explain why that is impossible.
//!
//! `sanitize` never produces a value `is_valid` would reject, and
//! sanitizing an already canonical value returns it unchanged.
//!
//! # Usage
//! ```
//! use intelflow_core::harmonization::TypeRegistry;
//! use serde_json::json;
//!
//! let registry = TypeRegistry::with_builtin_types();
//! let ip = registry.sanitize("IPAddress", &json!(" 10.0.0.1 ")).unwrap();
//! assert_eq!(ip, json!("10.0.0.1"));
//! assert!(registry.validate("IPAddress", &ip));
//! ```

mod classification;
mod encoding;
mod network;
mod scalar;
mod time;

pub use classification::{ClassificationTaxonomy, ClassificationType};
pub use encoding::{Base64, JsonDict, JsonList};
pub use network::{Asn, Fqdn, HostValue, IpAddress, IpNetwork, Url, split_host};
pub use scalar::{Accuracy, Boolean, Float, GenericString, Integer, LowercaseString, UppercaseString, Uuid};
pub use time::{DateTime, DateTimeFormat};

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde_json::Value;

use crate::error::{HarmonizationError, SanitizeError};

/// A semantic value type with a validation and a sanitization rule.
pub trait HarmonizationType: Send + Sync {
    /// Registered name (e.g. `"IPAddress"`).
    fn type_name(&self) -> &str;

    /// Coerces `value` into the canonical representation of this type.
    fn sanitize(&self, value: &Value) -> Result<Value, SanitizeError>;

    /// Returns whether `value` is already canonical.
    ///
    /// The default accepts exactly the fixed points of [`sanitize`](Self::sanitize).
    fn is_valid(&self, value: &Value) -> bool {
        matches!(self.sanitize(value), Ok(ref sanitized) if sanitized == value)
    }
}

type Validator = dyn Fn(&Value) -> bool + Send + Sync;
type Sanitizer = dyn Fn(&Value) -> Result<Value, String> + Send + Sync;

/// A type assembled from a pair of closures, for [`TypeRegistry::register_fn`].
pub struct FnType {
    name: String,
    validator: Box<Validator>,
    sanitizer: Box<Sanitizer>,
}

impl HarmonizationType for FnType {
    fn type_name(&self) -> &str {
        &self.name
    }

    fn sanitize(&self, value: &Value) -> Result<Value, SanitizeError> {
        let sanitized =
            (self.sanitizer)(value).map_err(|reason| SanitizeError::new(&self.name, value, reason))?;
        if !(self.validator)(&sanitized) {
            return Err(SanitizeError::new(
                &self.name,
                value,
                "sanitized value does not validate",
            ));
        }
        Ok(sanitized)
    }

    fn is_valid(&self, value: &Value) -> bool {
        (self.validator)(value)
    }
}

/// Catalog of harmonization types, keyed by name.
///
/// Built once at startup and shared read-only (behind an `Arc`) by the
/// field schema and every message.
#[derive(Clone, Default)]
pub struct TypeRegistry {
    types: BTreeMap<String, Arc<dyn HarmonizationType>>,
}

impl TypeRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry holding every built-in type.
    pub fn with_builtin_types() -> Self {
        let builtins: Vec<Arc<dyn HarmonizationType>> = vec![
            Arc::new(GenericString),
            Arc::new(LowercaseString::new()),
            Arc::new(LowercaseString::named("MalwareName")),
            Arc::new(UppercaseString),
            Arc::new(Boolean),
            Arc::new(Integer),
            Arc::new(Float),
            Arc::new(Accuracy),
            Arc::new(Uuid),
            Arc::new(IpAddress),
            Arc::new(IpNetwork),
            Arc::new(Fqdn),
            Arc::new(Url),
            Arc::new(Asn),
            Arc::new(DateTime),
            Arc::new(Base64),
            Arc::new(JsonDict),
            Arc::new(JsonList),
            Arc::new(ClassificationType),
            Arc::new(ClassificationTaxonomy),
        ];

        let mut registry = Self::new();
        for ty in builtins {
            registry.types.insert(ty.type_name().to_owned(), ty);
        }
        registry
    }

    /// Registers a type.
    ///
    /// Fails with [`HarmonizationError::DuplicateType`] if the name is taken.
    pub fn register(
        &mut self,
        ty: impl HarmonizationType + 'static,
    ) -> Result<(), HarmonizationError> {
        let name = ty.type_name().to_owned();
        if self.types.contains_key(&name) {
            return Err(HarmonizationError::DuplicateType(name));
        }
        self.types.insert(name, Arc::new(ty));
        Ok(())
    }

    /// Registers a type built from a validator and a sanitizer closure.
    ///
    /// The sanitizer returns the canonical value or a rejection reason.
    pub fn register_fn<V, S>(
        &mut self,
        type_name: impl Into<String>,
        validator: V,
        sanitizer: S,
    ) -> Result<(), HarmonizationError>
    where
        V: Fn(&Value) -> bool + Send + Sync + 'static,
        S: Fn(&Value) -> Result<Value, String> + Send + Sync + 'static,
    {
        self.register(FnType {
            name: type_name.into(),
            validator: Box::new(validator),
            sanitizer: Box::new(sanitizer),
        })
    }

    /// Looks up a type by name.
    pub fn get(&self, type_name: &str) -> Option<&dyn HarmonizationType> {
        self.types.get(type_name).map(|ty| ty.as_ref())
    }

    /// Returns whether a type with this name exists.
    pub fn contains(&self, type_name: &str) -> bool {
        self.types.contains_key(type_name)
    }

    /// Registered type names, sorted.
    pub fn type_names(&self) -> Vec<&str> {
        self.types.keys().map(String::as_str).collect()
    }

    /// Returns whether `value` already satisfies the named type.
    ///
    /// Unknown type names never validate.
    pub fn validate(&self, type_name: &str, value: &Value) -> bool {
        self.get(type_name).is_some_and(|ty| ty.is_valid(value))
    }

    /// Coerces `value` into the canonical form of the named type.
    pub fn sanitize(&self, type_name: &str, value: &Value) -> Result<Value, SanitizeError> {
        match self.get(type_name) {
            Some(ty) => ty.sanitize(value),
            None => Err(SanitizeError::new(
                type_name,
                value,
                HarmonizationError::UnknownType(type_name.to_owned()).to_string(),
            )),
        }
    }
}

impl fmt::Debug for TypeRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypeRegistry")
            .field("types", &self.type_names())
            .finish()
    }
}

/// Trims a JSON string value; `None` for every other JSON kind.
pub(crate) fn trimmed_str(value: &Value) -> Option<&str> {
    value.as_str().map(str::trim)
}
