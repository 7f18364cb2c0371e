//! intelflow core: harmonization types, field schema and the message model.
//!
//! Values entering a [`Message`] pass through the [`FieldSchema`], which
//! routes each field to a named type in the [`TypeRegistry`]. Messages are
//! exchanged between bots as canonical JSON ([`codec`]).

pub mod codec;
pub mod config;
pub mod error;
pub mod harmonization;
pub mod message;
pub mod metrics;
pub mod schema;

// --- re-exports ---

pub use error::{
    ConfigError, HarmonizationError, IntelflowError, MessageError, SanitizeError, SchemaError,
};

pub use config::{BotConfig, ErrorProcedure, IntelflowConfig};

pub use harmonization::{HarmonizationType, TypeRegistry};

pub use message::{AddOptions, JsonOptions, Message, MessageKind};

pub use schema::{FieldSchema, FieldSpec};
