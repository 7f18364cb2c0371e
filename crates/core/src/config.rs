//! Configuration -- `intelflow.toml` parsing and runtime settings.
//!
//! [`IntelflowConfig`] holds the process-wide sections and one
//! [`BotConfig`] per bot id. A bot process reads `[general]`, `[broker]`
//! and its own `[bots.<id>]` table.
//!
//! # Loading order
//! 1. defaults (`Default` impls)
//! 2. config file
//! 3. environment (`INTELFLOW_{SECTION}_{FIELD}`, e.g. `INTELFLOW_BROKER_PATH`)
//! 4. CLI flags (applied by the binary)
//! 5. [`validate`](IntelflowConfig::validate)
//!
//! Unknown keys are rejected everywhere, including bot `parameters` once
//! the bot deserializes them into its own options struct.
//!
//! # Usage
//! ```no_run
//! # fn example() -> Result<(), intelflow_core::error::IntelflowError> {
//! use intelflow_core::config::IntelflowConfig;
//!
//! let config = IntelflowConfig::load("intelflow.toml")?;
//! let bot = config.bot("demo-parser")?;
//! # Ok(())
//! # }
//! ```

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{ConfigError, IntelflowError};

static BOT_ID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[0-9a-zA-Z-]+$").expect("bot id pattern is valid"));

/// Destination path used when a bot sends without naming one.
pub const DEFAULT_PATH: &str = "_default";

const LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];
const LOG_FORMATS: &[&str] = &["json", "pretty"];
const BROKER_BACKENDS: &[&str] = &["file", "memory"];

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IntelflowConfig {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub broker: BrokerConfig,
    /// Bot tables keyed by bot id.
    #[serde(default)]
    pub bots: BTreeMap<String, BotConfig>,
}

impl IntelflowConfig {
    /// Loads a file, applies environment overrides and validates.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, IntelflowError> {
        let mut config = Self::from_file(path)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Loads a file without environment overrides or validation.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, IntelflowError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                IntelflowError::Config(ConfigError::FileNotFound {
                    path: path.display().to_string(),
                })
            } else {
                IntelflowError::Io(e)
            }
        })?;
        Self::parse(&content)
    }

    /// Parses TOML text.
    pub fn parse(toml_str: &str) -> Result<Self, IntelflowError> {
        toml::from_str(toml_str).map_err(|e| {
            IntelflowError::Config(ConfigError::ParseFailed {
                reason: e.to_string(),
            })
        })
    }

    /// Applies `INTELFLOW_{SECTION}_{FIELD}` environment variables.
    ///
    /// Bot tables have no environment overrides.
    pub fn apply_env_overrides(&mut self) {
        override_string(&mut self.general.log_level, "INTELFLOW_GENERAL_LOG_LEVEL");
        override_string(&mut self.general.log_format, "INTELFLOW_GENERAL_LOG_FORMAT");
        override_string(&mut self.general.dump_dir, "INTELFLOW_GENERAL_DUMP_DIR");
        override_opt_string(
            &mut self.general.harmonization_path,
            "INTELFLOW_GENERAL_HARMONIZATION_PATH",
        );

        override_string(&mut self.broker.backend, "INTELFLOW_BROKER_BACKEND");
        override_string(&mut self.broker.path, "INTELFLOW_BROKER_PATH");
        override_u64(
            &mut self.broker.poll_interval_ms,
            "INTELFLOW_BROKER_POLL_INTERVAL_MS",
        );
        override_u32(&mut self.broker.max_retries, "INTELFLOW_BROKER_MAX_RETRIES");
        override_u64(
            &mut self.broker.retry_delay_secs,
            "INTELFLOW_BROKER_RETRY_DELAY_SECS",
        );
    }

    /// Checks value ranges and cross references.
    pub fn validate(&self) -> Result<(), IntelflowError> {
        one_of("general.log_level", &self.general.log_level, LOG_LEVELS)?;
        one_of("general.log_format", &self.general.log_format, LOG_FORMATS)?;
        one_of("broker.backend", &self.broker.backend, BROKER_BACKENDS)?;

        if self.broker.backend == "file" && self.broker.path.is_empty() {
            return Err(invalid("broker.path", "must not be empty for the file backend").into());
        }
        if self.broker.poll_interval_ms == 0 {
            return Err(invalid("broker.poll_interval_ms", "must be greater than 0").into());
        }

        for (id, bot) in &self.bots {
            bot.validate(id)?;
        }
        Ok(())
    }

    /// Configuration of one bot.
    pub fn bot(&self, bot_id: &str) -> Result<&BotConfig, ConfigError> {
        self.bots.get(bot_id).ok_or_else(|| ConfigError::InvalidValue {
            field: format!("bots.{bot_id}"),
            reason: "no such bot".to_owned(),
        })
    }
}

/// General settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GeneralConfig {
    /// trace, debug, info, warn, error
    pub log_level: String,
    /// json, pretty
    pub log_format: String,
    /// Directory for `<bot-id>.dump` error dumps.
    pub dump_dir: String,
    /// Harmonization schema file; the built-in schema when unset.
    pub harmonization_path: Option<String>,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_owned(),
            log_format: "json".to_owned(),
            dump_dir: "/var/lib/intelflow/dumps".to_owned(),
            harmonization_path: None,
        }
    }
}

/// Queue backend settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BrokerConfig {
    /// file, memory
    pub backend: String,
    /// Root directory of the file backend.
    pub path: String,
    /// Polling interval of blocking pops on the file backend.
    pub poll_interval_ms: u64,
    /// Retries of a failed queue operation before giving up; 0 retries forever.
    pub max_retries: u32,
    /// Backoff between retries after the first failure.
    pub retry_delay_secs: u64,
}

impl BrokerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_secs)
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            backend: "file".to_owned(),
            path: "/var/lib/intelflow/queues".to_owned(),
            poll_interval_ms: 100,
            max_retries: 0,
            retry_delay_secs: 5,
        }
    }
}

/// What the runtime does with a message whose processing keeps failing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorProcedure {
    /// Leave the message in flight and stop the bot.
    #[default]
    Stop,
    /// Dump (if enabled), acknowledge and continue with the next message.
    Pass,
}

/// Feed metadata a collector stamps on each report.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FeedConfig {
    pub name: Option<String>,
    pub code: Option<String>,
    pub provider: Option<String>,
    pub documentation: Option<String>,
    pub accuracy: Option<f64>,
}

/// Settings of one bot.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BotConfig {
    /// Implementation to run, e.g. `file-output`.
    pub module: String,
    pub description: String,
    pub enabled: bool,
    /// Source queue; collectors have none.
    pub source_queue: Option<String>,
    /// Destination queues keyed by path name.
    pub destination_queues: BTreeMap<String, Vec<String>>,
    /// Send each message to one destination queue of the path, round-robin,
    /// instead of all of them.
    pub load_balance: bool,
    /// Seconds to sleep between iterations.
    pub rate_limit: u64,
    pub error_procedure: ErrorProcedure,
    /// Retries of a failing message before `error_procedure` applies.
    pub error_max_retries: u32,
    /// Seconds to wait before retrying a failed message.
    pub error_retry_delay: u64,
    /// Include the failing message in the error log line.
    pub error_log_message: bool,
    /// Include the full error chain in the error log line.
    pub error_log_exception: bool,
    /// Write messages dropped by `pass` to the dump file.
    pub error_dump_message: bool,
    pub feed: FeedConfig,
    /// Bot specific options, see [`BotConfig::parameters`].
    pub parameters: toml::Table,
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            module: String::new(),
            description: String::new(),
            enabled: true,
            source_queue: None,
            destination_queues: BTreeMap::new(),
            load_balance: false,
            rate_limit: 0,
            error_procedure: ErrorProcedure::Stop,
            error_max_retries: 3,
            error_retry_delay: 15,
            error_log_message: true,
            error_log_exception: true,
            error_dump_message: true,
            feed: FeedConfig::default(),
            parameters: toml::Table::new(),
        }
    }
}

impl BotConfig {
    /// Deserializes `[bots.<id>.parameters]` into the bot's own options.
    ///
    /// Use `#[serde(deny_unknown_fields)]` on `T` to reject unknown options.
    pub fn parameters<T: DeserializeOwned>(&self) -> Result<T, ConfigError> {
        toml::Value::Table(self.parameters.clone())
            .try_into()
            .map_err(|e: toml::de::Error| ConfigError::InvalidValue {
                field: "parameters".to_owned(),
                reason: e.to_string(),
            })
    }

    pub fn rate_limit(&self) -> Duration {
        Duration::from_secs(self.rate_limit)
    }

    pub fn error_retry_delay(&self) -> Duration {
        Duration::from_secs(self.error_retry_delay)
    }

    /// Destination queues of `path`, if the path is bound.
    pub fn destinations(&self, path: &str) -> Option<&[String]> {
        self.destination_queues.get(path).map(Vec::as_slice)
    }

    fn validate(&self, bot_id: &str) -> Result<(), ConfigError> {
        if !BOT_ID_RE.is_match(bot_id) {
            return Err(invalid(
                &format!("bots.{bot_id}"),
                "bot id must match [0-9a-zA-Z-]+",
            ));
        }
        if self.module.trim().is_empty() {
            return Err(invalid(&format!("bots.{bot_id}.module"), "must not be empty"));
        }
        if let Some(queue) = &self.source_queue {
            if queue.trim().is_empty() {
                return Err(invalid(
                    &format!("bots.{bot_id}.source_queue"),
                    "must not be empty",
                ));
            }
        }
        for (path, queues) in &self.destination_queues {
            if path.is_empty() || queues.is_empty() || queues.iter().any(|q| q.trim().is_empty()) {
                return Err(invalid(
                    &format!("bots.{bot_id}.destination_queues.{path}"),
                    "path and queue names must not be empty",
                ));
            }
        }
        if let Some(accuracy) = self.feed.accuracy {
            if !(0.0..=100.0).contains(&accuracy) {
                return Err(invalid(
                    &format!("bots.{bot_id}.feed.accuracy"),
                    "must be within 0 and 100",
                ));
            }
        }
        Ok(())
    }
}

fn invalid(field: &str, reason: &str) -> ConfigError {
    ConfigError::InvalidValue {
        field: field.to_owned(),
        reason: reason.to_owned(),
    }
}

fn one_of(field: &str, value: &str, allowed: &[&str]) -> Result<(), ConfigError> {
    if allowed.contains(&value) {
        Ok(())
    } else {
        Err(invalid(field, &format!("must be one of: {}", allowed.join(", "))))
    }
}

// --- environment override helpers ---

fn override_string(target: &mut String, env_key: &str) {
    if let Ok(val) = std::env::var(env_key) {
        *target = val;
    }
}

fn override_opt_string(target: &mut Option<String>, env_key: &str) {
    if let Ok(val) = std::env::var(env_key) {
        *target = (!val.is_empty()).then_some(val);
    }
}

fn override_u32(target: &mut u32, env_key: &str) {
    if let Ok(val) = std::env::var(env_key) {
        match val.parse::<u32>() {
            Ok(parsed) => *target = parsed,
            Err(_) => warn!(
                env_key,
                value = val.as_str(),
                "failed to parse u32 from env var, ignoring"
            ),
        }
    }
}

fn override_u64(target: &mut u64, env_key: &str) {
    if let Ok(val) = std::env::var(env_key) {
        match val.parse::<u64>() {
            Ok(parsed) => *target = parsed,
            Err(_) => warn!(
                env_key,
                value = val.as_str(),
                "failed to parse u64 from env var, ignoring"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    const BOTS: &str = r#"
[bots.demo-parser]
module = "demo-parser"
source_queue = "demo-parser-queue"
error_procedure = "pass"

[bots.demo-parser.destination_queues]
_default = ["file-output-queue"]
invalid = ["invalid-queue", "archive-queue"]

[bots.demo-parser.parameters]
columns = ["source.ip", "time.source", "source.fqdn"]
"#;

    #[test]
    fn default_config_passes_validation() {
        let config = IntelflowConfig::default();
        assert_eq!(config.general.log_level, "info");
        assert_eq!(config.broker.backend, "file");
        assert_eq!(config.broker.max_retries, 0);
        config.validate().unwrap();
    }

    #[test]
    fn empty_toml_uses_defaults() {
        let config = IntelflowConfig::parse("").unwrap();
        assert_eq!(config.general.log_format, "json");
        assert!(config.bots.is_empty());
    }

    #[test]
    fn parses_bot_tables() {
        let config = IntelflowConfig::parse(BOTS).unwrap();
        config.validate().unwrap();
        let bot = config.bot("demo-parser").unwrap();
        assert_eq!(bot.source_queue.as_deref(), Some("demo-parser-queue"));
        assert_eq!(bot.error_procedure, ErrorProcedure::Pass);
        assert_eq!(bot.destinations("invalid").unwrap().len(), 2);
        assert!(bot.destinations("missing").is_none());
        assert!(bot.enabled);
        assert_eq!(bot.error_max_retries, 3);
        assert!(config.bot("nope").is_err());
    }

    #[derive(Debug, Deserialize)]
    #[serde(deny_unknown_fields)]
    struct DemoParameters {
        columns: Vec<String>,
        #[serde(default)]
        delimiter: Option<String>,
    }

    #[test]
    fn typed_parameters() {
        let config = IntelflowConfig::parse(BOTS).unwrap();
        let params: DemoParameters = config.bot("demo-parser").unwrap().parameters().unwrap();
        assert_eq!(params.columns.len(), 3);
        assert!(params.delimiter.is_none());
    }

    #[test]
    fn unknown_parameter_is_rejected() {
        let mut config = IntelflowConfig::parse(BOTS).unwrap();
        let bot = config.bots.get_mut("demo-parser").unwrap();
        bot.parameters
            .insert("colums".to_owned(), toml::Value::String("typo".to_owned()));
        let err = bot.parameters::<DemoParameters>().unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn unknown_option_is_a_parse_error() {
        let err = IntelflowConfig::parse("[bots.x]\nmodule = \"m\"\nspeed = 3\n").unwrap_err();
        assert!(matches!(err, IntelflowError::Config(ConfigError::ParseFailed { .. })));
        let err = IntelflowConfig::parse("[general]\nverbose = true\n").unwrap_err();
        assert!(matches!(err, IntelflowError::Config(ConfigError::ParseFailed { .. })));
    }

    #[test]
    fn validate_rejects_bad_values() {
        let mut config = IntelflowConfig::default();
        config.general.log_level = "verbose".to_owned();
        assert!(config.validate().unwrap_err().to_string().contains("log_level"));

        let mut config = IntelflowConfig::default();
        config.broker.backend = "redis".to_owned();
        assert!(config.validate().unwrap_err().to_string().contains("backend"));

        let mut config = IntelflowConfig::default();
        config.broker.path.clear();
        assert!(config.validate().unwrap_err().to_string().contains("broker.path"));
    }

    #[test]
    fn validate_rejects_bad_bot_ids_and_queues() {
        let config = IntelflowConfig::parse("[bots.\"bad id\"]\nmodule = \"m\"\n").unwrap();
        assert!(config.validate().unwrap_err().to_string().contains("bot id"));

        let config = IntelflowConfig::parse("[bots.ok]\nmodule = \"\"\n").unwrap();
        assert!(config.validate().unwrap_err().to_string().contains("module"));

        let config =
            IntelflowConfig::parse("[bots.ok]\nmodule = \"m\"\n[bots.ok.destination_queues]\n_default = []\n")
                .unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    #[serial]
    fn env_override_string() {
        let mut val = "original".to_owned();
        // SAFETY: serialized with every other test touching the environment
        unsafe { std::env::set_var("TEST_INTELFLOW_STR", "overridden") };
        override_string(&mut val, "TEST_INTELFLOW_STR");
        assert_eq!(val, "overridden");
        unsafe { std::env::remove_var("TEST_INTELFLOW_STR") };
    }

    #[test]
    #[serial]
    fn env_override_invalid_number_keeps_original() {
        let mut val = 7_u64;
        // SAFETY: serialized with every other test touching the environment
        unsafe { std::env::set_var("TEST_INTELFLOW_U64_BAD", "seven") };
        override_u64(&mut val, "TEST_INTELFLOW_U64_BAD");
        assert_eq!(val, 7);
        unsafe { std::env::remove_var("TEST_INTELFLOW_U64_BAD") };
    }

    #[test]
    #[serial]
    fn env_override_optional_string() {
        let mut val = None;
        // SAFETY: serialized with every other test touching the environment
        unsafe { std::env::set_var("TEST_INTELFLOW_OPT", "/etc/h.toml") };
        override_opt_string(&mut val, "TEST_INTELFLOW_OPT");
        assert_eq!(val.as_deref(), Some("/etc/h.toml"));
        unsafe { std::env::set_var("TEST_INTELFLOW_OPT", "") };
        override_opt_string(&mut val, "TEST_INTELFLOW_OPT");
        assert_eq!(val, None);
        unsafe { std::env::remove_var("TEST_INTELFLOW_OPT") };
    }

    #[test]
    fn config_serialize_roundtrip() {
        let config = IntelflowConfig::parse(BOTS).unwrap();
        let toml_str = toml::to_string_pretty(&config).unwrap();
        let parsed = IntelflowConfig::parse(&toml_str).unwrap();
        assert_eq!(
            parsed.bot("demo-parser").unwrap().destination_queues,
            config.bot("demo-parser").unwrap().destination_queues
        );
    }

    #[test]
    fn from_file_not_found() {
        let err = IntelflowConfig::from_file("/nonexistent/path/intelflow.toml").unwrap_err();
        assert!(matches!(
            err,
            IntelflowError::Config(ConfigError::FileNotFound { .. })
        ));
    }
}
