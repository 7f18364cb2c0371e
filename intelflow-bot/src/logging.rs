//! Logging initialization for intelflow-bot.
//!
//! Configures `tracing-subscriber` from the `[general]` section of
//! `IntelflowConfig`. Supports JSON structured logging and a
//! human-readable pretty format. `RUST_LOG` takes precedence over
//! `log_level`.

use anyhow::Result;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use intelflow_core::config::GeneralConfig;

/// Initialize the global tracing subscriber.
///
/// Must be called exactly once, before any tracing macros are used.
///
/// # Formats
///
/// * `"json"` - Machine-parseable JSON lines (default for production)
/// * `"pretty"` - Human-readable output (for development)
pub fn init_tracing(config: &GeneralConfig) -> Result<()> {
    let env_filter = build_filter(&config.log_level)?;

    match config.log_format.as_str() {
        "json" => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_current_span(true)
                        .with_span_list(false),
                )
                .try_init()
                .map_err(|e| {
                    anyhow::anyhow!("failed to initialize JSON tracing subscriber: {}", e)
                })?;
        }
        "pretty" => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().pretty())
                .try_init()
                .map_err(|e| {
                    anyhow::anyhow!("failed to initialize pretty tracing subscriber: {}", e)
                })?;
        }
        _ => {
            return Err(anyhow::anyhow!(
                "unknown log format '{}', expected 'json' or 'pretty'",
                config.log_format
            ));
        }
    }

    Ok(())
}

/// `RUST_LOG` if set and valid, otherwise `log_level`.
fn build_filter(log_level: &str) -> Result<EnvFilter> {
    match EnvFilter::try_from_default_env() {
        Ok(filter) => Ok(filter),
        Err(_) => EnvFilter::try_new(log_level)
            .map_err(|e| anyhow::anyhow!("invalid log level '{}': {}", log_level, e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn config_level_applies_without_rust_log() {
        // SAFETY: serialized with the other env-mutating tests
        unsafe { std::env::remove_var("RUST_LOG") };
        let filter = build_filter("debug").unwrap();
        assert_eq!(filter.to_string(), "debug");
    }

    #[test]
    #[serial]
    fn rust_log_takes_precedence() {
        // SAFETY: serialized with the other env-mutating tests
        unsafe { std::env::set_var("RUST_LOG", "warn") };
        let filter = build_filter("debug").unwrap();
        unsafe { std::env::remove_var("RUST_LOG") };
        assert_eq!(filter.to_string(), "warn");
    }
}
