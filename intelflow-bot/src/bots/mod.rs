//! Built-in bots, selected by `[bots.<bot-id>] module`.

pub mod file_output;

use anyhow::Result;

use intelflow_core::config::BotConfig;
use intelflow_pipeline::Bot;

pub use file_output::{FileOutputBot, FileOutputParams};

/// Module names this binary can run.
pub const MODULES: &[&str] = &[file_output::MODULE];

/// The bot implementing `config.module`, with its parameters read.
///
/// # Errors
///
/// Returns an error naming the known modules if `module` is not one, or
/// the parameter error if `[parameters]` does not fit the module.
pub fn create(config: &BotConfig) -> Result<Box<dyn Bot>> {
    match config.module.as_str() {
        file_output::MODULE => {
            let bot = FileOutputBot::from_config(config).map_err(|e| {
                anyhow::anyhow!("invalid parameters for module '{}': {}", config.module, e)
            })?;
            Ok(Box::new(bot))
        }
        other => Err(anyhow::anyhow!(
            "unknown bot module '{}', expected one of: {}",
            other,
            MODULES.join(", ")
        )),
    }
}
