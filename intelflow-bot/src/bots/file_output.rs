//! `file-output`: appends each received event to a file, one JSON document
//! per line.
//!
//! ```toml
//! [bots.file-output]
//! module = "file-output"
//! source_queue = "file-output-queue"
//!
//! [bots.file-output.parameters]
//! path = "/var/lib/intelflow/events.jsonl"
//! hierarchical = false
//! ```

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::PathBuf;

use serde::Deserialize;

use intelflow_core::config::BotConfig;
use intelflow_core::error::ConfigError;
use intelflow_core::message::JsonOptions;
use intelflow_pipeline::{Bot, BotContext, BotError};

pub const MODULE: &str = "file-output";

/// `[bots.<id>.parameters]` of the file output.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileOutputParams {
    /// Output file, created with its parent directories.
    pub path: PathBuf,
    /// Nest dotted keys (`{"source": {"ip": ...}}`) instead of flat keys.
    #[serde(default)]
    pub hierarchical: bool,
}

pub struct FileOutputBot {
    params: FileOutputParams,
    writer: Option<BufWriter<File>>,
}

impl FileOutputBot {
    pub fn new(params: FileOutputParams) -> Self {
        Self {
            params,
            writer: None,
        }
    }

    /// Reads `[parameters]`; unknown or missing options are an error.
    pub fn from_config(config: &BotConfig) -> Result<Self, ConfigError> {
        Ok(Self::new(config.parameters()?))
    }

    fn json_options(&self) -> JsonOptions {
        if self.params.hierarchical {
            JsonOptions::hierarchical()
        } else {
            JsonOptions::flat()
        }
    }
}

impl Bot for FileOutputBot {
    fn required_paths(&self) -> Vec<String> {
        Vec::new()
    }

    fn init(&mut self, ctx: &mut BotContext) -> Result<(), BotError> {
        let params = &self.params;
        if let Some(dir) = params.path.parent() {
            if !dir.as_os_str().is_empty() {
                fs::create_dir_all(dir)?;
            }
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&params.path)?;
        tracing::info!(
            bot_id = %ctx.bot_id(),
            path = %params.path.display(),
            hierarchical = params.hierarchical,
            "output file opened"
        );
        self.writer = Some(BufWriter::new(file));
        Ok(())
    }

    fn process(&mut self, ctx: &mut BotContext) -> Result<(), BotError> {
        let event = ctx.receive_message()?;
        let line = event.to_json(&self.json_options())?;

        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| BotError::process("output file is not open"))?;
        writer.write_all(line.as_bytes())?;
        writer.write_all(b"\n")?;
        writer.flush()?;

        ctx.acknowledge_message()
    }

    fn shutdown(&mut self, _ctx: &mut BotContext) -> Result<(), BotError> {
        if let Some(writer) = self.writer.as_mut() {
            writer.flush()?;
        }
        Ok(())
    }
}
