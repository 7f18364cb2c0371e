//! Error dumps -- messages a bot gave up on, kept for operator inspection.
//!
//! One file per bot, `<dump_dir>/<bot-id>.dump`, holding a JSON object keyed
//! by UTC timestamp:
//!
//! ```text
//! {
//!     "2016-11-12T15:02:00.123456+00:00": {
//!         "bot_id": "demo-parser",
//!         "message": "{\"__type\": \"Report\", ...}",
//!         "source_queue": "demo-parser-queue",
//!         "traceback": "unknown field 'source.foo'"
//!     }
//! }
//! ```
//!
//! The file is rewritten through a temp file and a rename, so a crash never
//! leaves a truncated dump behind.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use intelflow_core::codec;

use crate::error::BotError;

/// One dumped message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DumpEntry {
    pub bot_id: String,
    pub source_queue: Option<String>,
    /// Error chain of the failure.
    pub traceback: String,
    /// Serialized message, or the raw payload if it was not a message.
    pub message: String,
}

/// Appends entries to a bot's dump file.
#[derive(Debug, Clone)]
pub struct DumpWriter {
    path: PathBuf,
}

impl DumpWriter {
    /// Writer for `<dump_dir>/<bot_id>.dump`.
    pub fn new(dump_dir: impl AsRef<Path>, bot_id: &str) -> Self {
        Self {
            path: dump_dir.as_ref().join(format!("{bot_id}.dump")),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Adds `entry` under the current time and returns the key used.
    pub fn dump(&self, entry: &DumpEntry) -> Result<String, BotError> {
        let mut entries = self.load_object()?;

        let now = Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false);
        let mut key = now.clone();
        let mut n = 1;
        while entries.contains_key(&key) {
            key = format!("{now}-{n}");
            n += 1;
        }
        let value = serde_json::to_value(entry)
            .map_err(|e| BotError::process(format!("failed to encode dump entry: {e}")))?;
        entries.insert(key.clone(), value);

        self.write_object(entries)?;
        metrics::counter!(intelflow_core::metrics::MESSAGES_DUMPED_TOTAL).increment(1);
        tracing::warn!(bot_id = %entry.bot_id, dump = %self.path.display(), "message dumped");
        Ok(key)
    }

    /// Entries of the dump file, sorted by key. Missing file means none.
    pub fn read(&self) -> Result<Vec<(String, DumpEntry)>, BotError> {
        let mut out = Vec::new();
        for (key, value) in self.load_object()? {
            let entry = serde_json::from_value(value)
                .map_err(|e| BotError::process(format!("invalid dump entry '{key}': {e}")))?;
            out.push((key, entry));
        }
        out.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(out)
    }

    fn load_object(&self) -> Result<Map<String, Value>, BotError> {
        let text = match fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Map::new()),
            Err(err) => return Err(err.into()),
        };
        match serde_json::from_str::<Value>(&text) {
            Ok(Value::Object(map)) => Ok(map),
            _ => {
                // keep the unreadable file next to the new one
                let backup = self.path.with_extension("dump.corrupt");
                fs::rename(&self.path, &backup)?;
                tracing::error!(
                    dump = %self.path.display(),
                    backup = %backup.display(),
                    "dump file is not a JSON object, moved aside"
                );
                Ok(Map::new())
            }
        }
    }

    fn write_object(&self, entries: Map<String, Value>) -> Result<(), BotError> {
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir)?;
        }
        let text = codec::to_canonical_string(&Value::Object(entries), Some(4))
            .map_err(|e| BotError::process(format!("failed to encode dump file: {e}")))?;
        let tmp = self.path.with_extension("dump.tmp");
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(text.as_bytes())?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}
