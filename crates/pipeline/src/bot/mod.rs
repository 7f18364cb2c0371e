//! Bot runtime -- the control loop shared by every bot.
//!
//! A bot implements [`Bot::process`], which handles one unit of work per
//! call through its [`BotContext`]: receive a message, change it, send the
//! results, acknowledge. [`BotRuntime`] drives the loop, applies the
//! configured rate limit and decides what happens when `process` fails.
//!
//! [`ParserRunner`] and [`CollectorRunner`] adapt the narrower
//! [`ParserBot`] and [`CollectorBot`] traits to [`Bot`].

mod collector;
mod parser;
mod runtime;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use intelflow_core::codec;
use intelflow_core::config::{BotConfig, DEFAULT_PATH};
use intelflow_core::message::Message;
use intelflow_core::schema::FieldSchema;

use crate::dump::{DumpEntry, DumpWriter};
use crate::error::{BotError, PipelineError, error_chain};
use crate::pipeline::Pipeline;
use crate::stop::StopHandle;

pub use collector::{CollectorBot, CollectorRunner};
pub use parser::{ParserBot, ParserRunner, RecordFormat, csv_fields, split_records};
pub use runtime::{BotRuntime, RuntimeState};

/// Longest `raw` value shown in receive logs.
const LOG_RAW_LIMIT: usize = 400;

/// A progress line is logged every this many sent messages.
const PROGRESS_EVERY: u64 = 500;

/// One bot implementation.
pub trait Bot: Send {
    /// Destination paths the bot sends on. The runtime refuses to start
    /// if one is not bound in `destination_queues`.
    fn required_paths(&self) -> Vec<String> {
        vec![DEFAULT_PATH.to_owned()]
    }

    /// Called once before the first `process`.
    fn init(&mut self, _ctx: &mut BotContext) -> Result<(), BotError> {
        Ok(())
    }

    /// Handles one unit of work.
    fn process(&mut self, ctx: &mut BotContext) -> Result<(), BotError>;

    /// Called once when the runtime stops.
    fn shutdown(&mut self, _ctx: &mut BotContext) -> Result<(), BotError> {
        Ok(())
    }
}

impl<B: Bot + ?Sized> Bot for Box<B> {
    fn required_paths(&self) -> Vec<String> {
        (**self).required_paths()
    }

    fn init(&mut self, ctx: &mut BotContext) -> Result<(), BotError> {
        (**self).init(ctx)
    }

    fn process(&mut self, ctx: &mut BotContext) -> Result<(), BotError> {
        (**self).process(ctx)
    }

    fn shutdown(&mut self, ctx: &mut BotContext) -> Result<(), BotError> {
        (**self).shutdown(ctx)
    }
}

/// What a bot sees of the runtime: its configuration and pipeline.
pub struct BotContext {
    bot_id: String,
    config: BotConfig,
    pipeline: Pipeline,
    dump: DumpWriter,
    stop: StopHandle,
    poll_interval: Duration,
    sent: u64,
    /// Last received message, until acknowledged.
    current: Option<Message>,
}

impl BotContext {
    /// Context of `bot_id`. The stop handle is the pipeline's.
    pub fn new(
        bot_id: impl Into<String>,
        config: BotConfig,
        pipeline: Pipeline,
        dump_dir: impl AsRef<Path>,
        poll_interval: Duration,
    ) -> Self {
        let bot_id = bot_id.into();
        Self {
            dump: DumpWriter::new(dump_dir, &bot_id),
            stop: pipeline.stop_handle().clone(),
            bot_id,
            config,
            pipeline,
            poll_interval: poll_interval.max(Duration::from_millis(1)),
            sent: 0,
            current: None,
        }
    }

    pub fn bot_id(&self) -> &str {
        &self.bot_id
    }

    pub fn config(&self) -> &BotConfig {
        &self.config
    }

    pub fn schema(&self) -> &Arc<FieldSchema> {
        self.pipeline.schema()
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    pub fn pipeline_mut(&mut self) -> &mut Pipeline {
        &mut self.pipeline
    }

    pub fn stop_handle(&self) -> &StopHandle {
        &self.stop
    }

    pub fn dump_writer(&self) -> &DumpWriter {
        &self.dump
    }

    /// Messages sent so far.
    pub fn sent(&self) -> u64 {
        self.sent
    }

    pub fn new_report(&self) -> Message {
        Message::new_report(Arc::clone(self.schema()))
    }

    pub fn new_event(&self) -> Message {
        Message::new_event(Arc::clone(self.schema()))
    }

    /// The message being processed.
    pub fn current_message(&self) -> Option<&Message> {
        self.current.as_ref()
    }

    /// Whether a received message is waiting for acknowledge.
    pub fn has_in_flight(&self) -> bool {
        self.pipeline.current_payload().is_some()
    }

    /// Waits for the next message, checking for stop requests between polls.
    ///
    /// A payload that is not a valid message is reported as
    /// [`BotError::Message`] and stays in flight, so the runtime's error
    /// procedure applies to it.
    pub fn receive_message(&mut self) -> Result<Message, BotError> {
        tracing::debug!(bot_id = %self.bot_id, "waiting for incoming message");
        loop {
            if self.stop.is_stopped() {
                return Err(BotError::Stopped);
            }
            match self.pipeline.receive_timeout(self.poll_interval) {
                Ok(Some(message)) => {
                    tracing::debug!(
                        bot_id = %self.bot_id,
                        message = %log_view(&message),
                        "received message"
                    );
                    self.current = Some(message.clone());
                    return Ok(message);
                }
                Ok(None) => continue,
                Err(PipelineError::Message(err)) => {
                    self.current = None;
                    return Err(BotError::Message(err));
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Sends on the default path.
    pub fn send_message(&mut self, message: &Message) -> Result<(), BotError> {
        self.send_to(message, DEFAULT_PATH)
    }

    /// Sends on `path`. Empty messages are skipped with a warning.
    pub fn send_to(&mut self, message: &Message, path: &str) -> Result<(), BotError> {
        if message.is_empty() {
            tracing::warn!(bot_id = %self.bot_id, "ignoring empty message at sending");
            return Ok(());
        }
        self.pipeline.send(message, path)?;
        self.sent += 1;
        if self.sent % PROGRESS_EVERY == 0 {
            tracing::info!(bot_id = %self.bot_id, sent = self.sent, "processed messages");
        }
        Ok(())
    }

    /// Acknowledges the message being processed.
    pub fn acknowledge_message(&mut self) -> Result<(), BotError> {
        self.pipeline.acknowledge()?;
        self.current = None;
        Ok(())
    }

    /// Writes `message` to the dump file with the error chain of `err`.
    pub fn dump_message(
        &self,
        err: &dyn std::error::Error,
        message: &Message,
    ) -> Result<String, BotError> {
        self.dump_text(error_chain(err), message.serialize()?)
    }

    /// Dumps what is in flight: the received message, or the raw payload
    /// when it could not be decoded. Does nothing if nothing is in flight.
    pub(crate) fn dump_in_flight(&self, err: &dyn std::error::Error) -> Result<(), BotError> {
        let text = match (&self.current, self.pipeline.current_payload()) {
            (Some(message), _) => message.serialize()?,
            (None, Some(payload)) => String::from_utf8_lossy(payload).into_owned(),
            (None, None) => return Ok(()),
        };
        self.dump_text(error_chain(err), text)?;
        Ok(())
    }

    fn dump_text(&self, traceback: String, message: String) -> Result<String, BotError> {
        self.dump.dump(&DumpEntry {
            bot_id: self.bot_id.clone(),
            source_queue: self.pipeline.source_queue().map(str::to_owned),
            traceback,
            message,
        })
    }

    /// Gives the in-flight message back for another attempt.
    pub(crate) fn release_in_flight(&mut self) -> Result<(), BotError> {
        if self.has_in_flight() {
            self.pipeline.release_current()?;
        }
        Ok(())
    }

    /// Acknowledges whatever is in flight, decoded or not.
    pub(crate) fn drop_in_flight(&mut self) -> Result<(), BotError> {
        if self.has_in_flight() {
            self.acknowledge_message()?;
        }
        Ok(())
    }
}

/// Canonical flat JSON of `message` with `raw` cut to a readable length.
pub(crate) fn log_view(message: &Message) -> String {
    let Ok(mut dict) = message.to_dict(false) else {
        return String::from("<unserializable message>");
    };
    if let Some(Value::String(raw)) = dict.get_mut("raw") {
        if raw.chars().count() > LOG_RAW_LIMIT {
            let cut: String = raw.chars().take(LOG_RAW_LIMIT - 3).collect();
            *raw = format!("{cut}...");
        }
    }
    codec::to_canonical_string(&Value::Object(dict), None)
        .unwrap_or_else(|_| String::from("<unserializable message>"))
}
