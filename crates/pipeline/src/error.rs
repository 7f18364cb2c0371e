//! Queue, pipeline and bot runtime errors.
//!
//! [`QueueError`] is what a backend reports; [`PipelineError`] is what is
//! left after the pipeline's own retries; [`BotError`] is what a bot's
//! `process()` returns to the runtime. All convert into
//! [`IntelflowError`] so callers can propagate with `?`.

use intelflow_core::error::{ConfigError, IntelflowError, MessageError};

/// Queue backend error.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    /// The backend could not be reached or an operation on it failed.
    #[error("{backend} queue connection failed: {reason}")]
    Connection {
        /// Backend name (memory, file)
        backend: String,
        /// Failure reason
        reason: String,
    },

    /// Queue names must be non-empty `[0-9a-zA-Z_.-]` and not start with `.`.
    #[error("invalid queue name '{0}'")]
    InvalidName(String),

    /// `acknowledge` without a payload in flight.
    #[error("no message in flight on queue '{0}'")]
    NothingInFlight(String),

    /// Backend I/O error.
    #[error("queue io error: {0}")]
    Io(#[from] std::io::Error),
}

impl QueueError {
    /// Whether the operation may succeed when retried after a backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Connection { .. } | Self::Io(_))
    }
}

/// Pipeline error, surfaced after retries are exhausted or for misuse.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// The bot has no source queue but tried to receive.
    #[error("bot '{0}' has no source queue")]
    NoSource(String),

    /// `send` on a path with no destination queues.
    #[error("no destination queues bound to path '{0}'")]
    UnknownPath(String),

    /// `acknowledge` or `release_current` without a received message.
    #[error("no message is in flight")]
    NothingInFlight,

    /// A queue operation kept failing.
    #[error("{operation} failed after {attempts} attempts: {source}")]
    RetriesExhausted {
        /// Operation name (push, pop, acknowledge, ...)
        operation: &'static str,
        /// Attempts made
        attempts: u32,
        /// Last error
        #[source]
        source: QueueError,
    },

    /// A queue operation failed with a non-retryable error.
    #[error(transparent)]
    Queue(QueueError),

    /// A stop was requested while waiting to retry.
    #[error("stop requested during retry backoff")]
    Interrupted,

    /// The received payload is not a message, or the message could not be
    /// serialized.
    #[error(transparent)]
    Message(#[from] MessageError),
}

impl From<QueueError> for PipelineError {
    fn from(err: QueueError) -> Self {
        Self::Queue(err)
    }
}

impl From<PipelineError> for IntelflowError {
    fn from(err: PipelineError) -> Self {
        IntelflowError::Pipeline(err.to_string())
    }
}

/// Error returned by a bot's `process()` and by the runtime.
#[derive(Debug, thiserror::Error)]
pub enum BotError {
    /// Message mutation failed.
    #[error(transparent)]
    Message(#[from] MessageError),

    /// Pipeline failure. Always fatal to the runtime.
    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    /// Bot configuration or parameters are invalid.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// I/O failure inside the bot.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Any other processing failure.
    #[error("{0}")]
    Process(String),

    /// A stop was requested while waiting for a message.
    #[error("stop requested")]
    Stopped,

    /// The runtime gave up on a message under the `stop` error procedure.
    #[error("gave up after {retries} retries: {reason}")]
    GaveUp {
        /// Retries made on the message
        retries: u32,
        /// Last processing error
        reason: String,
    },
}

impl BotError {
    /// Shorthand for [`BotError::Process`].
    pub fn process(reason: impl Into<String>) -> Self {
        Self::Process(reason.into())
    }

    /// Whether the runtime must stop instead of applying the error procedure.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Pipeline(_) | Self::Config(_) | Self::GaveUp { .. })
    }

    /// Whether the error only reports a requested stop.
    pub fn is_stop_request(&self) -> bool {
        matches!(self, Self::Stopped | Self::Pipeline(PipelineError::Interrupted))
    }
}

impl From<BotError> for IntelflowError {
    fn from(err: BotError) -> Self {
        match err {
            BotError::Message(e) => IntelflowError::Message(e),
            BotError::Config(e) => IntelflowError::Config(e),
            BotError::Io(e) => IntelflowError::Io(e),
            other => IntelflowError::Pipeline(other.to_string()),
        }
    }
}

/// Renders an error and its sources, one per line.
pub fn error_chain(err: &dyn std::error::Error) -> String {
    let mut out = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        out.push_str("\ncaused by: ");
        out.push_str(&cause.to_string());
        source = cause.source();
    }
    out
}
