//! intelflow pipeline: queues, at-least-once delivery and the bot runtime.
//!
//! # Modules
//!
//! - [`queue`]: queue backends with one unacknowledged payload per queue
//! - [`pipeline`]: a bot's view of its source and destination queues
//! - [`bot`]: the [`Bot`] trait, [`BotRuntime`] and parser/collector adapters
//! - [`dump`]: error dump files
//! - [`stop`]: stop requests from outside the bot thread
//! - [`error`]: domain error types
//!
//! # Architecture
//!
//! ```text
//! source queue --pop--> in flight --Pipeline::receive--> Bot::process
//!                          ^                                  |
//!                          |                        send to destination queues
//!                          +------- acknowledge <-------------+
//! ```

pub mod bot;
pub mod dump;
pub mod error;
pub mod pipeline;
pub mod queue;
pub mod stop;

// --- re-exports ---

pub use bot::{
    Bot, BotContext, BotRuntime, CollectorBot, CollectorRunner, ParserBot, ParserRunner,
    RecordFormat, RuntimeState,
};

pub use dump::{DumpEntry, DumpWriter};

pub use error::{BotError, PipelineError, QueueError};

pub use pipeline::{Pipeline, PipelineBuilder, RetryPolicy};

pub use queue::{FileBroker, MemoryBroker, Queue};

pub use stop::StopHandle;
