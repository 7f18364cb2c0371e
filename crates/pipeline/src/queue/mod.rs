//! Queue abstraction -- named FIFO queues with an in-flight slot.
//!
//! A pop moves the payload into the queue's in-flight slot in one step; it
//! stays there until [`Queue::acknowledge`]. While the slot is occupied by a
//! payload handed out in this session, further pops on that queue wait.
//! A payload left in the slot by an earlier session (crash, restart) or
//! re-armed with [`Queue::release`] is handed out again before anything
//! else, so delivery is at-least-once.
//!
//! Backends:
//! - [`MemoryBroker`]: shared in-process queues, fault injection for tests
//! - [`FileBroker`]: one directory per queue, survives process crashes

mod file;
mod memory;

use std::sync::LazyLock;
use std::time::Duration;

use bytes::Bytes;
use regex::Regex;

use crate::error::QueueError;

pub use file::FileBroker;
pub use memory::MemoryBroker;

static QUEUE_NAME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[0-9a-zA-Z_-][0-9a-zA-Z_.-]*$").expect("queue name pattern is valid")
});

/// A queue backend shared by the pipelines of one process.
pub trait Queue: Send + Sync {
    /// Backend name for logs and errors.
    fn backend(&self) -> &str;

    /// Appends a payload. Returns once the payload is stored.
    fn push(&self, queue: &str, payload: &[u8]) -> Result<(), QueueError>;

    /// Waits for the next payload and moves it in flight.
    fn pop_blocking(&self, queue: &str) -> Result<Bytes, QueueError>;

    /// Like [`pop_blocking`](Self::pop_blocking), giving up after `timeout`.
    fn pop_timeout(&self, queue: &str, timeout: Duration) -> Result<Option<Bytes>, QueueError>;

    /// Drops the in-flight payload.
    fn acknowledge(&self, queue: &str) -> Result<(), QueueError>;

    /// Marks the in-flight payload for redelivery on the next pop.
    fn release(&self, queue: &str) -> Result<(), QueueError>;

    /// The in-flight payload, if any.
    fn in_flight(&self, queue: &str) -> Result<Option<Bytes>, QueueError>;

    /// Number of pending payloads, not counting the in-flight one.
    fn length(&self, queue: &str) -> Result<usize, QueueError>;

    /// Removes all pending payloads and the in-flight one.
    fn clear(&self, queue: &str) -> Result<(), QueueError>;

    /// Drops and re-establishes the backend connection after a failure.
    fn reconnect(&self) -> Result<(), QueueError> {
        Ok(())
    }
}

/// Rejects queue names that are empty or could escape a backend's namespace.
pub fn validate_queue_name(queue: &str) -> Result<(), QueueError> {
    if QUEUE_NAME_RE.is_match(queue) {
        Ok(())
    } else {
        Err(QueueError::InvalidName(queue.to_owned()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_names() {
        assert!(validate_queue_name("file-output-queue").is_ok());
        assert!(validate_queue_name("parser_1.events").is_ok());
        assert!(validate_queue_name("").is_err());
        assert!(validate_queue_name(".inflight").is_err());
        assert!(validate_queue_name("../etc").is_err());
        assert!(validate_queue_name("a/b").is_err());
    }
}
