//! Pipeline -- one bot's view of its source and destination queues.
//!
//! [`Pipeline`] turns queue payloads into [`Message`]s and back and hides
//! backend failures: a retryable [`QueueError`] makes the pipeline
//! reconnect, wait and run the whole operation again. A re-run pop is safe
//! because the in-flight payload is redelivered; a re-run push may
//! duplicate a message, which downstream bots tolerate.
//!
//! ```text
//! source queue --pop--> in flight --receive()--> bot --send(path)--> destination queues
//!                          ^                        |
//!                          +----acknowledge()-------+
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use metrics::counter;

use intelflow_core::config::{BotConfig, BrokerConfig, DEFAULT_PATH};
use intelflow_core::message::Message;
use intelflow_core::metrics as names;
use intelflow_core::schema::FieldSchema;

use crate::error::{PipelineError, QueueError};
use crate::queue::{Queue, validate_queue_name};
use crate::stop::StopHandle;

/// Retry behaviour for failed queue operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries before giving up; 0 retries forever.
    pub max_retries: u32,
    /// Wait before every retry but the first.
    pub retry_delay: Duration,
}

impl RetryPolicy {
    pub fn from_broker(broker: &BrokerConfig) -> Self {
        Self {
            max_retries: broker.max_retries,
            retry_delay: broker.retry_delay(),
        }
    }

    /// Wait before retry number `failures` (1-based): none for the first,
    /// `retry_delay` afterwards.
    pub fn backoff(&self, failures: u32) -> Duration {
        if failures <= 1 {
            Duration::ZERO
        } else {
            self.retry_delay
        }
    }

    fn gives_up(&self, failures: u32) -> bool {
        self.max_retries > 0 && failures > self.max_retries
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_broker(&BrokerConfig::default())
    }
}

/// Source and destination queues of one bot.
pub struct Pipeline {
    bot_id: String,
    queue: Arc<dyn Queue>,
    schema: Arc<FieldSchema>,
    source: Option<String>,
    destinations: BTreeMap<String, Vec<String>>,
    load_balance: bool,
    balance_cursor: BTreeMap<String, usize>,
    retry: RetryPolicy,
    stop: StopHandle,
    /// Payload received and not yet acknowledged or released.
    current: Option<Bytes>,
}

impl Pipeline {
    /// Builder for a pipeline of `bot_id`.
    pub fn builder(bot_id: impl Into<String>) -> PipelineBuilder {
        PipelineBuilder::new(bot_id)
    }

    /// Pipeline wired from a bot's configuration.
    ///
    /// `required_paths` are the destination paths the bot sends on; each
    /// must be bound in `destination_queues`.
    pub fn from_config(
        bot_id: &str,
        bot: &BotConfig,
        broker: &BrokerConfig,
        queue: Arc<dyn Queue>,
        schema: Arc<FieldSchema>,
        required_paths: &[&str],
    ) -> Result<Self, PipelineError> {
        PipelineBuilder::new(bot_id)
            .queue(queue)
            .schema(schema)
            .source(bot.source_queue.clone())
            .destinations(bot.destination_queues.clone())
            .load_balance(bot.load_balance)
            .retry(RetryPolicy::from_broker(broker))
            .require_paths(required_paths)
            .build()
    }

    pub fn bot_id(&self) -> &str {
        &self.bot_id
    }

    pub fn source_queue(&self) -> Option<&str> {
        self.source.as_deref()
    }

    /// Bound destination paths, sorted.
    pub fn destination_paths(&self) -> impl Iterator<Item = &str> {
        self.destinations.keys().map(String::as_str)
    }

    pub fn schema(&self) -> &Arc<FieldSchema> {
        &self.schema
    }

    pub fn stop_handle(&self) -> &StopHandle {
        &self.stop
    }

    /// Raw payload of the message currently in flight.
    pub fn current_payload(&self) -> Option<&Bytes> {
        self.current.as_ref()
    }

    /// Waits for the next message of the source queue.
    ///
    /// While a received message is unacknowledged this blocks; a payload
    /// left in flight by an earlier run is returned first. If the payload is
    /// not a valid message the error is returned and the payload stays in
    /// flight ([`current_payload`](Self::current_payload)).
    pub fn receive(&mut self) -> Result<Message, PipelineError> {
        let source = self.source_name()?;
        let payload = self.with_retry("pop", |queue| queue.pop_blocking(&source))?;
        self.accept(&source, payload)
    }

    /// [`receive`](Self::receive) giving up after `timeout`.
    pub fn receive_timeout(&mut self, timeout: Duration) -> Result<Option<Message>, PipelineError> {
        let source = self.source_name()?;
        match self.with_retry("pop", |queue| queue.pop_timeout(&source, timeout))? {
            Some(payload) => self.accept(&source, payload).map(Some),
            None => Ok(None),
        }
    }

    /// Serializes `message` and pushes it to the queues bound to `path`.
    ///
    /// With load balancing one queue of the path is chosen round-robin,
    /// otherwise every queue of the path gets a copy.
    pub fn send(&mut self, message: &Message, path: &str) -> Result<(), PipelineError> {
        let queues = self
            .destinations
            .get(path)
            .ok_or_else(|| PipelineError::UnknownPath(path.to_owned()))?;
        let targets: Vec<String> = if self.load_balance {
            let cursor = self.balance_cursor.entry(path.to_owned()).or_default();
            let target = queues[*cursor % queues.len()].clone();
            *cursor = (*cursor + 1) % queues.len();
            vec![target]
        } else {
            queues.clone()
        };

        let payload = message.serialize()?;
        for target in &targets {
            self.with_retry("push", |queue| queue.push(target, payload.as_bytes()))?;
            tracing::trace!(bot_id = %self.bot_id, queue = %target, path, "message sent");
        }
        counter!(names::MESSAGES_SENT_TOTAL, names::LABEL_PATH => path.to_owned()).increment(1);
        Ok(())
    }

    /// [`send`](Self::send) on the default path.
    pub fn send_default(&mut self, message: &Message) -> Result<(), PipelineError> {
        self.send(message, DEFAULT_PATH)
    }

    /// Drops the in-flight message from the source queue.
    pub fn acknowledge(&mut self) -> Result<(), PipelineError> {
        let source = self.source_name()?;
        if self.current.is_none() {
            return Err(PipelineError::NothingInFlight);
        }
        self.with_retry("acknowledge", |queue| queue.acknowledge(&source))?;
        self.current = None;
        counter!(names::MESSAGES_ACKNOWLEDGED_TOTAL, names::LABEL_QUEUE => source).increment(1);
        Ok(())
    }

    /// Gives the in-flight message back; the next receive returns it again.
    pub fn release_current(&mut self) -> Result<(), PipelineError> {
        let source = self.source_name()?;
        if self.current.is_none() {
            return Err(PipelineError::NothingInFlight);
        }
        self.with_retry("release", |queue| queue.release(&source))?;
        self.current = None;
        Ok(())
    }

    /// Pending message counts of `queues`.
    pub fn count_queued_messages<S: AsRef<str>>(
        &self,
        queues: &[S],
    ) -> Result<BTreeMap<String, usize>, PipelineError> {
        let mut counts = BTreeMap::new();
        for name in queues {
            let name = name.as_ref();
            let length = self.with_retry("length", |queue| queue.length(name))?;
            counts.insert(name.to_owned(), length);
        }
        Ok(counts)
    }

    fn source_name(&self) -> Result<String, PipelineError> {
        self.source
            .clone()
            .ok_or_else(|| PipelineError::NoSource(self.bot_id.clone()))
    }

    fn accept(&mut self, source: &str, payload: Bytes) -> Result<Message, PipelineError> {
        self.current = Some(payload.clone());
        counter!(names::MESSAGES_RECEIVED_TOTAL, names::LABEL_QUEUE => source.to_owned())
            .increment(1);
        Ok(Message::unserialize_bytes(&payload, Arc::clone(&self.schema))?)
    }

    fn with_retry<T>(
        &self,
        operation: &'static str,
        mut op: impl FnMut(&dyn Queue) -> Result<T, QueueError>,
    ) -> Result<T, PipelineError> {
        let mut failures = 0_u32;
        loop {
            let err = match op(self.queue.as_ref()) {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retryable() => err,
                Err(err) => return Err(PipelineError::Queue(err)),
            };

            failures += 1;
            if self.retry.gives_up(failures) {
                tracing::error!(
                    bot_id = %self.bot_id,
                    operation,
                    retries = failures - 1,
                    error = %err,
                    "queue operation failed, giving up"
                );
                return Err(PipelineError::RetriesExhausted {
                    operation,
                    attempts: failures,
                    source: err,
                });
            }

            let delay = self.retry.backoff(failures);
            tracing::warn!(
                bot_id = %self.bot_id,
                backend = self.queue.backend(),
                operation,
                retries = failures,
                delay_secs = delay.as_secs_f64(),
                error = %err,
                "queue operation failed, reconnecting"
            );
            counter!(names::PIPELINE_RETRIES_TOTAL, names::LABEL_OPERATION => operation)
                .increment(1);
            if let Err(reconnect_err) = self.queue.reconnect() {
                tracing::warn!(bot_id = %self.bot_id, error = %reconnect_err, "reconnect failed");
            }
            if self.stop.sleep(delay) {
                return Err(PipelineError::Interrupted);
            }
        }
    }
}

/// Builder for [`Pipeline`].
///
/// ```ignore
/// let pipeline = Pipeline::builder("demo-parser")
///     .queue(broker)
///     .schema(schema)
///     .source(Some("demo-parser-queue".to_owned()))
///     .destination("_default", ["file-output-queue"])
///     .build()?;
/// ```
pub struct PipelineBuilder {
    bot_id: String,
    queue: Option<Arc<dyn Queue>>,
    schema: Option<Arc<FieldSchema>>,
    source: Option<String>,
    destinations: BTreeMap<String, Vec<String>>,
    load_balance: bool,
    retry: RetryPolicy,
    stop: StopHandle,
    required_paths: Vec<String>,
}

impl PipelineBuilder {
    pub fn new(bot_id: impl Into<String>) -> Self {
        Self {
            bot_id: bot_id.into(),
            queue: None,
            schema: None,
            source: None,
            destinations: BTreeMap::new(),
            load_balance: false,
            retry: RetryPolicy::default(),
            stop: StopHandle::new(),
            required_paths: Vec::new(),
        }
    }

    pub fn queue(mut self, queue: Arc<dyn Queue>) -> Self {
        self.queue = Some(queue);
        self
    }

    /// Schema used to decode received messages. Defaults to the built-in one.
    pub fn schema(mut self, schema: Arc<FieldSchema>) -> Self {
        self.schema = Some(schema);
        self
    }

    pub fn source(mut self, source: Option<String>) -> Self {
        self.source = source;
        self
    }

    pub fn destinations(mut self, destinations: BTreeMap<String, Vec<String>>) -> Self {
        self.destinations = destinations;
        self
    }

    /// Binds `queues` to `path`.
    pub fn destination<I, S>(mut self, path: &str, queues: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.destinations
            .insert(path.to_owned(), queues.into_iter().map(Into::into).collect());
        self
    }

    pub fn load_balance(mut self, load_balance: bool) -> Self {
        self.load_balance = load_balance;
        self
    }

    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Stop handle interrupting retry backoffs.
    pub fn stop_handle(mut self, stop: StopHandle) -> Self {
        self.stop = stop;
        self
    }

    /// Paths that must be bound when the pipeline is built.
    pub fn require_paths<S: AsRef<str>>(mut self, paths: &[S]) -> Self {
        self.required_paths
            .extend(paths.iter().map(|p| p.as_ref().to_owned()));
        self
    }

    /// Validates queue names and required paths.
    pub fn build(self) -> Result<Pipeline, PipelineError> {
        let queue = self.queue.ok_or_else(|| {
            PipelineError::Queue(QueueError::Connection {
                backend: "none".to_owned(),
                reason: "no queue backend configured".to_owned(),
            })
        })?;
        let schema = match self.schema {
            Some(schema) => schema,
            None => Arc::new(FieldSchema::builtin().map_err(|e| {
                PipelineError::Message(intelflow_core::error::MessageError::from(e))
            })?),
        };

        if let Some(source) = &self.source {
            validate_queue_name(source)?;
        }
        for (path, queues) in &self.destinations {
            if queues.is_empty() {
                return Err(PipelineError::UnknownPath(path.clone()));
            }
            for name in queues {
                validate_queue_name(name)?;
            }
        }
        for path in &self.required_paths {
            if !self.destinations.contains_key(path) {
                return Err(PipelineError::UnknownPath(path.clone()));
            }
        }

        tracing::info!(
            bot_id = %self.bot_id,
            backend = queue.backend(),
            source = self.source.as_deref().unwrap_or("-"),
            destinations = ?self.destinations,
            "pipeline ready"
        );

        Ok(Pipeline {
            bot_id: self.bot_id,
            queue,
            schema,
            source: self.source,
            destinations: self.destinations,
            load_balance: self.load_balance,
            balance_cursor: BTreeMap::new(),
            retry: self.retry,
            stop: self.stop,
            current: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::MemoryBroker;
    use intelflow_core::message::MessageKind;

    fn schema() -> Arc<FieldSchema> {
        Arc::new(FieldSchema::builtin().unwrap())
    }

    fn event(schema: &Arc<FieldSchema>, ip: &str) -> Message {
        let mut event = Message::new_event(Arc::clone(schema));
        event.add("source.ip", ip).unwrap();
        event
    }

    fn pipeline(broker: &Arc<MemoryBroker>, retry: RetryPolicy) -> Pipeline {
        Pipeline::builder("test-bot")
            .queue(Arc::clone(broker) as Arc<dyn Queue>)
            .schema(schema())
            .source(Some("in".to_owned()))
            .destination(DEFAULT_PATH, ["out"])
            .retry(retry)
            .build()
            .unwrap()
    }

    fn fast_retry(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            retry_delay: Duration::from_millis(1),
        }
    }

    #[test]
    fn backoff_starts_at_zero() {
        let policy = RetryPolicy {
            max_retries: 0,
            retry_delay: Duration::from_secs(5),
        };
        assert_eq!(policy.backoff(1), Duration::ZERO);
        assert_eq!(policy.backoff(2), Duration::from_secs(5));
        assert!(!policy.gives_up(1_000));
    }

    #[test]
    fn send_receive_acknowledge() {
        let broker = Arc::new(MemoryBroker::new());
        let mut pipeline = pipeline(&broker, fast_retry(0));
        let schema = Arc::clone(pipeline.schema());

        broker
            .push("in", event(&schema, "10.0.0.1").serialize().unwrap().as_bytes())
            .unwrap();
        let received = pipeline.receive().unwrap();
        assert_eq!(received.kind(), MessageKind::Event);
        assert!(pipeline.current_payload().is_some());

        pipeline.send_default(&received).unwrap();
        pipeline.acknowledge().unwrap();
        assert!(pipeline.current_payload().is_none());
        assert_eq!(broker.length("out").unwrap(), 1);
        assert_eq!(broker.in_flight("in").unwrap(), None);
    }

    #[test]
    fn unbound_path_is_rejected() {
        let broker = Arc::new(MemoryBroker::new());
        let mut pipeline = pipeline(&broker, fast_retry(0));
        let message = event(pipeline.schema(), "10.0.0.1");
        assert!(matches!(
            pipeline.send(&message, "alerts").unwrap_err(),
            PipelineError::UnknownPath(_)
        ));
    }

    #[test]
    fn required_paths_are_checked_at_build() {
        let err = Pipeline::builder("b")
            .queue(Arc::new(MemoryBroker::new()))
            .destination(DEFAULT_PATH, ["out"])
            .require_paths(&["_default", "alerts"])
            .build()
            .err()
            .unwrap();
        assert!(matches!(err, PipelineError::UnknownPath(ref p) if p == "alerts"));
    }

    #[test]
    fn transient_failures_are_retried() {
        let broker = Arc::new(MemoryBroker::new());
        let mut pipeline = pipeline(&broker, fast_retry(5));
        let message = event(pipeline.schema(), "10.0.0.1");

        broker.fail_next(3);
        pipeline.send_default(&message).unwrap();
        assert_eq!(broker.length("out").unwrap(), 1);
        assert_eq!(broker.reconnects(), 3);
    }

    #[test]
    fn retries_are_bounded() {
        let broker = Arc::new(MemoryBroker::new());
        let mut pipeline = pipeline(&broker, fast_retry(2));
        let message = event(pipeline.schema(), "10.0.0.1");

        broker.fail_next(10);
        let err = pipeline.send_default(&message).unwrap_err();
        assert!(matches!(
            err,
            PipelineError::RetriesExhausted { operation: "push", attempts: 3, .. }
        ));
    }

    #[test]
    fn load_balance_round_robins() {
        let broker = Arc::new(MemoryBroker::new());
        let mut pipeline = Pipeline::builder("b")
            .queue(Arc::clone(&broker) as Arc<dyn Queue>)
            .destination(DEFAULT_PATH, ["a", "b"])
            .load_balance(true)
            .build()
            .unwrap();
        let message = event(pipeline.schema(), "10.0.0.1");
        for _ in 0..3 {
            pipeline.send_default(&message).unwrap();
        }
        assert_eq!(broker.length("a").unwrap(), 2);
        assert_eq!(broker.length("b").unwrap(), 1);
    }

    #[test]
    fn fan_out_copies_to_every_queue() {
        let broker = Arc::new(MemoryBroker::new());
        let mut pipeline = Pipeline::builder("b")
            .queue(Arc::clone(&broker) as Arc<dyn Queue>)
            .destination(DEFAULT_PATH, ["a", "b"])
            .build()
            .unwrap();
        let message = event(pipeline.schema(), "10.0.0.1");
        pipeline.send_default(&message).unwrap();
        assert_eq!(broker.length("a").unwrap(), 1);
        assert_eq!(broker.length("b").unwrap(), 1);
    }

    #[test]
    fn malformed_payload_stays_in_flight() {
        let broker = Arc::new(MemoryBroker::new());
        let mut pipeline = pipeline(&broker, fast_retry(0));
        broker.push("in", b"not json").unwrap();

        let err = pipeline.receive().unwrap_err();
        assert!(matches!(err, PipelineError::Message(_)));
        assert_eq!(pipeline.current_payload(), Some(&Bytes::from_static(b"not json")));
        pipeline.acknowledge().unwrap();
    }

    #[test]
    fn release_current_redelivers() {
        let broker = Arc::new(MemoryBroker::new());
        let mut pipeline = pipeline(&broker, fast_retry(0));
        let schema = Arc::clone(pipeline.schema());
        broker
            .push("in", event(&schema, "10.0.0.1").serialize().unwrap().as_bytes())
            .unwrap();

        let first = pipeline.receive().unwrap();
        pipeline.release_current().unwrap();
        let again = pipeline.receive_timeout(Duration::from_millis(50)).unwrap();
        assert_eq!(again, Some(first));
    }

    #[test]
    fn acknowledge_without_receive_fails() {
        let broker = Arc::new(MemoryBroker::new());
        let mut pipeline = pipeline(&broker, fast_retry(0));
        assert!(matches!(
            pipeline.acknowledge().unwrap_err(),
            PipelineError::NothingInFlight
        ));
    }

    #[test]
    fn collectors_cannot_receive() {
        let mut pipeline = Pipeline::builder("collector")
            .queue(Arc::new(MemoryBroker::new()))
            .destination(DEFAULT_PATH, ["out"])
            .build()
            .unwrap();
        assert!(matches!(pipeline.receive().unwrap_err(), PipelineError::NoSource(_)));
    }

    #[test]
    fn counts_queued_messages() {
        let broker = Arc::new(MemoryBroker::new());
        let pipeline = pipeline(&broker, fast_retry(0));
        broker.push("in", b"{}").unwrap();
        broker.push("in", b"{}").unwrap();
        let counts = pipeline.count_queued_messages(&["in", "out"]).unwrap();
        assert_eq!(counts["in"], 2);
        assert_eq!(counts["out"], 0);
    }
}
