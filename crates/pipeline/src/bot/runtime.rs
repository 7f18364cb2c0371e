//! The bot control loop.
//!
//! ```text
//! Init --> Running <--> RateLimited
//!             |
//!             v
//!         Stopping --> Stopped
//! ```
//!
//! Failure handling for one `process()` call:
//! - stop request: leave the loop, message stays in flight
//! - pipeline or config error: fatal, leave the loop with the error
//! - any other error: give the message back and retry after
//!   `error_retry_delay`, up to `error_max_retries` times; then apply
//!   `error_procedure` (`pass` dumps and acknowledges, `stop` leaves the
//!   message in flight and stops)

use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use metrics::{counter, histogram};

use intelflow_core::config::{ErrorProcedure, IntelflowConfig};
use intelflow_core::metrics as names;
use intelflow_core::schema::FieldSchema;

use super::{Bot, BotContext, log_view};
use crate::error::{BotError, error_chain};
use crate::pipeline::{Pipeline, RetryPolicy};
use crate::queue::Queue;
use crate::stop::StopHandle;

/// Runtime state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeState {
    /// Configured, not started.
    Init,
    /// Calling `process()`.
    Running,
    /// Sleeping between iterations.
    RateLimited,
    /// Shutting the bot down.
    Stopping,
    /// Done.
    Stopped,
}

impl RuntimeState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::Running => "running",
            Self::RateLimited => "rate_limited",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
        }
    }
}

impl std::fmt::Display for RuntimeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Drives one bot.
pub struct BotRuntime<B: Bot> {
    bot: B,
    ctx: BotContext,
    state: RuntimeState,
    /// Consecutive failures on the current unit of work.
    error_retries: u32,
    processed: u64,
}

impl<B: Bot> BotRuntime<B> {
    /// Wires `bot` from `[bots.<bot_id>]`, `[broker]` and `[general]`.
    ///
    /// Fails if the bot is not configured or a required destination path
    /// is unbound.
    pub fn new(
        bot_id: &str,
        config: &IntelflowConfig,
        bot: B,
        queue: Arc<dyn Queue>,
        schema: Arc<FieldSchema>,
        stop: StopHandle,
    ) -> Result<Self, BotError> {
        let bot_config = config.bot(bot_id)?.clone();
        let pipeline = Pipeline::builder(bot_id)
            .queue(queue)
            .schema(schema)
            .source(bot_config.source_queue.clone())
            .destinations(bot_config.destination_queues.clone())
            .load_balance(bot_config.load_balance)
            .retry(RetryPolicy::from_broker(&config.broker))
            .stop_handle(stop)
            .require_paths(&bot.required_paths())
            .build()?;
        let ctx = BotContext::new(
            bot_id,
            bot_config,
            pipeline,
            Path::new(&config.general.dump_dir),
            config.broker.poll_interval(),
        );
        Ok(Self::with_context(bot, ctx))
    }

    /// Runtime over an already wired context.
    pub fn with_context(bot: B, ctx: BotContext) -> Self {
        Self {
            bot,
            ctx,
            state: RuntimeState::Init,
            error_retries: 0,
            processed: 0,
        }
    }

    pub fn state(&self) -> RuntimeState {
        self.state
    }

    pub fn context(&self) -> &BotContext {
        &self.ctx
    }

    pub fn bot(&self) -> &B {
        &self.bot
    }

    /// Successful `process()` calls so far.
    pub fn processed(&self) -> u64 {
        self.processed
    }

    /// Runs until a stop request (`Ok`) or a fatal error (`Err`).
    pub fn run(&mut self) -> Result<(), BotError> {
        let bot_id = self.ctx.bot_id().to_owned();
        tracing::info!(bot_id = %bot_id, "bot starting");

        let result = match self.bot.init(&mut self.ctx) {
            Ok(()) => {
                self.state = RuntimeState::Running;
                tracing::info!(bot_id = %bot_id, "start processing");
                self.run_loop()
            }
            Err(err) => {
                tracing::error!(bot_id = %bot_id, error = %error_chain(&err), "bot initialisation failed");
                Err(err)
            }
        };

        self.state = RuntimeState::Stopping;
        tracing::info!(bot_id = %bot_id, processed = self.processed, "bot stopping");
        if let Err(err) = self.bot.shutdown(&mut self.ctx) {
            tracing::warn!(bot_id = %bot_id, error = %err, "bot shutdown failed");
        }
        self.state = RuntimeState::Stopped;
        match &result {
            Ok(()) => tracing::info!(bot_id = %bot_id, "bot stopped"),
            Err(err) => tracing::error!(bot_id = %bot_id, error = %err, "bot stopped on error"),
        }
        result
    }

    /// Runs a single iteration. Used by tests and one-shot tooling.
    pub fn run_once(&mut self) -> Result<(), BotError> {
        self.state = RuntimeState::Running;
        match self.iterate() {
            Err(err) if err.is_stop_request() => Ok(()),
            other => other,
        }
    }

    fn run_loop(&mut self) -> Result<(), BotError> {
        loop {
            if self.ctx.stop_handle().is_stopped() {
                return Ok(());
            }
            match self.iterate() {
                Ok(()) => {}
                Err(err) if err.is_stop_request() => return Ok(()),
                Err(err) => return Err(err),
            }
        }
    }

    /// One `process()` call plus rate limiting or error handling.
    fn iterate(&mut self) -> Result<(), BotError> {
        let started = Instant::now();
        let outcome = self.bot.process(&mut self.ctx);
        histogram!(names::PROCESS_DURATION_SECONDS).record(started.elapsed().as_secs_f64());

        match outcome {
            Ok(()) => {
                self.processed += 1;
                self.error_retries = 0;
                self.rate_limit();
                Ok(())
            }
            Err(err) if err.is_stop_request() => Err(err),
            Err(err) => self.handle_error(err),
        }
    }

    fn rate_limit(&mut self) {
        let delay = self.ctx.config().rate_limit();
        if delay.is_zero() {
            return;
        }
        self.state = RuntimeState::RateLimited;
        tracing::info!(bot_id = %self.ctx.bot_id(), seconds = delay.as_secs(), "idling");
        self.ctx.stop_handle().sleep(delay);
        self.state = RuntimeState::Running;
    }

    fn handle_error(&mut self, err: BotError) -> Result<(), BotError> {
        counter!(names::PROCESS_ERRORS_TOTAL).increment(1);
        let bot_id = self.ctx.bot_id().to_owned();

        if err.is_fatal() {
            tracing::error!(bot_id = %bot_id, error = %error_chain(&err), "fatal error");
            return Err(err);
        }

        self.error_retries += 1;
        let config = self.ctx.config().clone();
        if config.error_log_exception {
            tracing::error!(
                bot_id = %bot_id,
                retries = self.error_retries,
                error = %error_chain(&err),
                "bot has found a problem"
            );
        } else {
            tracing::error!(bot_id = %bot_id, retries = self.error_retries, "bot has found a problem");
        }
        if config.error_log_message {
            if let Some(message) = self.ctx.current_message() {
                tracing::info!(bot_id = %bot_id, message = %log_view(message), "current message");
            }
        }

        if self.error_retries <= config.error_max_retries {
            self.ctx.release_in_flight()?;
            let delay = config.error_retry_delay();
            tracing::info!(bot_id = %bot_id, seconds = delay.as_secs(), "retrying after delay");
            self.ctx.stop_handle().sleep(delay);
            return Ok(());
        }

        match config.error_procedure {
            ErrorProcedure::Pass => {
                if config.error_dump_message {
                    if let Err(dump_err) = self.ctx.dump_in_flight(&err) {
                        tracing::error!(bot_id = %bot_id, error = %dump_err, "failed to dump message");
                    }
                }
                self.ctx.drop_in_flight()?;
                tracing::warn!(bot_id = %bot_id, retries = self.error_retries, "message skipped");
                self.error_retries = 0;
                Ok(())
            }
            ErrorProcedure::Stop => Err(BotError::GaveUp {
                retries: self.error_retries - 1,
                reason: err.to_string(),
            }),
        }
    }
}
