//! Process wiring: configuration, schema, queue backend, bot runtime and
//! shutdown signals.
//!
//! The runtime is synchronous. It runs on a blocking thread while the tokio
//! runtime waits for SIGTERM/SIGINT and turns them into a stop request.
//! A message being processed when the signal arrives finishes first; one
//! left unacknowledged is redelivered on the next start.

use std::sync::Arc;

use anyhow::Result;

use intelflow_core::config::{BrokerConfig, GeneralConfig, IntelflowConfig};
use intelflow_core::harmonization::TypeRegistry;
use intelflow_core::schema::FieldSchema;
use intelflow_pipeline::error::error_chain;
use intelflow_pipeline::{Bot, BotRuntime, FileBroker, MemoryBroker, Queue, StopHandle};

use crate::bots;
use crate::cli::BotCli;
use crate::logging;
use crate::metrics_server;

/// Loads the configuration file with environment and CLI overrides, then
/// validates it and checks that the bot is configured.
pub fn load_config(cli: &BotCli) -> Result<IntelflowConfig> {
    let mut config = IntelflowConfig::from_file(&cli.config)?;
    config.apply_env_overrides();
    if let Some(level) = &cli.log_level {
        config.general.log_level = level.clone();
    }
    if let Some(format) = &cli.log_format {
        config.general.log_format = format.clone();
    }
    config.validate()?;
    config.bot(&cli.bot_id)?;
    Ok(config)
}

/// The schema file named by `harmonization_path`, or the built-in schema.
pub fn load_schema(general: &GeneralConfig) -> Result<Arc<FieldSchema>> {
    let schema = match &general.harmonization_path {
        Some(path) => {
            tracing::debug!(path = %path, "loading harmonization schema");
            FieldSchema::load(path, Arc::new(TypeRegistry::with_builtin_types()))?
        }
        None => FieldSchema::builtin()?,
    };
    Ok(Arc::new(schema))
}

/// Opens the configured queue backend.
pub fn open_queue(broker: &BrokerConfig) -> Result<Arc<dyn Queue>> {
    match broker.backend.as_str() {
        "file" => Ok(Arc::new(FileBroker::open(&broker.path, broker.poll_interval())?)),
        "memory" => {
            tracing::warn!("memory broker selected, queues are lost when the process exits");
            Ok(Arc::new(MemoryBroker::new()))
        }
        other => Err(anyhow::anyhow!("unknown broker backend '{}'", other)),
    }
}

/// Builds the runtime of `bot_id` from its `module`. The bot's parameters
/// are checked here, so `--validate` reports them.
pub fn build_runtime(
    bot_id: &str,
    config: &IntelflowConfig,
    queue: Arc<dyn Queue>,
    schema: Arc<FieldSchema>,
    stop: StopHandle,
) -> Result<BotRuntime<Box<dyn Bot>>> {
    let bot = bots::create(config.bot(bot_id)?)?;
    BotRuntime::new(bot_id, config, bot, queue, schema, stop)
        .map_err(|e| anyhow::anyhow!("failed to set up bot '{}': {}", bot_id, error_chain(&e)))
}

/// Runs the bot named on the command line until it stops.
///
/// # Errors
///
/// Startup failures, and a runtime stopping on a fatal error or under the
/// `stop` error procedure. The process then exits non-zero.
pub async fn run(cli: BotCli) -> Result<()> {
    let config = load_config(&cli)?;
    logging::init_tracing(&config.general)?;

    let bot_id = cli.bot_id.clone();
    let bot_config = config.bot(&bot_id)?;
    if !bot_config.enabled {
        tracing::warn!(bot_id = %bot_id, "bot is disabled, exiting");
        return Ok(());
    }

    let schema = load_schema(&config.general)?;
    let queue = open_queue(&config.broker)?;
    let stop = StopHandle::new();
    let mut runtime = build_runtime(&bot_id, &config, queue, schema, stop.clone())?;

    if cli.validate {
        println!("configuration of bot '{}' is valid", bot_id);
        return Ok(());
    }

    if let Some(addr) = cli.metrics_listen {
        metrics_server::install_metrics_recorder(addr)?;
    }

    let signal_stop = stop.clone();
    let signals = tokio::spawn(async move {
        match wait_for_shutdown_signal().await {
            Ok(signal) => {
                tracing::info!(signal = signal, "shutdown signal received");
                signal_stop.stop();
            }
            Err(e) => tracing::error!(error = %e, "signal handling unavailable"),
        }
    });

    let span = tracing::info_span!("bot", bot_id = %bot_id);
    let result = tokio::task::spawn_blocking(move || span.in_scope(|| runtime.run()))
        .await
        .map_err(|e| anyhow::anyhow!("bot thread failed: {}", e))?;
    signals.abort();

    result.map_err(|e| anyhow::anyhow!("bot '{}' stopped: {}", bot_id, error_chain(&e)))
}

/// Wait for a shutdown signal (SIGTERM or SIGINT).
///
/// Returns the name of the signal that triggered the shutdown.
async fn wait_for_shutdown_signal() -> Result<&'static str> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigterm = signal(SignalKind::terminate())
        .map_err(|e| anyhow::anyhow!("failed to install SIGTERM handler: {}", e))?;
    let mut sigint = signal(SignalKind::interrupt())
        .map_err(|e| anyhow::anyhow!("failed to install SIGINT handler: {}", e))?;

    Ok(tokio::select! {
        _ = sigterm.recv() => "SIGTERM",
        _ = sigint.recv() => "SIGINT",
    })
}
