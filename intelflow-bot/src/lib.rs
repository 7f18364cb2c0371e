//! intelflow-bot library.
//!
//! Exposes the process wiring for integration testing. In production,
//! `intelflow-bot` is used as a binary (main.rs).

pub mod bots;
pub mod cli;
pub mod logging;
pub mod metrics_server;
pub mod orchestrator;
