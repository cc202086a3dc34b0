//! The LogSentry ingestion server.
//!
//! Instrumented applications stream batches of structured log records to the
//! `/ingest` endpoint. The server authenticates the sender against the API
//! key registry, normalizes and fingerprints each record, and hands the batch
//! to a per-app processor that classifies, persists and aggregates it. The
//! device-authorization endpoints issue credentials out-of-band, and the
//! summary endpoint serves the rolling health aggregates to the dashboard.

#![warn(missing_docs)]

use std::sync::Arc;

use logsentry_config::Config;
use logsentry_system::{Controller, Service};

mod endpoints;
mod extractors;
mod middlewares;
mod service;
mod services;
mod statsd;
pub mod store;
mod utils;

pub use crate::service::{ServiceState, StateError};
pub use crate::services::server::{HttpServer, ServerError, make_app};

/// An error covering all failure modes of [`run`].
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    /// Starting the service state failed.
    #[error(transparent)]
    State(#[from] StateError),

    /// Starting the HTTP server failed.
    #[error(transparent)]
    Server(#[from] ServerError),

    /// Building the runtime failed.
    #[error("could not create the runtime")]
    Runtime(#[source] std::io::Error),
}

/// Boots the server and blocks until a shutdown signal is processed.
///
/// This creates the tokio runtime, starts all services and the HTTP server,
/// and waits for the shutdown grace period to elapse before returning.
pub fn run(config: Config) -> Result<(), RunError> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .thread_name("logsentry")
        .enable_all()
        .build()
        .map_err(RunError::Runtime)?;

    runtime.block_on(async {
        Controller::start(config.shutdown_timeout());

        let config = Arc::new(config);
        let state = ServiceState::start(config.clone()).await?;
        HttpServer::new(config, state)?.start();

        Controller::shutdown().await;
        Ok(())
    })
}
