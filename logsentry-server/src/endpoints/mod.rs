//! Web server endpoints.

use axum::Router;
use axum::routing::get;
use logsentry_config::Config;

use crate::service::ServiceState;

mod common;
mod device_auth;
mod health_check;
mod ingest;
mod summary;

pub use self::common::BadIngestRequest;

/// Builds the router with all endpoints of the server.
pub fn routes(config: &Config) -> Router<ServiceState> {
    Router::new()
        .route("/ingest", ingest::route(config))
        .route("/sdk/device/start", device_auth::start_route())
        .route("/sdk/device/complete", device_auth::complete_route())
        .route("/sdk/device/poll", device_auth::poll_route())
        .route("/summary/{app_id}", summary::route())
        .route("/api/logsentry/healthcheck/{kind}", get(health_check::handle))
}
