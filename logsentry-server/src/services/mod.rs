//! Long-lived services of the ingestion server.
//!
//! Every service implements [`logsentry_system::Service`] and communicates
//! through typed addresses collected in the
//! [`Registry`](crate::service::Registry).

pub mod classifier;
pub mod device_auth;
pub mod health_check;
pub mod key_cache;
pub mod processor;
pub mod server;
pub mod spool;
