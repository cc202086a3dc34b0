//! Foundational building blocks for LogSentry's server-side services.
//!
//! Every long-lived component of the ingestion server (processor pool, key
//! registry, device sessions, health check) is a [`Service`]: a task that owns
//! its state and handles messages sent through a typed [`Addr`]. The
//! [`Controller`] listens for termination signals and broadcasts a graceful
//! [`Shutdown`] to all services that subscribed through
//! [`Controller::shutdown_handle`].

#![warn(missing_docs)]

mod controller;
mod service;
mod statsd;

pub use self::controller::*;
pub use self::service::*;
