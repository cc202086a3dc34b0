//! Logging setup and helpers for all LogSentry server crates.
//!
//! This crate configures a `tracing` subscriber according to a [`LogConfig`]
//! and re-exports the `tracing` macros so that other crates only depend on a
//! single logging surface.

#![warn(missing_docs)]

mod setup;
mod test;
mod utils;

pub use self::setup::*;
#[doc(hidden)]
pub use self::test::*;
pub use self::utils::*;

// Re-export the tracing macros and common types.
pub use tracing::{Level, debug, error, event_enabled, info, trace, warn};
