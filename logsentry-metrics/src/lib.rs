//! Rolling health aggregates for LogSentry.
//!
//! Each per-app processor owns one [`AppAggregate`], updated in enqueue order
//! as records are processed. Readers never touch the live aggregate: the
//! owner periodically publishes an immutable [`AppSnapshot`] into the shared
//! [`SnapshotRegistry`], which the summary endpoint serves lock-free apart
//! from a short registry read.

#![warn(missing_docs)]

mod aggregate;
mod config;
mod snapshot;

pub use self::aggregate::*;
pub use self::config::*;
pub use self::snapshot::*;
