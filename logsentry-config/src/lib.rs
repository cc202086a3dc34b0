//! Configuration for the LogSentry server.
//!
//! The server reads a `config.yml` from its config folder; every section has
//! complete defaults so an empty file (or none at all, via
//! [`Config::default`]) yields a working development setup. A small set of
//! fields can be overridden from the command line or environment through
//! [`OverridableConfig`].

#![warn(missing_docs)]

mod config;

pub use self::config::*;
