//! Main entry point and command line interface of the LogSentry server.
//!
//! The workspace is split into the following crates:
//!
//!  - `logsentry`: Main entry point and command line interface.
//!  - `logsentry-auth`: API key issuance, hashing and device codes.
//!  - `logsentry-config`: Configuration for the CLI and server.
//!  - `logsentry-log`: Logging setup and diagnostics.
//!  - `logsentry-metrics`: Rolling per-service health aggregates.
//!  - `logsentry-protocol`: Wire protocol types and fingerprinting.
//!  - `logsentry-sdk`: The in-process client SDK.
//!  - `logsentry-server`: Endpoints and services.
//!  - `logsentry-statsd`: Statsd metric client.
//!  - `logsentry-system`: Service framework and lifecycle controller.

mod cli;
mod cliapp;
mod setup;

use std::process;

pub fn main() {
    let exit_code = match cli::execute() {
        Ok(()) => 0,
        Err(err) => {
            logsentry_log::ensure_error(err);
            1
        }
    };

    process::exit(exit_code);
}
