//! Wire protocol types shared between the LogSentry SDK and server.
//!
//! This crate defines the [`LogRecord`] as it travels over the ingest
//! endpoint, the canonical [`LogLevel`] enumeration, scalar-only record
//! [`Attributes`], protocol size limits, and the deterministic
//! [fingerprinting](fingerprint) used for grouping and dedup.

#![warn(missing_docs)]

mod app;
mod fingerprint;
mod record;

pub use self::app::*;
pub use self::fingerprint::*;
pub use self::record::*;

/// Maximum length of a log message in bytes. Longer messages are truncated.
pub const MAX_MESSAGE_BYTES: usize = 16 * 1024;

/// Maximum size of a single serialized log record in bytes.
///
/// Oversize records are rejected, never truncated beyond the message.
pub const MAX_RECORD_BYTES: usize = 32 * 1024;

/// Maximum number of attribute entries on a single record.
pub const MAX_ATTRIBUTES: usize = 32;

/// Maximum serialized size of all attributes on a single record in bytes.
pub const MAX_ATTRIBUTES_BYTES: usize = 4 * 1024;

/// Maximum number of records in a single ingest envelope.
pub const MAX_BATCH_RECORDS: usize = 1000;

/// Maximum size of an ingest envelope in bytes.
pub const MAX_ENVELOPE_BYTES: usize = 1024 * 1024;
