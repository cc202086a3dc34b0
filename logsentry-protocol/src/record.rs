use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::de;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::{MAX_ATTRIBUTES, MAX_ATTRIBUTES_BYTES, MAX_MESSAGE_BYTES, MAX_RECORD_BYTES};

/// The severity of a log record.
///
/// The canonical wire representation is the upper-case name. Aliases such as
/// `WARN` are intentionally not accepted.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    /// Fine-grained diagnostic events.
    Trace,
    /// Debugging information.
    Debug,
    /// Regular operational messages.
    Info,
    /// Something unexpected that does not prevent operation.
    Warning,
    /// An operation failed.
    Error,
    /// The application is unable to continue.
    Critical,
}

impl LogLevel {
    /// All levels, ordered by increasing severity.
    pub const ALL: [LogLevel; 6] = [
        LogLevel::Trace,
        LogLevel::Debug,
        LogLevel::Info,
        LogLevel::Warning,
        LogLevel::Error,
        LogLevel::Critical,
    ];

    /// Returns the canonical upper-case name of this level.
    pub fn name(&self) -> &'static str {
        match self {
            LogLevel::Trace => "TRACE",
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warning => "WARNING",
            LogLevel::Error => "ERROR",
            LogLevel::Critical => "CRITICAL",
        }
    }

    /// Returns the position of this level in [`LogLevel::ALL`].
    ///
    /// Used to index fixed-size per-level counters.
    pub fn index(&self) -> usize {
        *self as usize
    }

    /// Returns `true` for levels that count towards error rates.
    pub fn is_error(&self) -> bool {
        matches!(self, LogLevel::Error | LogLevel::Critical)
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// An error parsing a [`LogLevel`].
#[derive(Clone, Copy, Debug, thiserror::Error, PartialEq, Eq)]
#[error("invalid log level")]
pub struct ParseLevelError;

impl FromStr for LogLevel {
    type Err = ParseLevelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "TRACE" => Ok(LogLevel::Trace),
            "DEBUG" => Ok(LogLevel::Debug),
            "INFO" => Ok(LogLevel::Info),
            "WARNING" => Ok(LogLevel::Warning),
            "ERROR" => Ok(LogLevel::Error),
            "CRITICAL" => Ok(LogLevel::Critical),
            _ => Err(ParseLevelError),
        }
    }
}

/// A scalar attribute value.
///
/// Records carry a flat string-to-scalar mapping; nested containers are
/// rejected at the SDK boundary and fail deserialization on the server.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttributeValue {
    /// A string value.
    String(String),
    /// A signed integer value.
    Int(i64),
    /// A floating point value.
    Float(f64),
    /// A boolean value.
    Bool(bool),
    /// An explicit null.
    Null,
}

impl From<&str> for AttributeValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_owned())
    }
}

impl From<String> for AttributeValue {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<i64> for AttributeValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<f64> for AttributeValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<bool> for AttributeValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

/// The attribute mapping of a [`LogRecord`].
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Attributes(BTreeMap<String, AttributeValue>);

impl Attributes {
    /// Creates an empty attribute mapping.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` if there are no attributes.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns the number of attributes.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Inserts an attribute, replacing any previous value for the key.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<AttributeValue>) {
        self.0.insert(key.into(), value.into());
    }

    /// Returns the value for a key, if present.
    pub fn get(&self, key: &str) -> Option<&AttributeValue> {
        self.0.get(key)
    }

    /// Iterates over all attributes in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &AttributeValue)> {
        self.0.iter()
    }
}

impl FromIterator<(String, AttributeValue)> for Attributes {
    fn from_iter<T: IntoIterator<Item = (String, AttributeValue)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// A wall-clock timestamp with second or finer precision.
///
/// On the wire this is either an ISO 8601 string or an epoch-seconds number;
/// serialization always emits the canonical ISO 8601 form.
#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd, Hash)]
pub struct Timestamp(pub DateTime<Utc>);

impl Timestamp {
    /// The current time.
    pub fn now() -> Self {
        Self(Utc::now())
    }

    /// Returns the inner UTC datetime.
    pub fn into_inner(self) -> DateTime<Utc> {
        self.0
    }
}

impl From<DateTime<Utc>> for Timestamp {
    fn from(dt: DateTime<Utc>) -> Self {
        Self(dt)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.to_rfc3339_opts(SecondsFormat::Micros, true))
    }
}

impl Serialize for Timestamp {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Timestamp {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Seconds(f64),
            Iso(String),
        }

        match Repr::deserialize(deserializer)? {
            Repr::Seconds(seconds) => {
                if !seconds.is_finite() || seconds < 0.0 {
                    return Err(de::Error::custom("timestamp out of range"));
                }
                let secs = seconds.trunc() as i64;
                let nanos = (seconds.fract() * 1_000_000_000.0) as u32;
                DateTime::from_timestamp(secs, nanos)
                    .map(|dt| Timestamp(dt))
                    .ok_or_else(|| de::Error::custom("timestamp out of range"))
            }
            Repr::Iso(value) => value
                .parse::<DateTime<Utc>>()
                .map(Timestamp)
                .map_err(|_| de::Error::custom("invalid timestamp")),
        }
    }
}

/// A single structured log record as sent by the SDK.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    /// Capture time of the record, monotonic-adjusted by the SDK.
    pub timestamp: Timestamp,

    /// The severity of the record.
    pub level: LogLevel,

    /// The log message, truncated to [`MAX_MESSAGE_BYTES`].
    pub message: String,

    /// The logical sub-component that emitted the record.
    ///
    /// Records without a service are attributed to the app's name on the
    /// server.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,

    /// Additional scalar attributes.
    #[serde(default, skip_serializing_if = "Attributes::is_empty")]
    pub attributes: Attributes,
}

/// An error validating a [`LogRecord`].
#[derive(Clone, Copy, Debug, thiserror::Error, PartialEq, Eq)]
pub enum RecordError {
    /// The serialized record exceeds [`MAX_RECORD_BYTES`].
    #[error("serialized record exceeds {MAX_RECORD_BYTES} bytes")]
    RecordTooLarge,

    /// The record carries more than [`MAX_ATTRIBUTES`] attributes.
    #[error("record carries more than {MAX_ATTRIBUTES} attributes")]
    TooManyAttributes,

    /// The serialized attributes exceed [`MAX_ATTRIBUTES_BYTES`].
    #[error("serialized attributes exceed {MAX_ATTRIBUTES_BYTES} bytes")]
    AttributesTooLarge,
}

impl LogRecord {
    /// Creates a record with the current timestamp and no attributes.
    pub fn new(level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            timestamp: Timestamp::now(),
            level,
            message: message.into(),
            service: None,
            attributes: Attributes::new(),
        }
    }

    /// Truncates the message to [`MAX_MESSAGE_BYTES`] on a char boundary.
    ///
    /// Truncation of the message is the only permitted lossy mutation of a
    /// record; everything else oversized is rejected by [`validate`](Self::validate).
    pub fn truncate_message(&mut self) {
        if self.message.len() > MAX_MESSAGE_BYTES {
            let mut end = MAX_MESSAGE_BYTES;
            while !self.message.is_char_boundary(end) {
                end -= 1;
            }
            self.message.truncate(end);
        }
    }

    /// Validates the size invariants of this record.
    ///
    /// Assumes the message has already been capped via
    /// [`truncate_message`](Self::truncate_message).
    pub fn validate(&self) -> Result<(), RecordError> {
        if self.attributes.len() > MAX_ATTRIBUTES {
            return Err(RecordError::TooManyAttributes);
        }

        let attribute_bytes = serde_json::to_vec(&self.attributes)
            .map(|v| v.len())
            .unwrap_or(usize::MAX);
        if attribute_bytes > MAX_ATTRIBUTES_BYTES {
            return Err(RecordError::AttributesTooLarge);
        }

        let record_bytes = serde_json::to_vec(self).map(|v| v.len()).unwrap_or(usize::MAX);
        if record_bytes > MAX_RECORD_BYTES {
            return Err(RecordError::RecordTooLarge);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record_json(level: &str) -> String {
        format!(
            r#"{{"timestamp": 1715000000, "level": "{level}", "message": "boom"}}"#
        )
    }

    #[test]
    fn test_level_roundtrip() {
        for level in LogLevel::ALL {
            let json = serde_json::to_string(&level).unwrap();
            assert_eq!(json, format!("\"{}\"", level.name()));
            assert_eq!(serde_json::from_str::<LogLevel>(&json).unwrap(), level);
        }
    }

    #[test]
    fn test_level_rejects_aliases() {
        assert!(serde_json::from_str::<LogRecord>(&record_json("WARN")).is_err());
        assert!(serde_json::from_str::<LogRecord>(&record_json("warning")).is_err());
        assert!(serde_json::from_str::<LogRecord>(&record_json("FATAL")).is_err());
    }

    #[test]
    fn test_timestamp_from_epoch_seconds() {
        let record: LogRecord = serde_json::from_str(&record_json("ERROR")).unwrap();
        assert_eq!(record.timestamp.0.timestamp(), 1715000000);
    }

    #[test]
    fn test_timestamp_from_iso() {
        let record: LogRecord = serde_json::from_str(
            r#"{"timestamp": "2024-05-06T13:33:20Z", "level": "INFO", "message": "hi"}"#,
        )
        .unwrap();
        assert_eq!(record.timestamp.0.timestamp(), 1715002400);
        // Epoch-seconds and ISO representations of the same instant agree.
        let epoch: LogRecord = serde_json::from_str(
            r#"{"timestamp": 1715002400, "level": "INFO", "message": "hi"}"#,
        )
        .unwrap();
        assert_eq!(epoch.timestamp, record.timestamp);
    }

    #[test]
    fn test_timestamp_rejects_negative() {
        let result = serde_json::from_str::<LogRecord>(
            r#"{"timestamp": -1, "level": "INFO", "message": "hi"}"#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_attributes_scalars_only() {
        let record: LogRecord = serde_json::from_str(
            r#"{
                "timestamp": 1715000000,
                "level": "INFO",
                "message": "hi",
                "attributes": {"a": "x", "b": 1, "c": 1.5, "d": true, "e": null}
            }"#,
        )
        .unwrap();
        assert_eq!(record.attributes.len(), 5);
        assert_eq!(record.attributes.get("b"), Some(&AttributeValue::Int(1)));

        let nested = serde_json::from_str::<LogRecord>(
            r#"{
                "timestamp": 1715000000,
                "level": "INFO",
                "message": "hi",
                "attributes": {"a": {"nested": true}}
            }"#,
        );
        assert!(nested.is_err());
    }

    #[test]
    fn test_message_truncation_respects_char_boundary() {
        let mut record = LogRecord::new(LogLevel::Info, "ä".repeat(MAX_MESSAGE_BYTES));
        record.truncate_message();
        assert!(record.message.len() <= MAX_MESSAGE_BYTES);
        assert!(record.message.is_char_boundary(record.message.len()));
        record.validate().unwrap();
    }

    #[test]
    fn test_validate_rejects_attribute_flood() {
        let mut record = LogRecord::new(LogLevel::Info, "hi");
        for i in 0..MAX_ATTRIBUTES + 1 {
            record.attributes.insert(format!("key_{i}"), i as i64);
        }
        assert_eq!(record.validate(), Err(RecordError::TooManyAttributes));
    }

    #[test]
    fn test_validate_rejects_oversize_attributes() {
        let mut record = LogRecord::new(LogLevel::Info, "hi");
        record.attributes.insert("payload", "x".repeat(MAX_ATTRIBUTES_BYTES));
        assert_eq!(record.validate(), Err(RecordError::AttributesTooLarge));
    }

    #[test]
    fn test_wire_roundtrip_preserves_fields() {
        let mut record = LogRecord::new(LogLevel::Error, "payment failed");
        record.service = Some("billing".to_owned());
        record.attributes.insert("retries", 3i64);

        let json = serde_json::to_string(&record).unwrap();
        let parsed: LogRecord = serde_json::from_str(&json).unwrap();

        assert_eq!(parsed.level, record.level);
        assert_eq!(parsed.message, record.message);
        assert_eq!(parsed.service, record.service);
        assert_eq!(parsed.attributes, record.attributes);
    }
}
