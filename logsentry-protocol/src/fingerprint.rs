use std::fmt;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{AppId, LogLevel};

static UUID_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}")
        .unwrap()
});

static EMAIL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}").unwrap());

static NUMBER_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\d+").unwrap());

/// Replaces variable tokens in a log message with stable placeholders.
///
/// Numeric runs, UUIDs and email-like tokens vary between otherwise identical
/// messages ("order 1234 failed" vs "order 1235 failed"); normalizing them
/// makes the [fingerprint](Fingerprint::compute) stable across such records.
pub fn normalize_message(message: &str) -> String {
    let message = UUID_RE.replace_all(message, "<uuid>");
    let message = EMAIL_RE.replace_all(&message, "<email>");
    let message = NUMBER_RE.replace_all(&message, "<num>");
    message.into_owned()
}

/// A deterministic grouping hash of a log record.
///
/// Fingerprints are SHA-256 over the canonicalized `(app_id, level,
/// normalized_message, service)` tuple, hex-encoded to 64 characters. They
/// group semantically equivalent records for aggregation and dedup.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Computes the fingerprint of a record's identifying fields.
    ///
    /// The `service` must already be resolved; records without an explicit
    /// service use the app name.
    pub fn compute(app_id: AppId, level: LogLevel, message: &str, service: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(app_id.uuid().as_bytes());
        hasher.update([0]);
        hasher.update(level.name().as_bytes());
        hasher.update([0]);
        hasher.update(normalize_message(message).as_bytes());
        hasher.update([0]);
        hasher.update(service.as_bytes());

        use std::fmt::Write;

        let digest = hasher.finalize();
        let mut hex = String::with_capacity(64);
        for byte in digest {
            write!(hex, "{byte:02x}").expect("writing to a string never fails");
        }

        Self(hex)
    }

    /// Returns the hex representation of this fingerprint.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_placeholders() {
        assert_eq!(
            normalize_message("order 1234 failed for user@example.com"),
            "order <num> failed for <email>"
        );
        assert_eq!(
            normalize_message("session 550e8400-e29b-41d4-a716-446655440000 expired"),
            "session <uuid> expired"
        );
        assert_eq!(normalize_message("no tokens here"), "no tokens here");
    }

    #[test]
    fn test_fingerprint_deterministic() {
        let app = AppId::random();
        let a = Fingerprint::compute(app, LogLevel::Error, "order 17 failed", "billing");
        let b = Fingerprint::compute(app, LogLevel::Error, "order 23 failed", "billing");
        assert_eq!(a, b);
        assert_eq!(a.as_str().len(), 64);
    }

    #[test]
    fn test_fingerprint_discriminates() {
        let app = AppId::random();
        let base = Fingerprint::compute(app, LogLevel::Error, "boom", "billing");

        let other_level = Fingerprint::compute(app, LogLevel::Critical, "boom", "billing");
        let other_service = Fingerprint::compute(app, LogLevel::Error, "boom", "checkout");
        let other_app = Fingerprint::compute(AppId::random(), LogLevel::Error, "boom", "billing");

        assert_ne!(base, other_level);
        assert_ne!(base, other_service);
        assert_ne!(base, other_app);
    }
}
