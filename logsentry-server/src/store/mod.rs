//! The document store backing the ingestion server.
//!
//! All durable state lives in four collections: `apps`, `app_api_keys`,
//! `device_sessions` and the append-only `logs`. The [`Store`] trait isolates
//! the rest of the server from the storage backend; production uses
//! [`SqliteStore`], tests use [`MemoryStore`].

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use logsentry_auth::KeyHash;
use logsentry_protocol::{AppId, Attributes, Fingerprint, LogLevel};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

mod memory;
mod sqlite;

pub use self::memory::MemoryStore;
pub use self::sqlite::SqliteStore;

/// An error produced by the document store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The underlying database failed.
    #[error("database operation failed")]
    Database(#[from] sqlx::Error),

    /// Stored data could not be interpreted.
    #[error("malformed row in collection {0}")]
    MalformedRow(&'static str),
}

/// An owner-scoped tenant under which logs are grouped.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct App {
    /// The app identifier.
    pub id: AppId,
    /// The owning user.
    pub owner_id: String,
    /// Human-readable name, unique per owner.
    pub name: String,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

/// Lifecycle states of a [`DeviceSession`].
///
/// Transitions are monotone along pending → approved → completed; any state
/// can transition to expired or denied, but never backwards.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    /// Waiting for the user to authorize in the browser.
    Pending,
    /// The user authorized the session; credentials not yet issued.
    Approved,
    /// Credentials were issued.
    Completed,
    /// The session outlived its TTL.
    Expired,
    /// The user rejected the session.
    Denied,
}

impl SessionStatus {
    /// Returns the stored representation of this status.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Completed => "completed",
            Self::Expired => "expired",
            Self::Denied => "denied",
        }
    }

    /// Returns `true` if the transition to `next` moves forward.
    pub fn can_transition(&self, next: SessionStatus) -> bool {
        match (self, next) {
            // Terminal states never change.
            (Self::Completed | Self::Expired | Self::Denied, _) => false,
            (Self::Pending, Self::Approved | Self::Completed) => true,
            (Self::Approved, Self::Completed) => true,
            (_, Self::Expired | Self::Denied) => true,
            _ => false,
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionStatus {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "approved" => Ok(Self::Approved),
            "completed" => Ok(Self::Completed),
            "expired" => Ok(Self::Expired),
            "denied" => Ok(Self::Denied),
            _ => Err(()),
        }
    }
}

/// An ephemeral record coordinating the CLI ↔ browser ↔ server handshake.
#[derive(Clone, Debug, PartialEq)]
pub struct DeviceSession {
    /// Unique row identifier.
    pub id: Uuid,
    /// Opaque high-entropy code identifying this session to the CLI.
    pub device_code: String,
    /// Short code the user enters in the browser.
    pub user_code: String,
    /// Current lifecycle state.
    pub status: SessionStatus,
    /// Name of the app to create or reuse.
    pub app_name: String,
    /// Optional app description.
    pub description: Option<String>,
    /// The authorizing user, set on approval.
    pub user_id: Option<String>,
    /// The bound app, set on completion.
    pub app_id: Option<AppId>,
    /// The minted key, readable exactly once via poll.
    pub api_key_plaintext: Option<String>,
    /// Hard expiry of this session.
    pub expires_at: DateTime<Utc>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// When the user authorized the session.
    pub approved_at: Option<DateTime<Utc>>,
}

impl DeviceSession {
    /// Returns `true` if the session is past its expiry at `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// A fully processed log record as persisted in the `logs` collection.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PersistedLog {
    /// Unique row identifier.
    pub id: Uuid,
    /// The app this record belongs to.
    pub app_id: AppId,
    /// Capture time reported by the SDK.
    pub timestamp: DateTime<Utc>,
    /// Server-side arrival time.
    pub ingested_at: DateTime<Utc>,
    /// Severity of the record.
    pub level: LogLevel,
    /// Resolved service name (the app name when the SDK sent none).
    pub service: String,
    /// The (possibly truncated) message.
    pub message: String,
    /// Scalar attributes.
    pub attributes: Attributes,
    /// Grouping fingerprint.
    pub fingerprint: Fingerprint,
    /// Classification assigned by the external classifier, if any.
    pub classification: Option<String>,
}

/// The document-store contract used by the core.
#[async_trait]
pub trait Store: Send + Sync + fmt::Debug {
    /// Returns the app with the given name for the owner, creating it if it
    /// does not exist. Name collisions reuse the existing app.
    async fn create_app(&self, owner_id: &str, name: &str) -> Result<App, StoreError>;

    /// Fetches an app by id.
    async fn get_app(&self, app_id: AppId) -> Result<Option<App>, StoreError>;

    /// Binds a key hash to an app.
    async fn insert_api_key(&self, app_id: AppId, key_hash: &KeyHash) -> Result<(), StoreError>;

    /// Resolves a key hash to its app, ignoring revoked keys.
    async fn lookup_api_key(&self, key_hash: &KeyHash) -> Result<Option<AppId>, StoreError>;

    /// Revokes a key. Returns `false` if the key was unknown.
    async fn revoke_api_key(&self, key_hash: &KeyHash) -> Result<bool, StoreError>;

    /// Inserts a new device session.
    async fn insert_session(&self, session: &DeviceSession) -> Result<(), StoreError>;

    /// Fetches a session by its device code.
    async fn session_by_device_code(
        &self,
        device_code: &str,
    ) -> Result<Option<DeviceSession>, StoreError>;

    /// Fetches a session by its user code.
    async fn session_by_user_code(
        &self,
        user_code: &str,
    ) -> Result<Option<DeviceSession>, StoreError>;

    /// Replaces a session row.
    async fn update_session(&self, session: &DeviceSession) -> Result<(), StoreError>;

    /// Atomically reads and clears the plaintext key of a completed session.
    ///
    /// At most one caller ever observes the plaintext.
    async fn take_session_key(&self, device_code: &str) -> Result<Option<String>, StoreError>;

    /// Marks all overdue pending or approved sessions as expired.
    ///
    /// Returns the number of sessions swept.
    async fn sweep_expired_sessions(&self, now: DateTime<Utc>) -> Result<u64, StoreError>;

    /// Appends processed records to the `logs` collection.
    async fn insert_logs(&self, logs: &[PersistedLog]) -> Result<(), StoreError>;

    /// Verifies that the store is reachable.
    async fn ping(&self) -> Result<(), StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_transitions_are_monotone() {
        use SessionStatus::*;

        assert!(Pending.can_transition(Approved));
        assert!(Pending.can_transition(Completed));
        assert!(Approved.can_transition(Completed));
        assert!(Pending.can_transition(Expired));
        assert!(Approved.can_transition(Denied));

        assert!(!Approved.can_transition(Pending));
        assert!(!Completed.can_transition(Pending));
        assert!(!Completed.can_transition(Approved));
        assert!(!Expired.can_transition(Pending));
        assert!(!Denied.can_transition(Completed));
    }
}
