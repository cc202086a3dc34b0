use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use logsentry_protocol::{AppId, Fingerprint, LogLevel};
use parking_lot::RwLock;
use serde::Serialize;

/// Health classification of a service.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Operating normally.
    Healthy,
    /// Elevated error rate.
    Warning,
    /// Error rate or error spike above the unhealthy thresholds.
    Unhealthy,
}

/// A recent error record retained for summaries.
#[derive(Clone, Debug, Serialize)]
pub struct ErrorRecord {
    /// Capture time of the record.
    pub timestamp: DateTime<Utc>,
    /// Severity of the record.
    pub level: LogLevel,
    /// The (possibly truncated) message.
    pub message: String,
    /// Grouping fingerprint of the record.
    pub fingerprint: Fingerprint,
    /// Classification assigned by the external classifier, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub classification: Option<String>,
}

/// The most frequent error fingerprint of a service.
#[derive(Clone, Debug, Serialize)]
pub struct MostCommonError {
    /// The grouping fingerprint.
    pub fingerprint: Fingerprint,
    /// Total occurrences since the aggregate was created.
    pub count: u64,
}

/// Immutable snapshot of one service's rolling aggregate.
#[derive(Clone, Debug, Serialize)]
pub struct ServiceSnapshot {
    /// Name of the service.
    pub service: String,
    /// Health classification at snapshot time.
    pub health: HealthStatus,
    /// Total number of records.
    pub total_count: u64,
    /// Record counts keyed by level name.
    pub severity_distribution: BTreeMap<String, u64>,
    /// Error counts of the completed 10-record windows, oldest first.
    pub errors_per_10_logs: Vec<u32>,
    /// Mean of `errors_per_10_logs`.
    pub avg_errors_per_10_logs: f64,
    /// Capture time of the first error seen.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_error_ts: Option<DateTime<Utc>>,
    /// Capture time of the most recent error seen.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latest_error_ts: Option<DateTime<Utc>>,
    /// The most frequent error fingerprint, if any errors were seen.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub most_common_error: Option<MostCommonError>,
    /// Up to 50 recent error records, oldest first.
    pub recent_errors: Vec<ErrorRecord>,
}

/// Immutable snapshot of all aggregates of one app.
#[derive(Clone, Debug, Serialize)]
pub struct AppSnapshot {
    /// The app these aggregates belong to.
    pub app_id: AppId,
    /// When this snapshot was published.
    pub generated_at: DateTime<Utc>,
    /// Total records across all services.
    pub total_count: u64,
    /// Per-service snapshots, ordered by service name.
    pub services: Vec<ServiceSnapshot>,
}

/// Shared registry of the latest published [`AppSnapshot`] per app.
///
/// Writers (the per-app processors) replace the `Arc` pointer wholesale;
/// readers clone it out under a short read lock and then work on the
/// immutable snapshot. No snapshot is ever mutated in place.
#[derive(Debug, Default)]
pub struct SnapshotRegistry {
    inner: RwLock<HashMap<AppId, Arc<AppSnapshot>>>,
}

impl SnapshotRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Publishes a new snapshot for an app, replacing the previous pointer.
    pub fn publish(&self, snapshot: AppSnapshot) {
        let app_id = snapshot.app_id;
        self.inner.write().insert(app_id, Arc::new(snapshot));
    }

    /// Returns the latest snapshot for an app, if one has been published.
    pub fn get(&self, app_id: AppId) -> Option<Arc<AppSnapshot>> {
        self.inner.read().get(&app_id).cloned()
    }

    /// Removes the snapshot of an app, e.g. when its processor shuts down.
    pub fn remove(&self, app_id: AppId) {
        self.inner.write().remove(&app_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_replaces_pointer() {
        let registry = SnapshotRegistry::new();
        let app_id = AppId::random();

        assert!(registry.get(app_id).is_none());

        registry.publish(AppSnapshot {
            app_id,
            generated_at: Utc::now(),
            total_count: 1,
            services: Vec::new(),
        });
        let first = registry.get(app_id).unwrap();
        assert_eq!(first.total_count, 1);

        registry.publish(AppSnapshot {
            app_id,
            generated_at: Utc::now(),
            total_count: 2,
            services: Vec::new(),
        });

        // The old pointer stays valid and unchanged.
        assert_eq!(first.total_count, 1);
        assert_eq!(registry.get(app_id).unwrap().total_count, 2);
    }

    #[test]
    fn test_health_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&HealthStatus::Unhealthy).unwrap(),
            "\"unhealthy\""
        );
    }
}
