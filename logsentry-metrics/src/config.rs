use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Hard upper bound on the number of retained error windows.
pub const MAX_WINDOW_COUNT: usize = 360;

/// Number of records per error window.
pub const WINDOW_SIZE: u64 = 10;

/// Configuration of rolling aggregates and health classification.
///
/// Embedded into the server config under the `aggregates` section.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregateConfig {
    /// Number of 10-record error windows retained per (app, service).
    ///
    /// Hard-capped at [`MAX_WINDOW_COUNT`].
    pub window_count: usize,

    /// Interval at which aggregate snapshots are published, in seconds.
    pub snapshot_interval_secs: u64,

    /// Average errors per 10 records at which a service becomes unhealthy.
    pub unhealthy_avg_errors: f64,

    /// Average errors per 10 records at which a service becomes a warning.
    pub warning_avg_errors: f64,

    /// Occurrences of the top error fingerprint within the recent window at
    /// which a service becomes unhealthy.
    pub unhealthy_top_error_count: u64,

    /// Length of the recent window for the top-error threshold, in seconds.
    pub top_error_window_secs: u64,

    /// Number of recent error records retained per service for summaries.
    pub recent_errors_limit: usize,
}

impl Default for AggregateConfig {
    fn default() -> Self {
        Self {
            window_count: MAX_WINDOW_COUNT,
            snapshot_interval_secs: 2,
            unhealthy_avg_errors: 5.0,
            warning_avg_errors: 2.0,
            unhealthy_top_error_count: 20,
            top_error_window_secs: 600,
            recent_errors_limit: 50,
        }
    }
}

impl AggregateConfig {
    /// Returns the effective window count, clamped to the protocol bound.
    pub fn window_count(&self) -> usize {
        self.window_count.clamp(1, MAX_WINDOW_COUNT)
    }

    /// Returns the interval at which snapshots are published.
    pub fn snapshot_interval(&self) -> Duration {
        Duration::from_secs(self.snapshot_interval_secs.max(1))
    }

    /// Returns the length of the recent window for the top-error threshold.
    pub fn top_error_window(&self) -> Duration {
        Duration::from_secs(self.top_error_window_secs)
    }

    /// Returns the effective recent-error retention, capped at 50 records.
    pub fn recent_errors_limit(&self) -> usize {
        self.recent_errors_limit.min(50)
    }
}
