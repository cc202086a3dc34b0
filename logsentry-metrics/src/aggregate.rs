use std::collections::{BTreeMap, HashMap, VecDeque};

use chrono::{DateTime, Utc};
use logsentry_protocol::{AppId, Fingerprint, LogLevel};

use crate::{
    AggregateConfig, AppSnapshot, ErrorRecord, HealthStatus, ServiceSnapshot, WINDOW_SIZE,
};

/// The fields of a processed record that feed the aggregates.
#[derive(Clone, Copy, Debug)]
pub struct RecordMetrics<'a> {
    /// Capture time of the record.
    pub timestamp: DateTime<Utc>,
    /// Severity of the record.
    pub level: LogLevel,
    /// Grouping fingerprint of the record.
    pub fingerprint: &'a Fingerprint,
    /// The (possibly truncated) message.
    pub message: &'a str,
    /// Classification assigned by the external classifier, if any.
    pub classification: Option<&'a str>,
}

/// Per-fingerprint occurrence tracking.
///
/// `recent` holds at most `threshold` timestamps; the threshold is met when
/// the deque is full and its oldest entry still falls into the recent window.
#[derive(Debug, Default)]
struct FingerprintStats {
    total: u64,
    recent: VecDeque<DateTime<Utc>>,
}

impl FingerprintStats {
    fn record(&mut self, timestamp: DateTime<Utc>, threshold: usize) {
        self.total += 1;
        if threshold == 0 {
            return;
        }

        if self.recent.len() == threshold {
            self.recent.pop_front();
        }
        self.recent.push_back(timestamp);
    }

    fn meets_threshold(&self, now: DateTime<Utc>, window: chrono::Duration, threshold: usize) -> bool {
        threshold > 0
            && self.recent.len() == threshold
            && self.recent.front().is_some_and(|first| *first >= now - window)
    }
}

/// Rolling counters for one `(app, service)` pair.
///
/// Owned and mutated exclusively by the app's processor task; readers only
/// ever see [snapshots](ServiceAggregate::snapshot).
#[derive(Debug)]
pub struct ServiceAggregate {
    config: AggregateConfig,
    total_count: u64,
    per_level_count: [u64; 6],
    window_fill: u64,
    window_errors: u32,
    windows: VecDeque<u32>,
    first_error_ts: Option<DateTime<Utc>>,
    latest_error_ts: Option<DateTime<Utc>>,
    errors: HashMap<Fingerprint, FingerprintStats>,
    recent_errors: VecDeque<ErrorRecord>,
}

impl ServiceAggregate {
    /// Creates an empty aggregate.
    pub fn new(config: AggregateConfig) -> Self {
        Self {
            config,
            total_count: 0,
            per_level_count: [0; 6],
            window_fill: 0,
            window_errors: 0,
            windows: VecDeque::new(),
            first_error_ts: None,
            latest_error_ts: None,
            errors: HashMap::new(),
            recent_errors: VecDeque::new(),
        }
    }

    /// Folds one processed record into the counters.
    pub fn push(&mut self, record: RecordMetrics<'_>) {
        self.total_count += 1;
        self.per_level_count[record.level.index()] += 1;

        if record.level.is_error() {
            self.window_errors += 1;

            self.first_error_ts.get_or_insert(record.timestamp);
            self.latest_error_ts = Some(record.timestamp);

            let threshold = self.config.unhealthy_top_error_count as usize;
            self.errors
                .entry(record.fingerprint.clone())
                .or_default()
                .record(record.timestamp, threshold);

            if self.recent_errors.len() == self.config.recent_errors_limit() {
                self.recent_errors.pop_front();
            }
            self.recent_errors.push_back(ErrorRecord {
                timestamp: record.timestamp,
                level: record.level,
                message: record.message.to_owned(),
                fingerprint: record.fingerprint.clone(),
                classification: record.classification.map(str::to_owned),
            });
        }

        self.window_fill += 1;
        if self.window_fill == WINDOW_SIZE {
            if self.windows.len() == self.config.window_count() {
                self.windows.pop_front();
            }
            self.windows.push_back(self.window_errors);
            self.window_fill = 0;
            self.window_errors = 0;
        }
    }

    /// Total number of records folded into this aggregate.
    pub fn total_count(&self) -> u64 {
        self.total_count
    }

    /// Mean error count over the completed windows.
    ///
    /// Partial windows do not contribute, matching the exposed
    /// `errors_per_10_logs` series.
    pub fn avg_errors_per_10_logs(&self) -> f64 {
        if self.windows.is_empty() {
            return 0.0;
        }

        self.windows.iter().map(|&count| count as f64).sum::<f64>() / self.windows.len() as f64
    }

    fn most_common_error(&self) -> Option<(&Fingerprint, u64)> {
        self.errors
            .iter()
            .max_by_key(|(_, stats)| stats.total)
            .map(|(fingerprint, stats)| (fingerprint, stats.total))
    }

    /// Classifies the health of this service at the given instant.
    pub fn health(&self, now: DateTime<Utc>) -> HealthStatus {
        let window = chrono::Duration::from_std(self.config.top_error_window())
            .unwrap_or_else(|_| chrono::Duration::seconds(600));
        let threshold = self.config.unhealthy_top_error_count as usize;

        let top_error_spike = self
            .errors
            .values()
            .any(|stats| stats.meets_threshold(now, window, threshold));

        let avg = self.avg_errors_per_10_logs();
        if avg >= self.config.unhealthy_avg_errors || top_error_spike {
            HealthStatus::Unhealthy
        } else if avg >= self.config.warning_avg_errors {
            HealthStatus::Warning
        } else {
            HealthStatus::Healthy
        }
    }

    /// Produces an immutable snapshot of the current counters.
    pub fn snapshot(&self, service: &str, now: DateTime<Utc>) -> ServiceSnapshot {
        let severity_distribution = LogLevel::ALL
            .iter()
            .map(|level| (level.name().to_owned(), self.per_level_count[level.index()]))
            .collect();

        ServiceSnapshot {
            service: service.to_owned(),
            health: self.health(now),
            total_count: self.total_count,
            severity_distribution,
            errors_per_10_logs: self.windows.iter().copied().collect(),
            avg_errors_per_10_logs: self.avg_errors_per_10_logs(),
            first_error_ts: self.first_error_ts,
            latest_error_ts: self.latest_error_ts,
            most_common_error: self.most_common_error().map(|(fingerprint, count)| {
                crate::MostCommonError {
                    fingerprint: fingerprint.clone(),
                    count,
                }
            }),
            recent_errors: self.recent_errors.iter().cloned().collect(),
        }
    }
}

/// All rolling aggregates of a single app, keyed by service.
#[derive(Debug)]
pub struct AppAggregate {
    app_id: AppId,
    config: AggregateConfig,
    services: BTreeMap<String, ServiceAggregate>,
}

impl AppAggregate {
    /// Creates an empty aggregate for an app.
    pub fn new(app_id: AppId, config: AggregateConfig) -> Self {
        Self {
            app_id,
            config,
            services: BTreeMap::new(),
        }
    }

    /// Folds one processed record of the given service into the counters.
    pub fn push(&mut self, service: &str, record: RecordMetrics<'_>) {
        if let Some(aggregate) = self.services.get_mut(service) {
            aggregate.push(record);
        } else {
            let mut aggregate = ServiceAggregate::new(self.config.clone());
            aggregate.push(record);
            self.services.insert(service.to_owned(), aggregate);
        }
    }

    /// The app these aggregates belong to.
    pub fn app_id(&self) -> AppId {
        self.app_id
    }

    /// Produces an immutable snapshot across all services of the app.
    pub fn snapshot(&self, now: DateTime<Utc>) -> AppSnapshot {
        AppSnapshot {
            app_id: self.app_id,
            generated_at: now,
            total_count: self.services.values().map(ServiceAggregate::total_count).sum(),
            services: self
                .services
                .iter()
                .map(|(service, aggregate)| aggregate.snapshot(service, now))
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use logsentry_protocol::Fingerprint;

    use super::*;

    fn fingerprint(app: AppId, message: &str) -> Fingerprint {
        Fingerprint::compute(app, LogLevel::Error, message, "api")
    }

    fn push_records(aggregate: &mut AppAggregate, level: LogLevel, count: usize, message: &str) {
        let fp = fingerprint(aggregate.app_id(), message);
        for _ in 0..count {
            aggregate.push(
                "api",
                RecordMetrics {
                    timestamp: Utc::now(),
                    level,
                    fingerprint: &fp,
                    message,
                    classification: None,
                },
            );
        }
    }

    #[test]
    fn test_per_level_counts() {
        let app = AppId::random();
        let mut aggregate = AppAggregate::new(app, AggregateConfig::default());
        push_records(&mut aggregate, LogLevel::Error, 5, "boom");
        push_records(&mut aggregate, LogLevel::Info, 3, "ok");

        let snapshot = aggregate.snapshot(Utc::now());
        assert_eq!(snapshot.total_count, 8);

        let service = &snapshot.services[0];
        assert_eq!(service.service, "api");
        assert_eq!(service.severity_distribution["ERROR"], 5);
        assert_eq!(service.severity_distribution["INFO"], 3);
        assert_eq!(service.severity_distribution["CRITICAL"], 0);
    }

    #[test]
    fn test_windows_complete_every_ten_records() {
        let app = AppId::random();
        let mut aggregate = AppAggregate::new(app, AggregateConfig::default());

        // 9 records: no completed window yet.
        push_records(&mut aggregate, LogLevel::Error, 9, "boom");
        let snapshot = aggregate.snapshot(Utc::now());
        assert!(snapshot.services[0].errors_per_10_logs.is_empty());
        assert_eq!(snapshot.services[0].avg_errors_per_10_logs, 0.0);

        // The 10th record completes a window of 10 errors.
        push_records(&mut aggregate, LogLevel::Error, 1, "boom");
        let snapshot = aggregate.snapshot(Utc::now());
        assert_eq!(snapshot.services[0].errors_per_10_logs, vec![10]);
        assert_eq!(snapshot.services[0].avg_errors_per_10_logs, 10.0);
    }

    #[test]
    fn test_windows_age_out_fifo() {
        let app = AppId::random();
        let config = AggregateConfig {
            window_count: 3,
            ..Default::default()
        };
        let mut aggregate = AppAggregate::new(app, config);

        // Four full windows; the first (all errors) must age out.
        push_records(&mut aggregate, LogLevel::Error, 10, "boom");
        push_records(&mut aggregate, LogLevel::Info, 30, "ok");

        let snapshot = aggregate.snapshot(Utc::now());
        assert_eq!(snapshot.services[0].errors_per_10_logs, vec![0, 0, 0]);
    }

    #[test]
    fn test_health_thresholds() {
        let app = AppId::random();
        let mut aggregate = AppAggregate::new(app, AggregateConfig::default());

        push_records(&mut aggregate, LogLevel::Info, 10, "ok");
        assert_eq!(aggregate.snapshot(Utc::now()).services[0].health, HealthStatus::Healthy);

        // Completed windows of 0, 2 and 4 errors: avg 2 reaches the warning
        // threshold.
        push_records(&mut aggregate, LogLevel::Error, 2, "boom");
        push_records(&mut aggregate, LogLevel::Info, 8, "ok");
        push_records(&mut aggregate, LogLevel::Error, 4, "boom");
        push_records(&mut aggregate, LogLevel::Info, 6, "ok");
        assert_eq!(aggregate.snapshot(Utc::now()).services[0].health, HealthStatus::Warning);

        // Flood of errors: avg climbs over the unhealthy threshold.
        push_records(&mut aggregate, LogLevel::Error, 40, "boom");
        assert_eq!(
            aggregate.snapshot(Utc::now()).services[0].health,
            HealthStatus::Unhealthy
        );
    }

    #[test]
    fn test_top_error_spike_is_unhealthy() {
        let app = AppId::random();
        let config = AggregateConfig {
            unhealthy_top_error_count: 20,
            ..Default::default()
        };
        let mut aggregate = AppAggregate::new(app, config);

        // 20 occurrences of one fingerprint inside the window trip the
        // spike threshold even though interleaved INFO records keep the
        // average below the avg threshold.
        for _ in 0..20 {
            push_records(&mut aggregate, LogLevel::Error, 1, "boom");
            push_records(&mut aggregate, LogLevel::Info, 9, "ok");
        }

        let snapshot = aggregate.snapshot(Utc::now());
        assert!(snapshot.services[0].avg_errors_per_10_logs < 5.0);
        assert_eq!(snapshot.services[0].health, HealthStatus::Unhealthy);
    }

    #[test]
    fn test_most_common_error() {
        let app = AppId::random();
        let mut aggregate = AppAggregate::new(app, AggregateConfig::default());

        push_records(&mut aggregate, LogLevel::Error, 3, "timeout");
        push_records(&mut aggregate, LogLevel::Error, 5, "boom");

        let snapshot = aggregate.snapshot(Utc::now());
        let top = snapshot.services[0].most_common_error.as_ref().unwrap();
        assert_eq!(top.fingerprint, fingerprint(app, "boom"));
        assert_eq!(top.count, 5);
    }

    #[test]
    fn test_recent_errors_are_bounded() {
        let app = AppId::random();
        let mut aggregate = AppAggregate::new(app, AggregateConfig::default());
        push_records(&mut aggregate, LogLevel::Error, 75, "boom");

        let snapshot = aggregate.snapshot(Utc::now());
        assert_eq!(snapshot.services[0].recent_errors.len(), 50);
    }
}
