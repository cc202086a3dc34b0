use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use logsentry_config::Config;
use logsentry_metrics::{AppAggregate, RecordMetrics, SnapshotRegistry};
use logsentry_system::{
    AsyncResponse, Controller, FromMessage, Interface, Receiver, Sender, Service,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::services::classifier::ClassifierHandle;
use crate::services::spool::DiskSpool;
use crate::statsd::{ServerCounters, ServerGauges, ServerHistograms, ServerTimers};
use crate::store::{App, PersistedLog, Store};
use crate::utils::RetryBackoff;

/// Maximum number of records pulled from the channel per processing round.
const DEQUEUE_LIMIT: usize = 256;

/// Number of spooled records drained per store write during recovery.
const SPOOL_DRAIN_CHUNK: i64 = 200;

/// Upper bound for the store-write retry backoff.
const WRITE_BACKOFF_CAP: std::time::Duration = std::time::Duration::from_secs(30);

/// Requests the inbound channel of an app's processor, spawning it on first
/// use.
#[derive(Debug)]
pub struct GetOrSpawn {
    /// The app to process records for.
    pub app: App,
}

/// Service interface of the processor pool.
#[derive(Debug)]
pub enum ProcessorPool {
    /// Returns the bounded record channel of an app's processor.
    GetOrSpawn(GetOrSpawn, Sender<mpsc::Sender<PersistedLog>>),
}

impl Interface for ProcessorPool {}

impl FromMessage<GetOrSpawn> for ProcessorPool {
    type Response = AsyncResponse<mpsc::Sender<PersistedLog>>;

    fn from_message(message: GetOrSpawn, sender: Sender<mpsc::Sender<PersistedLog>>) -> Self {
        Self::GetOrSpawn(message, sender)
    }
}

struct AppHandle {
    tx: mpsc::Sender<PersistedLog>,
    join: JoinHandle<()>,
}

/// Owns one long-lived processor task per active app.
///
/// The ingestion endpoint acquires an app's bounded channel through
/// [`GetOrSpawn`] and enqueues records itself, so a full channel applies
/// backpressure to that request without blocking this service. On shutdown
/// the pool stops handing out channels, closes all of them, and waits for the
/// processors to drain.
pub struct ProcessorPoolService {
    config: Arc<Config>,
    store: Arc<dyn Store>,
    spool: DiskSpool,
    classifier: Option<ClassifierHandle>,
    snapshots: Arc<SnapshotRegistry>,
    apps: HashMap<logsentry_protocol::AppId, AppHandle>,
}

impl ProcessorPoolService {
    /// Creates the service.
    pub fn new(
        config: Arc<Config>,
        store: Arc<dyn Store>,
        spool: DiskSpool,
        classifier: Option<ClassifierHandle>,
        snapshots: Arc<SnapshotRegistry>,
    ) -> Self {
        Self {
            config,
            store,
            spool,
            classifier,
            snapshots,
            apps: HashMap::new(),
        }
    }

    fn handle_get_or_spawn(&mut self, message: GetOrSpawn, sender: Sender<mpsc::Sender<PersistedLog>>) {
        let app_id = message.app.id;

        if let Some(handle) = self.apps.get(&app_id) {
            if !handle.join.is_finished() {
                sender.send(handle.tx.clone());
                return;
            }
            self.apps.remove(&app_id);
        }

        let (tx, rx) = mpsc::channel(self.config.per_app_channel_records());
        let processor = AppProcessor::new(
            message.app,
            self.config.clone(),
            self.store.clone(),
            self.spool.clone(),
            self.classifier.clone(),
            self.snapshots.clone(),
        );
        let join = tokio::spawn(processor.run(rx));

        sender.send(tx.clone());
        self.apps.insert(app_id, AppHandle { tx, join });
    }

    async fn drain(&mut self, timeout: Option<std::time::Duration>) {
        // Closing the channels lets every processor finish its backlog,
        // flush, snapshot and exit.
        let handles: Vec<_> = self
            .apps
            .drain()
            .map(|(_, handle)| {
                drop(handle.tx);
                handle.join
            })
            .collect();

        let join_all = async {
            for join in handles {
                join.await.ok();
            }
        };

        match timeout {
            Some(timeout) => {
                if tokio::time::timeout(timeout, join_all).await.is_err() {
                    logsentry_log::error!("processor pool drain timed out");
                }
            }
            None => join_all.await,
        }
    }
}

impl Service for ProcessorPoolService {
    type Interface = ProcessorPool;

    fn spawn_handler(mut self, mut rx: Receiver<Self::Interface>) {
        tokio::spawn(async move {
            let mut shutdown = Controller::shutdown_handle();

            loop {
                tokio::select! {
                    biased;

                    shutdown = shutdown.notified() => {
                        self.drain(shutdown.timeout).await;
                        break;
                    }
                    message = rx.recv() => match message {
                        Some(ProcessorPool::GetOrSpawn(message, sender)) => {
                            self.handle_get_or_spawn(message, sender)
                        }
                        None => break,
                    },
                }
            }
        });
    }

    fn name() -> &'static str {
        "processor_pool"
    }
}

enum WriteState {
    Normal,
    Degraded,
}

/// The long-lived task owning one app's pipeline.
///
/// Records arrive in enqueue order on the bounded channel. Each round is
/// classified best-effort, folded into the rolling aggregate, and appended to
/// the write batch, which flushes to the store on size or age. Sustained
/// write failures degrade the processor to the disk spool so that ingest
/// keeps flowing.
struct AppProcessor {
    app: App,
    store: Arc<dyn Store>,
    spool: DiskSpool,
    classifier: Option<ClassifierHandle>,
    snapshots: Arc<SnapshotRegistry>,
    aggregate: AppAggregate,
    write_batch: Vec<PersistedLog>,
    oldest_pending: Option<Instant>,
    write_state: WriteState,
    consecutive_failures: u32,
    backoff: RetryBackoff,
    max_write_failures: u32,
    write_batch_max_records: usize,
    write_batch_max_delay: std::time::Duration,
    store_write_timeout: std::time::Duration,
    snapshot_interval: std::time::Duration,
}

impl AppProcessor {
    fn new(
        app: App,
        config: Arc<Config>,
        store: Arc<dyn Store>,
        spool: DiskSpool,
        classifier: Option<ClassifierHandle>,
        snapshots: Arc<SnapshotRegistry>,
    ) -> Self {
        Self {
            aggregate: AppAggregate::new(app.id, config.aggregates().clone()),
            store,
            spool,
            classifier,
            snapshots,
            write_batch: Vec::new(),
            oldest_pending: None,
            write_state: WriteState::Normal,
            consecutive_failures: 0,
            backoff: RetryBackoff::new(WRITE_BACKOFF_CAP),
            max_write_failures: config.max_write_failures(),
            write_batch_max_records: config.write_batch_max_records(),
            write_batch_max_delay: config.write_batch_max_delay(),
            store_write_timeout: config.store_write_timeout(),
            snapshot_interval: config.aggregates().snapshot_interval(),
            app,
        }
    }

    async fn run(mut self, mut rx: mpsc::Receiver<PersistedLog>) {
        let mut snapshot_timer = tokio::time::interval(self.snapshot_interval);
        snapshot_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let mut buf = Vec::with_capacity(DEQUEUE_LIMIT);
        loop {
            let write_deadline = self
                .oldest_pending
                .map(|oldest| oldest + self.write_batch_max_delay);

            tokio::select! {
                n = rx.recv_many(&mut buf, DEQUEUE_LIMIT) => {
                    if n == 0 {
                        break;
                    }
                    let records = std::mem::take(&mut buf);
                    self.process_batch(records).await;
                }
                _ = maybe_sleep_until(write_deadline) => {
                    self.flush_writes().await;
                }
                _ = snapshot_timer.tick() => self.publish_snapshot(),
            }
        }

        // Channel closed: final flush, then leave the last snapshot behind.
        self.flush_writes().await;
        self.publish_snapshot();
    }

    async fn process_batch(&mut self, mut records: Vec<PersistedLog>) {
        if let Some(classifier) = &self.classifier {
            if let Some(classifications) = classifier.classify(&records).await {
                for (record, classification) in records.iter_mut().zip(classifications) {
                    record.classification = classification;
                }
            }
        }

        for record in &records {
            self.aggregate.push(
                &record.service,
                RecordMetrics {
                    timestamp: record.timestamp,
                    level: record.level,
                    fingerprint: &record.fingerprint,
                    message: &record.message,
                    classification: record.classification.as_deref(),
                },
            );
        }

        self.oldest_pending.get_or_insert_with(Instant::now);
        self.write_batch.extend(records);

        if self.write_batch.len() >= self.write_batch_max_records {
            self.flush_writes().await;
        }
    }

    /// Writes a batch to the store, retrying with backoff.
    ///
    /// Returns `false` once the failure budget is exhausted; the records are
    /// then the caller's responsibility.
    async fn write_with_retry(&mut self, records: &[PersistedLog]) -> bool {
        loop {
            let started = Instant::now();
            let result =
                tokio::time::timeout(self.store_write_timeout, self.store.insert_logs(records))
                    .await;
            logsentry_statsd::metric!(
                timer(ServerTimers::StoreWriteDuration) = started.elapsed()
            );

            match result {
                Ok(Ok(())) => {
                    self.consecutive_failures = 0;
                    self.backoff.reset();
                    logsentry_statsd::metric!(
                        counter(ServerCounters::RecordsPersisted) += records.len() as i64
                    );
                    return true;
                }
                failure => {
                    self.consecutive_failures += 1;
                    match failure {
                        Ok(Err(error)) => logsentry_log::warn!(
                            error = &error as &dyn std::error::Error,
                            app_id = %self.app.id,
                            attempt = self.consecutive_failures,
                            "store write failed"
                        ),
                        _ => logsentry_log::warn!(
                            app_id = %self.app.id,
                            attempt = self.consecutive_failures,
                            "store write timed out"
                        ),
                    }

                    if self.consecutive_failures >= self.max_write_failures {
                        return false;
                    }

                    tokio::time::sleep(self.backoff.next_backoff()).await;
                }
            }
        }
    }

    async fn flush_writes(&mut self) {
        if self.write_batch.is_empty() {
            return;
        }

        let records = std::mem::take(&mut self.write_batch);
        self.oldest_pending = None;
        logsentry_statsd::metric!(
            histogram(ServerHistograms::WriteBatchSize) = records.len() as u64
        );

        match self.write_state {
            WriteState::Normal => {
                if !self.write_with_retry(&records).await {
                    logsentry_log::error!(
                        app_id = %self.app.id,
                        "store writes keep failing, degrading to disk spool"
                    );
                    self.enter_degraded(records).await;
                }
            }
            WriteState::Degraded => self.degraded_flush(records).await,
        }
    }

    async fn enter_degraded(&mut self, records: Vec<PersistedLog>) {
        self.write_state = WriteState::Degraded;
        logsentry_statsd::metric!(gauge(ServerGauges::DegradedProcessors) = 1);
        self.spool_records(records).await;
    }

    /// One flush while degraded: probe the store, drain the spool on
    /// success, and only then resume normal writes.
    async fn degraded_flush(&mut self, records: Vec<PersistedLog>) {
        if self.store.ping().await.is_err() {
            self.spool_records(records).await;
            return;
        }

        loop {
            let chunk = match self.spool.drain(self.app.id, SPOOL_DRAIN_CHUNK).await {
                Ok(chunk) => chunk,
                Err(error) => {
                    logsentry_log::error!(
                        error = &error as &dyn std::error::Error,
                        "failed to drain the spool, staying degraded"
                    );
                    self.spool_records(records).await;
                    return;
                }
            };

            if chunk.is_empty() {
                break;
            }

            let write = tokio::time::timeout(
                self.store_write_timeout,
                self.store.insert_logs(&chunk),
            )
            .await;

            if !matches!(write, Ok(Ok(()))) {
                // The store relapsed mid-drain; put the chunk back at the
                // price of reordering and keep spooling.
                self.spool_records(chunk).await;
                self.spool_records(records).await;
                return;
            }

            logsentry_statsd::metric!(
                counter(ServerCounters::RecordsPersisted) += chunk.len() as i64
            );
        }

        logsentry_log::info!(app_id = %self.app.id, "spool drained, resuming normal writes");
        self.write_state = WriteState::Normal;
        self.consecutive_failures = 0;
        self.backoff.reset();
        logsentry_statsd::metric!(gauge(ServerGauges::DegradedProcessors) = 0);

        if !self.write_with_retry(&records).await {
            self.enter_degraded(records).await;
        }
    }

    async fn spool_records(&mut self, records: Vec<PersistedLog>) {
        if let Err(error) = self.spool.push(&records).await {
            logsentry_log::error!(
                error = &error as &dyn std::error::Error,
                app_id = %self.app.id,
                "spool write failed, dropping {} records",
                records.len()
            );
            logsentry_statsd::metric!(
                counter(ServerCounters::RecordsDropped) += records.len() as i64
            );
        }
    }

    fn publish_snapshot(&self) {
        self.snapshots.publish(self.aggregate.snapshot(Utc::now()));
    }
}

/// Sleeps until the given deadline, or forever when there is none.
async fn maybe_sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use logsentry_protocol::{AppId, Attributes, Fingerprint, LogLevel};
    use logsentry_system::Addr;
    use uuid::Uuid;

    use super::*;
    use crate::store::MemoryStore;

    async fn spawn_pool(
        config: Config,
        store: Arc<MemoryStore>,
    ) -> (Addr<ProcessorPool>, Arc<SnapshotRegistry>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let spool = DiskSpool::open(&dir.path().join("spool.db"), 256 * 1024 * 1024)
            .await
            .unwrap();
        let snapshots = Arc::new(SnapshotRegistry::new());

        let service = ProcessorPoolService::new(
            Arc::new(config),
            store as Arc<dyn Store>,
            spool,
            None,
            snapshots.clone(),
        );
        (service.start(), snapshots, dir)
    }

    fn record(app: &App, level: LogLevel, service: &str, message: &str) -> PersistedLog {
        PersistedLog {
            id: Uuid::new_v4(),
            app_id: app.id,
            timestamp: Utc::now(),
            ingested_at: Utc::now(),
            level,
            service: service.to_owned(),
            message: message.to_owned(),
            attributes: Attributes::new(),
            fingerprint: Fingerprint::compute(app.id, level, message, service),
            classification: None,
        }
    }

    fn app() -> App {
        App {
            id: AppId::random(),
            owner_id: "user-1".to_owned(),
            name: "svc-a".to_owned(),
            created_at: Utc::now(),
        }
    }

    fn fast_flush_config() -> Config {
        Config::from_json_value(serde_json::json!({
            "processing": {"write_batch_max_records": 1, "write_batch_max_delay_secs": 1},
            "aggregates": {"snapshot_interval_secs": 1}
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn test_records_are_persisted_in_order() {
        let store = Arc::new(MemoryStore::new());
        let (pool, _snapshots, _dir) = spawn_pool(fast_flush_config(), store.clone()).await;

        let app = app();
        let tx = pool.send(GetOrSpawn { app: app.clone() }).await.unwrap();

        for i in 0..20 {
            tx.send(record(&app, LogLevel::Error, "billing", &format!("boom {i}")))
                .await
                .unwrap();
        }

        // Wait until the write batches land.
        for _ in 0..100 {
            if store.log_count() == 20 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }

        let logs = store.logs();
        assert_eq!(logs.len(), 20);
        let messages: Vec<_> = logs.iter().map(|l| l.message.clone()).collect();
        let expected: Vec<_> = (0..20).map(|i| format!("boom {i}")).collect();
        assert_eq!(messages, expected);
    }

    #[tokio::test]
    async fn test_snapshot_is_published() {
        let store = Arc::new(MemoryStore::new());
        let (pool, snapshots, _dir) = spawn_pool(fast_flush_config(), store).await;

        let app = app();
        let tx = pool.send(GetOrSpawn { app: app.clone() }).await.unwrap();
        for _ in 0..5 {
            tx.send(record(&app, LogLevel::Error, "billing", "boom"))
                .await
                .unwrap();
        }

        let mut snapshot = None;
        for _ in 0..100 {
            snapshot = snapshots.get(app.id).filter(|s| s.total_count == 5);
            if snapshot.is_some() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }

        let snapshot = snapshot.expect("no snapshot published");
        assert_eq!(snapshot.services.len(), 1);
        let service = &snapshot.services[0];
        assert_eq!(service.service, "billing");
        assert_eq!(service.severity_distribution["ERROR"], 5);
        assert!(service.most_common_error.is_some());
    }

    #[tokio::test]
    async fn test_same_app_reuses_channel() {
        let store = Arc::new(MemoryStore::new());
        let (pool, _snapshots, _dir) = spawn_pool(fast_flush_config(), store).await;

        let app = app();
        let first = pool.send(GetOrSpawn { app: app.clone() }).await.unwrap();
        let second = pool.send(GetOrSpawn { app }).await.unwrap();
        assert!(first.same_channel(&second));
    }
}
