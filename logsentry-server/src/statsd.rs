use logsentry_statsd::{CounterMetric, GaugeMetric, HistogramMetric, TimerMetric};

/// Counter metrics used by the server.
pub enum ServerCounters {
    /// Number of records accepted on the ingest endpoint.
    ///
    /// This metric is tagged with:
    /// - `app_id`: the receiving app.
    RecordsAccepted,
    /// Number of ingest requests rejected before enqueueing.
    ///
    /// This metric is tagged with:
    /// - `reason`: the rejection reason.
    IngestRejected,
    /// Number of records persisted to the document store.
    RecordsPersisted,
    /// Number of records written to the degraded-mode disk spool.
    RecordsSpooled,
    /// Number of records dropped because the spool was full.
    RecordsDropped,
    /// Number of classifier calls that failed or timed out.
    ClassifierFailed,
    /// Number of started device authorization sessions.
    DeviceFlowStarted,
    /// Number of completed device authorization sessions.
    DeviceFlowCompleted,
    /// Number of device sessions marked expired by the janitor.
    DeviceSessionsExpired,
    /// Number of the HTTP server starts.
    ServerStarting,
}

impl CounterMetric for ServerCounters {
    fn name(&self) -> &'static str {
        match self {
            Self::RecordsAccepted => "ingest.records_accepted",
            Self::IngestRejected => "ingest.rejected",
            Self::RecordsPersisted => "store.records_persisted",
            Self::RecordsSpooled => "spool.records_written",
            Self::RecordsDropped => "spool.records_dropped",
            Self::ClassifierFailed => "classifier.failed",
            Self::DeviceFlowStarted => "device_auth.started",
            Self::DeviceFlowCompleted => "device_auth.completed",
            Self::DeviceSessionsExpired => "device_auth.expired",
            Self::ServerStarting => "server.starting",
        }
    }
}

/// Timer metrics used by the server.
pub enum ServerTimers {
    /// Wall-clock time of one ingest request.
    IngestDuration,
    /// Wall-clock time of one write batch flush to the store.
    StoreWriteDuration,
    /// Wall-clock time of one classifier call.
    ClassifierDuration,
    /// Wall-clock time of one API key lookup, cache misses only.
    KeyLookupDuration,
}

impl TimerMetric for ServerTimers {
    fn name(&self) -> &'static str {
        match self {
            Self::IngestDuration => "ingest.duration",
            Self::StoreWriteDuration => "store.write_duration",
            Self::ClassifierDuration => "classifier.duration",
            Self::KeyLookupDuration => "auth.key_lookup_duration",
        }
    }
}

/// Gauge metrics used by the server.
pub enum ServerGauges {
    /// Current on-disk size of the degraded-mode spool in bytes.
    SpoolDiskUsed,
    /// Number of per-app processors currently in the degraded state.
    DegradedProcessors,
}

impl GaugeMetric for ServerGauges {
    fn name(&self) -> &'static str {
        match self {
            Self::SpoolDiskUsed => "spool.disk_used",
            Self::DegradedProcessors => "processor.degraded",
        }
    }
}

/// Histogram metrics used by the server.
pub enum ServerHistograms {
    /// Number of records per accepted ingest envelope.
    BatchSize,
    /// Number of records per write batch flushed to the store.
    WriteBatchSize,
}

impl HistogramMetric for ServerHistograms {
    fn name(&self) -> &'static str {
        match self {
            Self::BatchSize => "ingest.batch_size",
            Self::WriteBatchSize => "store.write_batch_size",
        }
    }
}
