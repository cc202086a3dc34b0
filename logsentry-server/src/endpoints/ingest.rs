//! Handles the authenticated log intake endpoint.

use axum::Json;
use axum::extract::{DefaultBodyLimit, State};
use axum::response::IntoResponse;
use axum::routing::{MethodRouter, post};
use bytes::Bytes;
use logsentry_auth::ApiKey;
use logsentry_config::Config;
use logsentry_protocol::{Fingerprint, LogRecord};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tower_http::timeout::TimeoutLayer;
use uuid::Uuid;

use crate::endpoints::common::BadIngestRequest;
use crate::extractors::IngestedAt;
use crate::service::ServiceState;
use crate::services::key_cache::LookupKey;
use crate::services::processor::GetOrSpawn;
use crate::statsd::{ServerCounters, ServerHistograms, ServerTimers};
use crate::store::{App, PersistedLog};

#[derive(Debug, Deserialize)]
struct IngestEnvelope {
    api_key: String,
    logs: Vec<LogRecord>,
}

#[derive(Debug, Serialize)]
struct IngestResponse {
    accepted: usize,
}

/// Normalizes one wire record into its persisted form.
///
/// Caps the message, validates the size invariants, binds the app, resolves
/// the service name and derives the fingerprint.
fn normalize(
    record: LogRecord,
    app: &App,
    ingested_at: IngestedAt,
) -> Result<PersistedLog, BadIngestRequest> {
    let mut record = record;
    record.truncate_message();
    record.validate().map_err(BadIngestRequest::InvalidRecord)?;

    let service = record
        .service
        .filter(|service| !service.is_empty())
        .unwrap_or_else(|| app.name.clone());

    let fingerprint = Fingerprint::compute(app.id, record.level, &record.message, &service);

    Ok(PersistedLog {
        id: Uuid::new_v4(),
        app_id: app.id,
        timestamp: record.timestamp.into_inner(),
        ingested_at: ingested_at.into_inner(),
        level: record.level,
        service,
        message: record.message,
        attributes: record.attributes,
        fingerprint,
        classification: None,
    })
}

async fn handle(
    State(state): State<ServiceState>,
    ingested_at: IngestedAt,
    body: Bytes,
) -> Result<impl IntoResponse, BadIngestRequest> {
    let started = Instant::now();
    let config = state.config();

    if body.is_empty() {
        return Err(BadIngestRequest::EmptyBody);
    }
    if body.len() > config.max_envelope_bytes() {
        return Err(BadIngestRequest::PayloadTooLarge);
    }

    let envelope: IngestEnvelope =
        serde_json::from_slice(&body).map_err(BadIngestRequest::InvalidJson)?;
    if envelope.logs.len() > config.max_batch_records() {
        return Err(BadIngestRequest::TooManyRecords(envelope.logs.len()));
    }

    let api_key = ApiKey::parse(&envelope.api_key).map_err(|_| BadIngestRequest::Unauthorized)?;
    let app_id = state
        .key_cache()
        .send(LookupKey(api_key))
        .await
        .map_err(|_| BadIngestRequest::ServiceUnavailable)?
        .map_err(|_| BadIngestRequest::ServiceUnavailable)?
        .ok_or(BadIngestRequest::Unauthorized)?;

    let app = state
        .store()
        .get_app(app_id)
        .await
        .map_err(|_| BadIngestRequest::ServiceUnavailable)?
        .ok_or(BadIngestRequest::Unauthorized)?;

    if envelope.logs.is_empty() {
        return Ok(Json(IngestResponse { accepted: 0 }));
    }

    let records = envelope
        .logs
        .into_iter()
        .map(|record| normalize(record, &app, ingested_at))
        .collect::<Result<Vec<_>, _>>()?;

    let tx = state
        .processor_pool()
        .send(GetOrSpawn { app })
        .await
        .map_err(|_| BadIngestRequest::ServiceUnavailable)?;

    // Bounded wait for room in the per-app channel; a full channel surfaces
    // as backpressure for the client to retry.
    let permits = tokio::time::timeout(config.enqueue_timeout(), tx.reserve_many(records.len()))
        .await
        .map_err(|_| BadIngestRequest::Backpressure {
            retry_after: config.retry_after_secs(),
        })?
        .map_err(|_| BadIngestRequest::ServiceUnavailable)?;

    let accepted = records.len();
    for (permit, record) in permits.zip(records) {
        permit.send(record);
    }

    logsentry_statsd::metric!(
        counter(ServerCounters::RecordsAccepted) += accepted as i64,
        app_id = &app_id.to_string()
    );
    logsentry_statsd::metric!(histogram(ServerHistograms::BatchSize) = accepted as u64);
    logsentry_statsd::metric!(timer(ServerTimers::IngestDuration) = started.elapsed());

    Ok(Json(IngestResponse { accepted }))
}

pub fn route(config: &Config) -> MethodRouter<ServiceState> {
    post(handle)
        .route_layer(DefaultBodyLimit::max(config.max_envelope_bytes()))
        .route_layer(TimeoutLayer::new(config.ingest_timeout()))
}
