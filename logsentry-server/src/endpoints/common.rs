//! Common facilities for the ingest endpoint.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use logsentry_protocol::{MAX_BATCH_RECORDS, RecordError};

use crate::statsd::ServerCounters;
use crate::utils::ApiErrorResponse;

/// Rejections of an ingest request, mapped to their response codes.
#[derive(Debug, thiserror::Error)]
pub enum BadIngestRequest {
    /// The request body was empty.
    #[error("empty request body")]
    EmptyBody,

    /// The envelope was not valid JSON or failed schema validation.
    #[error("invalid JSON data")]
    InvalidJson(#[source] serde_json::Error),

    /// The envelope exceeds the size limit.
    #[error("payload exceeds the envelope size limit")]
    PayloadTooLarge,

    /// The envelope carries too many records.
    #[error("batch of {0} records exceeds the limit of {MAX_BATCH_RECORDS}")]
    TooManyRecords(usize),

    /// A record violated its size invariants.
    #[error("invalid record in batch")]
    InvalidRecord(#[source] RecordError),

    /// The API key is unknown, malformed or revoked.
    #[error("unknown or invalid API key")]
    Unauthorized,

    /// The app's processing channel is full.
    #[error("app processing queue is full")]
    Backpressure {
        /// Seconds the client should wait before retrying.
        retry_after: u64,
    },

    /// A backing service is unavailable, e.g. during shutdown or a store
    /// outage.
    #[error("service unavailable")]
    ServiceUnavailable,
}

impl BadIngestRequest {
    fn status(&self) -> StatusCode {
        match self {
            Self::EmptyBody | Self::InvalidJson(_) => StatusCode::BAD_REQUEST,
            Self::PayloadTooLarge | Self::TooManyRecords(_) => StatusCode::PAYLOAD_TOO_LARGE,
            Self::InvalidRecord(RecordError::RecordTooLarge) => StatusCode::PAYLOAD_TOO_LARGE,
            Self::InvalidRecord(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::Backpressure { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::ServiceUnavailable => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    fn reason(&self) -> &'static str {
        match self {
            Self::EmptyBody => "empty_body",
            Self::InvalidJson(_) => "invalid_json",
            Self::PayloadTooLarge => "payload_too_large",
            Self::TooManyRecords(_) => "too_many_records",
            Self::InvalidRecord(_) => "invalid_record",
            Self::Unauthorized => "unauthorized",
            Self::Backpressure { .. } => "backpressure",
            Self::ServiceUnavailable => "unavailable",
        }
    }
}

impl IntoResponse for BadIngestRequest {
    fn into_response(self) -> Response {
        logsentry_statsd::metric!(
            counter(ServerCounters::IngestRejected) += 1,
            reason = self.reason()
        );

        let status = self.status();
        let body = ApiErrorResponse::from_error(&self);

        match self {
            Self::Backpressure { retry_after } => {
                (status, [("Retry-After", retry_after.to_string())], body).into_response()
            }
            _ => (status, body).into_response(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejections_count_with_reason() {
        let captures = logsentry_statsd::with_capturing_test_client(|| {
            BadIngestRequest::Unauthorized.into_response();
            BadIngestRequest::Backpressure { retry_after: 1 }.into_response();
        });

        assert_eq!(
            captures,
            [
                "ingest.rejected:1|c|#reason:unauthorized",
                "ingest.rejected:1|c|#reason:backpressure",
            ]
        );
    }

    #[test]
    fn test_backpressure_carries_retry_after() {
        let response = BadIngestRequest::Backpressure { retry_after: 3 }.into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            response.headers().get("Retry-After").unwrap().to_str().unwrap(),
            "3"
        );
    }
}
