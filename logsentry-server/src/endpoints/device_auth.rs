//! Endpoints of the device-authorization handshake.
//!
//! The flow is modeled loosely on RFC 8628: the CLI calls `start` and opens a
//! browser; the authenticated user calls `complete`; the CLI polls `poll`
//! until the minted credentials come back exactly once.

use axum::Json;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{MethodRouter, get, post};
use logsentry_protocol::AppId;
use serde::{Deserialize, Serialize};

use crate::service::ServiceState;
use crate::services::device_auth::{
    CompleteDeviceSession, DeviceAuthError, PollDeviceSession, PollOutcome, StartDeviceSession,
};
use crate::utils::ApiErrorResponse;

fn error_response(error: DeviceAuthError) -> Response {
    let status = match &error {
        DeviceAuthError::InvalidAppName => StatusCode::BAD_REQUEST,
        DeviceAuthError::NotFound => StatusCode::NOT_FOUND,
        DeviceAuthError::Gone => StatusCode::GONE,
        DeviceAuthError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
        DeviceAuthError::StoreUnavailable => StatusCode::SERVICE_UNAVAILABLE,
    };

    (status, ApiErrorResponse::from_error(&error)).into_response()
}

#[derive(Debug, Deserialize)]
struct StartRequest {
    app_name: String,
    #[serde(default)]
    description: Option<String>,
}

#[derive(Debug, Serialize)]
struct StartResponse {
    device_code: String,
    user_code: String,
    verification_url: String,
    poll_interval_seconds: u64,
}

async fn start(
    State(state): State<ServiceState>,
    Json(request): Json<StartRequest>,
) -> Response {
    let message = StartDeviceSession {
        app_name: request.app_name,
        description: request.description.filter(|d| !d.is_empty()),
    };

    match state.device_auth().send(message).await {
        Ok(Ok(session)) => Json(StartResponse {
            device_code: session.device_code,
            user_code: session.user_code,
            verification_url: session.verification_url,
            poll_interval_seconds: session.poll_interval_seconds,
        })
        .into_response(),
        Ok(Err(error)) => error_response(error),
        Err(_) => error_response(DeviceAuthError::StoreUnavailable),
    }
}

#[derive(Debug, Deserialize)]
struct CompleteRequest {
    user_code: String,
    user_id: String,
}

#[derive(Debug, Serialize)]
struct CompleteResponse {
    app_id: AppId,
}

async fn complete(
    State(state): State<ServiceState>,
    Json(request): Json<CompleteRequest>,
) -> Response {
    let message = CompleteDeviceSession {
        user_code: request.user_code,
        user_id: request.user_id,
    };

    match state.device_auth().send(message).await {
        Ok(Ok(app_id)) => Json(CompleteResponse { app_id }).into_response(),
        Ok(Err(error)) => error_response(error),
        Err(_) => error_response(DeviceAuthError::StoreUnavailable),
    }
}

#[derive(Debug, Deserialize)]
struct PollQuery {
    device_code: String,
}

#[derive(Debug, Serialize)]
struct PollResponse {
    status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    api_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    app_id: Option<AppId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    dsn: Option<String>,
}

impl PollResponse {
    fn status_only(status: &'static str) -> Self {
        Self {
            status,
            api_key: None,
            app_id: None,
            dsn: None,
        }
    }
}

async fn poll(State(state): State<ServiceState>, Query(query): Query<PollQuery>) -> Response {
    let outcome = match state
        .device_auth()
        .send(PollDeviceSession {
            device_code: query.device_code,
        })
        .await
    {
        Ok(Ok(outcome)) => outcome,
        Ok(Err(error)) => return error_response(error),
        Err(_) => return error_response(DeviceAuthError::StoreUnavailable),
    };

    match outcome {
        PollOutcome::Pending => (
            StatusCode::ACCEPTED,
            Json(PollResponse::status_only("pending")),
        )
            .into_response(),
        PollOutcome::Ready { api_key, app_id } => Json(PollResponse {
            status: "ok",
            api_key: Some(api_key),
            app_id: Some(app_id),
            dsn: Some(state.config().public_url()),
        })
        .into_response(),
        PollOutcome::Expired => (
            StatusCode::GONE,
            Json(PollResponse::status_only("expired")),
        )
            .into_response(),
        PollOutcome::Consumed => (
            StatusCode::GONE,
            Json(PollResponse::status_only("consumed")),
        )
            .into_response(),
        PollOutcome::Denied => (
            StatusCode::GONE,
            Json(PollResponse::status_only("denied")),
        )
            .into_response(),
    }
}

pub fn start_route() -> MethodRouter<ServiceState> {
    post(start)
}

pub fn complete_route() -> MethodRouter<ServiceState> {
    post(complete)
}

pub fn poll_route() -> MethodRouter<ServiceState> {
    get(poll)
}
