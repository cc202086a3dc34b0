//! Read-side summary endpoint for the dashboard.
//!
//! Serves the latest published aggregate snapshot; persistence is never
//! consulted for reads, so summary latency is independent of store health.

use axum::Json;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{MethodRouter, get};
use chrono::{DateTime, Utc};
use logsentry_metrics::ServiceSnapshot;
use logsentry_protocol::AppId;
use serde::Serialize;

use crate::service::ServiceState;
use crate::utils::ApiErrorResponse;

/// Header carrying the authenticated user, injected by the identity layer in
/// front of this server.
const USER_HEADER: &str = "x-user-id";

#[derive(Debug, Serialize)]
struct SummaryResponse {
    app_id: AppId,
    app_name: String,
    generated_at: Option<DateTime<Utc>>,
    total_count: u64,
    services: Vec<ServiceSnapshot>,
}

async fn handle(
    State(state): State<ServiceState>,
    Path(app_id): Path<AppId>,
    headers: HeaderMap,
) -> Response {
    let Some(user_id) = headers.get(USER_HEADER).and_then(|v| v.to_str().ok()) else {
        return (
            StatusCode::UNAUTHORIZED,
            ApiErrorResponse::with_detail("missing user identity"),
        )
            .into_response();
    };

    let app = match state.store().get_app(app_id).await {
        Ok(Some(app)) => app,
        Ok(None) => {
            return (
                StatusCode::NOT_FOUND,
                ApiErrorResponse::with_detail("unknown app"),
            )
                .into_response();
        }
        Err(_) => {
            return (
                StatusCode::SERVICE_UNAVAILABLE,
                ApiErrorResponse::with_detail("store unavailable"),
            )
                .into_response();
        }
    };

    if app.owner_id != user_id {
        return (
            StatusCode::FORBIDDEN,
            ApiErrorResponse::with_detail("not the owner of this app"),
        )
            .into_response();
    }

    let response = match state.snapshots().get(app_id) {
        Some(snapshot) => SummaryResponse {
            app_id,
            app_name: app.name,
            generated_at: Some(snapshot.generated_at),
            total_count: snapshot.total_count,
            services: snapshot.services.clone(),
        },
        // No records processed since startup.
        None => SummaryResponse {
            app_id,
            app_name: app.name,
            generated_at: None,
            total_count: 0,
            services: Vec::new(),
        },
    };

    Json(response).into_response()
}

pub fn route() -> MethodRouter<ServiceState> {
    get(handle)
}
