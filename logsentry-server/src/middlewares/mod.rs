use std::any::Any;

use axum::extract::Request;
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};

use crate::extractors::IngestedAt;
use crate::utils::ApiErrorResponse;

/// Stamps every request with its arrival time.
///
/// Handlers read the timestamp through the [`IngestedAt`] extractor.
pub async fn ingested_at(mut request: Request, next: Next) -> Response {
    request.extensions_mut().insert(IngestedAt::now());
    next.run(request).await
}

/// Turns a handler panic into a plain 500 response.
pub fn handle_panic(_error: Box<dyn Any + Send + 'static>) -> Response {
    let response = ApiErrorResponse::with_detail("internal server error");
    (StatusCode::INTERNAL_SERVER_ERROR, response).into_response()
}
