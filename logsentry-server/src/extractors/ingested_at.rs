use std::convert::Infallible;

use axum::Extension;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use chrono::{DateTime, Utc};

/// The server-side arrival time stamped onto every ingested record.
///
/// Records carry the SDK's capture timestamp, but dedup and retention work
/// off the arrival time, which only the server may assign. The stamp is taken
/// once per request by the [`ingested_at`](crate::middlewares::ingested_at)
/// middleware so that all records of a batch share the same instant.
#[derive(Clone, Copy, Debug)]
pub struct IngestedAt(pub DateTime<Utc>);

impl IngestedAt {
    /// Stamps the current time.
    pub fn now() -> Self {
        Self(Utc::now())
    }

    /// Returns the inner UTC datetime.
    pub fn into_inner(self) -> DateTime<Utc> {
        self.0
    }
}

impl<S> FromRequestParts<S> for IngestedAt
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let Extension(ingested_at) = Extension::from_request_parts(parts, state)
            .await
            .expect("IngestedAt middleware is not configured");

        Ok(ingested_at)
    }
}
