use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::time::Instant;

use crate::statsd::{ServerCounters, ServerTimers};
use crate::store::PersistedLog;

/// An error produced by the external classifier.
#[derive(Debug, thiserror::Error)]
pub enum ClassifierError {
    /// The HTTP call failed.
    #[error("classifier request failed")]
    Http(#[from] reqwest::Error),

    /// The classifier returned a mismatched number of results.
    #[error("classifier returned {got} results for {want} records")]
    LengthMismatch {
        /// Number of results in the response.
        got: usize,
        /// Number of records in the request.
        want: usize,
    },
}

/// The external classification function.
///
/// Implementations assign an optional category to every record of a batch.
/// Classification is best-effort: the processor never blocks persistence on
/// it, and any failure degrades to unclassified pass-through.
#[async_trait]
pub trait Classify: Send + Sync + fmt::Debug {
    /// Classifies a batch of records, one result per record.
    async fn classify(
        &self,
        records: &[PersistedLog],
    ) -> Result<Vec<Option<String>>, ClassifierError>;
}

#[derive(Serialize)]
struct ClassifyRequestRecord<'a> {
    level: &'a str,
    service: &'a str,
    message: &'a str,
}

#[derive(Serialize)]
struct ClassifyRequest<'a> {
    logs: Vec<ClassifyRequestRecord<'a>>,
}

#[derive(Deserialize)]
struct ClassifyResponse {
    classifications: Vec<Option<String>>,
}

/// [`Classify`] implementation talking to the classifier service over HTTP.
#[derive(Debug)]
pub struct HttpClassifier {
    client: reqwest::Client,
    url: String,
}

impl HttpClassifier {
    /// Creates a classifier client for the given base URL.
    pub fn new(base_url: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: format!("{}/classify", base_url.trim_end_matches('/')),
        }
    }
}

#[async_trait]
impl Classify for HttpClassifier {
    async fn classify(
        &self,
        records: &[PersistedLog],
    ) -> Result<Vec<Option<String>>, ClassifierError> {
        let request = ClassifyRequest {
            logs: records
                .iter()
                .map(|log| ClassifyRequestRecord {
                    level: log.level.name(),
                    service: &log.service,
                    message: &log.message,
                })
                .collect(),
        };

        let response: ClassifyResponse = self
            .client
            .post(&self.url)
            .json(&request)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        if response.classifications.len() != records.len() {
            return Err(ClassifierError::LengthMismatch {
                got: response.classifications.len(),
                want: records.len(),
            });
        }

        Ok(response.classifications)
    }
}

/// Bounds and times classifier calls.
///
/// The semaphore is global across all per-app processors to cap the pressure
/// on the external service; the timeout turns a slow classifier into an
/// unclassified pass-through instead of a stalled pipeline.
#[derive(Clone, Debug)]
pub struct ClassifierHandle {
    inner: Arc<dyn Classify>,
    semaphore: Arc<Semaphore>,
    timeout: Duration,
}

impl ClassifierHandle {
    /// Wraps a classifier with a concurrency bound and a per-call timeout.
    pub fn new(inner: Arc<dyn Classify>, concurrency: usize, timeout: Duration) -> Self {
        Self {
            inner,
            semaphore: Arc::new(Semaphore::new(concurrency)),
            timeout,
        }
    }

    /// Classifies a batch, returning `None` on any failure or timeout.
    pub async fn classify(&self, records: &[PersistedLog]) -> Option<Vec<Option<String>>> {
        let Ok(_permit) = self.semaphore.acquire().await else {
            return None;
        };

        let started = Instant::now();
        let result = tokio::time::timeout(self.timeout, self.inner.classify(records)).await;
        logsentry_statsd::metric!(timer(ServerTimers::ClassifierDuration) = started.elapsed());

        match result {
            Ok(Ok(classifications)) => Some(classifications),
            Ok(Err(error)) => {
                logsentry_statsd::metric!(counter(ServerCounters::ClassifierFailed) += 1);
                logsentry_log::warn!(
                    error = &error as &dyn std::error::Error,
                    "classifier call failed, records pass through unclassified"
                );
                None
            }
            Err(_) => {
                logsentry_statsd::metric!(counter(ServerCounters::ClassifierFailed) += 1);
                logsentry_log::warn!("classifier call timed out, records pass through unclassified");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use logsentry_protocol::{AppId, Attributes, Fingerprint, LogLevel};
    use uuid::Uuid;

    use super::*;

    fn log(message: &str) -> PersistedLog {
        let app_id = AppId::random();
        PersistedLog {
            id: Uuid::new_v4(),
            app_id,
            timestamp: Utc::now(),
            ingested_at: Utc::now(),
            level: LogLevel::Error,
            service: "api".to_owned(),
            message: message.to_owned(),
            attributes: Attributes::new(),
            fingerprint: Fingerprint::compute(app_id, LogLevel::Error, message, "api"),
            classification: None,
        }
    }

    #[derive(Debug)]
    struct SlowClassifier;

    #[async_trait]
    impl Classify for SlowClassifier {
        async fn classify(
            &self,
            records: &[PersistedLog],
        ) -> Result<Vec<Option<String>>, ClassifierError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(vec![None; records.len()])
        }
    }

    #[derive(Debug)]
    struct StaticClassifier(&'static str);

    #[async_trait]
    impl Classify for StaticClassifier {
        async fn classify(
            &self,
            records: &[PersistedLog],
        ) -> Result<Vec<Option<String>>, ClassifierError> {
            Ok(vec![Some(self.0.to_owned()); records.len()])
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_degrades_to_unclassified() {
        let handle = ClassifierHandle::new(
            Arc::new(SlowClassifier),
            16,
            Duration::from_secs(2),
        );

        assert_eq!(handle.classify(&[log("boom")]).await, None);
    }

    #[tokio::test]
    async fn test_successful_classification() {
        let handle = ClassifierHandle::new(
            Arc::new(StaticClassifier("Database Error")),
            16,
            Duration::from_secs(2),
        );

        let result = handle.classify(&[log("boom"), log("crash")]).await.unwrap();
        assert_eq!(result.len(), 2);
        assert_eq!(result[0].as_deref(), Some("Database Error"));
    }
}
