use std::sync::Arc;
use std::time::Duration;

use logsentry_protocol::LogRecord;
use rand::Rng;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::config::SdkConfig;

/// Base delay of the retry backoff.
const BACKOFF_BASE: Duration = Duration::from_millis(500);

/// Upper bound of the retry backoff.
const BACKOFF_CAP: Duration = Duration::from_secs(30);

/// Consecutive failures after which a batch is dropped.
const MAX_FAILURES: u32 = 10;

/// Timeout of a single flush attempt.
const ATTEMPT_TIMEOUT: Duration = Duration::from_secs(10);

/// Wall-clock budget of the final drain on shutdown.
const DRAIN_BUDGET: Duration = Duration::from_secs(5);

/// Control messages from the host to the flusher task.
#[derive(Debug)]
pub enum Control {
    /// Flush buffered records now and acknowledge.
    Flush(std::sync::mpsc::SyncSender<()>),
    /// Final drain, then exit.
    Shutdown(std::sync::mpsc::SyncSender<()>),
}

#[derive(Serialize)]
struct IngestEnvelope<'a> {
    api_key: &'a str,
    logs: &'a [LogRecord],
}

/// Disposition of one delivery attempt.
enum Attempt {
    /// `2xx`: the batch is delivered.
    Delivered,
    /// `4xx` other than 413/429: a client bug will not be fixed by retry.
    Rejected(u16),
    /// `413`: the batch must be split.
    TooLarge,
    /// `401`: the key is bad; stop flushing entirely.
    Unauthorized,
    /// `429`, `5xx` or a network error: retry with backoff.
    Retryable,
}

/// The background task owning the network connection to the server.
///
/// It wakes when a full batch accumulates, when the oldest buffered record
/// reaches the flush interval, on an explicit flush, and on shutdown. Failed
/// batches go back to the head of the buffer and are retried with full-jitter
/// backoff; delivery remains responsive to flush and shutdown requests while
/// a backoff is pending.
pub struct Flusher {
    config: SdkConfig,
    buffer: Arc<crate::buffer::LogBuffer>,
    client: reqwest::Client,
    control_rx: mpsc::UnboundedReceiver<Control>,
    consecutive_failures: u32,
    next_attempt: Option<Instant>,
    /// Set after a 401; the server told us our credentials are bad.
    disabled: bool,
}

impl Flusher {
    /// Creates the flusher; call [`run`](Self::run) on a runtime to start it.
    pub fn new(
        config: SdkConfig,
        buffer: Arc<crate::buffer::LogBuffer>,
        control_rx: mpsc::UnboundedReceiver<Control>,
    ) -> Self {
        let client = reqwest::Client::builder()
            .timeout(ATTEMPT_TIMEOUT)
            .build()
            .unwrap_or_default();

        Self {
            config,
            buffer,
            client,
            control_rx,
            consecutive_failures: 0,
            next_attempt: None,
            disabled: false,
        }
    }

    /// Runs until shutdown is requested or all client handles are gone.
    pub async fn run(mut self) {
        loop {
            // While a backoff is pending, the retry deadline is the only
            // timer; otherwise wake when the oldest record comes of age.
            let deadline = match self.next_attempt {
                Some(at) => Some(at),
                None => self
                    .buffer
                    .age_deadline(self.config.flush_interval)
                    .map(Instant::from_std),
            };

            tokio::select! {
                biased;

                control = self.control_rx.recv() => match control {
                    Some(Control::Flush(ack)) => {
                        self.pump(true).await;
                        ack.send(()).ok();
                    }
                    Some(Control::Shutdown(ack)) => {
                        self.final_drain().await;
                        ack.send(()).ok();
                        return;
                    }
                    None => {
                        self.final_drain().await;
                        return;
                    }
                },
                _ = self.buffer.batch_ready.notified(), if self.next_attempt.is_none() => {
                    self.pump(false).await;
                }
                _ = maybe_sleep_until(deadline) => {
                    self.pump(false).await;
                }
            }
        }
    }

    /// Sends batches as long as the buffer yields them.
    ///
    /// Stops on the first retryable failure, leaving the batch at the head of
    /// the buffer and a backoff deadline set.
    async fn pump(&mut self, force: bool) {
        if self.disabled {
            return;
        }

        if let Some(at) = self.next_attempt {
            if Instant::now() < at {
                return;
            }
            self.next_attempt = None;
        }

        while let Some(batch) = self.buffer.take_batch(self.config.flush_interval, force) {
            match self.send(&batch).await {
                Attempt::Delivered => {
                    self.consecutive_failures = 0;
                }
                Attempt::Rejected(status) => {
                    tracing::warn!(
                        target: "logsentry_sdk",
                        "server rejected batch with status {status}, dropping {} records",
                        batch.len()
                    );
                    self.consecutive_failures = 0;
                }
                Attempt::Unauthorized => {
                    tracing::error!(
                        target: "logsentry_sdk",
                        "server rejected the API key, log forwarding stopped"
                    );
                    self.disabled = true;
                    return;
                }
                Attempt::TooLarge => {
                    self.send_halves(batch).await;
                }
                Attempt::Retryable => {
                    self.consecutive_failures += 1;

                    if self.consecutive_failures >= MAX_FAILURES {
                        tracing::error!(
                            target: "logsentry_sdk",
                            "dropping batch of {} records after {MAX_FAILURES} failed deliveries",
                            batch.len()
                        );
                        self.consecutive_failures = 0;
                        continue;
                    }

                    self.buffer.reinsert_front(batch);
                    self.next_attempt = Some(Instant::now() + self.backoff_delay());
                    return;
                }
            }
        }
    }

    /// Splits an oversize batch in half and retries each half once.
    async fn send_halves(&mut self, mut batch: Vec<LogRecord>) {
        if batch.len() < 2 {
            tracing::warn!(
                target: "logsentry_sdk",
                "dropping a single record that exceeds the server payload limit"
            );
            return;
        }

        let second = batch.split_off(batch.len() / 2);
        for half in [batch, second] {
            match self.send(&half).await {
                Attempt::Delivered => (),
                Attempt::Unauthorized => {
                    self.disabled = true;
                    return;
                }
                Attempt::Retryable => self.buffer.reinsert_front(half),
                _ => tracing::warn!(
                    target: "logsentry_sdk",
                    "dropping {} records rejected after batch split",
                    half.len()
                ),
            }
        }
    }

    /// Full jitter: a uniform delay below the exponential bound.
    fn backoff_delay(&self) -> Duration {
        let exp = self.consecutive_failures.saturating_sub(1).min(16);
        let bound = BACKOFF_BASE
            .saturating_mul(1u32 << exp)
            .min(BACKOFF_CAP)
            .as_millis() as u64;
        Duration::from_millis(rand::thread_rng().gen_range(0..=bound))
    }

    async fn send(&self, batch: &[LogRecord]) -> Attempt {
        let envelope = IngestEnvelope {
            api_key: &self.config.api_key,
            logs: batch,
        };

        let response = self
            .client
            .post(self.config.ingest_url())
            .json(&envelope)
            .send()
            .await;

        match response {
            Ok(response) => match response.status().as_u16() {
                200..=299 => Attempt::Delivered,
                401 => Attempt::Unauthorized,
                413 => Attempt::TooLarge,
                429 => Attempt::Retryable,
                status @ 400..=499 => Attempt::Rejected(status),
                _ => Attempt::Retryable,
            },
            Err(_) => Attempt::Retryable,
        }
    }

    /// One final flush with a hard wall-clock budget; undelivered records are
    /// dropped.
    async fn final_drain(&mut self) {
        if self.disabled || self.buffer.is_empty() {
            return;
        }

        let drain = async {
            while let Some(batch) = self.buffer.take_batch(Duration::ZERO, true) {
                match self.send(&batch).await {
                    Attempt::Delivered | Attempt::Rejected(_) => (),
                    // No budget for retries on the way out.
                    _ => {
                        self.buffer.reinsert_front(batch);
                        break;
                    }
                }
            }
        };

        tokio::time::timeout(DRAIN_BUDGET, drain).await.ok();

        let undelivered = self.buffer.len();
        if undelivered > 0 {
            tracing::error!(
                target: "logsentry_sdk",
                "shutdown drain incomplete, dropping {undelivered} buffered records"
            );
        }
    }
}

/// Sleeps until the given deadline, or forever when there is none.
async fn maybe_sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
