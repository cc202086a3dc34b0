//! In-process SDK streaming structured logs to a LogSentry server.
//!
//! [`init`] resolves credentials, starts the background flusher and installs
//! the log tap. From then on every `tracing` event at or above the configured
//! level is copied into a bounded buffer and shipped to the server in
//! batches:
//!
//! ```no_run
//! let _client = logsentry_sdk::init(logsentry_sdk::Options::default())?;
//!
//! tracing::error!(service = "billing", "payment failed");
//! # Ok::<(), logsentry_sdk::InitError>(())
//! ```
//!
//! Credentials are provisioned out-of-band by the `logsentry-sdk init`
//! command, which walks the device-authorization flow against the server and
//! stores the minted API key in `~/.logsentry/credentials.json`.

#![warn(missing_docs)]

use std::sync::Arc;
use std::time::Duration;

use logsentry_protocol::{LogLevel, LogRecord};
use parking_lot::RwLock;
use tokio::sync::mpsc;

mod buffer;
pub mod cli;
mod config;
mod credentials;
mod flusher;
mod layer;

pub use crate::config::{DEFAULT_DSN, InitError, Options, SdkConfig};
pub use crate::credentials::{Credentials, default_path as credentials_path};
pub use crate::layer::LogSentryLayer;

use crate::buffer::LogBuffer;
use crate::flusher::{Control, Flusher};

/// The globally installed client read by the log tap.
static GLOBAL_CLIENT: RwLock<Option<Arc<ClientInner>>> = RwLock::new(None);

pub(crate) fn current_client() -> Option<Arc<ClientInner>> {
    GLOBAL_CLIENT.read().clone()
}

pub(crate) struct ClientInner {
    config: SdkConfig,
    buffer: Arc<LogBuffer>,
    control_tx: mpsc::UnboundedSender<Control>,
}

impl ClientInner {
    pub(crate) fn max_level(&self) -> tracing::Level {
        self.config.max_level
    }

    pub(crate) fn enqueue(&self, record: LogRecord) {
        self.buffer.push(record);
    }
}

/// A handle to the running SDK.
///
/// Cloning is cheap; all clones talk to the same buffer and flusher. When the
/// last handle and the global registration are gone, the flusher performs a
/// final drain and exits.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    /// Starts a client without registering it globally.
    ///
    /// Prefer [`init`]; this exists for tests and embedders that install the
    /// [`LogSentryLayer`] and manage the handle themselves.
    pub fn start(config: SdkConfig) -> Self {
        let buffer = Arc::new(LogBuffer::new(config.max_buffer, config.batch_size));
        let (control_tx, control_rx) = mpsc::unbounded_channel();

        spawn_flusher(Flusher::new(config.clone(), buffer.clone(), control_rx));

        Self {
            inner: Arc::new(ClientInner {
                config,
                buffer,
                control_tx,
            }),
        }
    }

    /// Enqueues a record directly, bypassing the log tap.
    ///
    /// This is the only way to submit `CRITICAL` records, which have no
    /// `tracing` counterpart.
    pub fn capture_record(&self, mut record: LogRecord) {
        record.truncate_message();
        self.inner.enqueue(record);
    }

    /// Convenience for capturing a single message at a given level.
    pub fn capture_message(&self, level: LogLevel, message: impl Into<String>) {
        self.capture_record(LogRecord::new(level, message));
    }

    /// Flushes buffered records and waits for the attempt to finish.
    ///
    /// Returns `false` when the flusher did not acknowledge within the
    /// timeout. Blocks the calling thread; do not call from async contexts.
    pub fn flush(&self, timeout: Duration) -> bool {
        let (ack_tx, ack_rx) = std::sync::mpsc::sync_channel(1);
        if self.inner.control_tx.send(Control::Flush(ack_tx)).is_err() {
            return false;
        }

        ack_rx.recv_timeout(timeout).is_ok()
    }

    /// Signals the flusher to drain and waits for it to exit.
    ///
    /// The flusher attempts one final delivery within its drain budget;
    /// records still undelivered afterwards are dropped. Returns `false`
    /// when the drain did not finish within `timeout`.
    pub fn shutdown(self, timeout: Duration) -> bool {
        // Deregister first so the tap stops feeding the buffer.
        let mut global = GLOBAL_CLIENT.write();
        if global
            .as_ref()
            .is_some_and(|current| Arc::ptr_eq(current, &self.inner))
        {
            *global = None;
        }
        drop(global);

        let (ack_tx, ack_rx) = std::sync::mpsc::sync_channel(1);
        if self.inner.control_tx.send(Control::Shutdown(ack_tx)).is_err() {
            return true; // already stopped
        }

        ack_rx.recv_timeout(timeout).is_ok()
    }

    /// Number of records currently buffered.
    pub fn buffered(&self) -> usize {
        self.inner.buffer.len()
    }
}

/// Initializes the SDK and registers it globally.
///
/// Re-initialization is supported: the new configuration replaces the old
/// one, the previous buffer is flushed on a best-effort basis, and at most
/// one log tap is ever installed.
pub fn init(options: Options) -> Result<Client, InitError> {
    let config = SdkConfig::resolve(options)?;
    let client = Client::start(config);

    let previous = GLOBAL_CLIENT.write().replace(client.inner.clone());
    if let Some(previous) = previous {
        // Best-effort: ask the old flusher to drain without waiting.
        let (ack_tx, _ack_rx) = std::sync::mpsc::sync_channel(1);
        previous.control_tx.send(Control::Shutdown(ack_tx)).ok();
    }

    install_tap();
    Ok(client)
}

/// Registers the log tap with the global subscriber.
///
/// When the host already installed a subscriber this is a no-op; the host
/// composes [`LogSentryLayer`] into its own registry instead. Either way the
/// process ends up with exactly one tap, since the layer resolves the current
/// client on every event.
fn install_tap() {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    tracing_subscriber::registry()
        .with(LogSentryLayer::new())
        .try_init()
        .ok();
}

/// Runs the flusher on the host runtime, or on a dedicated daemon thread
/// when no tokio runtime is active.
fn spawn_flusher(flusher: Flusher) {
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(flusher.run());
        }
        Err(_) => {
            std::thread::Builder::new()
                .name("logsentry-flusher".into())
                .spawn(move || {
                    let runtime = tokio::runtime::Builder::new_current_thread()
                        .enable_all()
                        .build()
                        .expect("failed to build the flusher runtime");
                    runtime.block_on(flusher.run());
                })
                .expect("failed to spawn the flusher thread");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;
    use std::sync::Mutex;

    use axum::Json;
    use axum::extract::State;
    use axum::http::StatusCode;
    use axum::routing::post;
    use logsentry_protocol::LogLevel;
    use serde_json::Value;

    use super::*;

    #[derive(Clone, Default)]
    struct Received {
        envelopes: Arc<Mutex<Vec<Value>>>,
        /// Number of requests answered with 503 before accepting.
        fail_first: Arc<Mutex<u32>>,
    }

    async fn ingest(
        State(received): State<Received>,
        Json(envelope): Json<Value>,
    ) -> (StatusCode, Json<Value>) {
        {
            let mut fail = received.fail_first.lock().unwrap();
            if *fail > 0 {
                *fail -= 1;
                return (
                    StatusCode::SERVICE_UNAVAILABLE,
                    Json(serde_json::json!({"detail": "backpressure"})),
                );
            }
        }

        let accepted = envelope["logs"].as_array().map_or(0, Vec::len);
        received.envelopes.lock().unwrap().push(envelope);
        (
            StatusCode::OK,
            Json(serde_json::json!({"accepted": accepted})),
        )
    }

    async fn spawn_server(received: Received) -> SocketAddr {
        let app = axum::Router::new()
            .route("/ingest", post(ingest))
            .with_state(received);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.ok();
        });
        addr
    }

    fn config(addr: SocketAddr, batch_size: usize) -> SdkConfig {
        SdkConfig::resolve(Options {
            api_key: Some("sk_0123456789abcdef0123456789abcdef".to_owned()),
            dsn: Some(format!("http://{addr}")),
            batch_size: Some(batch_size),
            flush_interval: Some(Duration::from_secs(60)),
            ..Default::default()
        })
        .unwrap()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_batch_is_flushed_when_full() {
        let received = Received::default();
        let addr = spawn_server(received.clone()).await;

        let client = Client::start(config(addr, 3));
        for i in 0..3 {
            client.capture_message(LogLevel::Error, format!("boom {i}"));
        }

        for _ in 0..100 {
            if !received.envelopes.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let envelopes = received.envelopes.lock().unwrap();
        assert_eq!(envelopes.len(), 1);
        assert_eq!(envelopes[0]["logs"].as_array().unwrap().len(), 3);
        assert_eq!(envelopes[0]["logs"][0]["level"], "ERROR");
        assert_eq!(envelopes[0]["logs"][0]["message"], "boom 0");
        assert!(envelopes[0]["api_key"].as_str().unwrap().starts_with("sk_"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_explicit_flush_sends_partial_batch() {
        let received = Received::default();
        let addr = spawn_server(received.clone()).await;

        let client = Client::start(config(addr, 50));
        client.capture_message(LogLevel::Warning, "just one");

        let flushed = tokio::task::spawn_blocking({
            let client = client.clone();
            move || client.flush(Duration::from_secs(5))
        })
        .await
        .unwrap();
        assert!(flushed);

        let envelopes = received.envelopes.lock().unwrap();
        assert_eq!(envelopes.len(), 1);
        assert_eq!(envelopes[0]["logs"][0]["message"], "just one");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_retry_after_server_error() {
        let received = Received::default();
        *received.fail_first.lock().unwrap() = 2;
        let addr = spawn_server(received.clone()).await;

        let client = Client::start(config(addr, 2));
        client.capture_message(LogLevel::Error, "first");
        client.capture_message(LogLevel::Error, "second");

        // Two failures back off for at most a second each before the third
        // attempt succeeds.
        for _ in 0..300 {
            if !received.envelopes.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let envelopes = received.envelopes.lock().unwrap();
        assert_eq!(envelopes.len(), 1);
        assert_eq!(envelopes[0]["logs"].as_array().unwrap().len(), 2);
        assert_eq!(envelopes[0]["logs"][0]["message"], "first");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_shutdown_drains_buffer() {
        let received = Received::default();
        let addr = spawn_server(received.clone()).await;

        let client = Client::start(config(addr, 50));
        for i in 0..30 {
            client.capture_message(LogLevel::Info, format!("pending {i}"));
        }

        let drained = tokio::task::spawn_blocking(move || {
            client.shutdown(Duration::from_secs(6))
        })
        .await
        .unwrap();
        assert!(drained);

        let envelopes = received.envelopes.lock().unwrap();
        let total: usize = envelopes
            .iter()
            .map(|e| e["logs"].as_array().unwrap().len())
            .sum();
        assert_eq!(total, 30);
    }
}
