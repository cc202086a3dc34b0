//! End-to-end tests driving the HTTP endpoints against an in-memory store.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use chrono::{DateTime, Utc};
use logsentry_auth::KeyHash;
use logsentry_config::Config;
use logsentry_protocol::AppId;
use logsentry_server::store::{
    App, DeviceSession, MemoryStore, PersistedLog, Store, StoreError,
};
use logsentry_server::{ServiceState, make_app};
use serde_json::{Value, json};
use tower::ServiceExt;

/// A store decorator whose log writes can be stalled to force backpressure.
#[derive(Debug)]
struct StallableStore {
    inner: MemoryStore,
    stalled: AtomicBool,
}

impl StallableStore {
    fn new() -> Self {
        Self {
            inner: MemoryStore::new(),
            stalled: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl Store for StallableStore {
    async fn create_app(&self, owner_id: &str, name: &str) -> Result<App, StoreError> {
        self.inner.create_app(owner_id, name).await
    }

    async fn get_app(&self, app_id: AppId) -> Result<Option<App>, StoreError> {
        self.inner.get_app(app_id).await
    }

    async fn insert_api_key(&self, app_id: AppId, key_hash: &KeyHash) -> Result<(), StoreError> {
        self.inner.insert_api_key(app_id, key_hash).await
    }

    async fn lookup_api_key(&self, key_hash: &KeyHash) -> Result<Option<AppId>, StoreError> {
        self.inner.lookup_api_key(key_hash).await
    }

    async fn revoke_api_key(&self, key_hash: &KeyHash) -> Result<bool, StoreError> {
        self.inner.revoke_api_key(key_hash).await
    }

    async fn insert_session(&self, session: &DeviceSession) -> Result<(), StoreError> {
        self.inner.insert_session(session).await
    }

    async fn session_by_device_code(
        &self,
        device_code: &str,
    ) -> Result<Option<DeviceSession>, StoreError> {
        self.inner.session_by_device_code(device_code).await
    }

    async fn session_by_user_code(
        &self,
        user_code: &str,
    ) -> Result<Option<DeviceSession>, StoreError> {
        self.inner.session_by_user_code(user_code).await
    }

    async fn update_session(&self, session: &DeviceSession) -> Result<(), StoreError> {
        self.inner.update_session(session).await
    }

    async fn take_session_key(&self, device_code: &str) -> Result<Option<String>, StoreError> {
        self.inner.take_session_key(device_code).await
    }

    async fn sweep_expired_sessions(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        self.inner.sweep_expired_sessions(now).await
    }

    async fn insert_logs(&self, logs: &[PersistedLog]) -> Result<(), StoreError> {
        while self.stalled.load(Ordering::Relaxed) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        self.inner.insert_logs(logs).await
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.inner.ping().await
    }
}

fn test_config(spool_dir: &tempfile::TempDir) -> Config {
    Config::from_json_value(json!({
        "device_auth": {"poll_interval_secs": 0, "janitor_interval_secs": 1},
        "processing": {
            "write_batch_max_records": 1,
            "write_batch_max_delay_secs": 1,
            "store_write_timeout_secs": 60,
        },
        "aggregates": {"snapshot_interval_secs": 1},
        "spool": {"path": spool_dir.path().join("spool.db")},
    }))
    .unwrap()
}

async fn setup() -> (Router, Arc<StallableStore>, tempfile::TempDir) {
    logsentry_log::init_test!();

    let dir = tempfile::tempdir().unwrap();
    let config = Arc::new(test_config(&dir));
    let store = Arc::new(StallableStore::new());

    let state = ServiceState::start_with_store(config, store.clone() as Arc<dyn Store>)
        .await
        .unwrap();

    (make_app(state), store, dir)
}

async fn call(app: &Router, request: Request<Body>) -> (StatusCode, Value, axum::http::HeaderMap) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let headers = response.headers().clone();

    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };

    (status, value, headers)
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::post(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::get(uri).body(Body::empty()).unwrap()
}

/// Walks the device flow and returns `(api_key, app_id)`.
async fn provision(app: &Router, app_name: &str, user_id: &str) -> (String, String) {
    let (status, start, _) = call(
        app,
        post_json("/sdk/device/start", json!({"app_name": app_name})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let device_code = start["device_code"].as_str().unwrap().to_owned();
    let user_code = start["user_code"].as_str().unwrap().to_owned();

    let (status, _, _) = call(
        app,
        post_json(
            "/sdk/device/complete",
            json!({"user_code": user_code, "user_id": user_id}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, poll, _) = call(
        app,
        get(&format!("/sdk/device/poll?device_code={device_code}")),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    (
        poll["api_key"].as_str().unwrap().to_owned(),
        poll["app_id"].as_str().unwrap().to_owned(),
    )
}

fn error_record(message: &str, service: &str) -> Value {
    json!({
        "timestamp": 1715000000,
        "level": "ERROR",
        "message": message,
        "service": service,
    })
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_device_flow() {
    let (app, _store, _dir) = setup().await;

    let (status, start, _) = call(
        &app,
        post_json("/sdk/device/start", json!({"app_name": "api"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(start["poll_interval_seconds"], 0);
    assert_eq!(start["user_code"].as_str().unwrap().len(), 8);
    let device_code = start["device_code"].as_str().unwrap().to_owned();
    let user_code = start["user_code"].as_str().unwrap().to_owned();

    // Pending before the user completes.
    let (status, poll, _) = call(
        &app,
        get(&format!("/sdk/device/poll?device_code={device_code}")),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(poll["status"], "pending");

    let (status, complete, _) = call(
        &app,
        post_json(
            "/sdk/device/complete",
            json!({"user_code": user_code, "user_id": "user-1"}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let app_id = complete["app_id"].as_str().unwrap().to_owned();

    // First poll returns the plaintext once.
    let (status, poll, _) = call(
        &app,
        get(&format!("/sdk/device/poll?device_code={device_code}")),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(poll["status"], "ok");
    assert_eq!(poll["app_id"].as_str().unwrap(), app_id);
    assert!(poll["api_key"].as_str().unwrap().starts_with("sk_"));
    assert!(poll["dsn"].as_str().is_some());

    // Immediately after, the credentials are consumed.
    let (status, poll, _) = call(
        &app,
        get(&format!("/sdk/device/poll?device_code={device_code}")),
    )
    .await;
    assert_eq!(status, StatusCode::GONE);
    assert_eq!(poll["status"], "consumed");

    // Unknown codes are a 404.
    let (status, _, _) = call(&app, get("/sdk/device/poll?device_code=NOPE")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_happy_path_ingest_and_summary() {
    let (app, store, _dir) = setup().await;
    let (api_key, app_id) = provision(&app, "svc-a", "user-1").await;

    let logs: Vec<_> = (0..5)
        .map(|_| error_record("db connection lost", "billing"))
        .collect();
    let (status, body, _) = call(
        &app,
        post_json("/ingest", json!({"api_key": api_key, "logs": logs})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["accepted"], 5);

    // Persistence is asynchronous behind the ack.
    for _ in 0..200 {
        if store.inner.log_count() == 5 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    let persisted = store.inner.logs();
    assert_eq!(persisted.len(), 5);
    assert_eq!(persisted[0].service, "billing");
    assert_eq!(persisted[0].fingerprint.as_str().len(), 64);
    assert!(persisted.iter().all(|l| l.fingerprint == persisted[0].fingerprint));

    // The summary reflects the published snapshot.
    let mut summary = Value::Null;
    for _ in 0..200 {
        let (status, body, _) = call(
            &app,
            Request::get(format!("/summary/{app_id}"))
                .header("x-user-id", "user-1")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        if body["total_count"] == 5 {
            summary = body;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    assert_eq!(summary["app_name"], "svc-a");
    let services = summary["services"].as_array().unwrap();
    assert_eq!(services.len(), 1);
    assert_eq!(services[0]["service"], "billing");
    assert_eq!(services[0]["severity_distribution"]["ERROR"], 5);
    assert_eq!(
        services[0]["most_common_error"]["fingerprint"],
        persisted[0].fingerprint.as_str()
    );
    assert_eq!(services[0]["recent_errors"].as_array().unwrap().len(), 5);

    // Authorization of the summary endpoint.
    let (status, _, _) = call(&app, get(&format!("/summary/{app_id}"))).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _, _) = call(
        &app,
        Request::get(format!("/summary/{app_id}"))
            .header("x-user-id", "someone-else")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_ingest_rejections() {
    let (app, store, _dir) = setup().await;
    let (api_key, _) = provision(&app, "svc-a", "user-1").await;

    // Unknown key.
    let (status, _, _) = call(
        &app,
        post_json(
            "/ingest",
            json!({
                "api_key": "sk_00000000000000000000000000000000",
                "logs": [error_record("boom", "api")],
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(store.inner.log_count(), 0);

    // Malformed key format.
    let (status, _, _) = call(
        &app,
        post_json("/ingest", json!({"api_key": "not-a-key", "logs": []})),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    // Level aliases outside the canonical enum are schema violations.
    let (status, _, _) = call(
        &app,
        post_json(
            "/ingest",
            json!({
                "api_key": api_key,
                "logs": [{"timestamp": 1715000000, "level": "WARN", "message": "boom"}],
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    // Batches over the record limit.
    let logs: Vec<_> = (0..1001).map(|_| error_record("boom", "api")).collect();
    let (status, _, _) = call(
        &app,
        post_json("/ingest", json!({"api_key": api_key, "logs": logs})),
    )
    .await;
    assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);

    // Malformed envelope.
    let request = Request::post("/ingest")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from("{not json"))
        .unwrap();
    let (status, _, _) = call(&app, request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    // The empty batch is accepted.
    let (status, body, _) = call(
        &app,
        post_json("/ingest", json!({"api_key": api_key, "logs": []})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["accepted"], 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_backpressure() {
    let (app, store, _dir) = setup().await;
    let (api_key, _) = provision(&app, "svc-a", "user-1").await;

    // Stall the store so the processor cannot drain its channel.
    store.stalled.store(true, Ordering::Relaxed);

    let logs: Vec<_> = (0..1000).map(|_| error_record("boom", "api")).collect();
    let (status, _, _) = call(
        &app,
        post_json("/ingest", json!({"api_key": api_key, "logs": logs.clone()})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    // Give the processor a moment to pull its first round and block on the
    // stalled write, leaving the channel mostly full.
    tokio::time::sleep(Duration::from_millis(200)).await;

    let (status, _, headers) = call(
        &app,
        post_json("/ingest", json!({"api_key": api_key, "logs": logs.clone()})),
    )
    .await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    let retry_after: u64 = headers
        .get("Retry-After")
        .expect("backpressure must carry Retry-After")
        .to_str()
        .unwrap()
        .parse()
        .unwrap();
    assert!(retry_after >= 1);

    // Once the store recovers and the channel drains, the retry succeeds.
    store.stalled.store(false, Ordering::Relaxed);
    let mut accepted = false;
    for _ in 0..300 {
        tokio::time::sleep(Duration::from_millis(20)).await;
        let (status, _, _) = call(
            &app,
            post_json("/ingest", json!({"api_key": api_key, "logs": logs.clone()})),
        )
        .await;
        if status == StatusCode::OK {
            accepted = true;
            break;
        }
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }
    assert!(accepted, "backpressure never cleared after recovery");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_health_endpoints() {
    let (app, _store, _dir) = setup().await;

    let (status, body, _) = call(&app, get("/api/logsentry/healthcheck/live")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["is_healthy"], true);

    let (status, _, _) = call(&app, get("/api/logsentry/healthcheck/ready")).await;
    assert_eq!(status, StatusCode::OK);
}
