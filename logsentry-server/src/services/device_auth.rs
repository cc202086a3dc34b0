use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use logsentry_auth::{ApiKey, KeyHasher, generate_device_code, generate_user_code};
use logsentry_config::Config;
use logsentry_protocol::AppId;
use logsentry_system::{
    AsyncResponse, FromMessage, Interface, NoResponse, Receiver, Recipient, Sender, Service,
};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::services::key_cache::InvalidateKeys;
use crate::statsd::ServerCounters;
use crate::store::{DeviceSession, SessionStatus, Store};

/// Maximum accepted length of an app name.
const MAX_APP_NAME_LEN: usize = 100;

/// An error produced by the device-authorization flow.
#[derive(Clone, Debug, thiserror::Error, PartialEq, Eq)]
pub enum DeviceAuthError {
    /// The app name is missing or too long.
    #[error("invalid app name")]
    InvalidAppName,

    /// No session matches the given code.
    #[error("unknown device session")]
    NotFound,

    /// The session exists but can no longer be completed.
    #[error("device session is gone")]
    Gone,

    /// The device code polled faster than the allowed interval.
    #[error("polled too frequently")]
    RateLimited,

    /// The store failed or timed out.
    #[error("device session store unavailable")]
    StoreUnavailable,
}

/// Starts a new device-authorization session.
#[derive(Debug)]
pub struct StartDeviceSession {
    /// Name of the app to bind.
    pub app_name: String,
    /// Optional app description.
    pub description: Option<String>,
}

/// The response to [`StartDeviceSession`].
#[derive(Clone, Debug)]
pub struct StartedSession {
    /// Opaque code identifying the session to the CLI.
    pub device_code: String,
    /// Short code the user enters in the browser.
    pub user_code: String,
    /// URL the user opens to authorize the session.
    pub verification_url: String,
    /// Minimum seconds between polls.
    pub poll_interval_seconds: u64,
}

/// Completes a session after the user authenticated in the browser.
#[derive(Debug)]
pub struct CompleteDeviceSession {
    /// The user code shown in the CLI.
    pub user_code: String,
    /// The authenticated user.
    pub user_id: String,
}

/// Polls a session for issued credentials.
#[derive(Debug)]
pub struct PollDeviceSession {
    /// The device code returned by start.
    pub device_code: String,
}

/// The observable state of a polled session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PollOutcome {
    /// The user has not completed authorization yet.
    Pending,
    /// Credentials are ready; this is the single read of the plaintext.
    Ready {
        /// The minted API key.
        api_key: String,
        /// The bound app.
        app_id: AppId,
    },
    /// The session expired before completion.
    Expired,
    /// The credentials were already read once.
    Consumed,
    /// The user rejected the session.
    Denied,
}

/// Service interface of the device-authorization flow.
#[derive(Debug)]
pub enum DeviceAuth {
    /// Starts a session.
    Start(
        StartDeviceSession,
        Sender<Result<StartedSession, DeviceAuthError>>,
    ),
    /// Completes a session.
    Complete(
        CompleteDeviceSession,
        Sender<Result<AppId, DeviceAuthError>>,
    ),
    /// Polls a session.
    Poll(
        PollDeviceSession,
        Sender<Result<PollOutcome, DeviceAuthError>>,
    ),
}

impl Interface for DeviceAuth {}

impl FromMessage<StartDeviceSession> for DeviceAuth {
    type Response = AsyncResponse<Result<StartedSession, DeviceAuthError>>;

    fn from_message(
        message: StartDeviceSession,
        sender: Sender<Result<StartedSession, DeviceAuthError>>,
    ) -> Self {
        Self::Start(message, sender)
    }
}

impl FromMessage<CompleteDeviceSession> for DeviceAuth {
    type Response = AsyncResponse<Result<AppId, DeviceAuthError>>;

    fn from_message(
        message: CompleteDeviceSession,
        sender: Sender<Result<AppId, DeviceAuthError>>,
    ) -> Self {
        Self::Complete(message, sender)
    }
}

impl FromMessage<PollDeviceSession> for DeviceAuth {
    type Response = AsyncResponse<Result<PollOutcome, DeviceAuthError>>;

    fn from_message(
        message: PollDeviceSession,
        sender: Sender<Result<PollOutcome, DeviceAuthError>>,
    ) -> Self {
        Self::Poll(message, sender)
    }
}

/// Service implementing the [`DeviceAuth`] interface.
///
/// All session mutations run through this single task, which keeps the
/// monotone status transitions trivially race-free. A janitor tick marks
/// overdue sessions as expired and prunes the poll rate-limit table.
pub struct DeviceAuthService {
    config: Arc<Config>,
    store: Arc<dyn Store>,
    hasher: Arc<KeyHasher>,
    key_cache: Recipient<InvalidateKeys, NoResponse>,
    last_poll: HashMap<String, Instant>,
}

impl DeviceAuthService {
    /// Creates the service.
    pub fn new(
        config: Arc<Config>,
        store: Arc<dyn Store>,
        hasher: Arc<KeyHasher>,
        key_cache: Recipient<InvalidateKeys, NoResponse>,
    ) -> Self {
        Self {
            config,
            store,
            hasher,
            key_cache,
            last_poll: HashMap::new(),
        }
    }

    async fn with_timeout<T>(
        &self,
        fut: impl Future<Output = Result<T, crate::store::StoreError>>,
    ) -> Result<T, DeviceAuthError> {
        match tokio::time::timeout(self.config.device_session_op_timeout(), fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(error)) => {
                logsentry_log::error!(
                    error = &error as &dyn std::error::Error,
                    "device session store operation failed"
                );
                Err(DeviceAuthError::StoreUnavailable)
            }
            Err(_) => Err(DeviceAuthError::StoreUnavailable),
        }
    }

    async fn handle_start(
        &self,
        message: StartDeviceSession,
    ) -> Result<StartedSession, DeviceAuthError> {
        let app_name = message.app_name.trim();
        if app_name.is_empty() || app_name.len() > MAX_APP_NAME_LEN {
            return Err(DeviceAuthError::InvalidAppName);
        }

        let now = Utc::now();
        let ttl = chrono::Duration::from_std(self.config.device_session_ttl())
            .unwrap_or_else(|_| chrono::Duration::minutes(10));

        let session = DeviceSession {
            id: Uuid::new_v4(),
            device_code: generate_device_code(),
            user_code: generate_user_code(),
            status: SessionStatus::Pending,
            app_name: app_name.to_owned(),
            description: message.description,
            user_id: None,
            app_id: None,
            api_key_plaintext: None,
            expires_at: now + ttl,
            created_at: now,
            approved_at: None,
        };

        self.with_timeout(self.store.insert_session(&session)).await?;
        logsentry_statsd::metric!(counter(ServerCounters::DeviceFlowStarted) += 1);

        Ok(StartedSession {
            verification_url: format!(
                "{}/device?user_code={}",
                self.config.public_url(),
                session.user_code
            ),
            device_code: session.device_code,
            user_code: session.user_code,
            poll_interval_seconds: self.config.device_poll_interval().as_secs(),
        })
    }

    async fn handle_complete(
        &self,
        message: CompleteDeviceSession,
    ) -> Result<AppId, DeviceAuthError> {
        let mut session = self
            .with_timeout(self.store.session_by_user_code(&message.user_code))
            .await?
            .ok_or(DeviceAuthError::NotFound)?;

        let now = Utc::now();
        if session.status != SessionStatus::Pending || session.is_expired(now) {
            if session.status == SessionStatus::Pending {
                session.status = SessionStatus::Expired;
                self.with_timeout(self.store.update_session(&session)).await?;
            }
            return Err(DeviceAuthError::Gone);
        }

        let app = self
            .with_timeout(self.store.create_app(&message.user_id, &session.app_name))
            .await?;

        let api_key = ApiKey::generate();
        let hasher = self.hasher.clone();
        let hash_key = api_key.clone();
        let key_hash = tokio::task::spawn_blocking(move || hasher.hash(&hash_key))
            .await
            .map_err(|_| DeviceAuthError::StoreUnavailable)?
            .map_err(|_| DeviceAuthError::StoreUnavailable)?;

        self.with_timeout(self.store.insert_api_key(app.id, &key_hash))
            .await?;

        debug_assert!(session.status.can_transition(SessionStatus::Completed));
        session.status = SessionStatus::Completed;
        session.user_id = Some(message.user_id);
        session.app_id = Some(app.id);
        session.api_key_plaintext = Some(api_key.expose().to_owned());
        session.approved_at = Some(now);
        self.with_timeout(self.store.update_session(&session)).await?;

        // A lookup for this key may already be negative-cached.
        self.key_cache.send(InvalidateKeys);

        logsentry_statsd::metric!(counter(ServerCounters::DeviceFlowCompleted) += 1);
        Ok(app.id)
    }

    async fn handle_poll(
        &mut self,
        message: PollDeviceSession,
    ) -> Result<PollOutcome, DeviceAuthError> {
        let interval = self.config.device_poll_interval();
        if let Some(last) = self.last_poll.get(&message.device_code) {
            if last.elapsed() < interval {
                return Err(DeviceAuthError::RateLimited);
            }
        }
        self.last_poll
            .insert(message.device_code.clone(), Instant::now());

        let mut session = self
            .with_timeout(self.store.session_by_device_code(&message.device_code))
            .await?
            .ok_or(DeviceAuthError::NotFound)?;

        match session.status {
            SessionStatus::Pending | SessionStatus::Approved => {
                if session.is_expired(Utc::now()) {
                    session.status = SessionStatus::Expired;
                    self.with_timeout(self.store.update_session(&session)).await?;
                    Ok(PollOutcome::Expired)
                } else {
                    Ok(PollOutcome::Pending)
                }
            }
            SessionStatus::Expired => Ok(PollOutcome::Expired),
            SessionStatus::Denied => Ok(PollOutcome::Denied),
            SessionStatus::Completed => {
                let app_id = session.app_id.ok_or(DeviceAuthError::StoreUnavailable)?;
                match self
                    .with_timeout(self.store.take_session_key(&message.device_code))
                    .await?
                {
                    Some(api_key) => Ok(PollOutcome::Ready { api_key, app_id }),
                    None => Ok(PollOutcome::Consumed),
                }
            }
        }
    }

    async fn handle_message(&mut self, message: DeviceAuth) {
        match message {
            DeviceAuth::Start(message, sender) => sender.send(self.handle_start(message).await),
            DeviceAuth::Complete(message, sender) => {
                sender.send(self.handle_complete(message).await)
            }
            DeviceAuth::Poll(message, sender) => sender.send(self.handle_poll(message).await),
        }
    }

    async fn janitor_tick(&mut self) {
        match self.store.sweep_expired_sessions(Utc::now()).await {
            Ok(0) => (),
            Ok(swept) => {
                logsentry_statsd::metric!(
                    counter(ServerCounters::DeviceSessionsExpired) += swept as i64
                );
                logsentry_log::debug!("janitor expired {swept} device sessions");
            }
            Err(error) => logsentry_log::error!(
                error = &error as &dyn std::error::Error,
                "device session janitor sweep failed"
            ),
        }

        // Poll entries older than a full session TTL can never rate-limit
        // again.
        let ttl = self.config.device_session_ttl();
        self.last_poll.retain(|_, last| last.elapsed() < ttl);
    }
}

impl Service for DeviceAuthService {
    type Interface = DeviceAuth;

    fn spawn_handler(mut self, mut rx: Receiver<Self::Interface>) {
        tokio::spawn(async move {
            let mut janitor = tokio::time::interval(self.config.device_janitor_interval());
            janitor.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    biased;

                    message = rx.recv() => match message {
                        Some(message) => self.handle_message(message).await,
                        None => break,
                    },
                    _ = janitor.tick() => self.janitor_tick().await,
                }
            }
        });
    }

    fn name() -> &'static str {
        "device_auth"
    }
}

#[cfg(test)]
mod tests {
    use logsentry_system::Addr;

    use super::*;
    use crate::services::key_cache::KeyCache;
    use crate::store::MemoryStore;

    async fn setup(config: Config) -> (Addr<DeviceAuth>, Arc<MemoryStore>, Arc<KeyHasher>) {
        let store = Arc::new(MemoryStore::new());
        let hasher = Arc::new(KeyHasher::new(b"test-pepper"));
        let (cache_addr, mut cache_rx) = Addr::<KeyCache>::custom();
        // Swallow invalidations; the key cache has its own tests.
        tokio::spawn(async move { while cache_rx.recv().await.is_some() {} });

        let service = DeviceAuthService::new(
            Arc::new(config),
            store.clone() as Arc<dyn Store>,
            hasher.clone(),
            cache_addr.recipient(),
        );
        (service.start(), store, hasher)
    }

    fn fast_poll_config() -> Config {
        Config::from_json_value(serde_json::json!({
            "device_auth": {"poll_interval_secs": 0}
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn test_full_device_flow() {
        let (addr, store, hasher) = setup(fast_poll_config()).await;

        let started = addr
            .send(StartDeviceSession {
                app_name: "api".to_owned(),
                description: None,
            })
            .await
            .unwrap()
            .unwrap();
        assert_eq!(started.user_code.len(), 8);
        assert!(started.verification_url.contains(&started.user_code));

        // Nothing issued yet.
        let outcome = addr
            .send(PollDeviceSession {
                device_code: started.device_code.clone(),
            })
            .await
            .unwrap()
            .unwrap();
        assert_eq!(outcome, PollOutcome::Pending);

        // The user authorizes in the browser.
        let app_id = addr
            .send(CompleteDeviceSession {
                user_code: started.user_code.clone(),
                user_id: "user-1".to_owned(),
            })
            .await
            .unwrap()
            .unwrap();

        // First poll returns the plaintext exactly once.
        let outcome = addr
            .send(PollDeviceSession {
                device_code: started.device_code.clone(),
            })
            .await
            .unwrap()
            .unwrap();
        let PollOutcome::Ready { api_key, app_id: polled } = outcome else {
            panic!("expected credentials, got {outcome:?}");
        };
        assert_eq!(polled, app_id);
        assert!(api_key.starts_with("sk_"));

        // The key authenticates against the registry.
        let hash = hasher.hash(&ApiKey::parse(&api_key).unwrap()).unwrap();
        assert_eq!(store.lookup_api_key(&hash).await.unwrap(), Some(app_id));

        // Only the hash is persisted.
        let session = store
            .session_by_device_code(&started.device_code)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(session.api_key_plaintext, None);
        assert_eq!(session.status, SessionStatus::Completed);

        // Subsequent polls see consumed credentials.
        let outcome = addr
            .send(PollDeviceSession {
                device_code: started.device_code,
            })
            .await
            .unwrap()
            .unwrap();
        assert_eq!(outcome, PollOutcome::Consumed);
    }

    #[tokio::test]
    async fn test_complete_twice_is_gone() {
        let (addr, _store, _hasher) = setup(fast_poll_config()).await;

        let started = addr
            .send(StartDeviceSession {
                app_name: "api".to_owned(),
                description: None,
            })
            .await
            .unwrap()
            .unwrap();

        let complete = CompleteDeviceSession {
            user_code: started.user_code.clone(),
            user_id: "user-1".to_owned(),
        };
        addr.send(complete).await.unwrap().unwrap();

        let again = addr
            .send(CompleteDeviceSession {
                user_code: started.user_code,
                user_id: "user-1".to_owned(),
            })
            .await
            .unwrap();
        assert_eq!(again, Err(DeviceAuthError::Gone));
    }

    #[tokio::test]
    async fn test_expired_session_is_gone() {
        let config = Config::from_json_value(serde_json::json!({
            "device_auth": {"session_ttl_secs": 0, "poll_interval_secs": 0}
        }))
        .unwrap();
        let (addr, _store, _hasher) = setup(config).await;

        let started = addr
            .send(StartDeviceSession {
                app_name: "api".to_owned(),
                description: None,
            })
            .await
            .unwrap()
            .unwrap();

        let complete = addr
            .send(CompleteDeviceSession {
                user_code: started.user_code,
                user_id: "user-1".to_owned(),
            })
            .await
            .unwrap();
        assert_eq!(complete, Err(DeviceAuthError::Gone));

        let outcome = addr
            .send(PollDeviceSession {
                device_code: started.device_code,
            })
            .await
            .unwrap()
            .unwrap();
        assert_eq!(outcome, PollOutcome::Expired);
    }

    #[tokio::test]
    async fn test_poll_rate_limit() {
        // Default interval of 2 seconds.
        let (addr, _store, _hasher) = setup(Config::default()).await;

        let started = addr
            .send(StartDeviceSession {
                app_name: "api".to_owned(),
                description: None,
            })
            .await
            .unwrap()
            .unwrap();

        let first = addr
            .send(PollDeviceSession {
                device_code: started.device_code.clone(),
            })
            .await
            .unwrap();
        assert_eq!(first, Ok(PollOutcome::Pending));

        let second = addr
            .send(PollDeviceSession {
                device_code: started.device_code,
            })
            .await
            .unwrap();
        assert_eq!(second, Err(DeviceAuthError::RateLimited));
    }

    #[tokio::test]
    async fn test_invalid_app_name() {
        let (addr, _store, _hasher) = setup(Config::default()).await;

        let result = addr
            .send(StartDeviceSession {
                app_name: "  ".to_owned(),
                description: None,
            })
            .await
            .unwrap();
        assert_eq!(result.map(|_| ()), Err(DeviceAuthError::InvalidAppName));
    }
}
