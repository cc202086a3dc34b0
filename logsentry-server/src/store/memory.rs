use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use logsentry_auth::KeyHash;
use logsentry_protocol::AppId;
use parking_lot::Mutex;

use super::{App, DeviceSession, PersistedLog, SessionStatus, Store, StoreError};

#[derive(Debug, Default)]
struct Inner {
    apps: Vec<App>,
    api_keys: HashMap<String, (AppId, bool)>,
    sessions: HashMap<String, DeviceSession>,
    logs: Vec<PersistedLog>,
}

/// In-memory [`Store`] used by tests and local experiments.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy of all persisted logs, in insertion order.
    pub fn logs(&self) -> Vec<PersistedLog> {
        self.inner.lock().logs.clone()
    }

    /// Returns the number of persisted logs.
    pub fn log_count(&self) -> usize {
        self.inner.lock().logs.len()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn create_app(&self, owner_id: &str, name: &str) -> Result<App, StoreError> {
        let mut inner = self.inner.lock();

        if let Some(app) = inner
            .apps
            .iter()
            .find(|app| app.owner_id == owner_id && app.name == name)
        {
            return Ok(app.clone());
        }

        let app = App {
            id: AppId::random(),
            owner_id: owner_id.to_owned(),
            name: name.to_owned(),
            created_at: Utc::now(),
        };
        inner.apps.push(app.clone());
        Ok(app)
    }

    async fn get_app(&self, app_id: AppId) -> Result<Option<App>, StoreError> {
        Ok(self
            .inner
            .lock()
            .apps
            .iter()
            .find(|app| app.id == app_id)
            .cloned())
    }

    async fn insert_api_key(&self, app_id: AppId, key_hash: &KeyHash) -> Result<(), StoreError> {
        self.inner
            .lock()
            .api_keys
            .insert(key_hash.to_string(), (app_id, false));
        Ok(())
    }

    async fn lookup_api_key(&self, key_hash: &KeyHash) -> Result<Option<AppId>, StoreError> {
        Ok(self
            .inner
            .lock()
            .api_keys
            .get(key_hash.as_str())
            .filter(|(_, revoked)| !revoked)
            .map(|(app_id, _)| *app_id))
    }

    async fn revoke_api_key(&self, key_hash: &KeyHash) -> Result<bool, StoreError> {
        match self.inner.lock().api_keys.get_mut(key_hash.as_str()) {
            Some(entry) if !entry.1 => {
                entry.1 = true;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn insert_session(&self, session: &DeviceSession) -> Result<(), StoreError> {
        self.inner
            .lock()
            .sessions
            .insert(session.device_code.clone(), session.clone());
        Ok(())
    }

    async fn session_by_device_code(
        &self,
        device_code: &str,
    ) -> Result<Option<DeviceSession>, StoreError> {
        Ok(self.inner.lock().sessions.get(device_code).cloned())
    }

    async fn session_by_user_code(
        &self,
        user_code: &str,
    ) -> Result<Option<DeviceSession>, StoreError> {
        Ok(self
            .inner
            .lock()
            .sessions
            .values()
            .find(|session| session.user_code == user_code)
            .cloned())
    }

    async fn update_session(&self, session: &DeviceSession) -> Result<(), StoreError> {
        self.inner
            .lock()
            .sessions
            .insert(session.device_code.clone(), session.clone());
        Ok(())
    }

    async fn take_session_key(&self, device_code: &str) -> Result<Option<String>, StoreError> {
        Ok(self
            .inner
            .lock()
            .sessions
            .get_mut(device_code)
            .and_then(|session| session.api_key_plaintext.take()))
    }

    async fn sweep_expired_sessions(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut swept = 0;
        for session in self.inner.lock().sessions.values_mut() {
            if matches!(
                session.status,
                SessionStatus::Pending | SessionStatus::Approved
            ) && session.is_expired(now)
            {
                session.status = SessionStatus::Expired;
                swept += 1;
            }
        }

        Ok(swept)
    }

    async fn insert_logs(&self, logs: &[PersistedLog]) -> Result<(), StoreError> {
        self.inner.lock().logs.extend_from_slice(logs);
        Ok(())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}
