use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use logsentry_auth::KeyHash;
use logsentry_protocol::AppId;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow, SqliteSynchronous,
};
use sqlx::{Pool, Row, Sqlite};
use uuid::Uuid;

use super::{App, DeviceSession, PersistedLog, SessionStatus, Store, StoreError};

/// Maximum number of rows per batched insert.
///
/// SQLite limits the number of bound variables per statement; 10 columns per
/// log row leaves ample headroom at this batch size.
const INSERT_BATCH: usize = 50;

/// [`Store`] implementation backed by SQLite.
#[derive(Clone, Debug)]
pub struct SqliteStore {
    db: Pool<Sqlite>,
}

impl SqliteStore {
    /// Connects to the given database URL and applies migrations.
    ///
    /// The database file is created if it does not exist.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            // WAL keeps readers and the write path from blocking each other.
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal);

        let db = SqlitePoolOptions::new()
            .max_connections(16)
            .connect_with(options)
            .await?;

        sqlx::migrate!("./migrations")
            .run(&db)
            .await
            .map_err(|e| StoreError::Database(e.into()))?;

        Ok(Self { db })
    }

    fn app_from_row(row: SqliteRow) -> Result<App, StoreError> {
        let id: String = row.try_get("id")?;
        Ok(App {
            id: id.parse().map_err(|_| StoreError::MalformedRow("apps"))?,
            owner_id: row.try_get("owner_id")?,
            name: row.try_get("name")?,
            created_at: row.try_get("created_at")?,
        })
    }

    fn session_from_row(row: SqliteRow) -> Result<DeviceSession, StoreError> {
        let id: String = row.try_get("id")?;
        let status: String = row.try_get("status")?;
        let app_id: Option<String> = row.try_get("app_id")?;

        Ok(DeviceSession {
            id: Uuid::parse_str(&id).map_err(|_| StoreError::MalformedRow("device_sessions"))?,
            device_code: row.try_get("device_code")?,
            user_code: row.try_get("user_code")?,
            status: status
                .parse()
                .map_err(|_| StoreError::MalformedRow("device_sessions"))?,
            app_name: row.try_get("app_name")?,
            description: row.try_get("description")?,
            user_id: row.try_get("user_id")?,
            app_id: app_id
                .map(|id| id.parse::<AppId>())
                .transpose()
                .map_err(|_| StoreError::MalformedRow("device_sessions"))?,
            api_key_plaintext: row.try_get("api_key_plaintext")?,
            expires_at: row.try_get("expires_at")?,
            created_at: row.try_get("created_at")?,
            approved_at: row.try_get("approved_at")?,
        })
    }
}

#[async_trait]
impl Store for SqliteStore {
    async fn create_app(&self, owner_id: &str, name: &str) -> Result<App, StoreError> {
        sqlx::query(
            "INSERT INTO apps (id, owner_id, name, created_at)
             VALUES (?, ?, ?, ?)
             ON CONFLICT (owner_id, name) DO NOTHING",
        )
        .bind(AppId::random().to_string())
        .bind(owner_id.to_owned())
        .bind(name.to_owned())
        .bind(Utc::now())
        .execute(&self.db)
        .await?;

        let row = sqlx::query("SELECT * FROM apps WHERE owner_id = ? AND name = ?")
            .bind(owner_id.to_owned())
            .bind(name.to_owned())
            .fetch_one(&self.db)
            .await?;

        Self::app_from_row(row)
    }

    async fn get_app(&self, app_id: AppId) -> Result<Option<App>, StoreError> {
        let row = sqlx::query("SELECT * FROM apps WHERE id = ?")
            .bind(app_id.to_string())
            .fetch_optional(&self.db)
            .await?;

        row.map(Self::app_from_row).transpose()
    }

    async fn insert_api_key(&self, app_id: AppId, key_hash: &KeyHash) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO app_api_keys (key_hash, app_id, created_at) VALUES (?, ?, ?)",
        )
        .bind(key_hash.to_string())
        .bind(app_id.to_string())
        .bind(Utc::now())
        .execute(&self.db)
        .await?;

        Ok(())
    }

    async fn lookup_api_key(&self, key_hash: &KeyHash) -> Result<Option<AppId>, StoreError> {
        let row = sqlx::query(
            "SELECT app_id FROM app_api_keys WHERE key_hash = ? AND revoked_at IS NULL",
        )
        .bind(key_hash.to_string())
        .fetch_optional(&self.db)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let app_id: String = row.try_get("app_id")?;
        app_id
            .parse()
            .map(Some)
            .map_err(|_| StoreError::MalformedRow("app_api_keys"))
    }

    async fn revoke_api_key(&self, key_hash: &KeyHash) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE app_api_keys SET revoked_at = ? WHERE key_hash = ? AND revoked_at IS NULL",
        )
        .bind(Utc::now())
        .bind(key_hash.to_string())
        .execute(&self.db)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn insert_session(&self, session: &DeviceSession) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO device_sessions
                (id, device_code, user_code, status, app_name, description, user_id,
                 app_id, api_key_plaintext, expires_at, created_at, approved_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(session.id.to_string())
        .bind(session.device_code.clone())
        .bind(session.user_code.clone())
        .bind(session.status.to_string())
        .bind(session.app_name.clone())
        .bind(session.description.clone())
        .bind(session.user_id.clone())
        .bind(session.app_id.map(|id| id.to_string()))
        .bind(session.api_key_plaintext.clone())
        .bind(session.expires_at)
        .bind(session.created_at)
        .bind(session.approved_at)
        .execute(&self.db)
        .await?;

        Ok(())
    }

    async fn session_by_device_code(
        &self,
        device_code: &str,
    ) -> Result<Option<DeviceSession>, StoreError> {
        let row = sqlx::query("SELECT * FROM device_sessions WHERE device_code = ?")
            .bind(device_code.to_owned())
            .fetch_optional(&self.db)
            .await?;

        row.map(Self::session_from_row).transpose()
    }

    async fn session_by_user_code(
        &self,
        user_code: &str,
    ) -> Result<Option<DeviceSession>, StoreError> {
        let row = sqlx::query("SELECT * FROM device_sessions WHERE user_code = ?")
            .bind(user_code.to_owned())
            .fetch_optional(&self.db)
            .await?;

        row.map(Self::session_from_row).transpose()
    }

    async fn update_session(&self, session: &DeviceSession) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE device_sessions SET
                status = ?, app_name = ?, description = ?, user_id = ?, app_id = ?,
                api_key_plaintext = ?, expires_at = ?, approved_at = ?
             WHERE id = ?",
        )
        .bind(session.status.to_string())
        .bind(session.app_name.clone())
        .bind(session.description.clone())
        .bind(session.user_id.clone())
        .bind(session.app_id.map(|id| id.to_string()))
        .bind(session.api_key_plaintext.clone())
        .bind(session.expires_at)
        .bind(session.approved_at)
        .bind(session.id.to_string())
        .execute(&self.db)
        .await?;

        Ok(())
    }

    async fn take_session_key(&self, device_code: &str) -> Result<Option<String>, StoreError> {
        let mut tx = self.db.begin().await?;

        let row = sqlx::query(
            "SELECT api_key_plaintext FROM device_sessions WHERE device_code = ?",
        )
        .bind(device_code.to_owned())
        .fetch_optional(&mut *tx)
        .await?;

        let plaintext: Option<String> = match row {
            Some(row) => row.try_get("api_key_plaintext")?,
            None => None,
        };

        if plaintext.is_some() {
            sqlx::query(
                "UPDATE device_sessions SET api_key_plaintext = NULL WHERE device_code = ?",
            )
            .bind(device_code.to_owned())
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(plaintext)
    }

    async fn sweep_expired_sessions(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "UPDATE device_sessions SET status = 'expired'
             WHERE status IN ('pending', 'approved') AND expires_at <= ?",
        )
        .bind(now)
        .execute(&self.db)
        .await?;

        Ok(result.rows_affected())
    }

    async fn insert_logs(&self, logs: &[PersistedLog]) -> Result<(), StoreError> {
        // One transaction for the whole call: a failure mid-batch rolls back
        // every chunk, so the caller can retry the full slice. Ids are stable
        // across retries, so rows that did land are skipped instead of
        // tripping the primary key.
        let mut tx = self.db.begin().await?;

        for chunk in logs.chunks(INSERT_BATCH) {
            let mut builder = sqlx::QueryBuilder::<Sqlite>::new(
                "INSERT INTO logs
                    (id, app_id, timestamp, ingested_at, level, service, message,
                     attributes, fingerprint, classification) ",
            );

            builder.push_values(chunk, |mut b, log| {
                b.push_bind(log.id.to_string())
                    .push_bind(log.app_id.to_string())
                    .push_bind(log.timestamp)
                    .push_bind(log.ingested_at)
                    .push_bind(log.level.name())
                    .push_bind(log.service.clone())
                    .push_bind(log.message.clone())
                    .push_bind(serde_json::to_string(&log.attributes).unwrap_or_default())
                    .push_bind(log.fingerprint.to_string())
                    .push_bind(log.classification.clone());
            });
            builder.push(" ON CONFLICT (id) DO NOTHING");

            builder.build().execute(&mut *tx).await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").fetch_one(&self.db).await?;
        Ok(())
    }
}
