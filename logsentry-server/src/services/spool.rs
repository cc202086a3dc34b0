use std::path::Path;

use logsentry_protocol::AppId;
use sqlx::sqlite::{
    SqliteAutoVacuum, SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions,
    SqliteSynchronous,
};
use sqlx::{Pool, Row, Sqlite};

use crate::statsd::{ServerCounters, ServerGauges};
use crate::store::PersistedLog;

/// An error produced by the disk spool.
#[derive(Debug, thiserror::Error)]
pub enum SpoolError {
    /// Failed to set up the spool database.
    #[error("failed to set up the spool database")]
    Setup(#[source] sqlx::Error),

    /// Failed to insert data into the spool.
    #[error("failed to insert data into the spool")]
    InsertFailed(#[source] sqlx::Error),

    /// Failed to delete data from the spool.
    #[error("failed to delete data from the spool")]
    DeleteFailed(#[source] sqlx::Error),

    /// Failed to fetch data from the spool.
    #[error("failed to fetch data from the spool")]
    FetchFailed(#[source] sqlx::Error),

    /// Failed to read the spool size.
    #[error("failed to read the spool size")]
    SizeReadFailed(#[source] sqlx::Error),
}

/// On-disk overflow buffer for degraded per-app processors.
///
/// When a processor exhausts its store-write retries it shunts records here
/// instead of dropping them. The spool is bounded: once the database file
/// reaches `max_bytes`, the oldest rows are dropped to make room. Records are
/// drained back to the store in insertion order during recovery.
#[derive(Clone, Debug)]
pub struct DiskSpool {
    db: Pool<Sqlite>,
    max_bytes: u64,
}

impl DiskSpool {
    /// Opens or creates the spool database at the given path.
    pub async fn open(path: &Path, max_bytes: u64) -> Result<Self, SpoolError> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            // Truncates freed pages on commit, keeping the file size honest
            // for the cap check.
            .auto_vacuum(SqliteAutoVacuum::Full);

        let db = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .map_err(SpoolError::Setup)?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS spool (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                app_id TEXT NOT NULL,
                received_at INTEGER NOT NULL,
                payload TEXT NOT NULL
            )",
        )
        .execute(&db)
        .await
        .map_err(SpoolError::Setup)?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_spool_app ON spool (app_id, id)")
            .execute(&db)
            .await
            .map_err(SpoolError::Setup)?;

        Ok(Self { db, max_bytes })
    }

    /// Estimates the database size by multiplying `page_count * page_size`.
    pub async fn estimate_size(&self) -> Result<u64, SpoolError> {
        let size: i64 = sqlx::query(
            "SELECT page_count * page_size AS size
             FROM pragma_page_count(), pragma_page_size()",
        )
        .fetch_one(&self.db)
        .await
        .and_then(|row| row.try_get("size"))
        .map_err(SpoolError::SizeReadFailed)?;

        let size = size.max(0) as u64;
        logsentry_statsd::metric!(gauge(ServerGauges::SpoolDiskUsed) = size);
        Ok(size)
    }

    /// Appends records to the spool, dropping the oldest rows when the size
    /// cap is reached.
    ///
    /// Returns the number of old rows dropped to make room.
    pub async fn push(&self, logs: &[PersistedLog]) -> Result<u64, SpoolError> {
        if logs.is_empty() {
            return Ok(0);
        }

        let mut dropped = 0;
        if self.estimate_size().await? >= self.max_bytes {
            let result = sqlx::query(
                "DELETE FROM spool WHERE id IN
                    (SELECT id FROM spool ORDER BY id ASC LIMIT ?)",
            )
            .bind(logs.len() as i64)
            .execute(&self.db)
            .await
            .map_err(SpoolError::DeleteFailed)?;

            dropped = result.rows_affected();
            logsentry_statsd::metric!(
                counter(ServerCounters::RecordsDropped) += dropped as i64
            );
        }

        let mut builder = sqlx::QueryBuilder::<Sqlite>::new(
            "INSERT INTO spool (app_id, received_at, payload) ",
        );
        builder.push_values(logs, |mut b, log| {
            b.push_bind(log.app_id.to_string())
                .push_bind(log.ingested_at.timestamp_millis())
                .push_bind(serde_json::to_string(log).unwrap_or_default());
        });

        builder
            .build()
            .execute(&self.db)
            .await
            .map_err(SpoolError::InsertFailed)?;

        logsentry_statsd::metric!(
            counter(ServerCounters::RecordsSpooled) += logs.len() as i64
        );
        Ok(dropped)
    }

    /// Removes and returns up to `limit` of the oldest records of an app.
    pub async fn drain(&self, app_id: AppId, limit: i64) -> Result<Vec<PersistedLog>, SpoolError> {
        let rows = sqlx::query(
            "DELETE FROM spool WHERE id IN
                (SELECT id FROM spool WHERE app_id = ? ORDER BY id ASC LIMIT ?)
             RETURNING id, payload",
        )
        .bind(app_id.to_string())
        .bind(limit)
        .fetch_all(&self.db)
        .await
        .map_err(SpoolError::DeleteFailed)?;

        // `DELETE ... RETURNING` does not guarantee row order.
        let mut rows: Vec<(i64, String)> = rows
            .into_iter()
            .filter_map(|row| {
                let id: i64 = row.try_get("id").ok()?;
                let payload: String = row.try_get("payload").ok()?;
                Some((id, payload))
            })
            .collect();
        rows.sort_by_key(|(id, _)| *id);

        Ok(rows
            .into_iter()
            .filter_map(|(_, payload)| match serde_json::from_str(&payload) {
                Ok(log) => Some(log),
                Err(error) => {
                    logsentry_log::error!(
                        error = &error as &dyn std::error::Error,
                        "dropping malformed spool row"
                    );
                    None
                }
            })
            .collect())
    }

    /// Returns `true` if the spool holds no records for the given app.
    pub async fn is_empty_for(&self, app_id: AppId) -> Result<bool, SpoolError> {
        let row = sqlx::query("SELECT 1 FROM spool WHERE app_id = ? LIMIT 1")
            .bind(app_id.to_string())
            .fetch_optional(&self.db)
            .await
            .map_err(SpoolError::FetchFailed)?;

        Ok(row.is_none())
    }
}
