use std::path::Path;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::ConnectOptions;

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("failed to open job ledger: {0}")]
    Open(#[source] sqlx::Error),
    #[error("ledger query failed: {0}")]
    Query(#[source] sqlx::Error),
}

/// Crash-durable set of accepted-but-not-finalized job ids (C1).
///
/// Backed by a single `jobs(job_id TEXT PRIMARY KEY NOT NULL)` table. Writes
/// are synchronous (`PRAGMA synchronous = FULL`) so that an `insert` is
/// flushed to disk before the caller proceeds to any externally observable
/// action.
pub struct DurableJobSet {
    pool: SqlitePool,
}

impl DurableJobSet {
    pub async fn open(path: &Path) -> Result<Self, LedgerError> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .disable_statement_logging();

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(LedgerError::Open)?;

        sqlx::query("PRAGMA journal_mode = WAL")
            .execute(&pool)
            .await
            .map_err(LedgerError::Open)?;
        sqlx::query("PRAGMA synchronous = FULL")
            .execute(&pool)
            .await
            .map_err(LedgerError::Open)?;
        sqlx::query("CREATE TABLE IF NOT EXISTS jobs (job_id TEXT PRIMARY KEY NOT NULL)")
            .execute(&pool)
            .await
            .map_err(LedgerError::Open)?;

        Ok(Self { pool })
    }

    /// Opens an in-memory ledger, for tests.
    #[cfg(test)]
    pub async fn open_memory() -> Result<Self, LedgerError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .map_err(LedgerError::Open)?;
        sqlx::query("CREATE TABLE IF NOT EXISTS jobs (job_id TEXT PRIMARY KEY NOT NULL)")
            .execute(&pool)
            .await
            .map_err(LedgerError::Open)?;
        Ok(Self { pool })
    }

    /// Idempotent insert; a repeat is a no-op.
    pub async fn insert(&self, job_id: &str) -> Result<(), LedgerError> {
        sqlx::query("INSERT OR IGNORE INTO jobs (job_id) VALUES (?)")
            .bind(job_id)
            .execute(&self.pool)
            .await
            .map_err(LedgerError::Query)?;
        Ok(())
    }

    /// Removing an absent id is a no-op, not an error.
    pub async fn remove(&self, job_id: &str) -> Result<(), LedgerError> {
        sqlx::query("DELETE FROM jobs WHERE job_id = ?")
            .bind(job_id)
            .execute(&self.pool)
            .await
            .map_err(LedgerError::Query)?;
        Ok(())
    }

    /// All current ids, unspecified order.
    pub async fn list(&self) -> Result<Vec<String>, LedgerError> {
        let rows: Vec<(String,)> = sqlx::query_as("SELECT job_id FROM jobs")
            .fetch_all(&self.pool)
            .await
            .map_err(LedgerError::Query)?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn insert_is_idempotent() {
        let ledger = DurableJobSet::open_memory().await.unwrap();
        ledger.insert("J1").await.unwrap();
        ledger.insert("J1").await.unwrap();
        let ids = ledger.list().await.unwrap();
        assert_eq!(ids, vec!["J1".to_string()]);
    }

    #[tokio::test]
    async fn remove_absent_is_noop() {
        let ledger = DurableJobSet::open_memory().await.unwrap();
        ledger.remove("missing").await.unwrap();
        assert!(ledger.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn insert_then_remove_clears_membership() {
        let ledger = DurableJobSet::open_memory().await.unwrap();
        ledger.insert("J1").await.unwrap();
        ledger.remove("J1").await.unwrap();
        assert!(!ledger.list().await.unwrap().contains(&"J1".to_string()));
    }

    #[tokio::test]
    async fn round_trip_through_a_file_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jobs.db");

        {
            let ledger = DurableJobSet::open(&path).await.unwrap();
            ledger.insert("J1").await.unwrap();
            ledger.insert("J2").await.unwrap();
            ledger.remove("J2").await.unwrap();
        }

        let reopened = DurableJobSet::open(&path).await.unwrap();
        let ids = reopened.list().await.unwrap();
        assert_eq!(ids, vec!["J1".to_string()]);
    }
}
