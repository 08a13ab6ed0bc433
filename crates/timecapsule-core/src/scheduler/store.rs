//! Durable timer storage.

use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::Row;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow,
};

use super::model::{Job, PendingJob};
use crate::capsule::JobId;
use crate::{Error, Result};

/// Repository for persisted timers.
///
/// A row exists from scheduling until it is claimed; claiming deletes it, so
/// a timer fires at most once even with several processes polling.
#[derive(Debug, Clone)]
pub struct JobStore {
    pool: SqlitePool,
}

impl JobStore {
    /// Opens (or creates) the database at `path` in WAL mode.
    ///
    /// # Errors
    ///
    /// Returns an error if the database connection fails or schema creation fails.
    pub async fn new(path: &Path) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.initialize().await?;
        Ok(store)
    }

    /// Create an in-memory store for testing.
    ///
    /// # Errors
    ///
    /// Returns an error if the database connection fails or schema creation fails.
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;

        let store = Self { pool };
        store.initialize().await?;
        Ok(store)
    }

    /// Closes the pool. Later calls fail with a database error.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    async fn initialize(&self) -> Result<()> {
        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS scheduled_jobs (
                job_id TEXT PRIMARY KEY,
                fire_at INTEGER NOT NULL,
                args TEXT NOT NULL,
                created_at TEXT NOT NULL
            )
            ",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_scheduled_jobs_fire_at ON scheduled_jobs(fire_at)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Persists a timer. Never overwrites an existing one.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DuplicateJob`] if the id is taken, or a database error.
    pub async fn insert(
        &self,
        job_id: &JobId,
        fire_at: DateTime<Utc>,
        args: &serde_json::Value,
    ) -> Result<()> {
        let result = sqlx::query(
            r"
            INSERT INTO scheduled_jobs (job_id, fire_at, args, created_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(job_id) DO NOTHING
            ",
        )
        .bind(job_id.as_str())
        .bind(fire_at.timestamp_millis())
        .bind(serde_json::to_string(args)?)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(Error::DuplicateJob(job_id.to_string()));
        }
        Ok(())
    }

    /// Deletes the timer and reports whether this caller removed it.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn claim(&self, job_id: &JobId) -> Result<bool> {
        let result = sqlx::query("DELETE FROM scheduled_jobs WHERE job_id = ?")
            .bind(job_id.as_str())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Timers due at `now`, earliest first.
    ///
    /// A row whose arguments do not parse is returned with null arguments so
    /// the handler falls back to the job id. A row whose key does not parse
    /// can never run and is deleted.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn due(&self, now: DateTime<Utc>, limit: u32) -> Result<Vec<Job>> {
        let rows = sqlx::query(
            r"
            SELECT job_id, fire_at, args
            FROM scheduled_jobs
            WHERE fire_at <= ?
            ORDER BY fire_at ASC
            LIMIT ?
            ",
        )
        .bind(now.timestamp_millis())
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        let mut jobs = Vec::with_capacity(rows.len());
        for row in &rows {
            let (job_id, fire_at) = match read_key(row) {
                Ok(key) => key,
                Err(e) => {
                    self.drop_corrupt(row, &e).await?;
                    continue;
                }
            };
            let raw: String = row.get("args");
            let args = serde_json::from_str(&raw).unwrap_or_else(|e| {
                tracing::warn!(job_id = %job_id, error = %e, "timer arguments are corrupt");
                serde_json::Value::Null
            });
            jobs.push(Job {
                job_id,
                fire_at,
                args,
            });
        }
        Ok(jobs)
    }

    async fn drop_corrupt(&self, row: &SqliteRow, reason: &Error) -> Result<()> {
        let raw: String = row.get("job_id");
        tracing::error!(job_id = %raw, error = %reason, "dropping corrupt timer");
        sqlx::query("DELETE FROM scheduled_jobs WHERE job_id = ?")
            .bind(raw)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// All pending timers, earliest first. Rows with a corrupt key are
    /// skipped.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn list_pending(&self) -> Result<Vec<PendingJob>> {
        let rows = sqlx::query("SELECT job_id, fire_at FROM scheduled_jobs ORDER BY fire_at ASC")
            .fetch_all(&self.pool)
            .await?;

        Ok(rows
            .iter()
            .filter_map(|row| match read_key(row) {
                Ok((job_id, fire_at)) => Some(PendingJob { job_id, fire_at }),
                Err(e) => {
                    tracing::warn!(error = %e, "skipping corrupt timer");
                    None
                }
            })
            .collect())
    }

    /// Earliest pending fire time.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn next_fire_at(&self) -> Result<Option<DateTime<Utc>>> {
        let row = sqlx::query("SELECT MIN(fire_at) AS next FROM scheduled_jobs")
            .fetch_one(&self.pool)
            .await?;
        let next: Option<i64> = row.get("next");
        Ok(next.and_then(DateTime::from_timestamp_millis))
    }
}

fn read_key(row: &SqliteRow) -> Result<(JobId, DateTime<Utc>)> {
    let job_id: String = row.get("job_id");
    let fire_at: i64 = row.get("fire_at");
    let fire_at = DateTime::from_timestamp_millis(fire_at)
        .ok_or_else(|| Error::Config(format!("timer {job_id} has invalid fire_at {fire_at}")))?;
    Ok((JobId::parse(&job_id)?, fire_at))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use serde_json::json;

    fn id(s: &str) -> JobId {
        JobId::parse(s).unwrap()
    }

    #[tokio::test]
    async fn test_insert_is_create_once() {
        let store = JobStore::in_memory().await.unwrap();
        let at = Utc::now() + ChronoDuration::hours(1);
        store.insert(&id("job-1"), at, &json!({"job_id": "job-1"})).await.unwrap();

        let later = at + ChronoDuration::hours(5);
        let err = store.insert(&id("job-1"), later, &json!({})).await.unwrap_err();
        assert!(matches!(err, Error::DuplicateJob(_)));

        let pending = store.list_pending().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].fire_at.timestamp_millis(), at.timestamp_millis());
    }

    #[tokio::test]
    async fn test_claim_only_once() {
        let store = JobStore::in_memory().await.unwrap();
        store.insert(&id("job-1"), Utc::now(), &json!(null)).await.unwrap();
        assert!(store.claim(&id("job-1")).await.unwrap());
        assert!(!store.claim(&id("job-1")).await.unwrap());
        assert!(store.list_pending().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_due_and_next_fire_at() {
        let store = JobStore::in_memory().await.unwrap();
        let now = Utc::now();
        assert_eq!(store.next_fire_at().await.unwrap(), None);

        store.insert(&id("late"), now + ChronoDuration::hours(2), &json!(2)).await.unwrap();
        store.insert(&id("past"), now - ChronoDuration::minutes(5), &json!(1)).await.unwrap();
        store.insert(&id("past2"), now - ChronoDuration::minutes(1), &json!(3)).await.unwrap();

        let due = store.due(now, 10).await.unwrap();
        assert_eq!(
            due.iter().map(|j| j.job_id.as_str()).collect::<Vec<_>>(),
            vec!["past", "past2"]
        );
        assert_eq!(due[0].args, json!(1));
        assert_eq!(store.due(now, 1).await.unwrap().len(), 1);

        let next = store.next_fire_at().await.unwrap().unwrap();
        assert_eq!(
            next.timestamp_millis(),
            (now - ChronoDuration::minutes(5)).timestamp_millis()
        );
    }

    #[tokio::test]
    async fn test_file_backed_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jobs.db");
        {
            let store = JobStore::new(&path).await.unwrap();
            store.insert(&id("keep"), Utc::now(), &json!({})).await.unwrap();
        }
        let store = JobStore::new(&path).await.unwrap();
        assert_eq!(store.list_pending().await.unwrap().len(), 1);
        assert!(store.claim(&id("keep")).await.unwrap());
    }

    async fn insert_raw(store: &JobStore, job_id: &str, fire_at: DateTime<Utc>, args: &str) {
        sqlx::query("INSERT INTO scheduled_jobs (job_id, fire_at, args, created_at) VALUES (?, ?, ?, ?)")
            .bind(job_id)
            .bind(fire_at.timestamp_millis())
            .bind(args)
            .bind(Utc::now().to_rfc3339())
            .execute(&store.pool)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_due_tolerates_corrupt_rows() {
        let store = JobStore::in_memory().await.unwrap();
        let now = Utc::now();
        insert_raw(&store, "../escape", now - ChronoDuration::minutes(3), "{}").await;
        insert_raw(&store, "bad-args", now - ChronoDuration::minutes(2), "{not json").await;
        store.insert(&id("good"), now - ChronoDuration::minutes(1), &json!({"job_id": "good"})).await.unwrap();

        let pending = store.list_pending().await.unwrap();
        assert_eq!(
            pending.iter().map(|p| p.job_id.as_str()).collect::<Vec<_>>(),
            vec!["bad-args", "good"]
        );

        let due = store.due(now, 10).await.unwrap();
        assert_eq!(
            due.iter().map(|j| j.job_id.as_str()).collect::<Vec<_>>(),
            vec!["bad-args", "good"]
        );
        assert_eq!(due[0].args, serde_json::Value::Null);
        assert_eq!(due[1].args, json!({"job_id": "good"}));

        // The unparseable key is gone, so the loop no longer sees it as due.
        let next = store.next_fire_at().await.unwrap().unwrap();
        assert_eq!(
            next.timestamp_millis(),
            (now - ChronoDuration::minutes(2)).timestamp_millis()
        );
    }
}
