//! SQLite-backed job store.
//!
//! One table, one row per job:
//!
//! ```sql
//! jobs(id PK autoincrement, type, payload, status, retry_count default 0,
//!      max_retries default 3, last_error nullable, created_at, updated_at)
//! ```
//!
//! ## Atomicity
//!
//! Every write is a single `INSERT` or `UPDATE` statement, which SQLite
//! applies atomically. `record_failure` updates status, retry count and last
//! error in the same statement.
//!
//! ## Error mapping
//!
//! | Situation | JobStoreError |
//! |-----------|---------------|
//! | `UPDATE` touched zero rows | `NotFound` |
//! | `SELECT` returned no row | `NotFound` (or `None` from `get`) |
//! | any SQLx error, undecodable column | `Storage` |

use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use tracing::instrument;

use jobforge_core::{Job, JobId, JobStatus, NewJob};

use super::store::{failure_status, JobStore, JobStoreError};

const CREATE_JOBS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS jobs (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    type        TEXT    NOT NULL,
    payload     TEXT    NOT NULL,
    status      TEXT    NOT NULL,
    retry_count INTEGER NOT NULL DEFAULT 0,
    max_retries INTEGER NOT NULL DEFAULT 3,
    last_error  TEXT,
    created_at  TEXT    NOT NULL,
    updated_at  TEXT    NOT NULL
)
"#;

/// SQLite-backed job store.
///
/// `AUTOINCREMENT` guarantees ids are never reused, even after deletes.
#[derive(Debug, Clone)]
pub struct SqliteJobStore {
    pool: SqlitePool,
}

impl SqliteJobStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Open (creating if missing) the database at `url` and ensure the schema.
    pub async fn connect(url: &str) -> Result<Self, JobStoreError> {
        let options = SqliteConnectOptions::from_str(url)
            .map_err(|e| map_sqlx_error("connect", e))?
            .create_if_missing(true);

        if let Some(parent) = options.get_filename().parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await.map_err(|e| {
                    JobStoreError::storage(format!("failed to create {}: {e}", parent.display()))
                })?;
            }
        }

        let pool = SqlitePoolOptions::new()
            .connect_with(options)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;

        let store = Self::new(pool);
        store.migrate().await?;
        Ok(store)
    }

    /// Create the `jobs` table if it does not exist.
    pub async fn migrate(&self) -> Result<(), JobStoreError> {
        sqlx::query(CREATE_JOBS_TABLE)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("migrate", e))?;
        Ok(())
    }
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> JobStoreError {
    match err {
        sqlx::Error::Database(db_err) => JobStoreError::storage(format!(
            "database error in {operation}: {}",
            db_err.message()
        )),
        other => JobStoreError::storage(format!("{operation}: {other}")),
    }
}

fn column_u32(row: &SqliteRow, column: &str) -> Result<u32, JobStoreError> {
    let raw: i64 = row
        .try_get(column)
        .map_err(|e| map_sqlx_error("decode", e))?;
    u32::try_from(raw).map_err(|_| JobStoreError::storage(format!("{column} out of range: {raw}")))
}

fn job_from_row(row: &SqliteRow) -> Result<Job, JobStoreError> {
    let decode = |e: sqlx::Error| map_sqlx_error("decode", e);

    let id: i64 = row.try_get("id").map_err(decode)?;
    let job_type: String = row.try_get("type").map_err(decode)?;
    let payload: String = row.try_get("payload").map_err(decode)?;
    let status: String = row.try_get("status").map_err(decode)?;
    let last_error: Option<String> = row.try_get("last_error").map_err(decode)?;
    let created_at: DateTime<Utc> = row.try_get("created_at").map_err(decode)?;
    let updated_at: DateTime<Utc> = row.try_get("updated_at").map_err(decode)?;

    Ok(Job {
        id: JobId::new(id),
        job_type,
        payload: serde_json::from_str(&payload)
            .map_err(|e| JobStoreError::storage(format!("job {id}: invalid payload: {e}")))?,
        status: status
            .parse()
            .map_err(|e| JobStoreError::storage(format!("job {id}: {e}")))?,
        retry_count: column_u32(row, "retry_count")?,
        max_retries: column_u32(row, "max_retries")?,
        last_error,
        created_at,
        updated_at,
    })
}

#[async_trait]
impl JobStore for SqliteJobStore {
    #[instrument(skip_all, fields(job_type = %job.job_type()), err)]
    async fn create_job(&self, job: NewJob) -> Result<JobId, JobStoreError> {
        let payload = serde_json::to_string(job.payload())
            .map_err(|e| JobStoreError::storage(format!("payload serialization: {e}")))?;
        let now = Utc::now();

        let result = sqlx::query(
            r#"
            INSERT INTO jobs (type, payload, status, retry_count, max_retries, created_at, updated_at)
            VALUES (?1, ?2, ?3, 0, ?4, ?5, ?5)
            "#,
        )
        .bind(job.job_type())
        .bind(payload)
        .bind(JobStatus::Pending.as_str())
        .bind(i64::from(job.max_retries()))
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("create_job", e))?;

        Ok(JobId::new(result.last_insert_rowid()))
    }

    #[instrument(skip_all, fields(job_id = %job_id), err)]
    async fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, type, payload, status, retry_count, max_retries, last_error, created_at, updated_at
            FROM jobs
            WHERE id = ?1
            "#,
        )
        .bind(job_id.get())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("get", e))?;

        row.as_ref().map(job_from_row).transpose()
    }

    #[instrument(skip_all, fields(job_id = %job_id), err)]
    async fn get_status(&self, job_id: JobId) -> Result<JobStatus, JobStoreError> {
        let row = sqlx::query("SELECT status FROM jobs WHERE id = ?1")
            .bind(job_id.get())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_status", e))?
            .ok_or(JobStoreError::NotFound(job_id))?;

        let status: String = row
            .try_get("status")
            .map_err(|e| map_sqlx_error("get_status", e))?;
        status
            .parse()
            .map_err(|e| JobStoreError::storage(format!("job {job_id}: {e}")))
    }

    #[instrument(skip_all, fields(job_id = %job_id, status = %status), err)]
    async fn set_status(&self, job_id: JobId, status: JobStatus) -> Result<(), JobStoreError> {
        let result = sqlx::query("UPDATE jobs SET status = ?1, updated_at = ?2 WHERE id = ?3")
            .bind(status.as_str())
            .bind(Utc::now())
            .bind(job_id.get())
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("set_status", e))?;

        if result.rows_affected() == 0 {
            return Err(JobStoreError::NotFound(job_id));
        }
        Ok(())
    }

    #[instrument(skip_all, fields(job_id = %job_id, retry_count = retry_count, terminal = terminal), err)]
    async fn record_failure(
        &self,
        job_id: JobId,
        retry_count: u32,
        error: &str,
        terminal: bool,
    ) -> Result<(), JobStoreError> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = ?1, retry_count = ?2, last_error = ?3, updated_at = ?4
            WHERE id = ?5
            "#,
        )
        .bind(failure_status(terminal).as_str())
        .bind(i64::from(retry_count))
        .bind(error)
        .bind(Utc::now())
        .bind(job_id.get())
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("record_failure", e))?;

        if result.rows_affected() == 0 {
            return Err(JobStoreError::NotFound(job_id));
        }
        Ok(())
    }

    #[instrument(skip_all, fields(job_id = %job_id), err)]
    async fn read_retry_count(&self, job_id: JobId) -> Result<u32, JobStoreError> {
        let row = sqlx::query("SELECT retry_count FROM jobs WHERE id = ?1")
            .bind(job_id.get())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("read_retry_count", e))?
            .ok_or(JobStoreError::NotFound(job_id))?;

        column_u32(&row, "retry_count")
    }
}
