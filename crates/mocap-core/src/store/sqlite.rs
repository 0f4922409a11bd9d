//! SQLite implementation of [`JobStore`].
//!
//! Migrations are embedded at compile time from `./migrations` (relative to
//! the crate root) and run by [`SqliteJobStore::connect`]. Queries use the
//! runtime-checked `sqlx::query` form so no `DATABASE_URL` is needed to build.
//!
//! The run guard lives in each `WHERE` clause, which makes every guarded
//! write a single atomic statement.

use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;

use super::{JobStore, Outcome};
use crate::error::StoreError;
use crate::model::{JobId, JobRecord, JobStatus, PipelineKind};

const COLUMNS: &str = "id, name, input_path, pipeline_kind, status, progress, progress_detail, \
                       error, artifact_path, intermediate_path, fps, run, created_at, updated_at";

const RUN_GUARD: &str = "id = ?1 AND run = ?2 AND status NOT IN ('complete', 'failed')";

/// SQLite-backed job store.
#[derive(Clone, Debug)]
pub struct SqliteJobStore {
    pool: SqlitePool,
}

impl SqliteJobStore {
    /// Open (or create) the database at `url` and run pending migrations.
    ///
    /// `url` is a sqlx SQLite URL such as `"sqlite://mocap.db?mode=rwc"` or
    /// `"sqlite::memory:"`. In-memory databases are pinned to one connection
    /// so every query sees the same data.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
        let in_memory = url.contains(":memory:");
        let pool = SqlitePoolOptions::new()
            .max_connections(if in_memory { 1 } else { 8 })
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }
}

#[derive(sqlx::FromRow)]
struct JobRow {
    id: String,
    name: String,
    input_path: String,
    pipeline_kind: String,
    status: String,
    progress: i64,
    progress_detail: String,
    error: String,
    artifact_path: String,
    intermediate_path: String,
    fps: f64,
    run: i64,
    created_at: String,
    updated_at: String,
}

impl TryFrom<JobRow> for JobRecord {
    type Error = StoreError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let corrupt = |message: String| StoreError::Corrupt {
            id: row.id.clone(),
            message,
        };
        let id = row
            .id
            .parse::<JobId>()
            .map_err(|e| corrupt(format!("bad id: {e}")))?;
        let pipeline_kind = PipelineKind::from_str(&row.pipeline_kind)
            .map_err(|_| corrupt(format!("unknown pipeline kind '{}'", row.pipeline_kind)))?;
        let status = JobStatus::from_str(&row.status)
            .map_err(|_| corrupt(format!("unknown status '{}'", row.status)))?;

        Ok(JobRecord {
            id,
            name: row.name,
            input_path: row.input_path,
            pipeline_kind,
            status,
            progress: row.progress.clamp(0, 100) as u8,
            progress_detail: row.progress_detail,
            error: row.error,
            artifact_path: row.artifact_path,
            intermediate_path: row.intermediate_path,
            fps: row.fps,
            run: row.run,
            created_at: parse_timestamp(&row.created_at, "created_at"),
            updated_at: parse_timestamp(&row.updated_at, "updated_at"),
        })
    }
}

fn parse_timestamp(raw: &str, column: &str) -> DateTime<Utc> {
    raw.parse().unwrap_or_else(|e: chrono::ParseError| {
        tracing::warn!(raw = %raw, column, error = %e, "failed to parse job timestamp; using now");
        Utc::now()
    })
}

fn now() -> String {
    Utc::now().to_rfc3339()
}

#[async_trait]
impl JobStore for SqliteJobStore {
    async fn insert(&self, job: &JobRecord) -> Result<(), StoreError> {
        sqlx::query(&format!(
            "INSERT INTO jobs ({COLUMNS}) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)"
        ))
        .bind(job.id.to_string())
        .bind(&job.name)
        .bind(&job.input_path)
        .bind(job.pipeline_kind.as_ref())
        .bind(job.status.as_ref())
        .bind(i64::from(job.progress))
        .bind(&job.progress_detail)
        .bind(&job.error)
        .bind(&job.artifact_path)
        .bind(&job.intermediate_path)
        .bind(job.fps)
        .bind(job.run)
        .bind(job.created_at.to_rfc3339())
        .bind(job.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, id: JobId) -> Result<Option<JobRecord>, StoreError> {
        let row: Option<JobRow> =
            sqlx::query_as(&format!("SELECT {COLUMNS} FROM jobs WHERE id = ?1"))
                .bind(id.to_string())
                .fetch_optional(&self.pool)
                .await?;
        row.map(JobRecord::try_from).transpose()
    }

    async fn list(&self) -> Result<Vec<JobRecord>, StoreError> {
        let rows: Vec<JobRow> =
            sqlx::query_as(&format!("SELECT {COLUMNS} FROM jobs ORDER BY created_at DESC"))
                .fetch_all(&self.pool)
                .await?;
        rows.into_iter().map(JobRecord::try_from).collect()
    }

    async fn list_by_status(&self, statuses: &[JobStatus]) -> Result<Vec<JobRecord>, StoreError> {
        if statuses.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = (1..=statuses.len())
            .map(|i| format!("?{i}"))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "SELECT {COLUMNS} FROM jobs WHERE status IN ({placeholders}) ORDER BY created_at DESC"
        );
        let mut query = sqlx::query_as::<_, JobRow>(&sql);
        for status in statuses {
            query = query.bind(status.as_ref());
        }
        let rows = query.fetch_all(&self.pool).await?;
        rows.into_iter().map(JobRecord::try_from).collect()
    }

    async fn delete(&self, id: JobId) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM jobs WHERE id = ?1")
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn enter_stage(
        &self,
        id: JobId,
        run: i64,
        status: JobStatus,
        progress: u8,
        detail: &str,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(&format!(
            "UPDATE jobs SET status = ?3, progress = MAX(progress, ?4), progress_detail = ?5, \
             updated_at = ?6 WHERE {RUN_GUARD}"
        ))
        .bind(id.to_string())
        .bind(run)
        .bind(status.as_ref())
        .bind(i64::from(progress.min(100)))
        .bind(detail)
        .bind(now())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn update_progress(
        &self,
        id: JobId,
        run: i64,
        progress: u8,
        detail: &str,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(&format!(
            "UPDATE jobs SET progress = MAX(progress, ?3), progress_detail = ?4, updated_at = ?5 \
             WHERE {RUN_GUARD}"
        ))
        .bind(id.to_string())
        .bind(run)
        .bind(i64::from(progress.min(100)))
        .bind(detail)
        .bind(now())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn set_intermediate(&self, id: JobId, run: i64, path: &str) -> Result<bool, StoreError> {
        let result = sqlx::query(&format!(
            "UPDATE jobs SET intermediate_path = ?3, updated_at = ?4 WHERE {RUN_GUARD}"
        ))
        .bind(id.to_string())
        .bind(run)
        .bind(path)
        .bind(now())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn finish(&self, id: JobId, run: i64, outcome: &Outcome) -> Result<bool, StoreError> {
        let result = match outcome {
            Outcome::Complete {
                artifact_path,
                detail,
                fps,
            } => {
                sqlx::query(&format!(
                    "UPDATE jobs SET status = 'complete', progress = 100, progress_detail = ?3, \
                     error = '', artifact_path = ?4, fps = COALESCE(?5, fps), updated_at = ?6 \
                     WHERE {RUN_GUARD}"
                ))
                .bind(id.to_string())
                .bind(run)
                .bind(detail)
                .bind(artifact_path)
                .bind(*fps)
                .bind(now())
                .execute(&self.pool)
                .await?
            }
            Outcome::Failed { error, detail } => {
                sqlx::query(&format!(
                    "UPDATE jobs SET status = 'failed', error = ?3, \
                     progress_detail = COALESCE(?4, progress_detail), updated_at = ?5 \
                     WHERE {RUN_GUARD}"
                ))
                .bind(id.to_string())
                .bind(run)
                .bind(error)
                .bind(detail.as_deref())
                .bind(now())
                .execute(&self.pool)
                .await?
            }
        };
        Ok(result.rows_affected() > 0)
    }

    async fn reset(&self, id: JobId, detail: &str) -> Result<Option<JobRecord>, StoreError> {
        let result = sqlx::query(
            "UPDATE jobs SET status = 'pending', progress = 0, progress_detail = ?2, error = '', \
             artifact_path = '', intermediate_path = '', run = run + 1, updated_at = ?3 \
             WHERE id = ?1 AND status IN ('complete', 'failed')",
        )
        .bind(id.to_string())
        .bind(detail)
        .bind(now())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Ok(None);
        }
        self.get(id).await
    }
}
