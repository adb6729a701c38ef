//! Job records in the `jobs` table.

use std::str::FromStr;

use async_trait::async_trait;
use tracing::debug;
use uuid::Uuid;
use vigil_job_queue::{
    JobRecord, JobStatus, Metadata, StateStore, StatusCounts, StoreError, TransitionOutcome,
};

use crate::pool::DbPool;
use crate::utils::{format_timestamp, parse_timestamp};

const JOB_COLUMNS: &str = "job_id, keyword, metadata, status, created_at, started_at, \
     processed_at, total_results, results_payload, error, processed_via";

#[derive(Debug, sqlx::FromRow)]
pub struct JobsRow {
    pub job_id: String,
    pub keyword: String,
    pub metadata: String,
    pub status: String,
    pub created_at: String,
    pub started_at: Option<String>,
    pub processed_at: Option<String>,
    pub total_results: Option<i64>,
    pub results_payload: Option<String>,
    pub error: Option<String>,
    pub processed_via: Option<String>,
}

impl TryFrom<JobsRow> for JobRecord {
    type Error = StoreError;

    fn try_from(row: JobsRow) -> Result<Self, Self::Error> {
        let corrupt = |field: &str, err: &dyn std::fmt::Display| {
            StoreError::Corrupt(format!("job {}: bad {field}: {err}", row.job_id))
        };

        let job_id = Uuid::parse_str(&row.job_id).map_err(|e| corrupt("job_id", &e))?;
        let metadata: Metadata =
            serde_json::from_str(&row.metadata).map_err(|e| corrupt("metadata", &e))?;
        let status = JobStatus::from_str(&row.status).map_err(|e| corrupt("status", &e))?;
        let created_at = parse_timestamp(&row.created_at).map_err(|e| corrupt("created_at", &e))?;
        let started_at = row
            .started_at
            .as_deref()
            .map(parse_timestamp)
            .transpose()
            .map_err(|e| corrupt("started_at", &e))?;
        let processed_at = row
            .processed_at
            .as_deref()
            .map(parse_timestamp)
            .transpose()
            .map_err(|e| corrupt("processed_at", &e))?;
        let total_results = row
            .total_results
            .map(u64::try_from)
            .transpose()
            .map_err(|e| corrupt("total_results", &e))?;
        let results_payload = row
            .results_payload
            .as_deref()
            .map(serde_json::from_str::<serde_json::Value>)
            .transpose()
            .map_err(|e| corrupt("results_payload", &e))?;

        Ok(JobRecord {
            job_id,
            keyword: row.keyword,
            metadata,
            status,
            created_at,
            started_at,
            processed_at,
            total_results,
            results_payload,
            error: row.error,
            processed_via: row.processed_via,
        })
    }
}

fn backend(err: sqlx::Error) -> StoreError {
    StoreError::Backend(err.to_string())
}

fn encode_json<T: serde::Serialize>(value: &T) -> Result<String, StoreError> {
    serde_json::to_string(value).map_err(|e| StoreError::Backend(format!("encode json: {e}")))
}

/// [`StateStore`] over the shared SQLite database.
///
/// Every write is a single statement, so there is no cross-job locking;
/// forward-only transitions are enforced by the `status_rank` guard in SQL.
#[derive(Debug, Clone)]
pub struct SqlStateStore {
    pool: DbPool,
}

impl SqlStateStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }
}

#[async_trait]
impl StateStore for SqlStateStore {
    async fn create(&self, record: &JobRecord) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO jobs (job_id, keyword, metadata, status, status_rank, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(record.job_id.to_string())
        .bind(&record.keyword)
        .bind(encode_json(&record.metadata)?)
        .bind(record.status.as_str())
        .bind(record.status.rank())
        .bind(format_timestamp(&record.created_at))
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                Err(StoreError::Duplicate(record.job_id))
            }
            Err(err) => Err(backend(err)),
        }
    }

    async fn transition(&self, record: &JobRecord) -> Result<TransitionOutcome, StoreError> {
        let payload = record
            .results_payload
            .as_ref()
            .map(encode_json)
            .transpose()?;
        let total_results = record.total_results.map(|n| n.min(i64::MAX as u64) as i64);

        let result = sqlx::query(
            r#"
            INSERT INTO jobs (
                job_id, keyword, metadata, status, status_rank, created_at,
                started_at, processed_at, total_results, results_payload, error, processed_via
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(job_id) DO UPDATE SET
                status = excluded.status,
                status_rank = excluded.status_rank,
                started_at = COALESCE(jobs.started_at, excluded.started_at),
                processed_at = excluded.processed_at,
                total_results = excluded.total_results,
                results_payload = excluded.results_payload,
                error = excluded.error,
                processed_via = excluded.processed_via
            WHERE jobs.status_rank < excluded.status_rank
            "#,
        )
        .bind(record.job_id.to_string())
        .bind(&record.keyword)
        .bind(encode_json(&record.metadata)?)
        .bind(record.status.as_str())
        .bind(record.status.rank())
        .bind(format_timestamp(&record.created_at))
        .bind(record.started_at.as_ref().map(format_timestamp))
        .bind(record.processed_at.as_ref().map(format_timestamp))
        .bind(total_results)
        .bind(payload)
        .bind(record.error.as_deref())
        .bind(record.processed_via.as_deref())
        .execute(&self.pool)
        .await
        .map_err(backend)?;

        if result.rows_affected() > 0 {
            Ok(TransitionOutcome::Applied)
        } else {
            debug!(job_id = %record.job_id, status = %record.status, "stale transition ignored");
            Ok(TransitionOutcome::Unchanged)
        }
    }

    async fn get(&self, job_id: Uuid) -> Result<Option<JobRecord>, StoreError> {
        let row = sqlx::query_as::<_, JobsRow>(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE job_id = ?"
        ))
        .bind(job_id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?;

        row.map(JobRecord::try_from).transpose()
    }

    async fn get_all(&self) -> Result<Vec<JobRecord>, StoreError> {
        let rows = sqlx::query_as::<_, JobsRow>(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs ORDER BY created_at DESC, job_id"
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;

        rows.into_iter().map(JobRecord::try_from).collect()
    }

    async fn counts_by_status(&self) -> Result<StatusCounts, StoreError> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM jobs GROUP BY status")
                .fetch_all(&self.pool)
                .await
                .map_err(backend)?;

        let mut counts = StatusCounts::default();
        for (status, count) in rows {
            let status = JobStatus::from_str(&status)
                .map_err(|e| StoreError::Corrupt(format!("unknown status in jobs table: {e}")))?;
            counts.add(status, u64::try_from(count).unwrap_or_default());
        }
        Ok(counts)
    }

    async fn list(
        &self,
        status: Option<JobStatus>,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<JobRecord>, StoreError> {
        let status = status.map(JobStatus::as_str);
        let rows = sqlx::query_as::<_, JobsRow>(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE (? IS NULL OR status = ?) \
             ORDER BY created_at DESC, job_id LIMIT ? OFFSET ?"
        ))
        .bind(status)
        .bind(status)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .bind(i64::try_from(offset).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;

        rows.into_iter().map(JobRecord::try_from).collect()
    }
}
