//! Analysis Work Queue — PostgreSQL-backed async dispatch
//!
//! Uses `SELECT FOR UPDATE SKIP LOCKED` so multiple worker replicas each
//! claim their own job without stepping on each other. Jobs carry a retry
//! budget; exhausting it parks the job in `'failed'` permanently.

use crate::storage::StorageError;
use sqlx::PgPool;
use tracing::warn;
use uuid::Uuid;

/// Recognised job type strings (stored as TEXT so new types don't need
/// migrations).
pub mod job_type {
    pub const ANALYZE_INCIDENT: &str = "analyze_incident";
    pub const EXECUTE_ACTION: &str = "execute_action";
}

/// A claimed job ready for processing.
#[derive(Debug, Clone)]
pub struct AnalysisJob {
    pub id: Uuid,
    pub job_type: String,
    pub incident_id: Uuid,
    pub payload: serde_json::Value,
    pub retry_count: i32,
    pub max_retries: i32,
}

/// Enqueue a new job, returning its generated ID.
pub async fn enqueue_job(
    pool: &PgPool,
    job_type: &str,
    incident_id: Uuid,
    payload: serde_json::Value,
) -> Result<Uuid, StorageError> {
    let id = Uuid::new_v4();

    sqlx::query(
        "INSERT INTO analysis_jobs (id, job_type, incident_id, payload) \
         VALUES ($1, $2, $3, $4)",
    )
    .bind(id)
    .bind(job_type)
    .bind(incident_id)
    .bind(&payload)
    .execute(pool)
    .await?;

    Ok(id)
}

/// Atomically claim the next pending job.
///
/// Single `UPDATE … RETURNING` over a `FOR UPDATE SKIP LOCKED` subquery:
/// concurrent callers never claim the same row. Returns `None` when the
/// queue is empty.
pub async fn claim_job(pool: &PgPool) -> Result<Option<AnalysisJob>, StorageError> {
    let row: Option<(Uuid, String, Uuid, serde_json::Value, i32, i32)> = sqlx::query_as(
        r#"
        UPDATE analysis_jobs
        SET    status = 'running',
               claimed_at = NOW()
        WHERE  id = (
            SELECT id
            FROM   analysis_jobs
            WHERE  status = 'pending'
              AND  retry_count < max_retries
            ORDER  BY created_at ASC
            LIMIT  1
            FOR UPDATE SKIP LOCKED
        )
        RETURNING id, job_type, incident_id, payload, retry_count, max_retries
        "#,
    )
    .fetch_optional(pool)
    .await?;

    Ok(row.map(
        |(id, job_type, incident_id, payload, retry_count, max_retries)| AnalysisJob {
            id,
            job_type,
            incident_id,
            payload,
            retry_count,
            max_retries,
        },
    ))
}

/// Mark a job as successfully completed.
pub async fn complete_job(pool: &PgPool, job: &AnalysisJob) -> Result<(), StorageError> {
    sqlx::query(
        "UPDATE analysis_jobs \
         SET status = 'done', completed_at = NOW() \
         WHERE id = $1",
    )
    .bind(job.id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Mark a job as failed. Increments `retry_count`; when the budget is
/// exhausted the job transitions to `'failed'` permanently, otherwise it
/// returns to `'pending'` for another worker.
pub async fn fail_job(pool: &PgPool, job: &AnalysisJob, error: &str) -> Result<(), StorageError> {
    let next_retry = job.retry_count + 1;
    let exhausted = next_retry >= job.max_retries;
    let new_status = if exhausted { "failed" } else { "pending" };

    if exhausted {
        warn!(
            job_id = %job.id,
            job_type = %job.job_type,
            retries = next_retry,
            "job permanently failed after {} attempts",
            next_retry
        );
    }

    sqlx::query(
        "UPDATE analysis_jobs \
         SET status        = $1, \
             retry_count   = $2, \
             error_message = $3, \
             completed_at  = CASE WHEN $4 THEN NOW() ELSE NULL END, \
             claimed_at    = NULL \
         WHERE id = $5",
    )
    .bind(new_status)
    .bind(next_retry)
    .bind(error)
    .bind(exhausted)
    .bind(job.id)
    .execute(pool)
    .await?;

    Ok(())
}

/// Count pending jobs (metrics/logging).
pub async fn pending_job_count(pool: &PgPool) -> Result<i64, StorageError> {
    let count: (i64,) =
        sqlx::query_as("SELECT COUNT(*) FROM analysis_jobs WHERE status = 'pending'")
            .fetch_one(pool)
            .await?;
    Ok(count.0)
}
