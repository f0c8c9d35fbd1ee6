//! Confidence Outcome Records — append-only calibration log

use crate::storage::StorageError;
use crate::types::ConfidenceOutcomeRecord;
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

/// Append one calibration record inside the caller's transaction.
pub async fn append_outcome(
    tx: &mut Transaction<'_, Postgres>,
    record: &ConfidenceOutcomeRecord,
) -> Result<Uuid, StorageError> {
    let id = Uuid::new_v4();

    sqlx::query(
        "INSERT INTO confidence_outcomes \
         (id, incident_id, service_name, hypothesis_category, confidence_score, \
          action_type, action_executed, outcome_success, outcome_status, \
          verification_metrics, time_to_resolution_seconds, recorded_at) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, NOW())",
    )
    .bind(id)
    .bind(record.incident_id)
    .bind(&record.service_name)
    .bind(record.hypothesis_category.as_str())
    .bind(record.confidence_score)
    .bind(record.action_type.map(|a| a.as_str()))
    .bind(record.action_executed)
    .bind(record.outcome_success)
    .bind(&record.outcome_status)
    .bind(&record.verification_metrics)
    .bind(record.time_to_resolution_seconds)
    .execute(&mut **tx)
    .await?;

    Ok(id)
}

/// Recent outcome records for a service, newest first.
pub async fn list_for_service(
    pool: &PgPool,
    service_name: &str,
    limit: i64,
) -> Result<Vec<(Uuid, f64, bool)>, StorageError> {
    let rows: Vec<(Uuid, f64, bool)> = sqlx::query_as(
        "SELECT incident_id, confidence_score, outcome_success \
         FROM confidence_outcomes \
         WHERE service_name = $1 \
         ORDER BY recorded_at DESC \
         LIMIT $2",
    )
    .bind(service_name)
    .bind(limit)
    .fetch_all(pool)
    .await?;

    Ok(rows)
}
