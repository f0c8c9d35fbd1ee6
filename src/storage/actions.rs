//! Action persistence — state-machine-guarded rows linked to an incident

use crate::decision::action_selector::ActionRecommendation;
use crate::storage::StorageError;
use crate::types::{ActionRecord, ActionStatus, ActionType, ExecutionMode, RiskLevel};
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Transaction};
use tracing::warn;
use uuid::Uuid;

type ActionRow = (
    Uuid,
    Uuid,
    String,
    String,
    String,
    String,
    Option<String>,
    String,
    f64,
    String,
    bool,
    serde_json::Value,
    String,
    String,
    DateTime<Utc>,
);

const ACTION_COLUMNS: &str = "id, incident_id, action_type, name, description, target_service, \
     target_resource, risk_level, risk_score, blast_radius, requires_approval, \
     parameters, execution_mode, status, created_at";

fn action_from_row(row: ActionRow) -> Result<ActionRecord, StorageError> {
    let (
        id,
        incident_id,
        action_type,
        name,
        description,
        target_service,
        target_resource,
        risk_level,
        risk_score,
        blast_radius,
        requires_approval,
        parameters,
        execution_mode,
        status,
        created_at,
    ) = row;

    Ok(ActionRecord {
        id,
        incident_id,
        action_type: ActionType::parse(&action_type)
            .ok_or_else(|| StorageError::Corrupt(format!("unknown action type: {action_type}")))?,
        name,
        description,
        target_service,
        target_resource,
        risk_level: RiskLevel::parse(&risk_level)
            .ok_or_else(|| StorageError::Corrupt(format!("unknown risk level: {risk_level}")))?,
        risk_score,
        blast_radius: RiskLevel::parse(&blast_radius)
            .ok_or_else(|| StorageError::Corrupt(format!("unknown blast radius: {blast_radius}")))?,
        requires_approval,
        parameters,
        execution_mode: ExecutionMode::parse(&execution_mode).ok_or_else(|| {
            StorageError::Corrupt(format!("unknown execution mode: {execution_mode}"))
        })?,
        status: ActionStatus::parse(&status)
            .ok_or_else(|| StorageError::Corrupt(format!("unknown action status: {status}")))?,
        created_at,
    })
}

/// Persist a recommendation as a pending-approval action row inside the
/// caller's transaction.
pub async fn insert_recommendation(
    tx: &mut Transaction<'_, Postgres>,
    incident_id: Uuid,
    recommendation: &ActionRecommendation,
    execution_mode: ExecutionMode,
) -> Result<Uuid, StorageError> {
    let id = Uuid::new_v4();

    sqlx::query(
        "INSERT INTO actions \
         (id, incident_id, action_type, name, description, target_service, \
          target_resource, risk_level, risk_score, blast_radius, requires_approval, \
          parameters, execution_mode, status, created_at) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, NOW())",
    )
    .bind(id)
    .bind(incident_id)
    .bind(recommendation.action_type.as_str())
    .bind(&recommendation.name)
    .bind(&recommendation.description)
    .bind(&recommendation.target_service)
    .bind(&recommendation.target_resource)
    .bind(recommendation.risk_level.as_str())
    .bind(recommendation.risk_score)
    .bind(recommendation.blast_radius.as_str())
    .bind(recommendation.requires_approval)
    .bind(&recommendation.parameters)
    .bind(execution_mode.as_str())
    .bind(ActionStatus::PendingApproval.as_str())
    .execute(&mut **tx)
    .await?;

    Ok(id)
}

/// Fetch one action by id.
pub async fn get_action(pool: &PgPool, id: Uuid) -> Result<Option<ActionRecord>, StorageError> {
    let row: Option<ActionRow> = sqlx::query_as(&format!(
        "SELECT {ACTION_COLUMNS} FROM actions WHERE id = $1"
    ))
    .bind(id)
    .fetch_optional(pool)
    .await?;

    row.map(action_from_row).transpose()
}

/// Actions for an incident, newest first.
pub async fn list_for_incident(
    pool: &PgPool,
    incident_id: Uuid,
) -> Result<Vec<ActionRecord>, StorageError> {
    let rows: Vec<ActionRow> = sqlx::query_as(&format!(
        "SELECT {ACTION_COLUMNS} FROM actions \
         WHERE incident_id = $1 ORDER BY created_at DESC"
    ))
    .bind(incident_id)
    .fetch_all(pool)
    .await?;

    rows.into_iter().map(action_from_row).collect()
}

/// Transition an action's status under a row lock, enforcing the state
/// machine. Illegal transitions are rejected and logged.
pub async fn transition_action(
    tx: &mut Transaction<'_, Postgres>,
    id: Uuid,
    next: ActionStatus,
) -> Result<bool, StorageError> {
    let row: Option<(String,)> =
        sqlx::query_as("SELECT status FROM actions WHERE id = $1 FOR UPDATE")
            .bind(id)
            .fetch_optional(&mut **tx)
            .await?;

    let current = match row {
        Some((status,)) => ActionStatus::parse(&status)
            .ok_or_else(|| StorageError::Corrupt(format!("unknown action status: {status}")))?,
        None => return Ok(false),
    };

    if !current.can_transition_to(next) {
        warn!(
            action_id = %id,
            from = current.as_str(),
            to = next.as_str(),
            "illegal action status transition rejected"
        );
        return Ok(false);
    }

    sqlx::query("UPDATE actions SET status = $1 WHERE id = $2")
        .bind(next.as_str())
        .bind(id)
        .execute(&mut **tx)
        .await?;

    Ok(true)
}

/// Record (merge) an execution result payload on an action. Merging lets
/// the executor and the learning loop each contribute their keys.
pub async fn record_execution_result(
    tx: &mut Transaction<'_, Postgres>,
    id: Uuid,
    result: &serde_json::Value,
) -> Result<(), StorageError> {
    sqlx::query(
        "UPDATE actions \
         SET execution_result = COALESCE(execution_result, '{}'::jsonb) || $1 \
         WHERE id = $2",
    )
    .bind(result)
    .bind(id)
    .execute(&mut **tx)
    .await?;
    Ok(())
}
