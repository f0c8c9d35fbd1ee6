//! Action Execution Task — approved action → executor → verification
//!
//! Runs once per approved action: transitions the action into `executing`
//! under a row lock (only the executor leaves that state), drives the
//! validate → dry-run/execute contract, verifies the effect against
//! before/after health metrics, and lands both rows in terminal states.

use crate::execution::kubernetes::{OrchestratorClient, PodRestartExecutor, ScaleExecutor};
use crate::execution::verification::{PostActionVerifier, Recommendation};
use crate::execution::{ActionExecutor, ExecutionResult, RollbackOutcome};
use crate::storage::queue::AnalysisJob;
use crate::storage::{actions, incidents, StorageError};
use crate::types::{ActionStatus, ActionType, ExecutionMode, IncidentStatus};
use sqlx::PgPool;
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Terminal result of one execution run.
#[derive(Debug)]
pub enum ExecutionOutcome {
    /// Executor and verifier both ran; statuses are committed.
    Completed {
        action_status: ActionStatus,
        incident_status: IncidentStatus,
    },
    /// Action was not in `approved` — another run already handled it.
    Skipped { status: ActionStatus },
    /// Job payload did not reference an existing action.
    NotFound,
}

/// Dependencies for the execution task.
pub struct ExecutionDeps {
    pub pool: PgPool,
    pub verifier: PostActionVerifier,
    pub orchestrator: Option<Arc<dyn OrchestratorClient>>,
    pub dry_run_mode: bool,
}

/// Executor dispatch per action type. Only pod restart and scaling have
/// concrete executors; anything else is refused at execution time.
fn executor_for(
    action_type: ActionType,
    dry_run: bool,
    orchestrator: Option<Arc<dyn OrchestratorClient>>,
) -> Option<Box<dyn ActionExecutor>> {
    match action_type {
        ActionType::RestartPod => Some(Box::new(PodRestartExecutor::new(dry_run, orchestrator))),
        ActionType::ScaleUp | ActionType::ScaleDown => {
            Some(Box::new(ScaleExecutor::new(dry_run, orchestrator)))
        }
        _ => None,
    }
}

/// Run the execution pipeline for one approved action.
pub async fn execute_action(
    deps: &ExecutionDeps,
    job: &AnalysisJob,
) -> Result<ExecutionOutcome, StorageError> {
    let action_id = match job
        .payload
        .get("action_id")
        .and_then(serde_json::Value::as_str)
        .and_then(|s| Uuid::parse_str(s).ok())
    {
        Some(id) => id,
        None => {
            error!(job_id = %job.id, "execution job missing action_id");
            return Ok(ExecutionOutcome::NotFound);
        }
    };

    let action = match actions::get_action(&deps.pool, action_id).await? {
        Some(action) => action,
        None => {
            error!(action_id = %action_id, "action not found for execution");
            return Ok(ExecutionOutcome::NotFound);
        }
    };

    // Claim the action: approved → executing, both rows in one commit.
    // The transition is row-locked, so a second worker observes a
    // non-approved status and no-ops.
    let mut tx = deps.pool.begin().await?;
    let claimed = actions::transition_action(&mut tx, action_id, ActionStatus::Executing).await?;
    if !claimed {
        tx.rollback().await?;
        let current = actions::get_action(&deps.pool, action_id)
            .await?
            .map(|a| a.status)
            .unwrap_or(ActionStatus::Failed);
        warn!(action_id = %action_id, status = current.as_str(), "action not claimable, skipping");
        return Ok(ExecutionOutcome::Skipped { status: current });
    }
    incidents::set_incident_status(&mut tx, action.incident_id, IncidentStatus::Executing).await?;
    tx.commit().await?;

    // Dry-run wins if either the action row or the process says so
    let dry_run = deps.dry_run_mode || action.execution_mode == ExecutionMode::DryRun;

    let executor = executor_for(action.action_type, dry_run, deps.orchestrator.clone());
    let result = match &executor {
        Some(executor) => {
            executor
                .execute(&action.target_service, &action.parameters)
                .await
        }
        None => {
            // Policy refusal: never substitute a different executor
            warn!(
                action_id = %action_id,
                action_type = %action.action_type,
                "no executor registered for action type"
            );
            ExecutionResult::failed(
                format!("no executor registered for {}", action.action_type),
                chrono::Utc::now(),
                "unsupported action type",
                dry_run,
            )
        }
    };

    let verification = deps
        .verifier
        .verify(&action.target_service, &result, None)
        .await;

    // Rollback when verification says so and the executor supports it
    let (action_status, incident_status) = match verification.recommendation {
        Recommendation::Continue => (ActionStatus::Succeeded, IncidentStatus::Resolved),
        Recommendation::Monitor => (ActionStatus::Succeeded, IncidentStatus::Executing),
        Recommendation::Escalate => (ActionStatus::Succeeded, IncidentStatus::Escalated),
        Recommendation::Rollback => match &executor {
            Some(executor) => match executor.rollback(&action.target_service, &result).await {
                RollbackOutcome::Attempted(rollback) if rollback.is_success() => {
                    info!(action_id = %action_id, "action rolled back after degraded verification");
                    (ActionStatus::RolledBack, IncidentStatus::Escalated)
                }
                RollbackOutcome::Attempted(_) => {
                    error!(action_id = %action_id, "rollback attempt failed");
                    (ActionStatus::Failed, IncidentStatus::Failed)
                }
                RollbackOutcome::NotApplicable => {
                    warn!(action_id = %action_id, "rollback not applicable, escalating");
                    (ActionStatus::Failed, IncidentStatus::Escalated)
                }
            },
            None => (ActionStatus::Failed, IncidentStatus::Failed),
        },
    };

    // Commit terminal states plus the execution/verification payloads
    let mut tx = deps.pool.begin().await?;
    actions::transition_action(&mut tx, action_id, action_status).await?;
    actions::record_execution_result(
        &mut tx,
        action_id,
        &serde_json::json!({
            "execution": result,
            "verification": {
                "status": verification.status,
                "recommendation": verification.recommendation,
                "improvement_percentage": verification.improvement_percentage,
                "message": verification.message,
            },
        }),
    )
    .await?;
    if incident_status != IncidentStatus::Executing {
        incidents::set_incident_status(&mut tx, action.incident_id, incident_status).await?;
    }
    tx.commit().await?;

    info!(
        action_id = %action_id,
        incident_id = %action.incident_id,
        action_status = action_status.as_str(),
        incident_status = incident_status.as_str(),
        verification = verification.status.as_str(),
        "action execution complete"
    );

    Ok(ExecutionOutcome::Completed {
        action_status,
        incident_status,
    })
}
