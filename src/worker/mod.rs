//! Worker Path — queue-driven analysis and execution
//!
//! Workers claim jobs from the Postgres queue and dispatch by job type:
//! `analyze_incident` runs the reasoning pipeline, `execute_action` drives
//! an approved action through the executor and verifier. Terminal states
//! are committed explicitly: a failure inside either pipeline never leaves
//! an incident stuck in a non-terminal status.

pub mod analysis;
pub mod execute;

pub use analysis::{analyze_incident, AnalysisDeps, AnalysisOutcome};
pub use execute::{execute_action, ExecutionDeps, ExecutionOutcome};

use crate::storage::queue::{self, job_type, AnalysisJob};
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Idle sleep between claim attempts when the queue is empty.
const IDLE_POLL: Duration = Duration::from_secs(2);

/// Delay before a failed job becomes eligible again.
const RETRY_DELAY: Duration = Duration::from_secs(10);

/// Soft time limit for one job. On expiry the incident is marked failed
/// and the job ends cleanly; the hard limit is the host's concern.
const SOFT_TIME_LIMIT: Duration = Duration::from_secs(300);

/// Everything a worker task needs, wired once at startup.
pub struct WorkerDeps {
    pub analysis: AnalysisDeps,
    pub execution: ExecutionDeps,
}

/// Claim-and-run loop for one worker task. Runs until cancelled.
pub async fn run_worker(pool: PgPool, deps: Arc<WorkerDeps>, shutdown: CancellationToken) {
    info!("worker started");

    loop {
        if shutdown.is_cancelled() {
            info!("worker stopped");
            return;
        }

        let job = match queue::claim_job(&pool).await {
            Ok(Some(job)) => job,
            Ok(None) => {
                tokio::select! {
                    _ = tokio::time::sleep(IDLE_POLL) => continue,
                    _ = shutdown.cancelled() => continue,
                }
            }
            Err(e) => {
                error!(error = %e, "job claim failed");
                tokio::time::sleep(IDLE_POLL).await;
                continue;
            }
        };

        process_job(&pool, &deps, job).await;
    }
}

async fn process_job(pool: &PgPool, deps: &WorkerDeps, job: AnalysisJob) {
    info!(
        job_id = %job.id,
        job_type = %job.job_type,
        incident_id = %job.incident_id,
        "processing job"
    );

    let outcome = tokio::time::timeout(SOFT_TIME_LIMIT, dispatch(deps, &job)).await;

    match outcome {
        Ok(Ok(())) => {
            if let Err(e) = queue::complete_job(pool, &job).await {
                error!(job_id = %job.id, error = %e, "failed to mark job done");
            }
        }
        Ok(Err(e)) => {
            // Transient failure (datastore unreachable mid-flight). The
            // retry budget lives on the job row.
            warn!(job_id = %job.id, error = %e, "job failed, returning to queue");
            if let Err(e) = queue::fail_job(pool, &job, &e.to_string()).await {
                error!(job_id = %job.id, error = %e, "failed to record job failure");
            }
            tokio::time::sleep(RETRY_DELAY).await;
        }
        Err(_elapsed) => {
            // Soft limit expired: the incident must still reach a terminal
            // state before the job ends.
            error!(
                job_id = %job.id,
                incident_id = %job.incident_id,
                "job soft time limit exceeded"
            );
            analysis::mark_incident_failed(pool, job.incident_id, "job timed out").await;
            if let Err(e) = queue::fail_job(pool, &job, "soft time limit exceeded").await {
                error!(job_id = %job.id, error = %e, "failed to record job timeout");
            }
        }
    }
}

async fn dispatch(deps: &WorkerDeps, job: &AnalysisJob) -> Result<(), crate::storage::StorageError> {
    match job.job_type.as_str() {
        job_type::ANALYZE_INCIDENT => {
            let outcome = analyze_incident(&deps.analysis, job.incident_id).await?;
            info!(job_id = %job.id, outcome = ?outcome, "analysis finished");
            Ok(())
        }
        job_type::EXECUTE_ACTION => {
            let outcome = execute_action(&deps.execution, job).await?;
            info!(job_id = %job.id, outcome = ?outcome, "execution finished");
            Ok(())
        }
        other => {
            // Structural: retrying an unknown type cannot help
            error!(job_id = %job.id, job_type = other, "unknown job type, dropping");
            Ok(())
        }
    }
}
