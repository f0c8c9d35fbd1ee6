//! Incident Analysis Task — metrics → detection → reasoning → action row
//!
//! Invoked per incident transitioning to `analyzing`. The status check at
//! the top makes the task idempotent: a second run observes a different
//! status and no-ops. Failures are converted into an explicitly committed
//! `failed` status — the pipeline result type replaces raise-to-rollback
//! control flow, so no error path can strand an incident in `analyzing`.

use crate::decision::action_selector::ActionSelector;
use crate::decision::blast_radius::BlastRadiusCalculator;
use crate::decision::risk_profiles::ActionRiskRegistry;
use crate::metrics_client::MetricClient;
use crate::perception::anomaly_detector::{Anomaly, AnomalyDetector};
use crate::reasoning::hypothesis::HypothesisGenerator;
use crate::storage::{actions, hypotheses, incidents, StorageError};
use crate::topology::DependencyGraph;
use crate::types::{ExecutionMode, Incident, IncidentStatus, ServiceContext};
use sqlx::PgPool;
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Everything the analysis task needs, wired once at worker startup.
pub struct AnalysisDeps {
    pub pool: PgPool,
    pub metrics: MetricClient,
    pub generator: HypothesisGenerator,
    pub selector: ActionSelector,
    pub blast: BlastRadiusCalculator,
    pub risks: ActionRiskRegistry,
    pub graph: Arc<DependencyGraph>,
    pub detector: AnomalyDetector,
    pub lookback_minutes: i64,
    pub execution_mode: ExecutionMode,
}

/// Terminal result of one analysis run. Every variant corresponds to a
/// committed incident state.
#[derive(Debug)]
pub enum AnalysisOutcome {
    /// Hypotheses persisted; action row created iff `action_created`.
    Completed {
        hypothesis_count: usize,
        action_created: bool,
    },
    /// Benign flap: no anomalies in current metrics, incident resolved.
    NoAnomalies,
    /// Incident was not in `analyzing` — another run already handled it.
    Skipped { status: IncidentStatus },
    /// Incident id does not exist.
    NotFound,
    /// Pipeline failed; incident committed as `failed`.
    Failed { error: String },
}

/// Run the analysis pipeline for one incident.
///
/// The returned `StorageError` covers only infrastructure failures around
/// the terminal-state bookkeeping itself; pipeline failures come back as
/// `AnalysisOutcome::Failed` with the incident already committed `failed`.
pub async fn analyze_incident(
    deps: &AnalysisDeps,
    incident_id: Uuid,
) -> Result<AnalysisOutcome, StorageError> {
    let mut tx = deps.pool.begin().await?;

    let incident = match incidents::get_incident_for_update(&mut tx, incident_id).await? {
        Some(incident) => incident,
        None => {
            error!(incident_id = %incident_id, "incident not found in analysis task");
            tx.rollback().await?;
            return Ok(AnalysisOutcome::NotFound);
        }
    };

    if incident.status != IncidentStatus::Analyzing {
        warn!(
            incident_id = %incident_id,
            status = incident.status.as_str(),
            "incident not in analyzing status, skipping"
        );
        tx.rollback().await?;
        return Ok(AnalysisOutcome::Skipped {
            status: incident.status,
        });
    }

    match run_pipeline(deps, &mut tx, &incident).await {
        Ok(outcome) => {
            tx.commit().await?;
            Ok(outcome)
        }
        Err(e) => {
            // Drop the poisoned transaction, then commit the failed state
            // in a fresh one so it cannot be lost.
            let message = e.to_string();
            error!(incident_id = %incident_id, error = %message, "analysis pipeline failed");
            tx.rollback().await?;
            mark_incident_failed(&deps.pool, incident_id, &message).await;
            Ok(AnalysisOutcome::Failed { error: message })
        }
    }
}

/// The pipeline proper, running inside the caller's transaction.
async fn run_pipeline(
    deps: &AnalysisDeps,
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    incident: &Incident,
) -> anyhow::Result<AnalysisOutcome> {
    let service = &incident.affected_service;

    // Fetch fresh metrics and re-run detection
    let service_metrics = deps
        .metrics
        .service_metrics(service, deps.lookback_minutes)
        .await;
    let all_series: Vec<_> = service_metrics.into_values().flatten().collect();
    let anomalies: Vec<Anomaly> = deps.detector.detect_multiple(&all_series);

    if anomalies.is_empty() {
        // Benign flap: whatever triggered detection has already cleared
        warn!(incident_id = %incident.id, "no anomalies in current metrics, resolving");
        incidents::set_incident_status(tx, incident.id, IncidentStatus::Resolved).await?;
        return Ok(AnalysisOutcome::NoAnomalies);
    }

    let context = service_context(&deps.graph, service);
    let (response, llm_response) = deps
        .generator
        .generate(&anomalies, service, Some(&context))
        .await?;

    hypotheses::insert_hypotheses(tx, incident.id, &response.hypotheses, &llm_response).await?;

    // Size the downstream impact; the urgency decision is advisory here
    // (approval still gates execution) but recorded for the operator.
    let blast = deps.blast.calculate(service).await;
    let top_confidence = response
        .hypotheses
        .first()
        .map(|h| h.confidence_score)
        .unwrap_or(0.0);
    let urgency = BlastRadiusCalculator::should_act_immediately(&blast, top_confidence);
    info!(incident_id = %incident.id, urgency = ?urgency, "blast radius assessed");

    sqlx::query(
        "UPDATE incidents SET context = context || $1::jsonb WHERE id = $2",
    )
    .bind(serde_json::json!({ "blast_radius": &blast }))
    .bind(incident.id)
    .execute(&mut **tx)
    .await?;

    let mut recommendation = deps
        .selector
        .select_best(&response.hypotheses, service, Some(&context));

    let action_created = match &mut recommendation {
        Some(recommendation) => {
            // Cost the action against the blast-scaled risk catalogue so
            // the approver sees the stakes alongside the hypothesis.
            let expected =
                deps.risks.expected_cost(recommendation.action_type, blast.urgency_multiplier);
            let worst =
                deps.risks.worst_case_cost(recommendation.action_type, blast.urgency_multiplier);
            recommendation.reasoning = format!(
                "{}\nRisk assessment: expected cost ${expected:.2}, worst case ${worst:.2}, urgency {:.1}x",
                recommendation.reasoning, blast.urgency_multiplier
            );

            actions::insert_recommendation(tx, incident.id, recommendation, deps.execution_mode)
                .await?;
            true
        }
        None => {
            info!(incident_id = %incident.id, "no action recommendation from runbook policy");
            false
        }
    };

    incidents::set_incident_status(tx, incident.id, IncidentStatus::PendingApproval).await?;

    info!(
        incident_id = %incident.id,
        hypotheses = response.hypotheses.len(),
        action_created,
        tokens = llm_response.total_tokens,
        "analysis complete"
    );

    Ok(AnalysisOutcome::Completed {
        hypothesis_count: response.hypotheses.len(),
        action_created,
    })
}

/// Commit a `failed` status for an incident in its own transaction.
/// Used by the error path and the timeout cleanup. Errors here are
/// logged, not propagated, so the job can still end.
pub async fn mark_incident_failed(pool: &PgPool, incident_id: Uuid, reason: &str) {
    let result = async {
        let mut tx = pool.begin().await?;
        incidents::set_incident_status(&mut tx, incident_id, IncidentStatus::Failed).await?;
        tx.commit().await?;
        Ok::<(), StorageError>(())
    }
    .await;

    match result {
        Ok(()) => {
            info!(incident_id = %incident_id, reason, "incident marked failed");
        }
        Err(e) => {
            error!(
                incident_id = %incident_id,
                error = %e,
                "could not mark incident failed — monitor will observe the stuck state"
            );
        }
    }
}

/// Build the service context handed to reasoning and decision from the
/// topology graph.
fn service_context(graph: &DependencyGraph, service: &str) -> ServiceContext {
    let node = graph.get(service);
    ServiceContext {
        dependencies: graph.upstream(service),
        recent_deployments: None,
        tier: node.and_then(|n| n.tier.clone()),
        team: node.and_then(|n| n.team.clone()),
        current_replicas: None,
        pod_name: None,
    }
}
