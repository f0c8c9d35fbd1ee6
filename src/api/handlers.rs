//! API handlers for the incident pipeline surface
//!
//! The analysis path is asynchronous: handlers enqueue work and answer
//! with 202 semantics. Expensive endpoints sit behind the shared-cache
//! rate limiters; denials carry a Retry-After hint.

use crate::api::envelope::{ApiErrorResponse, ApiResponse};
use crate::api::EngineState;
use crate::ratelimit::RateLimitDecision;
use crate::storage::{incidents, queue};
use crate::types::{IncidentOutcome, IncidentStatus, Severity};
use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::response::Response;
use axum::Json;
use serde::Deserialize;
use tracing::error;
use uuid::Uuid;

/// Client IP for rate limiting. X-Forwarded-For is taken at face value;
/// strip or validate it at the ingress layer before it reaches here.
fn client_ip(headers: &HeaderMap) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

/// GET /api/v1/health
pub async fn get_health(State(state): State<EngineState>) -> Response {
    let queue_depth = queue::pending_job_count(&state.pool).await.ok();
    ApiResponse::ok(serde_json::json!({
        "status": "ok",
        "pending_analysis_jobs": queue_depth,
    }))
}

/// GET /api/v1/incidents
pub async fn list_incidents(State(state): State<EngineState>) -> Response {
    match incidents::list_incidents(&state.pool, 100).await {
        Ok(list) => ApiResponse::ok(list),
        Err(e) => {
            error!(error = %e, "failed to list incidents");
            ApiErrorResponse::internal("failed to list incidents")
        }
    }
}

/// GET /api/v1/incidents/:id
pub async fn get_incident(
    State(state): State<EngineState>,
    Path(id): Path<Uuid>,
) -> Response {
    match incidents::get_incident(&state.pool, id).await {
        Ok(Some(incident)) => ApiResponse::ok(incident),
        Ok(None) => ApiErrorResponse::not_found(format!("incident {id} not found")),
        Err(e) => {
            error!(error = %e, "failed to fetch incident");
            ApiErrorResponse::internal("failed to fetch incident")
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateIncidentRequest {
    pub title: String,
    pub description: String,
    pub severity: String,
    pub service: String,
    #[serde(default)]
    pub affected_components: Vec<String>,
    #[serde(default)]
    pub context: serde_json::Value,
}

/// POST /api/v1/incidents — create or merge into a duplicate.
pub async fn create_incident(
    State(state): State<EngineState>,
    headers: HeaderMap,
    Json(request): Json<CreateIncidentRequest>,
) -> Response {
    if let RateLimitDecision::Denied {
        retry_after_seconds,
    } = state.write_limiter.check(&client_ip(&headers)).await
    {
        return ApiErrorResponse::too_many_requests(retry_after_seconds);
    }

    let severity = match Severity::parse(&request.severity) {
        Some(severity) => severity,
        None => {
            return ApiErrorResponse::bad_request(format!(
                "unknown severity: {}",
                request.severity
            ))
        }
    };

    let lookback = crate::config::get().dedup.lookback_minutes(severity);

    let result = async {
        let mut tx = state.pool.begin().await?;
        let (incident, created) = incidents::create_or_update_incident(
            &mut tx,
            incidents::NewIncident {
                title: request.title,
                description: request.description,
                severity,
                affected_service: request.service,
                affected_components: request.affected_components,
                metrics_snapshot: serde_json::Value::Null,
                context: request.context,
            },
            lookback,
        )
        .await?;
        tx.commit().await?;
        Ok::<_, crate::storage::StorageError>((incident, created))
    }
    .await;

    match result {
        Ok((incident, true)) => ApiResponse::created(incident),
        Ok((incident, false)) => ApiResponse::ok(incident),
        Err(e) => {
            error!(error = %e, "failed to create incident");
            ApiErrorResponse::internal("failed to create incident")
        }
    }
}

/// POST /api/v1/incidents/:id/analyze — transition to analyzing and
/// enqueue the worker task. Returns 202; the analysis happens out of band.
pub async fn trigger_analysis(
    State(state): State<EngineState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Response {
    if let RateLimitDecision::Denied {
        retry_after_seconds,
    } = state.llm_limiter.check(&client_ip(&headers)).await
    {
        return ApiErrorResponse::too_many_requests(retry_after_seconds);
    }

    let transition = async {
        let mut tx = state.pool.begin().await?;
        let incident = incidents::get_incident_for_update(&mut tx, id).await?;

        let incident = match incident {
            Some(incident) => incident,
            None => {
                tx.rollback().await?;
                return Ok(None);
            }
        };

        if !incident
            .status
            .can_transition_to(IncidentStatus::Analyzing)
        {
            tx.rollback().await?;
            return Ok(Some((incident.status, false)));
        }

        incidents::set_incident_status(&mut tx, id, IncidentStatus::Analyzing).await?;
        tx.commit().await?;
        Ok::<_, crate::storage::StorageError>(Some((IncidentStatus::Analyzing, true)))
    }
    .await;

    match transition {
        Ok(None) => ApiErrorResponse::not_found(format!("incident {id} not found")),
        Ok(Some((status, false))) => ApiErrorResponse::conflict(format!(
            "incident is {status}, cannot start analysis"
        )),
        Ok(Some((_, true))) => {
            match queue::enqueue_job(
                &state.pool,
                queue::job_type::ANALYZE_INCIDENT,
                id,
                serde_json::Value::Null,
            )
            .await
            {
                Ok(job_id) => ApiResponse::accepted(serde_json::json!({
                    "incident_id": id,
                    "job_id": job_id,
                    "status": "analyzing",
                })),
                Err(e) => {
                    error!(error = %e, "failed to enqueue analysis");
                    ApiErrorResponse::internal("failed to enqueue analysis")
                }
            }
        }
        Err(e) => {
            error!(error = %e, "failed to start analysis");
            ApiErrorResponse::internal("failed to start analysis")
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct OutcomeRequest {
    pub hypothesis_id: Option<Uuid>,
    #[serde(default)]
    pub hypothesis_correct: bool,
    pub action_id: Option<Uuid>,
    #[serde(default)]
    pub action_effective: bool,
    #[serde(default)]
    pub human_override: bool,
    pub override_reason: Option<String>,
    #[serde(default)]
    pub resolution_notes: String,
}

/// POST /api/v1/incidents/:id/outcome — operator feedback for the
/// learning loop.
pub async fn capture_outcome(
    State(state): State<EngineState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
    Json(request): Json<OutcomeRequest>,
) -> Response {
    if let RateLimitDecision::Denied {
        retry_after_seconds,
    } = state.write_limiter.check(&client_ip(&headers)).await
    {
        return ApiErrorResponse::too_many_requests(retry_after_seconds);
    }

    let outcome = IncidentOutcome {
        incident_id: id,
        hypothesis_id: request.hypothesis_id,
        hypothesis_correct: request.hypothesis_correct,
        action_id: request.action_id,
        action_effective: request.action_effective,
        human_override: request.human_override,
        override_reason: request.override_reason,
        resolution_notes: request.resolution_notes,
    };

    match state.learning.capture_outcome(&outcome).await {
        Ok(()) => ApiResponse::accepted(serde_json::json!({ "incident_id": id })),
        Err(e) => {
            error!(error = %e, "failed to capture outcome");
            ApiErrorResponse::internal("failed to capture outcome")
        }
    }
}

/// Raw alert as delivered by a monitoring webhook. Severity arrives as a
/// free-form source string and is normalised on ingestion.
#[derive(Debug, Deserialize)]
pub struct RawAlert {
    pub source: String,
    pub name: String,
    pub service: String,
    pub severity: String,
    #[serde(default)]
    pub message: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    #[serde(default)]
    pub labels: std::collections::HashMap<String, String>,
    #[serde(default)]
    pub annotations: std::collections::HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
pub struct IngestAlertsRequest {
    pub alerts: Vec<RawAlert>,
}

/// POST /api/v1/alerts — ingest a batch of raw alerts.
///
/// Alert storms are collapsed before anything else sees them: normalise
/// severity, dedupe by fingerprint and window, convert to signals,
/// correlate, and open one incident per surviving candidate.
pub async fn ingest_alerts(
    State(state): State<EngineState>,
    headers: HeaderMap,
    Json(request): Json<IngestAlertsRequest>,
) -> Response {
    use crate::perception::{
        Alert, AlertDeduplicator, AlertSeverity, Signal, SignalCorrelator, SignalType,
    };

    if let RateLimitDecision::Denied {
        retry_after_seconds,
    } = state.write_limiter.check(&client_ip(&headers)).await
    {
        return ApiErrorResponse::too_many_requests(retry_after_seconds);
    }

    let settings = crate::config::get();
    let deduplicator = AlertDeduplicator::default();

    let alerts: Vec<Alert> = request
        .alerts
        .iter()
        .map(|raw| Alert {
            source: raw.source.clone(),
            name: raw.name.clone(),
            service: raw.service.clone(),
            severity: deduplicator.normalize_severity(&raw.severity),
            message: raw.message.clone(),
            timestamp: raw.timestamp,
            labels: raw.labels.clone(),
            annotations: raw.annotations.clone(),
        })
        .collect();

    let deduped = deduplicator.deduplicate(&alerts, None);

    // Deduplicated alerts become signals typed by their source system;
    // the anomaly score tracks the strongest severity seen in the window.
    let signal_type_for = |source: &str| {
        let source = source.to_lowercase();
        if source.contains("prom") || source.contains("metric") {
            SignalType::Metric
        } else if source.contains("loki") || source.contains("log") {
            SignalType::Log
        } else if source.contains("jaeger") || source.contains("tempo") || source.contains("trace")
        {
            SignalType::Trace
        } else {
            SignalType::Event
        }
    };

    let signals: Vec<Signal> = deduped
        .iter()
        .map(|d| {
            let score = match d.max_severity {
                AlertSeverity::Critical => 1.0,
                AlertSeverity::High => 0.8,
                AlertSeverity::Medium => 0.6,
                AlertSeverity::Low => 0.4,
                AlertSeverity::Info => 0.2,
            };
            let mut labels = d.representative.labels.clone();
            labels.insert("service".to_string(), d.representative.service.clone());
            Signal {
                signal_type: signal_type_for(&d.representative.source),
                source: d.representative.source.clone(),
                name: d.representative.name.clone(),
                value: d.count as f64,
                timestamp: d.last_seen,
                labels,
                anomaly_score: score,
            }
        })
        .collect();

    let correlator = SignalCorrelator::new(
        settings.correlation.window_seconds,
        settings.correlation.min_signals,
    );
    let candidates = correlator.correlate(&signals, None);

    let mut incident_ids = Vec::new();
    for candidate in &candidates {
        let severity = if candidate.severity_score >= 0.8 {
            Severity::Critical
        } else if candidate.severity_score >= 0.6 {
            Severity::High
        } else if candidate.severity_score >= 0.4 {
            Severity::Medium
        } else {
            Severity::Low
        };
        let lookback = settings.dedup.lookback_minutes(severity);

        let created = async {
            let mut tx = state.pool.begin().await?;
            let (incident, created) = incidents::create_or_update_incident(
                &mut tx,
                incidents::NewIncident {
                    title: candidate.title.clone(),
                    description: candidate.description.clone(),
                    severity,
                    affected_service: candidate.service.clone(),
                    affected_components: vec![candidate.service.clone()],
                    metrics_snapshot: serde_json::Value::Null,
                    context: serde_json::json!({
                        "signal_count": candidate.signals.len(),
                        "correlation_confidence": candidate.confidence,
                    }),
                },
                lookback,
            )
            .await?;
            tx.commit().await?;
            Ok::<_, crate::storage::StorageError>((incident.id, created))
        }
        .await;

        match created {
            Ok((id, _)) => incident_ids.push(id),
            Err(e) => {
                error!(service = %candidate.service, error = %e, "failed to record correlated incident");
            }
        }
    }

    ApiResponse::ok(serde_json::json!({
        "alerts_received": request.alerts.len(),
        "deduplicated": deduped.len(),
        "candidates": candidates.len(),
        "incident_ids": incident_ids,
    }))
}

/// POST /api/v1/actions/:id/approve — approve a pending action and
/// enqueue its execution. Returns 202; execution happens out of band.
pub async fn approve_action(
    State(state): State<EngineState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Response {
    if let RateLimitDecision::Denied {
        retry_after_seconds,
    } = state.write_limiter.check(&client_ip(&headers)).await
    {
        return ApiErrorResponse::too_many_requests(retry_after_seconds);
    }

    let action = match crate::storage::actions::get_action(&state.pool, id).await {
        Ok(Some(action)) => action,
        Ok(None) => return ApiErrorResponse::not_found(format!("action {id} not found")),
        Err(e) => {
            error!(error = %e, "failed to fetch action");
            return ApiErrorResponse::internal("failed to fetch action");
        }
    };

    let approved = async {
        let mut tx = state.pool.begin().await?;
        let ok = crate::storage::actions::transition_action(
            &mut tx,
            id,
            crate::types::ActionStatus::Approved,
        )
        .await?;
        if ok {
            incidents::set_incident_status(
                &mut tx,
                action.incident_id,
                IncidentStatus::Approved,
            )
            .await?;
            tx.commit().await?;
        } else {
            tx.rollback().await?;
        }
        Ok::<bool, crate::storage::StorageError>(ok)
    }
    .await;

    match approved {
        Ok(false) => ApiErrorResponse::conflict(format!(
            "action is {}, cannot approve",
            action.status
        )),
        Ok(true) => {
            match queue::enqueue_job(
                &state.pool,
                queue::job_type::EXECUTE_ACTION,
                action.incident_id,
                serde_json::json!({ "action_id": id.to_string() }),
            )
            .await
            {
                Ok(job_id) => ApiResponse::accepted(serde_json::json!({
                    "action_id": id,
                    "incident_id": action.incident_id,
                    "job_id": job_id,
                    "status": "approved",
                })),
                Err(e) => {
                    error!(error = %e, "failed to enqueue execution");
                    ApiErrorResponse::internal("failed to enqueue execution")
                }
            }
        }
        Err(e) => {
            error!(error = %e, "failed to approve action");
            ApiErrorResponse::internal("failed to approve action")
        }
    }
}

/// GET /api/v1/incidents/:id/hypotheses
pub async fn list_hypotheses(
    State(state): State<EngineState>,
    Path(id): Path<Uuid>,
) -> Response {
    match crate::storage::hypotheses::list_for_incident(&state.pool, id).await {
        Ok(list) => ApiResponse::ok(list),
        Err(e) => {
            error!(error = %e, "failed to list hypotheses");
            ApiErrorResponse::internal("failed to list hypotheses")
        }
    }
}

/// GET /api/v1/incidents/:id/actions
pub async fn list_actions(
    State(state): State<EngineState>,
    Path(id): Path<Uuid>,
) -> Response {
    match crate::storage::actions::list_for_incident(&state.pool, id).await {
        Ok(list) => ApiResponse::ok(list),
        Err(e) => {
            error!(error = %e, "failed to list actions");
            ApiErrorResponse::internal("failed to list actions")
        }
    }
}
