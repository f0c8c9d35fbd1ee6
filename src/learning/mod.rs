//! Learning Engine — operator feedback closes the loop
//!
//! Captures incident outcomes, updates hypothesis validation and action
//! effectiveness, and maintains per-pattern counters under a pessimistic
//! row lock. The in-memory pattern cache is strictly a read-through L1:
//! authoritative counters live in the datastore, and the cache is updated
//! to match committed values only.

use crate::storage::{hypotheses, incidents, outcomes, patterns, StorageError};
use crate::types::{
    AnomalyCategory, ConfidenceOutcomeRecord, IncidentOutcome, IncidentPattern,
};
use chrono::Utc;
use dashmap::DashMap;
use sqlx::PgPool;
use tracing::{error, info, warn};

/// Engine for capturing feedback and improving future confidence scoring.
pub struct LearningEngine {
    pool: PgPool,
    /// Read-optimisation only; bounded by #services × #categories.
    pattern_cache: DashMap<String, IncidentPattern>,
}

impl LearningEngine {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            pattern_cache: DashMap::new(),
        }
    }

    /// Load all pattern rows into the L1 cache at startup.
    pub async fn warmup(&self) -> Result<usize, StorageError> {
        let all = patterns::load_all(&self.pool).await?;
        let count = all.len();
        for pattern in all {
            self.pattern_cache.insert(pattern.pattern_id.clone(), pattern);
        }
        info!(patterns = count, "pattern cache warmed up");
        Ok(count)
    }

    /// Cached confidence adjustment for a pattern; 0 when unknown.
    /// Readers racing a concurrent update see the last committed value.
    pub fn confidence_adjustment(&self, service: &str, category: AnomalyCategory) -> f64 {
        let key = IncidentPattern::pattern_key(service, category);
        self.pattern_cache
            .get(&key)
            .map(|p| p.confidence_adjustment)
            .unwrap_or(0.0)
    }

    /// Cached pattern snapshot, for dashboards.
    pub fn cached_pattern(&self, pattern_id: &str) -> Option<IncidentPattern> {
        self.pattern_cache.get(pattern_id).map(|p| p.clone())
    }

    /// Capture the outcome of an incident resolution.
    ///
    /// All writes happen in one transaction: incident learning metadata,
    /// hypothesis validation, action effectiveness, the locked pattern
    /// update, and the calibration record. The L1 cache is refreshed only
    /// after the commit succeeds.
    pub async fn capture_outcome(&self, outcome: &IncidentOutcome) -> Result<(), StorageError> {
        info!(incident_id = %outcome.incident_id, "capturing incident outcome");

        let mut tx = self.pool.begin().await?;

        let incident =
            match incidents::get_incident_for_update(&mut tx, outcome.incident_id).await? {
                Some(incident) => incident,
                None => {
                    error!(incident_id = %outcome.incident_id, "incident not found for outcome capture");
                    tx.rollback().await?;
                    return Ok(());
                }
            };

        // Hypothesis validation feeds the pattern counters
        let mut committed_pattern: Option<IncidentPattern> = None;
        let mut category = AnomalyCategory::MetricAnomaly;
        let mut confidence_score = 0.0;

        if let Some(hypothesis_id) = outcome.hypothesis_id {
            match hypotheses::get_hypothesis(&self.pool, hypothesis_id).await? {
                Some(hypothesis) => {
                    hypotheses::record_validation(
                        &mut tx,
                        hypothesis_id,
                        outcome.hypothesis_correct,
                        &outcome.resolution_notes,
                    )
                    .await?;

                    category = hypothesis.category;
                    confidence_score = hypothesis.confidence_score;
                    let indicators: Vec<String> = hypothesis
                        .evidence
                        .iter()
                        .map(|e| e.signal_name.clone())
                        .collect();

                    let pattern = patterns::record_outcome(
                        &mut tx,
                        &incident.affected_service,
                        hypothesis.category,
                        &indicators,
                        outcome.hypothesis_correct,
                    )
                    .await?;
                    committed_pattern = Some(pattern);
                }
                None => {
                    warn!(hypothesis_id = %hypothesis_id, "hypothesis not found for outcome capture");
                }
            }
        }

        // Action effectiveness lands on the action row
        let mut action_type = None;
        if let Some(action_id) = outcome.action_id {
            if let Some(action) = crate::storage::actions::get_action(&self.pool, action_id).await? {
                action_type = Some(action.action_type);
                crate::storage::actions::record_execution_result(
                    &mut tx,
                    action_id,
                    &serde_json::json!({
                        "effective": outcome.action_effective,
                        "resolution_notes": outcome.resolution_notes,
                    }),
                )
                .await?;
            }
        }

        // Learning metadata on the incident context
        let mut context = incident.context.as_object().cloned().unwrap_or_default();
        context.insert(
            "learning".to_string(),
            serde_json::json!({
                "hypothesis_correct": outcome.hypothesis_correct,
                "action_effective": outcome.action_effective,
                "human_override": outcome.human_override,
                "override_reason": outcome.override_reason,
                "captured_at": Utc::now().to_rfc3339(),
            }),
        );
        sqlx::query("UPDATE incidents SET context = $1 WHERE id = $2")
            .bind(serde_json::Value::Object(context))
            .bind(incident.id)
            .execute(&mut *tx)
            .await?;

        // Calibration record
        let time_to_resolution = incident
            .resolved_at
            .map(|resolved| (resolved - incident.detected_at).num_seconds());
        outcomes::append_outcome(
            &mut tx,
            &ConfidenceOutcomeRecord {
                incident_id: incident.id,
                service_name: incident.affected_service.clone(),
                hypothesis_category: category,
                confidence_score,
                action_type,
                action_executed: outcome.action_id.is_some(),
                outcome_success: outcome.hypothesis_correct && outcome.action_effective,
                outcome_status: incident.status.as_str().to_string(),
                verification_metrics: serde_json::Value::Null,
                time_to_resolution_seconds: time_to_resolution,
            },
        )
        .await?;

        tx.commit().await?;

        // Refresh the L1 cache with committed values only
        if let Some(pattern) = committed_pattern {
            self.pattern_cache
                .insert(pattern.pattern_id.clone(), pattern);
        }

        info!(
            incident_id = %outcome.incident_id,
            hypothesis_correct = outcome.hypothesis_correct,
            action_effective = outcome.action_effective,
            "outcome captured"
        );

        Ok(())
    }
}

