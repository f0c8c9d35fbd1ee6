//! Action Selection — hypothesis → remediation action under runbook policy
//!
//! Rule-based mapping from hypothesis category to action, followed by a
//! numeric risk assessment and the approval policy. The runbook registry is
//! the hard gate: an action not present in the runbook for the (category,
//! service) pair is refused outright, with a user-readable reason and no
//! substitute action.

use crate::decision::runbooks::RunbookRegistry;
use crate::reasoning::hypothesis::RankedHypothesis;
use crate::types::{ActionType, AnomalyCategory, RiskLevel, ServiceContext};
use thiserror::Error;
use tracing::{info, warn};

/// Policy refusal — fail fast, never fall back to a different action.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SelectionRefusal {
    #[error("no action rule for category {0}")]
    NoRuleForCategory(AnomalyCategory),

    #[error("action {action} is not allowed by the runbook for ({category}, {service})")]
    NotInRunbook {
        action: ActionType,
        category: AnomalyCategory,
        service: String,
    },
}

/// Recommended action for an incident, ready to persist as a pending row.
#[derive(Debug, Clone)]
pub struct ActionRecommendation {
    pub action_type: ActionType,
    pub name: String,
    pub description: String,
    pub target_service: String,
    pub target_resource: Option<String>,
    pub risk_level: RiskLevel,
    /// Numeric risk in [0, 1]
    pub risk_score: f64,
    pub blast_radius: RiskLevel,
    pub requires_approval: bool,
    pub parameters: serde_json::Value,
    pub reasoning: String,
    /// Inherited from the hypothesis
    pub confidence: f64,
}

/// Selects remediation actions constrained by the runbook registry.
pub struct ActionSelector {
    registry: RunbookRegistry,
    approval_threshold: f64,
}

impl ActionSelector {
    pub fn new(registry: RunbookRegistry, approval_threshold: f64) -> Self {
        Self {
            registry,
            approval_threshold,
        }
    }

    /// Category → (action, base risk, blast radius) mapping.
    fn action_rule(category: AnomalyCategory) -> Option<(ActionType, RiskLevel, RiskLevel)> {
        match category {
            AnomalyCategory::MemoryLeak => {
                Some((ActionType::RestartPod, RiskLevel::Medium, RiskLevel::Medium))
            }
            AnomalyCategory::CpuSpike => {
                Some((ActionType::ScaleUp, RiskLevel::Low, RiskLevel::Low))
            }
            AnomalyCategory::TrafficSpike => {
                Some((ActionType::ScaleUp, RiskLevel::Low, RiskLevel::Low))
            }
            AnomalyCategory::TrafficDrop => {
                Some((ActionType::ScaleDown, RiskLevel::Low, RiskLevel::Low))
            }
            AnomalyCategory::LatencySpike => {
                Some((ActionType::RestartPod, RiskLevel::Medium, RiskLevel::Medium))
            }
            AnomalyCategory::ErrorSpike => Some((
                ActionType::RollbackDeployment,
                RiskLevel::High,
                RiskLevel::High,
            )),
            AnomalyCategory::DatabaseIssue => {
                Some((ActionType::RestartPod, RiskLevel::High, RiskLevel::High))
            }
            AnomalyCategory::NetworkIssue => {
                Some((ActionType::RestartPod, RiskLevel::High, RiskLevel::High))
            }
            _ => None,
        }
    }

    /// Select an action for one hypothesis.
    pub fn select(
        &self,
        hypothesis: &RankedHypothesis,
        service_name: &str,
        service_context: Option<&ServiceContext>,
    ) -> Result<ActionRecommendation, SelectionRefusal> {
        let (action_type, base_risk, blast_radius) = Self::action_rule(hypothesis.category)
            .ok_or_else(|| {
                warn!(category = %hypothesis.category, "no action rule for category");
                SelectionRefusal::NoRuleForCategory(hypothesis.category)
            })?;

        // Runbook gate: refuse anything outside the allow-list.
        if !self
            .registry
            .is_allowed(action_type, hypothesis.category, service_name)
        {
            warn!(
                action = %action_type,
                category = %hypothesis.category,
                service = service_name,
                "action refused by runbook"
            );
            return Err(SelectionRefusal::NotInRunbook {
                action: action_type,
                category: hypothesis.category,
                service: service_name.to_string(),
            });
        }

        let risk_score = self.risk_score(base_risk, hypothesis.confidence_score, service_context);
        let risk_level = Self::score_to_level(risk_score);
        let requires_approval = self.requires_approval(hypothesis.confidence_score, risk_level);
        let parameters = Self::build_parameters(action_type, service_name, service_context);

        info!(
            action = %action_type,
            service = service_name,
            risk_score,
            risk = %risk_level,
            requires_approval,
            "selected remediation action"
        );

        Ok(ActionRecommendation {
            action_type,
            name: format!("{} - {}", action_type.display_name(), service_name),
            description: Self::describe(action_type, service_name, &hypothesis.description),
            target_service: service_name.to_string(),
            target_resource: service_context.and_then(|c| c.pod_name.clone()),
            risk_level,
            risk_score,
            blast_radius,
            requires_approval,
            parameters,
            reasoning: hypothesis.reasoning.clone(),
            confidence: hypothesis.confidence_score,
        })
    }

    /// Select the best action across ranked hypotheses: first hypothesis
    /// (highest confidence) whose action passes the rule and runbook gates.
    pub fn select_best(
        &self,
        hypotheses: &[RankedHypothesis],
        service_name: &str,
        service_context: Option<&ServiceContext>,
    ) -> Option<ActionRecommendation> {
        for hypothesis in hypotheses {
            match self.select(hypothesis, service_name, service_context) {
                Ok(recommendation) => return Some(recommendation),
                Err(refusal) => {
                    info!(rank = hypothesis.rank, %refusal, "skipping hypothesis");
                }
            }
        }
        None
    }

    /// Numeric risk: base by level, plus a penalty for low confidence and
    /// a penalty for high service tiers; clamped to [0, 1].
    fn risk_score(
        &self,
        base_risk: RiskLevel,
        confidence: f64,
        service_context: Option<&ServiceContext>,
    ) -> f64 {
        let base = match base_risk {
            RiskLevel::Low => 0.20,
            RiskLevel::Medium => 0.50,
            RiskLevel::High => 0.75,
            RiskLevel::Critical => 0.95,
        };

        let confidence_penalty = (1.0 - confidence) * 0.1;

        let tier_penalty = service_context
            .and_then(|c| c.tier.as_deref())
            .map(|tier| match tier {
                "tier-1" | "tier1" => 0.15,
                "tier-2" | "tier2" => 0.05,
                _ => 0.0,
            })
            .unwrap_or(0.0);

        (base + confidence_penalty + tier_penalty).clamp(0.0, 1.0)
    }

    fn score_to_level(score: f64) -> RiskLevel {
        if score >= 0.9 {
            RiskLevel::Critical
        } else if score >= 0.7 {
            RiskLevel::High
        } else if score >= 0.4 {
            RiskLevel::Medium
        } else {
            RiskLevel::Low
        }
    }

    /// MVP posture: every recommendation requires approval. The gates are
    /// still evaluated in order so the binding reason is the one logged.
    fn requires_approval(&self, confidence: f64, risk_level: RiskLevel) -> bool {
        if matches!(risk_level, RiskLevel::High | RiskLevel::Critical) {
            return true;
        }
        if confidence < self.approval_threshold {
            return true;
        }
        if risk_level == RiskLevel::Medium {
            return true;
        }
        // Low risk with high confidence could auto-execute in principle;
        // held behind approval until the learning loop earns that trust.
        true
    }

    fn build_parameters(
        action_type: ActionType,
        service_name: &str,
        service_context: Option<&ServiceContext>,
    ) -> serde_json::Value {
        let mut params = serde_json::json!({ "service_name": service_name });

        match action_type {
            ActionType::ScaleUp => {
                let current = service_context
                    .and_then(|c| c.current_replicas)
                    .unwrap_or(1);
                params["target_replicas"] = serde_json::json!(current + 1);
                params["max_replicas"] = serde_json::json!(current + 5);
            }
            ActionType::ScaleDown => {
                let current = service_context
                    .and_then(|c| c.current_replicas)
                    .unwrap_or(2);
                params["target_replicas"] = serde_json::json!((current - 1).max(1));
            }
            ActionType::RestartPod => {
                params["graceful_shutdown_seconds"] = serde_json::json!(30);
            }
            ActionType::RollbackDeployment => {
                params["revision"] = serde_json::json!("previous");
            }
            _ => {}
        }

        params
    }

    fn describe(action_type: ActionType, service_name: &str, hypothesis: &str) -> String {
        let base = match action_type {
            ActionType::RestartPod => format!(
                "Restart pods for {service_name} to clear potential memory leaks or stale state"
            ),
            ActionType::ScaleUp => format!(
                "Scale up {service_name} to handle increased load or compensate for degraded instances"
            ),
            ActionType::ScaleDown => {
                format!("Scale down {service_name} to optimize resource usage")
            }
            ActionType::RollbackDeployment => format!(
                "Rollback {service_name} to previous deployment due to suspected regression"
            ),
            other => format!("Execute {other} on {service_name}"),
        };
        format!("{base}. Root cause hypothesis: {hypothesis}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decision::runbooks::{Runbook, RunbookAction};
    use crate::types::Evidence;

    fn hypothesis(category: AnomalyCategory, confidence: f64) -> RankedHypothesis {
        RankedHypothesis {
            rank: 1,
            description: "test hypothesis".to_string(),
            category,
            confidence_score: confidence,
            evidence: vec![Evidence {
                signal_type: "metric".to_string(),
                signal_name: "error_rate".to_string(),
                observation: "elevated".to_string(),
                relevance: 0.9,
            }],
            reasoning: "because".to_string(),
        }
    }

    fn selector() -> ActionSelector {
        ActionSelector::new(RunbookRegistry::starter(), 0.70)
    }

    #[test]
    fn memory_leak_maps_to_restart() {
        let rec = selector()
            .select(&hypothesis(AnomalyCategory::MemoryLeak, 0.8), "api", None)
            .unwrap();
        assert_eq!(rec.action_type, ActionType::RestartPod);
        assert_eq!(rec.blast_radius, RiskLevel::Medium);
        assert_eq!(rec.parameters["graceful_shutdown_seconds"], 30);
        assert!(rec.requires_approval);
    }

    #[test]
    fn unknown_category_yields_no_rule() {
        let err = selector()
            .select(&hypothesis(AnomalyCategory::MetricAnomaly, 0.9), "api", None)
            .unwrap_err();
        assert_eq!(
            err,
            SelectionRefusal::NoRuleForCategory(AnomalyCategory::MetricAnomaly)
        );
    }

    #[test]
    fn runbook_refusal_produces_no_action() {
        // Runbook for memory_leak on this service only allows scale_up, but
        // the category rule wants restart_pod — must refuse, not substitute.
        let registry = RunbookRegistry::from_runbooks(vec![Runbook {
            id: "rb".to_string(),
            symptom: String::new(),
            category: AnomalyCategory::MemoryLeak,
            service: Some("locked-down".to_string()),
            allowed_actions: vec![RunbookAction {
                action_type: ActionType::ScaleUp,
                approval_required: true,
                risk_level: RiskLevel::Low,
                parameters_template: serde_json::Value::Null,
                prerequisites: Vec::new(),
                max_auto_executions_per_day: None,
            }],
            diagnostic_queries: Vec::new(),
            escalation_criteria: Vec::new(),
        }]);
        let selector = ActionSelector::new(registry, 0.70);

        let err = selector
            .select(
                &hypothesis(AnomalyCategory::MemoryLeak, 0.9),
                "locked-down",
                None,
            )
            .unwrap_err();
        assert!(matches!(err, SelectionRefusal::NotInRunbook { .. }));
        assert!(selector
            .select_best(
                &[hypothesis(AnomalyCategory::MemoryLeak, 0.9)],
                "locked-down",
                None
            )
            .is_none());
    }

    #[test]
    fn risk_score_penalties() {
        let sel = selector();
        let tier1 = ServiceContext {
            tier: Some("tier-1".to_string()),
            ..ServiceContext::default()
        };

        // error_spike base 0.75; confidence 0.8 → +0.02; tier-1 → +0.15
        let rec = sel
            .select(
                &hypothesis(AnomalyCategory::ErrorSpike, 0.8),
                "api",
                Some(&tier1),
            )
            .unwrap();
        assert!((rec.risk_score - (0.75 + 0.02 + 0.15)).abs() < 1e-9);
        assert_eq!(rec.risk_level, RiskLevel::Critical);
    }

    #[test]
    fn scale_parameters_from_current_replicas() {
        let ctx = ServiceContext {
            current_replicas: Some(4),
            ..ServiceContext::default()
        };
        let rec = selector()
            .select(
                &hypothesis(AnomalyCategory::TrafficSpike, 0.85),
                "api",
                Some(&ctx),
            )
            .unwrap();
        assert_eq!(rec.parameters["target_replicas"], 5);
        assert_eq!(rec.parameters["max_replicas"], 9);
    }

    #[test]
    fn scale_down_clamps_at_one_replica() {
        let ctx = ServiceContext {
            current_replicas: Some(1),
            ..ServiceContext::default()
        };
        let rec = selector()
            .select(
                &hypothesis(AnomalyCategory::TrafficDrop, 0.85),
                "api",
                Some(&ctx),
            )
            .unwrap();
        assert_eq!(rec.parameters["target_replicas"], 1);
    }

    #[test]
    fn select_best_falls_through_refused_hypotheses() {
        let hypotheses = vec![
            hypothesis(AnomalyCategory::MetricAnomaly, 0.95),
            hypothesis(AnomalyCategory::CpuSpike, 0.80),
        ];
        let rec = selector().select_best(&hypotheses, "api", None).unwrap();
        assert_eq!(rec.action_type, ActionType::ScaleUp);
    }

    #[test]
    fn approval_required_on_every_path() {
        let sel = selector();
        for (category, confidence) in [
            (AnomalyCategory::CpuSpike, 0.95),
            (AnomalyCategory::MemoryLeak, 0.5),
            (AnomalyCategory::ErrorSpike, 0.99),
        ] {
            let rec = sel.select(&hypothesis(category, confidence), "api", None).unwrap();
            assert!(rec.requires_approval);
        }
    }
}
