//! Runbook Registry — static allow-list of actions per (category, service)
//!
//! Runbooks define symptom → allowed actions → approval requirements. The
//! action selector refuses anything not present here: there is no free-form
//! action invention. Loaded from a declarative TOML file at startup; a
//! missing file falls back to a built-in starter set.

use crate::types::{ActionType, AnomalyCategory, RiskLevel};
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum RunbookError {
    #[error("failed to read runbook file {0}: {1}")]
    Io(String, #[source] std::io::Error),

    #[error("failed to parse runbook file {0}: {1}")]
    Parse(String, #[source] toml::de::Error),
}

/// One allowed action inside a runbook.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunbookAction {
    pub action_type: ActionType,
    #[serde(default = "default_true")]
    pub approval_required: bool,
    pub risk_level: RiskLevel,
    /// Template merged into the action parameters at selection time.
    #[serde(default)]
    pub parameters_template: serde_json::Value,
    #[serde(default)]
    pub prerequisites: Vec<String>,
    /// Daily auto-execution budget; `None` = no auto execution.
    #[serde(default)]
    pub max_auto_executions_per_day: Option<u32>,
}

fn default_true() -> bool {
    true
}

/// Runbook for one symptom category, optionally scoped to a service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Runbook {
    pub id: String,
    pub symptom: String,
    pub category: AnomalyCategory,
    /// `None` = wildcard: applies to any service without a more specific
    /// runbook for the same category.
    #[serde(default)]
    pub service: Option<String>,
    #[serde(default)]
    pub allowed_actions: Vec<RunbookAction>,
    #[serde(default)]
    pub diagnostic_queries: Vec<String>,
    #[serde(default)]
    pub escalation_criteria: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct RunbookFile {
    #[serde(default)]
    runbooks: Vec<Runbook>,
}

/// Process-wide registry of runbooks, read once at startup.
#[derive(Debug, Clone, Default)]
pub struct RunbookRegistry {
    runbooks: Vec<Runbook>,
}

impl RunbookRegistry {
    /// Load from a TOML file; a missing file yields the built-in starter
    /// runbooks with a warning.
    pub fn load(path: &Path) -> Result<Self, RunbookError> {
        if !path.exists() {
            warn!(
                path = %path.display(),
                "runbook file not found, using built-in starter runbooks"
            );
            return Ok(Self::starter());
        }

        let contents = std::fs::read_to_string(path)
            .map_err(|e| RunbookError::Io(path.display().to_string(), e))?;
        let file: RunbookFile = toml::from_str(&contents)
            .map_err(|e| RunbookError::Parse(path.display().to_string(), e))?;

        info!(runbooks = file.runbooks.len(), "loaded runbook registry");
        Ok(Self {
            runbooks: file.runbooks,
        })
    }

    pub fn from_runbooks(runbooks: Vec<Runbook>) -> Self {
        Self { runbooks }
    }

    /// Built-in starter runbooks covering the common symptom categories.
    pub fn starter() -> Self {
        let restart = |risk| RunbookAction {
            action_type: ActionType::RestartPod,
            approval_required: true,
            risk_level: risk,
            parameters_template: serde_json::json!({"graceful_shutdown_seconds": 30}),
            prerequisites: vec!["Multiple replicas available".to_string()],
            max_auto_executions_per_day: None,
        };
        let scale_up = RunbookAction {
            action_type: ActionType::ScaleUp,
            approval_required: true,
            risk_level: RiskLevel::Low,
            parameters_template: serde_json::Value::Null,
            prerequisites: vec!["Cluster has capacity".to_string()],
            max_auto_executions_per_day: Some(3),
        };

        Self {
            runbooks: vec![
                Runbook {
                    id: "rb-memory-leak".to_string(),
                    symptom: "Memory usage growing without bound".to_string(),
                    category: AnomalyCategory::MemoryLeak,
                    service: None,
                    allowed_actions: vec![restart(RiskLevel::Medium)],
                    diagnostic_queries: vec![
                        "process_resident_memory_bytes".to_string(),
                        "go_goroutines".to_string(),
                    ],
                    escalation_criteria: vec!["Restart does not reclaim memory".to_string()],
                },
                Runbook {
                    id: "rb-cpu-spike".to_string(),
                    symptom: "CPU saturation".to_string(),
                    category: AnomalyCategory::CpuSpike,
                    service: None,
                    allowed_actions: vec![scale_up.clone()],
                    diagnostic_queries: vec!["process_cpu_seconds_total".to_string()],
                    escalation_criteria: vec!["CPU stays saturated after scale-up".to_string()],
                },
                Runbook {
                    id: "rb-traffic-spike".to_string(),
                    symptom: "Request volume surge".to_string(),
                    category: AnomalyCategory::TrafficSpike,
                    service: None,
                    allowed_actions: vec![scale_up],
                    diagnostic_queries: vec!["rate(http_requests_total[5m])".to_string()],
                    escalation_criteria: vec!["Surge exceeds max replica budget".to_string()],
                },
                Runbook {
                    id: "rb-traffic-drop".to_string(),
                    symptom: "Sustained request volume drop".to_string(),
                    category: AnomalyCategory::TrafficDrop,
                    service: None,
                    allowed_actions: vec![RunbookAction {
                        action_type: ActionType::ScaleDown,
                        approval_required: true,
                        risk_level: RiskLevel::Low,
                        parameters_template: serde_json::Value::Null,
                        prerequisites: vec!["Load allows reduction".to_string()],
                        max_auto_executions_per_day: None,
                    }],
                    diagnostic_queries: vec!["rate(http_requests_total[5m])".to_string()],
                    escalation_criteria: Vec::new(),
                },
                Runbook {
                    id: "rb-latency-spike".to_string(),
                    symptom: "p95/p99 latency regression".to_string(),
                    category: AnomalyCategory::LatencySpike,
                    service: None,
                    allowed_actions: vec![restart(RiskLevel::Medium)],
                    diagnostic_queries: vec![
                        "histogram_quantile(0.99, rate(http_request_duration_seconds_bucket[5m]))"
                            .to_string(),
                    ],
                    escalation_criteria: vec!["Latency persists after restart".to_string()],
                },
                Runbook {
                    id: "rb-error-spike".to_string(),
                    symptom: "5xx error rate spike".to_string(),
                    category: AnomalyCategory::ErrorSpike,
                    service: None,
                    allowed_actions: vec![RunbookAction {
                        action_type: ActionType::RollbackDeployment,
                        approval_required: true,
                        risk_level: RiskLevel::High,
                        parameters_template: serde_json::json!({"revision": "previous"}),
                        prerequisites: vec!["Previous version available".to_string()],
                        max_auto_executions_per_day: None,
                    }],
                    diagnostic_queries: vec![
                        r#"rate(http_requests_total{status=~"5.."}[5m])"#.to_string(),
                    ],
                    escalation_criteria: vec!["Errors persist after rollback".to_string()],
                },
                Runbook {
                    id: "rb-database-issue".to_string(),
                    symptom: "Database connectivity or saturation".to_string(),
                    category: AnomalyCategory::DatabaseIssue,
                    service: None,
                    allowed_actions: vec![restart(RiskLevel::High)],
                    diagnostic_queries: vec!["pg_stat_activity_count".to_string()],
                    escalation_criteria: vec!["Connection pool does not recover".to_string()],
                },
                Runbook {
                    id: "rb-network-issue".to_string(),
                    symptom: "Network errors between services".to_string(),
                    category: AnomalyCategory::NetworkIssue,
                    service: None,
                    allowed_actions: vec![restart(RiskLevel::High)],
                    diagnostic_queries: Vec::new(),
                    escalation_criteria: Vec::new(),
                },
            ],
        }
    }

    /// Look up the runbook for a (category, service) pair. An exact
    /// (category, service) match is preferred over (category, wildcard).
    pub fn get_runbook(&self, category: AnomalyCategory, service: &str) -> Option<&Runbook> {
        let mut wildcard = None;
        for runbook in &self.runbooks {
            if runbook.category != category {
                continue;
            }
            match &runbook.service {
                Some(scoped) if scoped == service => return Some(runbook),
                Some(_) => {}
                None => wildcard = wildcard.or(Some(runbook)),
            }
        }
        wildcard
    }

    /// Allowed actions for a (category, service) pair; empty when no
    /// runbook matches.
    pub fn get_allowed_actions(
        &self,
        category: AnomalyCategory,
        service: &str,
    ) -> &[RunbookAction] {
        self.get_runbook(category, service)
            .map(|rb| rb.allowed_actions.as_slice())
            .unwrap_or(&[])
    }

    /// Enforcement check used by the action selector.
    pub fn is_allowed(
        &self,
        action_type: ActionType,
        category: AnomalyCategory,
        service: &str,
    ) -> bool {
        self.get_allowed_actions(category, service)
            .iter()
            .any(|a| a.action_type == action_type)
    }

    pub fn all(&self) -> &[Runbook] {
        &self.runbooks
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scoped_runbook(category: AnomalyCategory, service: Option<&str>, action: ActionType) -> Runbook {
        Runbook {
            id: format!("rb-{}-{}", category, service.unwrap_or("any")),
            symptom: String::new(),
            category,
            service: service.map(str::to_string),
            allowed_actions: vec![RunbookAction {
                action_type: action,
                approval_required: true,
                risk_level: RiskLevel::Medium,
                parameters_template: serde_json::Value::Null,
                prerequisites: Vec::new(),
                max_auto_executions_per_day: None,
            }],
            diagnostic_queries: Vec::new(),
            escalation_criteria: Vec::new(),
        }
    }

    #[test]
    fn exact_service_match_beats_wildcard() {
        let registry = RunbookRegistry::from_runbooks(vec![
            scoped_runbook(AnomalyCategory::MemoryLeak, None, ActionType::RestartPod),
            scoped_runbook(
                AnomalyCategory::MemoryLeak,
                Some("payment-service"),
                ActionType::ScaleUp,
            ),
        ]);

        let rb = registry
            .get_runbook(AnomalyCategory::MemoryLeak, "payment-service")
            .unwrap();
        assert_eq!(rb.allowed_actions[0].action_type, ActionType::ScaleUp);

        let rb = registry
            .get_runbook(AnomalyCategory::MemoryLeak, "other-service")
            .unwrap();
        assert_eq!(rb.allowed_actions[0].action_type, ActionType::RestartPod);
    }

    #[test]
    fn enforcement_refuses_unlisted_actions() {
        let registry = RunbookRegistry::from_runbooks(vec![scoped_runbook(
            AnomalyCategory::MemoryLeak,
            Some("payment-service"),
            ActionType::ScaleUp,
        )]);

        assert!(registry.is_allowed(
            ActionType::ScaleUp,
            AnomalyCategory::MemoryLeak,
            "payment-service"
        ));
        assert!(!registry.is_allowed(
            ActionType::RestartPod,
            AnomalyCategory::MemoryLeak,
            "payment-service"
        ));
        // No runbook at all for this category
        assert!(!registry.is_allowed(
            ActionType::RestartPod,
            AnomalyCategory::CpuSpike,
            "payment-service"
        ));
    }

    #[test]
    fn starter_covers_mapped_categories() {
        let registry = RunbookRegistry::starter();
        for category in [
            AnomalyCategory::MemoryLeak,
            AnomalyCategory::CpuSpike,
            AnomalyCategory::TrafficSpike,
            AnomalyCategory::TrafficDrop,
            AnomalyCategory::LatencySpike,
            AnomalyCategory::ErrorSpike,
            AnomalyCategory::DatabaseIssue,
            AnomalyCategory::NetworkIssue,
        ] {
            assert!(
                registry.get_runbook(category, "any-service").is_some(),
                "missing starter runbook for {category}"
            );
        }
    }

    #[test]
    fn loads_from_toml() {
        use std::io::Write;
        let mut f = tempfile::NamedTempFile::new().unwrap();
        write!(
            f,
            r#"
[[runbooks]]
id = "rb-custom"
symptom = "OOM kills"
category = "memory_leak"
service = "api"

[[runbooks.allowed_actions]]
action_type = "restart_pod"
approval_required = true
risk_level = "medium"
prerequisites = ["Multiple replicas available"]
"#
        )
        .unwrap();

        let registry = RunbookRegistry::load(f.path()).unwrap();
        assert!(registry.is_allowed(ActionType::RestartPod, AnomalyCategory::MemoryLeak, "api"));
        assert!(!registry.is_allowed(ActionType::ScaleUp, AnomalyCategory::MemoryLeak, "api"));
    }
}
