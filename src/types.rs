//! Shared data structures for the incident-response pipeline
//!
//! This module defines the core types flowing through the pipeline:
//! - Perception: anomaly categories and severities
//! - Incident lifecycle: Incident, IncidentStatus, Severity
//! - Reasoning: Hypothesis, Evidence
//! - Decision & Execution: ActionType, RiskLevel, ActionStatus
//! - Learning: IncidentPattern, IncidentOutcome

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ============================================================================
// Severity
// ============================================================================

/// Incident severity, ordered `Low < Medium < High < Critical`.
///
/// Deduplication merges may only escalate severity, never downgrade it.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }

    /// Parse from a lowercase string (DB column, config).
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "low" => Some(Severity::Low),
            "medium" => Some(Severity::Medium),
            "high" => Some(Severity::High),
            "critical" => Some(Severity::Critical),
            _ => None,
        }
    }

    /// Severity derived from the strongest anomaly deviation in an incident:
    /// ≥5σ critical, ≥4σ high, ≥3σ medium, else low.
    pub fn from_max_deviation(max_deviation_sigma: f64) -> Self {
        if max_deviation_sigma >= 5.0 {
            Severity::Critical
        } else if max_deviation_sigma >= 4.0 {
            Severity::High
        } else if max_deviation_sigma >= 3.0 {
            Severity::Medium
        } else {
            Severity::Low
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================================
// Incident lifecycle
// ============================================================================

/// Incident state machine.
///
/// ```text
/// detected → analyzing → pending_approval → approved → executing
///                                                        ├→ resolved
///                                                        ├→ failed
///                                                        └→ escalated
/// ```
///
/// Transitions are one-directional; `resolved`, `failed` and `escalated`
/// are terminal. `resolved_at` is set iff status is `resolved`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum IncidentStatus {
    Detected,
    Analyzing,
    PendingApproval,
    Approved,
    Executing,
    Resolved,
    Failed,
    Escalated,
}

impl IncidentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            IncidentStatus::Detected => "detected",
            IncidentStatus::Analyzing => "analyzing",
            IncidentStatus::PendingApproval => "pending_approval",
            IncidentStatus::Approved => "approved",
            IncidentStatus::Executing => "executing",
            IncidentStatus::Resolved => "resolved",
            IncidentStatus::Failed => "failed",
            IncidentStatus::Escalated => "escalated",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "detected" => Some(IncidentStatus::Detected),
            "analyzing" => Some(IncidentStatus::Analyzing),
            "pending_approval" => Some(IncidentStatus::PendingApproval),
            "approved" => Some(IncidentStatus::Approved),
            "executing" => Some(IncidentStatus::Executing),
            "resolved" => Some(IncidentStatus::Resolved),
            "failed" => Some(IncidentStatus::Failed),
            "escalated" => Some(IncidentStatus::Escalated),
            _ => None,
        }
    }

    /// Terminal states close the incident lifecycle.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            IncidentStatus::Resolved | IncidentStatus::Failed | IncidentStatus::Escalated
        )
    }

    /// Non-terminal statuses considered by the deduplicator. Resolved,
    /// failed and escalated incidents never absorb new duplicates.
    pub fn dedup_candidates() -> &'static [IncidentStatus] {
        &[
            IncidentStatus::Detected,
            IncidentStatus::Analyzing,
            IncidentStatus::PendingApproval,
            IncidentStatus::Approved,
            IncidentStatus::Executing,
        ]
    }

    /// Forward-only transition check.
    pub fn can_transition_to(&self, next: IncidentStatus) -> bool {
        use IncidentStatus::*;
        matches!(
            (self, next),
            (Detected, Analyzing)
                | (Analyzing, PendingApproval | Resolved | Failed)
                | (PendingApproval, Approved | Escalated | Failed)
                | (Approved, Executing | Failed)
                | (Executing, Resolved | Failed | Escalated)
        )
    }
}

impl std::fmt::Display for IncidentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Central incident record, owned by the datastore.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Incident {
    pub id: Uuid,
    pub title: String,
    pub description: String,
    pub status: IncidentStatus,
    pub severity: Severity,
    pub affected_service: String,
    pub affected_components: Vec<String>,
    pub detected_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    /// Per-metric snapshot captured at detection time.
    pub metrics_snapshot: serde_json::Value,
    /// Arbitrary key/value context (duplicate counters, learning metadata).
    pub context: serde_json::Value,
}

impl Incident {
    /// Duplicate count accumulated by the deduplicator (0 when never merged).
    pub fn duplicate_count(&self) -> i64 {
        self.context
            .get("duplicate_count")
            .and_then(serde_json::Value::as_i64)
            .unwrap_or(0)
    }
}

// ============================================================================
// Anomaly category
// ============================================================================

/// Category tag assigned to an anomaly or hypothesis.
///
/// Derived from the metric name and deviation direction; the reasoning
/// layer also receives free-form categories from the model, which are
/// parsed back into this enum (unknown strings map to `MetricAnomaly`).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyCategory {
    ErrorSpike,
    ErrorRecovery,
    LatencySpike,
    LatencyImprovement,
    MemoryLeak,
    MemoryRelease,
    CpuSpike,
    CpuDrop,
    TrafficSpike,
    TrafficDrop,
    DatabaseIssue,
    NetworkIssue,
    DeploymentIssue,
    MetricAnomaly,
}

impl AnomalyCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnomalyCategory::ErrorSpike => "error_spike",
            AnomalyCategory::ErrorRecovery => "error_recovery",
            AnomalyCategory::LatencySpike => "latency_spike",
            AnomalyCategory::LatencyImprovement => "latency_improvement",
            AnomalyCategory::MemoryLeak => "memory_leak",
            AnomalyCategory::MemoryRelease => "memory_release",
            AnomalyCategory::CpuSpike => "cpu_spike",
            AnomalyCategory::CpuDrop => "cpu_drop",
            AnomalyCategory::TrafficSpike => "traffic_spike",
            AnomalyCategory::TrafficDrop => "traffic_drop",
            AnomalyCategory::DatabaseIssue => "database_issue",
            AnomalyCategory::NetworkIssue => "network_issue",
            AnomalyCategory::DeploymentIssue => "deployment_issue",
            AnomalyCategory::MetricAnomaly => "metric_anomaly",
        }
    }

    /// Parse a category string coming back from the model or the DB.
    /// Unknown categories collapse to `MetricAnomaly` so downstream
    /// tables (base confidence, action rules) treat them as generic.
    pub fn parse(s: &str) -> Self {
        match s {
            "error_spike" => AnomalyCategory::ErrorSpike,
            "error_recovery" => AnomalyCategory::ErrorRecovery,
            "latency_spike" => AnomalyCategory::LatencySpike,
            "latency_improvement" => AnomalyCategory::LatencyImprovement,
            "memory_leak" => AnomalyCategory::MemoryLeak,
            "memory_release" => AnomalyCategory::MemoryRelease,
            "cpu_spike" => AnomalyCategory::CpuSpike,
            "cpu_drop" => AnomalyCategory::CpuDrop,
            "traffic_spike" => AnomalyCategory::TrafficSpike,
            "traffic_drop" => AnomalyCategory::TrafficDrop,
            "database_issue" => AnomalyCategory::DatabaseIssue,
            "network_issue" => AnomalyCategory::NetworkIssue,
            "deployment_issue" => AnomalyCategory::DeploymentIssue,
            _ => AnomalyCategory::MetricAnomaly,
        }
    }
}

impl std::fmt::Display for AnomalyCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================================
// Reasoning output
// ============================================================================

/// A single piece of evidence supporting a hypothesis.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Evidence {
    /// Type of signal (metric, log, trace, event).
    pub signal_type: String,
    /// Name of the signal.
    pub signal_name: String,
    /// What was observed.
    pub observation: String,
    /// Relevance score in [0, 1].
    pub relevance: f64,
}

/// Ranked root-cause hypothesis with deterministic confidence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Hypothesis {
    pub id: Uuid,
    pub incident_id: Uuid,
    pub description: String,
    pub category: AnomalyCategory,
    /// Deterministic confidence in [0.01, 0.99]; never model-generated.
    pub confidence_score: f64,
    /// 1-based dense rank within the incident, ordered by confidence.
    pub rank: i32,
    pub evidence: Vec<Evidence>,
    pub reasoning: String,
    pub model_id: String,
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
}

// ============================================================================
// Actions
// ============================================================================

/// Remediation action types recognised by the runbook registry and the
/// risk catalogue.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    RestartPod,
    ScaleUp,
    ScaleDown,
    RollbackDeployment,
    ToggleFeatureFlag,
    ClearCache,
    DrainNode,
}

impl ActionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionType::RestartPod => "restart_pod",
            ActionType::ScaleUp => "scale_up",
            ActionType::ScaleDown => "scale_down",
            ActionType::RollbackDeployment => "rollback_deployment",
            ActionType::ToggleFeatureFlag => "toggle_feature_flag",
            ActionType::ClearCache => "clear_cache",
            ActionType::DrainNode => "drain_node",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "restart_pod" => Some(ActionType::RestartPod),
            "scale_up" => Some(ActionType::ScaleUp),
            "scale_down" => Some(ActionType::ScaleDown),
            "rollback_deployment" => Some(ActionType::RollbackDeployment),
            "toggle_feature_flag" => Some(ActionType::ToggleFeatureFlag),
            "clear_cache" => Some(ActionType::ClearCache),
            "drain_node" => Some(ActionType::DrainNode),
            _ => None,
        }
    }

    /// Human-readable name, e.g. "Restart Pod".
    pub fn display_name(&self) -> &'static str {
        match self {
            ActionType::RestartPod => "Restart Pod",
            ActionType::ScaleUp => "Scale Up",
            ActionType::ScaleDown => "Scale Down",
            ActionType::RollbackDeployment => "Rollback Deployment",
            ActionType::ToggleFeatureFlag => "Toggle Feature Flag",
            ActionType::ClearCache => "Clear Cache",
            ActionType::DrainNode => "Drain Node",
        }
    }
}

impl std::fmt::Display for ActionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Risk level associated with an action, ordered `Low < Critical`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskLevel::Low => "low",
            RiskLevel::Medium => "medium",
            RiskLevel::High => "high",
            RiskLevel::Critical => "critical",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "low" => Some(RiskLevel::Low),
            "medium" => Some(RiskLevel::Medium),
            "high" => Some(RiskLevel::High),
            "critical" => Some(RiskLevel::Critical),
            _ => None,
        }
    }
}

impl std::fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Action state machine.
///
/// `pending_approval → approved → executing → {succeeded, failed, rolled_back}`.
/// `skipped` is allowed when rollback is not applicable. Only the executor
/// transitions out of `executing`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    PendingApproval,
    Approved,
    Executing,
    Succeeded,
    Failed,
    RolledBack,
    Skipped,
}

impl ActionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionStatus::PendingApproval => "pending_approval",
            ActionStatus::Approved => "approved",
            ActionStatus::Executing => "executing",
            ActionStatus::Succeeded => "succeeded",
            ActionStatus::Failed => "failed",
            ActionStatus::RolledBack => "rolled_back",
            ActionStatus::Skipped => "skipped",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending_approval" => Some(ActionStatus::PendingApproval),
            "approved" => Some(ActionStatus::Approved),
            "executing" => Some(ActionStatus::Executing),
            "succeeded" => Some(ActionStatus::Succeeded),
            "failed" => Some(ActionStatus::Failed),
            "rolled_back" => Some(ActionStatus::RolledBack),
            "skipped" => Some(ActionStatus::Skipped),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ActionStatus::Succeeded
                | ActionStatus::Failed
                | ActionStatus::RolledBack
                | ActionStatus::Skipped
        )
    }

    pub fn can_transition_to(&self, next: ActionStatus) -> bool {
        use ActionStatus::*;
        matches!(
            (self, next),
            (PendingApproval, Approved | Skipped)
                | (Approved, Executing)
                | (Executing, Succeeded | Failed | RolledBack)
        )
    }
}

impl std::fmt::Display for ActionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Execution mode for an action.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    #[default]
    DryRun,
    Live,
}

impl ExecutionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionMode::DryRun => "dry_run",
            ExecutionMode::Live => "live",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "dry_run" => Some(ExecutionMode::DryRun),
            "live" => Some(ExecutionMode::Live),
            _ => None,
        }
    }
}

/// Persisted action row linked to an incident.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionRecord {
    pub id: Uuid,
    pub incident_id: Uuid,
    pub action_type: ActionType,
    pub name: String,
    pub description: String,
    pub target_service: String,
    pub target_resource: Option<String>,
    pub risk_level: RiskLevel,
    pub risk_score: f64,
    pub blast_radius: RiskLevel,
    pub requires_approval: bool,
    pub parameters: serde_json::Value,
    pub execution_mode: ExecutionMode,
    pub status: ActionStatus,
    pub created_at: DateTime<Utc>,
}

// ============================================================================
// Learning
// ============================================================================

/// Pattern counters keyed by `"{service}:{category}"`.
///
/// `success_rate = successes / occurrence_count` holds after every atomic
/// update; the row lock in the datastore is authoritative, the in-memory
/// cache is a read-optimisation only.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IncidentPattern {
    pub pattern_id: String,
    pub name: String,
    pub category: AnomalyCategory,
    pub signal_indicators: Vec<String>,
    /// Confidence adjustment in [-0.5, 0.5].
    pub confidence_adjustment: f64,
    pub occurrence_count: i64,
    /// Success rate in [0, 1].
    pub success_rate: f64,
}

impl IncidentPattern {
    pub fn pattern_key(service: &str, category: AnomalyCategory) -> String {
        format!("{}:{}", service, category.as_str())
    }
}

/// Captured outcome of an incident resolution, fed to the learning engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IncidentOutcome {
    pub incident_id: Uuid,
    pub hypothesis_id: Option<Uuid>,
    pub hypothesis_correct: bool,
    pub action_id: Option<Uuid>,
    pub action_effective: bool,
    pub human_override: bool,
    pub override_reason: Option<String>,
    pub resolution_notes: String,
}

/// Calibration record appended per verified incident outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfidenceOutcomeRecord {
    pub incident_id: Uuid,
    pub service_name: String,
    pub hypothesis_category: AnomalyCategory,
    pub confidence_score: f64,
    pub action_type: Option<ActionType>,
    pub action_executed: bool,
    pub outcome_success: bool,
    pub outcome_status: String,
    pub verification_metrics: serde_json::Value,
    pub time_to_resolution_seconds: Option<i64>,
}

// ============================================================================
// Service context
// ============================================================================

/// Optional topology/deployment context handed to the reasoning and
/// decision layers.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceContext {
    pub dependencies: Vec<String>,
    pub recent_deployments: Option<String>,
    pub tier: Option<String>,
    pub team: Option<String>,
    pub current_replicas: Option<i32>,
    pub pod_name: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_ordering_matches_escalation_rule() {
        assert!(Severity::Low < Severity::Medium);
        assert!(Severity::Medium < Severity::High);
        assert!(Severity::High < Severity::Critical);
    }

    #[test]
    fn severity_from_deviation_bands() {
        assert_eq!(Severity::from_max_deviation(5.5), Severity::Critical);
        assert_eq!(Severity::from_max_deviation(4.2), Severity::High);
        assert_eq!(Severity::from_max_deviation(3.0), Severity::Medium);
        assert_eq!(Severity::from_max_deviation(2.9), Severity::Low);
    }

    #[test]
    fn incident_status_transitions_are_forward_only() {
        use IncidentStatus::*;
        assert!(Detected.can_transition_to(Analyzing));
        assert!(Analyzing.can_transition_to(PendingApproval));
        assert!(Analyzing.can_transition_to(Resolved));
        assert!(Executing.can_transition_to(Resolved));
        // Backwards and self transitions are rejected
        assert!(!Analyzing.can_transition_to(Detected));
        assert!(!Resolved.can_transition_to(Analyzing));
        assert!(!Executing.can_transition_to(Executing));
    }

    #[test]
    fn action_status_executor_owns_terminal_transitions() {
        use ActionStatus::*;
        assert!(PendingApproval.can_transition_to(Approved));
        assert!(Approved.can_transition_to(Executing));
        assert!(Executing.can_transition_to(Succeeded));
        assert!(Executing.can_transition_to(RolledBack));
        assert!(!PendingApproval.can_transition_to(Executing));
        assert!(!Succeeded.can_transition_to(Executing));
    }

    #[test]
    fn category_round_trips_and_collapses_unknown() {
        assert_eq!(
            AnomalyCategory::parse("memory_leak"),
            AnomalyCategory::MemoryLeak
        );
        assert_eq!(
            AnomalyCategory::parse("something_new"),
            AnomalyCategory::MetricAnomaly
        );
        for cat in [
            AnomalyCategory::ErrorSpike,
            AnomalyCategory::TrafficDrop,
            AnomalyCategory::DeploymentIssue,
        ] {
            assert_eq!(AnomalyCategory::parse(cat.as_str()), cat);
        }
    }

    #[test]
    fn pattern_key_format() {
        assert_eq!(
            IncidentPattern::pattern_key("payment-service", AnomalyCategory::MemoryLeak),
            "payment-service:memory_leak"
        );
    }
}
