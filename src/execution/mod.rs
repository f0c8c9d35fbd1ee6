//! Execution Layer — validate → dry-run → execute → rollback
//!
//! Executors follow a four-phase contract: validate inputs and live-state
//! preconditions, short-circuit in dry-run mode, execute against the
//! orchestrator, and reverse where applicable. Orchestration target names
//! are validated against the identifier grammar before any outward call.

pub mod kubernetes;
pub mod verification;

pub use kubernetes::{
    DeploymentInfo, OrchestratorClient, OrchestratorError, PodRestartExecutor, ScaleExecutor,
};
pub use verification::{HealthMetrics, PostActionVerifier, VerificationResult, VerificationStatus};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

/// Maximum length of an orchestration resource name.
pub const MAX_RESOURCE_NAME_LENGTH: usize = 253;

/// Outcome status of an execution attempt.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Success,
    Failed,
}

/// Result of one execute (or rollback) call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub status: ExecutionStatus,
    pub message: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub duration_seconds: f64,
    pub details: serde_json::Value,
    pub error: Option<String>,
    pub dry_run: bool,
}

impl ExecutionResult {
    pub fn success(
        message: impl Into<String>,
        started_at: DateTime<Utc>,
        details: serde_json::Value,
        dry_run: bool,
    ) -> Self {
        let completed_at = Utc::now();
        Self {
            status: ExecutionStatus::Success,
            message: message.into(),
            started_at,
            completed_at,
            duration_seconds: (completed_at - started_at).num_milliseconds() as f64 / 1000.0,
            details,
            error: None,
            dry_run,
        }
    }

    pub fn failed(
        message: impl Into<String>,
        started_at: DateTime<Utc>,
        error: impl Into<String>,
        dry_run: bool,
    ) -> Self {
        let completed_at = Utc::now();
        Self {
            status: ExecutionStatus::Failed,
            message: message.into(),
            started_at,
            completed_at,
            duration_seconds: (completed_at - started_at).num_milliseconds() as f64 / 1000.0,
            details: serde_json::Value::Null,
            error: Some(error.into()),
            dry_run,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == ExecutionStatus::Success
    }
}

/// Outcome of a rollback request.
#[derive(Debug, Clone)]
pub enum RollbackOutcome {
    /// The action cannot be reversed (e.g. a pod restart).
    NotApplicable,
    /// Rollback was attempted; result carries success/failure.
    Attempted(ExecutionResult),
}

/// Four-phase executor contract.
#[async_trait]
pub trait ActionExecutor: Send + Sync {
    /// Short name for logs ("pod_restart", "scale").
    fn name(&self) -> &'static str;

    /// Validate target and parameters: shape, identifier grammar, and —
    /// outside dry-run — live-state preconditions. Violations fail fast.
    async fn validate(&self, target: &str, params: &serde_json::Value) -> Result<(), String>;

    /// Execute the action. Dry-run mode short-circuits live-state calls
    /// and succeeds whenever inputs validate syntactically.
    async fn execute(&self, target: &str, params: &serde_json::Value) -> ExecutionResult;

    /// Reverse a prior execution where applicable.
    async fn rollback(&self, target: &str, prior: &ExecutionResult) -> RollbackOutcome;
}

/// Validate an orchestration resource name.
///
/// Grammar: lowercase alphanumeric, `-`, `.`; each dot-separated segment
/// starts and ends with an alphanumeric; length ≤ 253.
pub fn validate_resource_name(name: &str, field: &str) -> Result<(), String> {
    static NAME_RE: OnceLock<Regex> = OnceLock::new();
    let re = NAME_RE.get_or_init(|| {
        #[allow(clippy::unwrap_used)]
        Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?(\.[a-z0-9]([-a-z0-9]*[a-z0-9])?)*$").unwrap()
    });

    if name.is_empty() {
        return Err(format!("{field} cannot be empty"));
    }
    if name.len() > MAX_RESOURCE_NAME_LENGTH {
        return Err(format!(
            "{field} must be {MAX_RESOURCE_NAME_LENGTH} characters or less (got {})",
            name.len()
        ));
    }
    if !re.is_match(name) {
        return Err(format!(
            "{field} must consist of lowercase alphanumeric characters, '-', or '.', \
             and must start and end with an alphanumeric character (got: {name})"
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_resource_names() {
        for name in [
            "api",
            "payment-service",
            "api.prod.cluster",
            "a",
            "x1-y2.z3",
        ] {
            assert!(validate_resource_name(name, "name").is_ok(), "{name}");
        }
    }

    #[test]
    fn invalid_resource_names() {
        for name in [
            "",
            "-api",
            "api-",
            "API",
            "api..prod",
            "api_prod",
            "api prod",
            ".api",
            "api.",
        ] {
            assert!(validate_resource_name(name, "name").is_err(), "{name:?}");
        }
    }

    #[test]
    fn length_limit_enforced() {
        let ok = "a".repeat(MAX_RESOURCE_NAME_LENGTH);
        assert!(validate_resource_name(&ok, "name").is_ok());
        let too_long = "a".repeat(MAX_RESOURCE_NAME_LENGTH + 1);
        assert!(validate_resource_name(&too_long, "name").is_err());
    }

    #[test]
    fn execution_result_constructors() {
        let started = Utc::now();
        let ok = ExecutionResult::success("done", started, serde_json::json!({"k": "v"}), true);
        assert!(ok.is_success());
        assert!(ok.dry_run);
        assert!(ok.error.is_none());

        let failed = ExecutionResult::failed("boom", started, "cause", false);
        assert!(!failed.is_success());
        assert_eq!(failed.error.as_deref(), Some("cause"));
    }
}
