//! Kubernetes-Style Executors — pod restart and deployment scale
//!
//! Both executors talk to the orchestrator through the [`OrchestratorClient`]
//! seam. When no client is wired in (the orchestrator is optional), they
//! degrade to simulation with clearly tagged results instead of failing.
//!
//! Safety checks:
//! - Pod restart requires ≥ 2 replicas and full availability (live mode)
//! - Scale validates min ≤ target ≤ max before touching the deployment

use crate::execution::{
    validate_resource_name, ActionExecutor, ExecutionResult, RollbackOutcome,
};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

/// Grace period handed to pod deletion.
const POD_DELETE_GRACE_SECONDS: i64 = 30;

/// Settle delay after deleting a pod before reporting.
const POD_RESTART_SETTLE: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("deployment {0} not found in namespace {1}")]
    DeploymentNotFound(String, String),
    #[error("pod {0} not found in namespace {1}")]
    PodNotFound(String, String),
    #[error("orchestrator API error: {0}")]
    Api(String),
}

/// Deployment state needed by safety checks and scaling.
#[derive(Debug, Clone, Copy)]
pub struct DeploymentInfo {
    pub spec_replicas: i32,
    pub available_replicas: i32,
}

/// Narrow orchestrator surface consumed by the executors.
#[async_trait]
pub trait OrchestratorClient: Send + Sync {
    async fn read_deployment(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<DeploymentInfo, OrchestratorError>;

    async fn delete_pod(
        &self,
        namespace: &str,
        name: &str,
        grace_period_seconds: i64,
    ) -> Result<(), OrchestratorError>;

    async fn list_pods(
        &self,
        namespace: &str,
        label_selector: &str,
    ) -> Result<Vec<String>, OrchestratorError>;

    async fn scale_deployment(
        &self,
        namespace: &str,
        name: &str,
        replicas: i32,
    ) -> Result<(), OrchestratorError>;
}

fn param_str<'a>(params: &'a Value, key: &str) -> Option<&'a str> {
    params.get(key).and_then(Value::as_str)
}

fn param_i64(params: &Value, key: &str) -> Option<i64> {
    params.get(key).and_then(Value::as_i64)
}

// ─── Pod restart ──────────────────────────────────────────────────────────────

/// Restarts a pod by deleting it, relying on the replica controller to
/// recreate it. Not rollbackable.
pub struct PodRestartExecutor {
    dry_run: bool,
    orchestrator: Option<Arc<dyn OrchestratorClient>>,
}

impl PodRestartExecutor {
    pub fn new(dry_run: bool, orchestrator: Option<Arc<dyn OrchestratorClient>>) -> Self {
        Self {
            dry_run,
            orchestrator,
        }
    }

    fn resolve_names<'a>(
        target: &'a str,
        params: &'a Value,
    ) -> (&'a str, &'a str, Option<&'a str>) {
        let namespace = param_str(params, "namespace").unwrap_or("default");
        let deployment = param_str(params, "deployment").unwrap_or(target);
        let pod_name = param_str(params, "pod_name");
        (namespace, deployment, pod_name)
    }
}

#[async_trait]
impl ActionExecutor for PodRestartExecutor {
    fn name(&self) -> &'static str {
        "pod_restart"
    }

    async fn validate(&self, target: &str, params: &Value) -> Result<(), String> {
        let (namespace, deployment, pod_name) = Self::resolve_names(target, params);

        validate_resource_name(namespace, "namespace")?;
        validate_resource_name(deployment, "deployment")?;
        if let Some(pod) = pod_name {
            validate_resource_name(pod, "pod_name")?;
        }

        if self.dry_run {
            // Live-state preconditions are skipped in dry-run
            return Ok(());
        }

        let orchestrator = match &self.orchestrator {
            Some(client) => client,
            // No orchestrator: execution will simulate, nothing to check
            None => return Ok(()),
        };

        let deployment_info = orchestrator
            .read_deployment(namespace, deployment)
            .await
            .map_err(|e| e.to_string())?;

        if deployment_info.spec_replicas < 2 {
            return Err(format!(
                "Only {} replica(s) - unsafe to restart",
                deployment_info.spec_replicas
            ));
        }
        if deployment_info.available_replicas < deployment_info.spec_replicas {
            return Err("Deployment not fully available".to_string());
        }

        Ok(())
    }

    async fn execute(&self, target: &str, params: &Value) -> ExecutionResult {
        let started_at = Utc::now();
        let (namespace, deployment, pod_name) = Self::resolve_names(target, params);

        if let Err(msg) = self.validate(target, params).await {
            return ExecutionResult::failed(
                format!("Validation failed: {msg}"),
                started_at,
                msg,
                self.dry_run,
            );
        }

        if self.dry_run {
            return ExecutionResult::success(
                format!("[DRY RUN] Would restart pod in deployment {deployment}"),
                started_at,
                serde_json::json!({
                    "action": "pod_restart",
                    "namespace": namespace,
                    "deployment": deployment,
                    "pod_name": pod_name,
                    "simulated": true,
                }),
                true,
            );
        }

        let orchestrator = match &self.orchestrator {
            Some(client) => Arc::clone(client),
            None => {
                warn!(deployment, "orchestrator unavailable, simulating pod restart");
                return ExecutionResult::success(
                    format!("[SIMULATED] Restarted pod in deployment {deployment}"),
                    started_at,
                    serde_json::json!({
                        "action": "pod_restart",
                        "namespace": namespace,
                        "deployment": deployment,
                        "simulated": true,
                        "reason": "orchestrator_not_available",
                    }),
                    false,
                );
            }
        };

        let restarted = if let Some(pod) = pod_name {
            orchestrator
                .delete_pod(namespace, pod, POD_DELETE_GRACE_SECONDS)
                .await
                .map(|_| pod.to_string())
        } else {
            match orchestrator
                .list_pods(namespace, &format!("app={deployment}"))
                .await
            {
                Ok(pods) => match pods.first() {
                    Some(pod) => orchestrator
                        .delete_pod(namespace, pod, POD_DELETE_GRACE_SECONDS)
                        .await
                        .map(|_| pod.clone()),
                    None => {
                        return ExecutionResult::failed(
                            format!("No pods found for deployment {deployment}"),
                            started_at,
                            "No pods found",
                            false,
                        );
                    }
                },
                Err(e) => Err(e),
            }
        };

        match restarted {
            Ok(pod) => {
                // Give the replacement pod time to start before reporting
                tokio::time::sleep(POD_RESTART_SETTLE).await;
                info!(namespace, deployment, pod = %pod, "pod restarted");
                ExecutionResult::success(
                    format!("Restarted pod {pod}"),
                    started_at,
                    serde_json::json!({
                        "action": "pod_restart",
                        "namespace": namespace,
                        "deployment": deployment,
                        "pod_name": pod,
                    }),
                    false,
                )
            }
            Err(e) => ExecutionResult::failed(
                format!("Pod restart failed: {e}"),
                started_at,
                e.to_string(),
                false,
            ),
        }
    }

    async fn rollback(&self, _target: &str, _prior: &ExecutionResult) -> RollbackOutcome {
        // Deleting a pod cannot be undone; the controller already replaced it
        RollbackOutcome::NotApplicable
    }
}

// ─── Scale ────────────────────────────────────────────────────────────────────

/// Patches a deployment's replica count. Rollback re-applies the replica
/// count recorded at execute time.
pub struct ScaleExecutor {
    dry_run: bool,
    orchestrator: Option<Arc<dyn OrchestratorClient>>,
}

impl ScaleExecutor {
    pub fn new(dry_run: bool, orchestrator: Option<Arc<dyn OrchestratorClient>>) -> Self {
        Self {
            dry_run,
            orchestrator,
        }
    }

    fn bounds(params: &Value) -> (i64, Option<i64>, Option<i64>) {
        let target = param_i64(params, "target_replicas").unwrap_or(0);
        let min = param_i64(params, "min_replicas");
        let max = param_i64(params, "max_replicas");
        (target, min, max)
    }
}

#[async_trait]
impl ActionExecutor for ScaleExecutor {
    fn name(&self) -> &'static str {
        "scale"
    }

    async fn validate(&self, target: &str, params: &Value) -> Result<(), String> {
        let namespace = param_str(params, "namespace").unwrap_or("default");
        let deployment = param_str(params, "deployment").unwrap_or(target);

        validate_resource_name(namespace, "namespace")?;
        validate_resource_name(deployment, "deployment")?;

        let (target_replicas, min, max) = Self::bounds(params);
        if target_replicas < 1 {
            return Err(format!(
                "target_replicas must be at least 1 (got {target_replicas})"
            ));
        }
        if let Some(min) = min {
            if target_replicas < min {
                return Err(format!(
                    "target_replicas {target_replicas} below min_replicas {min}"
                ));
            }
        }
        if let Some(max) = max {
            if target_replicas > max {
                return Err(format!(
                    "target_replicas {target_replicas} above max_replicas {max}"
                ));
            }
        }

        Ok(())
    }

    async fn execute(&self, target: &str, params: &Value) -> ExecutionResult {
        let started_at = Utc::now();
        let namespace = param_str(params, "namespace").unwrap_or("default").to_string();
        let deployment = param_str(params, "deployment").unwrap_or(target).to_string();
        let (target_replicas, _, _) = Self::bounds(params);

        if let Err(msg) = self.validate(target, params).await {
            return ExecutionResult::failed(
                format!("Validation failed: {msg}"),
                started_at,
                msg,
                self.dry_run,
            );
        }

        if self.dry_run {
            return ExecutionResult::success(
                format!("[DRY RUN] Would scale {deployment} to {target_replicas} replicas"),
                started_at,
                serde_json::json!({
                    "action": "scale",
                    "namespace": namespace,
                    "deployment": deployment,
                    "target_replicas": target_replicas,
                    "simulated": true,
                }),
                true,
            );
        }

        let orchestrator = match &self.orchestrator {
            Some(client) => Arc::clone(client),
            None => {
                warn!(deployment = %deployment, "orchestrator unavailable, simulating scale");
                return ExecutionResult::success(
                    format!("[SIMULATED] Scaled {deployment} to {target_replicas} replicas"),
                    started_at,
                    serde_json::json!({
                        "action": "scale",
                        "namespace": namespace,
                        "deployment": deployment,
                        "target_replicas": target_replicas,
                        "simulated": true,
                        "reason": "orchestrator_not_available",
                    }),
                    false,
                );
            }
        };

        // Record the pre-scale replica count so rollback can restore it
        let previous_replicas = match orchestrator.read_deployment(&namespace, &deployment).await {
            Ok(info) => Some(info.spec_replicas),
            Err(e) => {
                warn!(deployment = %deployment, error = %e, "could not read pre-scale replicas");
                None
            }
        };

        match orchestrator
            .scale_deployment(&namespace, &deployment, target_replicas as i32)
            .await
        {
            Ok(()) => {
                info!(
                    namespace = %namespace,
                    deployment = %deployment,
                    replicas = target_replicas,
                    "deployment scaled"
                );
                ExecutionResult::success(
                    format!("Scaled {deployment} to {target_replicas} replicas"),
                    started_at,
                    serde_json::json!({
                        "action": "scale",
                        "namespace": namespace,
                        "deployment": deployment,
                        "target_replicas": target_replicas,
                        "previous_replicas": previous_replicas,
                    }),
                    false,
                )
            }
            Err(e) => ExecutionResult::failed(
                format!("Scale failed: {e}"),
                started_at,
                e.to_string(),
                false,
            ),
        }
    }

    /// Re-execute with the replica count recorded at execute time.
    async fn rollback(&self, target: &str, prior: &ExecutionResult) -> RollbackOutcome {
        let previous = prior
            .details
            .get("previous_replicas")
            .and_then(Value::as_i64);

        let previous = match previous {
            Some(p) => p,
            None => return RollbackOutcome::NotApplicable,
        };

        let params = serde_json::json!({
            "namespace": prior.details.get("namespace").and_then(Value::as_str).unwrap_or("default"),
            "deployment": prior.details.get("deployment").and_then(Value::as_str).unwrap_or(target),
            "target_replicas": previous,
        });

        RollbackOutcome::Attempted(self.execute(target, &params).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Scripted orchestrator for executor tests.
    #[derive(Default)]
    struct FakeOrchestrator {
        deployment: Mutex<Option<DeploymentInfo>>,
        pods: Mutex<Vec<String>>,
        deleted: Mutex<Vec<String>>,
        scaled_to: Mutex<Vec<i32>>,
    }

    #[async_trait]
    impl OrchestratorClient for FakeOrchestrator {
        async fn read_deployment(
            &self,
            namespace: &str,
            name: &str,
        ) -> Result<DeploymentInfo, OrchestratorError> {
            self.deployment.lock().unwrap().ok_or_else(|| {
                OrchestratorError::DeploymentNotFound(name.to_string(), namespace.to_string())
            })
        }

        async fn delete_pod(
            &self,
            _namespace: &str,
            name: &str,
            _grace: i64,
        ) -> Result<(), OrchestratorError> {
            self.deleted.lock().unwrap().push(name.to_string());
            Ok(())
        }

        async fn list_pods(
            &self,
            _namespace: &str,
            _selector: &str,
        ) -> Result<Vec<String>, OrchestratorError> {
            Ok(self.pods.lock().unwrap().clone())
        }

        async fn scale_deployment(
            &self,
            _namespace: &str,
            _name: &str,
            replicas: i32,
        ) -> Result<(), OrchestratorError> {
            self.scaled_to.lock().unwrap().push(replicas);
            if let Some(info) = self.deployment.lock().unwrap().as_mut() {
                info.spec_replicas = replicas;
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn dry_run_restart_succeeds_without_orchestrator() {
        let executor = PodRestartExecutor::new(true, None);
        let params = serde_json::json!({"deployment": "api"});

        let result = executor.execute("api", &params).await;
        assert!(result.is_success());
        assert!(result.dry_run);
        assert_eq!(result.details["simulated"], true);
    }

    #[tokio::test]
    async fn restart_rejects_bad_identifiers() {
        let executor = PodRestartExecutor::new(true, None);
        let params = serde_json::json!({"deployment": "Bad_Name"});
        let result = executor.execute("api", &params).await;
        assert!(!result.is_success());
        assert!(result.message.contains("Validation failed"));
    }

    #[tokio::test]
    async fn restart_requires_two_replicas_live() {
        let orchestrator = Arc::new(FakeOrchestrator::default());
        *orchestrator.deployment.lock().unwrap() = Some(DeploymentInfo {
            spec_replicas: 1,
            available_replicas: 1,
        });

        let executor = PodRestartExecutor::new(false, Some(orchestrator as _));
        let err = executor
            .validate("api", &serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(err.contains("unsafe to restart"));
    }

    #[tokio::test]
    async fn restart_deletes_first_matching_pod() {
        let orchestrator = Arc::new(FakeOrchestrator::default());
        *orchestrator.deployment.lock().unwrap() = Some(DeploymentInfo {
            spec_replicas: 3,
            available_replicas: 3,
        });
        *orchestrator.pods.lock().unwrap() =
            vec!["api-abc".to_string(), "api-def".to_string()];

        let executor = PodRestartExecutor::new(false, Some(Arc::clone(&orchestrator) as _));
        let result = executor.execute("api", &serde_json::json!({})).await;
        assert!(result.is_success());
        assert_eq!(
            orchestrator.deleted.lock().unwrap().as_slice(),
            &["api-abc".to_string()]
        );
    }

    #[tokio::test]
    async fn restart_is_not_rollbackable() {
        let executor = PodRestartExecutor::new(true, None);
        let result = executor.execute("api", &serde_json::json!({})).await;
        assert!(matches!(
            executor.rollback("api", &result).await,
            RollbackOutcome::NotApplicable
        ));
    }

    #[tokio::test]
    async fn scale_validates_target_bounds() {
        let executor = ScaleExecutor::new(true, None);

        let too_low = serde_json::json!({"target_replicas": 0});
        assert!(executor.validate("api", &too_low).await.is_err());

        let above_max = serde_json::json!({"target_replicas": 10, "max_replicas": 5});
        assert!(executor.validate("api", &above_max).await.is_err());

        let below_min = serde_json::json!({"target_replicas": 1, "min_replicas": 2});
        assert!(executor.validate("api", &below_min).await.is_err());

        let ok = serde_json::json!({"target_replicas": 3, "min_replicas": 1, "max_replicas": 5});
        assert!(executor.validate("api", &ok).await.is_ok());
    }

    #[tokio::test]
    async fn scale_then_rollback_restores_previous_count() {
        let orchestrator = Arc::new(FakeOrchestrator::default());
        *orchestrator.deployment.lock().unwrap() = Some(DeploymentInfo {
            spec_replicas: 2,
            available_replicas: 2,
        });

        let executor = ScaleExecutor::new(false, Some(Arc::clone(&orchestrator) as _));
        let result = executor
            .execute("api", &serde_json::json!({"target_replicas": 5}))
            .await;
        assert!(result.is_success());
        assert_eq!(result.details["previous_replicas"], 2);

        let rollback = executor.rollback("api", &result).await;
        match rollback {
            RollbackOutcome::Attempted(r) => assert!(r.is_success()),
            RollbackOutcome::NotApplicable => panic!("scale must be rollbackable"),
        }
        assert_eq!(
            orchestrator.scaled_to.lock().unwrap().as_slice(),
            &[5, 2]
        );
    }

    #[tokio::test]
    async fn scale_simulates_without_orchestrator() {
        let executor = ScaleExecutor::new(false, None);
        let result = executor
            .execute("api", &serde_json::json!({"target_replicas": 4}))
            .await;
        assert!(result.is_success());
        assert_eq!(result.details["simulated"], true);
        assert_eq!(result.details["reason"], "orchestrator_not_available");
    }
}
