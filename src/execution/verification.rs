//! Post-Action Verification — did the action actually help?
//!
//! An action that executes without confirming impact is useless. The
//! verifier waits out a stabilisation window, samples the same health
//! metrics before and after, computes per-metric improvement, and routes
//! the result to continue / rollback / monitor / escalate. Verification
//! failure is a signal, not an error.

use crate::execution::ExecutionResult;
use crate::metrics_client::MetricClient;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{error, info};

/// Degradation tolerance: any metric worse than this (percent) fails the
/// verification outright.
const DEGRADATION_FLOOR_PCT: f64 = -10.0;

/// Spread between best and worst improvement beyond which the outcome is
/// considered unstable.
const INSTABILITY_SPREAD_PCT: f64 = 30.0;

/// Status of post-action verification.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum VerificationStatus {
    /// Metrics improved, action worked
    Success,
    /// Some improvement but not complete
    PartialSuccess,
    /// Metrics unchanged
    NoChange,
    /// Metrics worse, needs rollback
    Degraded,
    /// Metrics fluctuating, needs monitoring
    Unstable,
}

impl VerificationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            VerificationStatus::Success => "success",
            VerificationStatus::PartialSuccess => "partial_success",
            VerificationStatus::NoChange => "no_change",
            VerificationStatus::Degraded => "degraded",
            VerificationStatus::Unstable => "unstable",
        }
    }
}

/// Next step recommended by the verifier.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Recommendation {
    Continue,
    Rollback,
    Escalate,
    Monitor,
}

impl Recommendation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Recommendation::Continue => "continue",
            Recommendation::Rollback => "rollback",
            Recommendation::Escalate => "escalate",
            Recommendation::Monitor => "monitor",
        }
    }
}

/// Health metric sample for one service at one point in time.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HealthMetrics {
    /// Errors per minute
    pub error_rate: Option<f64>,
    /// 95th percentile latency (ms)
    pub latency_p95: Option<f64>,
    /// 99th percentile latency (ms)
    pub latency_p99: Option<f64>,
    /// Up probe at query time (1 = up)
    pub availability: Option<f64>,
    /// Requests per second
    pub request_rate: Option<f64>,
    pub sampled_at: Option<DateTime<Utc>>,
}

/// Result of post-action verification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationResult {
    pub status: VerificationStatus,
    /// Rendered per-metric before/after/Δ report for human review
    pub message: String,
    pub before_metrics: HealthMetrics,
    pub after_metrics: HealthMetrics,
    /// Metric name → improvement percentage (positive = better)
    pub improvement_percentage: BTreeMap<String, f64>,
    pub recommendation: Recommendation,
    pub stabilization_seconds: u64,
    pub verified_at: DateTime<Utc>,
}

/// Verifies that actions actually fixed the issue.
pub struct PostActionVerifier {
    metrics: MetricClient,
    stabilization_seconds: u64,
    /// Minimum average improvement (percent) to declare success
    improvement_threshold_pct: f64,
}

impl PostActionVerifier {
    pub fn new(
        metrics: MetricClient,
        stabilization_seconds: u64,
        improvement_threshold_pct: f64,
    ) -> Self {
        Self {
            metrics,
            stabilization_seconds,
            improvement_threshold_pct,
        }
    }

    /// Verify an executed action against before/after health metrics.
    ///
    /// A failed execution returns degraded + rollback immediately, without
    /// waiting or querying.
    pub async fn verify(
        &self,
        service_name: &str,
        execution: &ExecutionResult,
        before_metrics: Option<HealthMetrics>,
    ) -> VerificationResult {
        if !execution.is_success() {
            return VerificationResult {
                status: VerificationStatus::Degraded,
                message: format!(
                    "Action execution failed: {}",
                    execution.error.as_deref().unwrap_or("unknown error")
                ),
                before_metrics: before_metrics.unwrap_or_default(),
                after_metrics: HealthMetrics::default(),
                improvement_percentage: BTreeMap::new(),
                recommendation: Recommendation::Rollback,
                stabilization_seconds: 0,
                verified_at: Utc::now(),
            };
        }

        info!(
            service = service_name,
            wait_seconds = self.stabilization_seconds,
            "waiting for stabilization before verification"
        );
        tokio::time::sleep(Duration::from_secs(self.stabilization_seconds)).await;

        let after_metrics = self.fetch_health_metrics(service_name, None).await;

        let before_metrics = match before_metrics {
            Some(m) => m,
            None => {
                // Sample just before the action started
                let before_time = execution.started_at - ChronoDuration::minutes(5);
                self.fetch_health_metrics(service_name, Some(before_time))
                    .await
            }
        };

        let improvements = compare_metrics(&before_metrics, &after_metrics);
        let status = classify(&improvements, self.improvement_threshold_pct);
        let recommendation = recommend(status);
        let message = render_report(status, &improvements, &before_metrics, &after_metrics);

        info!(
            service = service_name,
            status = status.as_str(),
            recommendation = recommendation.as_str(),
            "verification complete"
        );

        VerificationResult {
            status,
            message,
            before_metrics,
            after_metrics,
            improvement_percentage: improvements,
            recommendation,
            stabilization_seconds: self.stabilization_seconds,
            verified_at: Utc::now(),
        }
    }

    /// Sample the health bundle at a point in time (None = now). Query
    /// failures leave the corresponding field empty.
    async fn fetch_health_metrics(
        &self,
        service_name: &str,
        time: Option<DateTime<Utc>>,
    ) -> HealthMetrics {
        let mut metrics = HealthMetrics {
            sampled_at: Some(time.unwrap_or_else(Utc::now)),
            ..HealthMetrics::default()
        };

        let queries: [(&str, String); 5] = [
            (
                "error_rate",
                format!(
                    r#"rate(http_requests_total{{service="{service_name}",status=~"5.."}}[1m]) * 60"#
                ),
            ),
            (
                "latency_p95",
                format!(
                    r#"histogram_quantile(0.95, rate(http_request_duration_seconds_bucket{{service="{service_name}"}}[5m])) * 1000"#
                ),
            ),
            (
                "latency_p99",
                format!(
                    r#"histogram_quantile(0.99, rate(http_request_duration_seconds_bucket{{service="{service_name}"}}[5m])) * 1000"#
                ),
            ),
            (
                "request_rate",
                format!(r#"rate(http_requests_total{{service="{service_name}"}}[1m])"#),
            ),
            ("availability", format!(r#"up{{service="{service_name}"}}"#)),
        ];

        for (field, query) in queries {
            match self.metrics.query(&query, time).await {
                Ok(series) => {
                    let value = series.first().and_then(|s| s.latest_value());
                    match field {
                        "error_rate" => metrics.error_rate = value.or(Some(0.0)),
                        "latency_p95" => metrics.latency_p95 = value,
                        "latency_p99" => metrics.latency_p99 = value,
                        "request_rate" => metrics.request_rate = value,
                        "availability" => metrics.availability = value.or(Some(0.0)),
                        _ => {}
                    }
                }
                Err(e) => {
                    error!(service = service_name, metric = field, error = %e, "health metric query failed");
                }
            }
        }

        metrics
    }
}

/// Per-metric improvement percentages. For "higher is worse" metrics the
/// sign is (before − after)/before; availability inverts.
pub fn compare_metrics(before: &HealthMetrics, after: &HealthMetrics) -> BTreeMap<String, f64> {
    let mut improvements = BTreeMap::new();

    let worse_is_higher = [
        ("error_rate", before.error_rate, after.error_rate),
        ("latency_p95", before.latency_p95, after.latency_p95),
        ("latency_p99", before.latency_p99, after.latency_p99),
    ];
    for (name, before_v, after_v) in worse_is_higher {
        if let (Some(b), Some(a)) = (before_v, after_v) {
            let pct = if b > 0.0 {
                (b - a) / b * 100.0
            } else if a == 0.0 {
                0.0
            } else {
                -100.0
            };
            improvements.insert(name.to_string(), pct);
        }
    }

    if let (Some(b), Some(a)) = (before.availability, after.availability) {
        let pct = if b > 0.0 { (a - b) / b * 100.0 } else { 0.0 };
        improvements.insert("availability".to_string(), pct);
    }

    improvements
}

/// Status decision over the improvement set.
pub fn classify(improvements: &BTreeMap<String, f64>, threshold_pct: f64) -> VerificationStatus {
    if improvements.is_empty() {
        return VerificationStatus::NoChange;
    }

    let values: Vec<f64> = improvements.values().copied().collect();
    let avg = values.iter().sum::<f64>() / values.len() as f64;

    if values.iter().any(|v| *v < DEGRADATION_FLOOR_PCT) {
        return VerificationStatus::Degraded;
    }
    if avg >= threshold_pct {
        return VerificationStatus::Success;
    }
    if avg >= threshold_pct / 2.0 {
        return VerificationStatus::PartialSuccess;
    }

    let max = values.iter().copied().fold(f64::MIN, f64::max);
    let min = values.iter().copied().fold(f64::MAX, f64::min);
    if max - min > INSTABILITY_SPREAD_PCT {
        return VerificationStatus::Unstable;
    }

    VerificationStatus::NoChange
}

/// Recommendation per status: success continues, degradation rolls back,
/// partial keeps watching, everything unclear escalates to a human.
pub fn recommend(status: VerificationStatus) -> Recommendation {
    match status {
        VerificationStatus::Success => Recommendation::Continue,
        VerificationStatus::Degraded => Recommendation::Rollback,
        VerificationStatus::PartialSuccess => Recommendation::Monitor,
        VerificationStatus::Unstable | VerificationStatus::NoChange => Recommendation::Escalate,
    }
}

/// Render the per-metric before/after/Δ report.
fn render_report(
    status: VerificationStatus,
    improvements: &BTreeMap<String, f64>,
    before: &HealthMetrics,
    after: &HealthMetrics,
) -> String {
    let mut lines = vec![
        format!("Post-action verification: {}", status.as_str()),
        String::new(),
        "=== Before-After Metrics Comparison ===".to_string(),
    ];

    let mut section = |label: &str, unit: &str, b: Option<f64>, a: Option<f64>, key: &str| {
        if let (Some(b), Some(a)) = (b, a) {
            let delta = a - b;
            let delta_pct = improvements.get(key).copied().unwrap_or(0.0);
            lines.push(String::new());
            lines.push(format!("{label}:"));
            lines.push(format!("  Before: {b:.2}{unit}"));
            lines.push(format!("  After:  {a:.2}{unit}"));
            lines.push(format!("  Δ = {delta:+.2}{unit} ({delta_pct:+.1}%)"));
        }
    };

    section(
        "Error Rate",
        " errors/min",
        before.error_rate,
        after.error_rate,
        "error_rate",
    );
    section(
        "Latency P95",
        "ms",
        before.latency_p95,
        after.latency_p95,
        "latency_p95",
    );
    section(
        "Latency P99",
        "ms",
        before.latency_p99,
        after.latency_p99,
        "latency_p99",
    );
    section(
        "Availability",
        "",
        before.availability,
        after.availability,
        "availability",
    );
    section(
        "Request Rate",
        " req/s",
        before.request_rate,
        after.request_rate,
        "request_rate",
    );

    lines.push(String::new());
    lines.push("=".repeat(40));

    if !improvements.is_empty() {
        let avg = improvements.values().sum::<f64>() / improvements.len() as f64;
        lines.push(format!("Overall improvement: {avg:+.1}%"));
    }

    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metrics(error_rate: f64, p95: f64, p99: f64, availability: f64) -> HealthMetrics {
        HealthMetrics {
            error_rate: Some(error_rate),
            latency_p95: Some(p95),
            latency_p99: Some(p99),
            availability: Some(availability),
            request_rate: Some(100.0),
            sampled_at: Some(Utc::now()),
        }
    }

    #[test]
    fn improvement_signs_are_consistent() {
        let before = metrics(10.0, 500.0, 900.0, 0.9);
        let after = metrics(5.0, 250.0, 450.0, 1.0);

        let improvements = compare_metrics(&before, &after);
        // Halving the error rate is a +50% improvement
        assert!((improvements["error_rate"] - 50.0).abs() < 1e-9);
        assert!((improvements["latency_p95"] - 50.0).abs() < 1e-9);
        // Availability climbing is positive
        assert!(improvements["availability"] > 0.0);
    }

    #[test]
    fn zero_before_error_rate_edge_cases() {
        let before = metrics(0.0, 100.0, 100.0, 1.0);
        let mut after = metrics(0.0, 100.0, 100.0, 1.0);
        let improvements = compare_metrics(&before, &after);
        assert!((improvements["error_rate"]).abs() < f64::EPSILON);

        after.error_rate = Some(3.0);
        let improvements = compare_metrics(&before, &after);
        assert!((improvements["error_rate"] + 100.0).abs() < f64::EPSILON);
    }

    #[test]
    fn classification_bands() {
        let mut improvements = BTreeMap::new();
        improvements.insert("error_rate".to_string(), 30.0);
        improvements.insert("latency_p95".to_string(), 25.0);
        assert_eq!(classify(&improvements, 20.0), VerificationStatus::Success);

        improvements.insert("error_rate".to_string(), 12.0);
        improvements.insert("latency_p95".to_string(), 10.0);
        assert_eq!(
            classify(&improvements, 20.0),
            VerificationStatus::PartialSuccess
        );

        improvements.insert("error_rate".to_string(), -15.0);
        assert_eq!(classify(&improvements, 20.0), VerificationStatus::Degraded);

        let mut flat = BTreeMap::new();
        flat.insert("error_rate".to_string(), 1.0);
        flat.insert("latency_p95".to_string(), 2.0);
        assert_eq!(classify(&flat, 20.0), VerificationStatus::NoChange);

        let mut spread = BTreeMap::new();
        spread.insert("error_rate".to_string(), -5.0);
        spread.insert("latency_p95".to_string(), 28.0);
        // avg 11.5 ≥ 10 → partial beats unstable at threshold 20
        assert_eq!(
            classify(&spread, 20.0),
            VerificationStatus::PartialSuccess
        );

        let mut unstable = BTreeMap::new();
        unstable.insert("error_rate".to_string(), -8.0);
        unstable.insert("latency_p95".to_string(), 24.0);
        unstable.insert("latency_p99".to_string(), 0.0);
        // avg ≈ 5.3, spread 32 → unstable
        assert_eq!(classify(&unstable, 20.0), VerificationStatus::Unstable);

        assert_eq!(classify(&BTreeMap::new(), 20.0), VerificationStatus::NoChange);
    }

    #[test]
    fn recommendations_per_status() {
        assert_eq!(recommend(VerificationStatus::Success), Recommendation::Continue);
        assert_eq!(recommend(VerificationStatus::Degraded), Recommendation::Rollback);
        assert_eq!(
            recommend(VerificationStatus::PartialSuccess),
            Recommendation::Monitor
        );
        assert_eq!(recommend(VerificationStatus::Unstable), Recommendation::Escalate);
        assert_eq!(recommend(VerificationStatus::NoChange), Recommendation::Escalate);
    }

    #[tokio::test]
    async fn failed_execution_short_circuits_to_rollback() {
        let client = MetricClient::new("http://localhost:9090").unwrap();
        let verifier = PostActionVerifier::new(client, 120, 20.0);

        let failed = ExecutionResult::failed("scale failed", Utc::now(), "api error", false);
        let result = verifier.verify("api", &failed, None).await;

        assert_eq!(result.status, VerificationStatus::Degraded);
        assert_eq!(result.recommendation, Recommendation::Rollback);
        assert_eq!(result.stabilization_seconds, 0);
    }

    #[test]
    fn report_renders_before_after_delta() {
        let before = metrics(12.0, 480.0, 950.0, 0.98);
        let after = metrics(1.2, 210.0, 400.0, 1.0);
        let improvements = compare_metrics(&before, &after);
        let report = render_report(
            VerificationStatus::Success,
            &improvements,
            &before,
            &after,
        );

        assert!(report.contains("Error Rate"));
        assert!(report.contains("Before: 12.00 errors/min"));
        assert!(report.contains("After:  1.20 errors/min"));
        assert!(report.contains("Δ = "));
        assert!(report.contains("Overall improvement"));
    }
}
