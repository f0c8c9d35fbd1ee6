//! Blast-Radius Awareness — impact-sized action urgency
//!
//! Not all service failures are equal. The calculator sizes an incident by
//! downstream services, request volume, error propagation and criticality,
//! then derives an urgency multiplier: small blast → wait and observe,
//! large blast → act aggressively.

use crate::metrics_client::MetricClient;
use crate::topology::DependencyGraph;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

/// Default request volume when the metric backend cannot answer.
const DEFAULT_REQUEST_VOLUME_RPS: f64 = 10.0;

/// Blast radius severity levels.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum BlastRadiusLevel {
    /// Single service, low traffic
    Minimal,
    /// Few downstream services
    Low,
    /// Multiple downstream services
    Medium,
    /// Critical services affected
    High,
    /// Cascading failure, many services
    Critical,
}

impl BlastRadiusLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            BlastRadiusLevel::Minimal => "minimal",
            BlastRadiusLevel::Low => "low",
            BlastRadiusLevel::Medium => "medium",
            BlastRadiusLevel::High => "high",
            BlastRadiusLevel::Critical => "critical",
        }
    }

    fn base_urgency(&self) -> f64 {
        match self {
            BlastRadiusLevel::Minimal => 1.0,
            BlastRadiusLevel::Low => 1.5,
            BlastRadiusLevel::Medium => 2.5,
            BlastRadiusLevel::High => 3.5,
            BlastRadiusLevel::Critical => 5.0,
        }
    }
}

impl std::fmt::Display for BlastRadiusLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Assessment of incident blast radius.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlastRadius {
    pub level: BlastRadiusLevel,
    /// Weighted score in [0, 1]
    pub score: f64,
    pub affected_services_count: usize,
    pub downstream_services: Vec<String>,
    pub request_volume_per_second: f64,
    /// Fraction of downstream services with elevated 5xx, as a percentage
    pub error_propagation_pct: f64,
    pub estimated_users_impacted: u64,
    pub revenue_impact_per_hour: f64,
    /// Action-prioritisation multiplier in [1.0, 5.0]
    pub urgency_multiplier: f64,
    pub assessed_at: DateTime<Utc>,
}

/// Whether to act now, soon, or keep observing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UrgencyDecision {
    ActImmediately { reason: String },
    ActSoon { reason: String },
    Observe { reason: String },
}

impl UrgencyDecision {
    pub fn should_act(&self) -> bool {
        !matches!(self, UrgencyDecision::Observe { .. })
    }
}

/// Calculates blast radius for a service incident.
pub struct BlastRadiusCalculator {
    metrics: MetricClient,
    graph: Arc<DependencyGraph>,
    users_per_rps: f64,
    revenue_per_user_hour: f64,
}

impl BlastRadiusCalculator {
    pub fn new(
        metrics: MetricClient,
        graph: Arc<DependencyGraph>,
        users_per_rps: f64,
        revenue_per_user_hour: f64,
    ) -> Self {
        Self {
            metrics,
            graph,
            users_per_rps,
            revenue_per_user_hour,
        }
    }

    /// Assess the blast radius of an incident on `service_name`.
    pub async fn calculate(&self, service_name: &str) -> BlastRadius {
        let downstream = self.graph.downstream(service_name);
        let request_volume = self.request_volume(service_name).await;
        let error_propagation = self.error_propagation(&downstream).await;
        let criticality = self.graph.criticality_score(service_name);

        let users_impacted = (request_volume * self.users_per_rps) as u64;
        let revenue_impact = users_impacted as f64 * self.revenue_per_user_hour;

        let score = blast_score(
            downstream.len(),
            request_volume,
            error_propagation,
            criticality,
        );
        let level = score_to_level(score);
        let urgency_multiplier = urgency(score, level);

        let assessment = BlastRadius {
            level,
            score,
            affected_services_count: downstream.len(),
            downstream_services: downstream,
            request_volume_per_second: request_volume,
            error_propagation_pct: error_propagation * 100.0,
            estimated_users_impacted: users_impacted,
            revenue_impact_per_hour: revenue_impact,
            urgency_multiplier,
            assessed_at: Utc::now(),
        };

        info!(
            service = service_name,
            level = %assessment.level,
            score = assessment.score,
            downstream = assessment.affected_services_count,
            rps = assessment.request_volume_per_second,
            urgency = assessment.urgency_multiplier,
            "blast radius assessed"
        );

        assessment
    }

    /// Request volume over the last 5 minutes; defaults on failure.
    async fn request_volume(&self, service_name: &str) -> f64 {
        let query = format!(r#"rate(http_requests_total{{service="{service_name}"}}[5m])"#);
        match self.metrics.query(&query, None).await {
            Ok(series) => series
                .first()
                .and_then(|s| s.latest_value())
                .unwrap_or(DEFAULT_REQUEST_VOLUME_RPS),
            Err(e) => {
                warn!(service = service_name, error = %e, "request volume query failed, using default");
                DEFAULT_REQUEST_VOLUME_RPS
            }
        }
    }

    /// Fraction of downstream services with elevated 5xx rate.
    async fn error_propagation(&self, downstream: &[String]) -> f64 {
        if downstream.is_empty() {
            return 0.0;
        }

        let mut affected = 0usize;
        for service in downstream {
            let query = format!(
                r#"rate(http_requests_total{{service="{service}",status=~"5.."}}[5m]) > 0.01"#
            );
            match self.metrics.query(&query, None).await {
                Ok(series) => {
                    if series.iter().any(|s| !s.points.is_empty()) {
                        affected += 1;
                    }
                }
                Err(e) => {
                    warn!(service = %service, error = %e, "error propagation query failed");
                }
            }
        }

        affected as f64 / downstream.len() as f64
    }

    /// Decision matrix:
    /// - critical blast: act immediately regardless of confidence
    /// - high blast + confidence ≥ 0.7: act immediately
    /// - medium blast + confidence ≥ 0.8: act soon
    /// - otherwise: observe
    pub fn should_act_immediately(
        assessment: &BlastRadius,
        confidence: f64,
    ) -> UrgencyDecision {
        match assessment.level {
            BlastRadiusLevel::Critical => UrgencyDecision::ActImmediately {
                reason: format!(
                    "CRITICAL blast radius ({} services, {} users, ${:.2}/hr) - act immediately",
                    assessment.affected_services_count,
                    assessment.estimated_users_impacted,
                    assessment.revenue_impact_per_hour
                ),
            },
            BlastRadiusLevel::High if confidence >= 0.7 => UrgencyDecision::ActImmediately {
                reason: format!(
                    "HIGH blast radius with {:.0}% confidence - act immediately",
                    confidence * 100.0
                ),
            },
            BlastRadiusLevel::Medium if confidence >= 0.8 => UrgencyDecision::ActSoon {
                reason: format!(
                    "MEDIUM blast radius with high confidence ({:.0}%) - act soon",
                    confidence * 100.0
                ),
            },
            level => UrgencyDecision::Observe {
                reason: format!(
                    "{} blast radius with confidence {:.0}% - wait and observe",
                    level.as_str().to_uppercase(),
                    confidence * 100.0
                ),
            },
        }
    }
}

/// Weighted blast score: downstream 30% (normalised /10), volume 25%
/// (normalised /100), error propagation 25%, criticality 20%.
fn blast_score(
    downstream_count: usize,
    request_volume: f64,
    error_propagation: f64,
    criticality: f64,
) -> f64 {
    let downstream_score = (downstream_count as f64 / 10.0).min(1.0);
    let volume_score = (request_volume / 100.0).min(1.0);

    let score = downstream_score * 0.30
        + volume_score * 0.25
        + error_propagation * 0.25
        + criticality * 0.20;

    score.clamp(0.0, 1.0)
}

fn score_to_level(score: f64) -> BlastRadiusLevel {
    if score >= 0.8 {
        BlastRadiusLevel::Critical
    } else if score >= 0.6 {
        BlastRadiusLevel::High
    } else if score >= 0.4 {
        BlastRadiusLevel::Medium
    } else if score >= 0.2 {
        BlastRadiusLevel::Low
    } else {
        BlastRadiusLevel::Minimal
    }
}

/// Base urgency by level plus `score · 0.5`, clamped to [1, 5].
fn urgency(score: f64, level: BlastRadiusLevel) -> f64 {
    (level.base_urgency() + score * 0.5).clamp(1.0, 5.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assessment(level: BlastRadiusLevel, score: f64) -> BlastRadius {
        BlastRadius {
            level,
            score,
            affected_services_count: 3,
            downstream_services: vec!["a".into(), "b".into(), "c".into()],
            request_volume_per_second: 50.0,
            error_propagation_pct: 30.0,
            estimated_users_impacted: 500,
            revenue_impact_per_hour: 5.0,
            urgency_multiplier: urgency(score, level),
            assessed_at: Utc::now(),
        }
    }

    #[test]
    fn blast_score_weighted_sum() {
        // 5 downstream, 50 rps, 40% propagation, criticality 0.7
        let score = blast_score(5, 50.0, 0.4, 0.7);
        let expected = 0.5 * 0.30 + 0.5 * 0.25 + 0.4 * 0.25 + 0.7 * 0.20;
        assert!((score - expected).abs() < 1e-12);
    }

    #[test]
    fn normalisation_caps_at_one() {
        let score = blast_score(50, 5000.0, 1.0, 1.0);
        assert!(score <= 1.0);
        // downstream and volume components are saturated
        let expected = 0.30 + 0.25 + 0.25 + 0.20;
        assert!((score - expected).abs() < 1e-12);
    }

    #[test]
    fn level_bands() {
        assert_eq!(score_to_level(0.85), BlastRadiusLevel::Critical);
        assert_eq!(score_to_level(0.65), BlastRadiusLevel::High);
        assert_eq!(score_to_level(0.45), BlastRadiusLevel::Medium);
        assert_eq!(score_to_level(0.25), BlastRadiusLevel::Low);
        assert_eq!(score_to_level(0.1), BlastRadiusLevel::Minimal);
    }

    #[test]
    fn urgency_stays_in_bounds() {
        assert!((urgency(0.0, BlastRadiusLevel::Minimal) - 1.0).abs() < f64::EPSILON);
        assert!(urgency(1.0, BlastRadiusLevel::Critical) <= 5.0);
        assert!(urgency(0.5, BlastRadiusLevel::Medium) > 2.5);
    }

    #[test]
    fn decision_matrix() {
        let critical = assessment(BlastRadiusLevel::Critical, 0.9);
        assert!(matches!(
            BlastRadiusCalculator::should_act_immediately(&critical, 0.1),
            UrgencyDecision::ActImmediately { .. }
        ));

        let high = assessment(BlastRadiusLevel::High, 0.65);
        assert!(matches!(
            BlastRadiusCalculator::should_act_immediately(&high, 0.75),
            UrgencyDecision::ActImmediately { .. }
        ));
        assert!(matches!(
            BlastRadiusCalculator::should_act_immediately(&high, 0.5),
            UrgencyDecision::Observe { .. }
        ));

        let medium = assessment(BlastRadiusLevel::Medium, 0.45);
        assert!(matches!(
            BlastRadiusCalculator::should_act_immediately(&medium, 0.85),
            UrgencyDecision::ActSoon { .. }
        ));

        let low = assessment(BlastRadiusLevel::Low, 0.25);
        let decision = BlastRadiusCalculator::should_act_immediately(&low, 0.99);
        assert!(!decision.should_act());
    }
}
