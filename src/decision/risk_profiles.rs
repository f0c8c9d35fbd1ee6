//! Action Risk Catalogue — per-action risk profiles and risk-weighted ranking
//!
//! Every executable action carries a code-resident risk profile: failure
//! probability, downtime expectations, reversibility and cost. The ranker
//! adjusts base risk by service criticality and accumulated downtime, then
//! picks the lowest-risk candidate above the confidence floor.

use crate::types::ActionType;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{info, warn};

/// Coarse category of an action's reversibility and impact.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ActionRiskCategory {
    /// Scale up, cache clear
    ReversibleLowImpact,
    /// Scale down, restart
    ReversibleMediumImpact,
    /// Feature flag toggle
    IrreversibleLowImpact,
    /// Rollback, drain node
    IrreversibleHighImpact,
}

/// Static risk profile for one action type.
#[derive(Debug, Clone, Serialize)]
pub struct ActionRiskProfile {
    pub action_type: ActionType,
    pub risk_category: ActionRiskCategory,
    /// Probability of making things worse, in [0, 1]
    pub risk_score: f64,
    pub expected_downtime_seconds: f64,
    pub worst_case_downtime_seconds: f64,
    pub recovery_time_seconds: f64,
    pub reversible: bool,
    /// "single_pod", "deployment", "cluster"
    pub blast_radius: &'static str,
    pub estimated_cost_per_minute: f64,
    pub prerequisites: &'static [&'static str],
    pub side_effects: &'static [&'static str],
}

/// Registry of risk profiles for all action types. Process-wide, read-mostly.
#[derive(Debug, Clone)]
pub struct ActionRiskRegistry {
    profiles: HashMap<ActionType, ActionRiskProfile>,
}

impl Default for ActionRiskRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ActionRiskRegistry {
    pub fn new() -> Self {
        let mut profiles = HashMap::new();

        // Scale up - low risk, easily reversible
        profiles.insert(
            ActionType::ScaleUp,
            ActionRiskProfile {
                action_type: ActionType::ScaleUp,
                risk_category: ActionRiskCategory::ReversibleLowImpact,
                risk_score: 0.05,
                expected_downtime_seconds: 0.0,
                worst_case_downtime_seconds: 30.0,
                recovery_time_seconds: 60.0,
                reversible: true,
                blast_radius: "deployment",
                estimated_cost_per_minute: 10.0,
                prerequisites: &["Current replicas < max replicas", "Cluster has capacity"],
                side_effects: &["Increased resource usage", "Higher infrastructure cost"],
            },
        );

        // Scale down - medium risk, reversible but reduces capacity
        profiles.insert(
            ActionType::ScaleDown,
            ActionRiskProfile {
                action_type: ActionType::ScaleDown,
                risk_category: ActionRiskCategory::ReversibleMediumImpact,
                risk_score: 0.25,
                expected_downtime_seconds: 0.0,
                worst_case_downtime_seconds: 300.0,
                recovery_time_seconds: 120.0,
                reversible: true,
                blast_radius: "deployment",
                estimated_cost_per_minute: 50.0,
                prerequisites: &["Current replicas > min replicas", "Load allows reduction"],
                side_effects: &["Reduced capacity", "Potential queuing if load increases"],
            },
        );

        // Restart pod - medium-high risk, brief downtime
        profiles.insert(
            ActionType::RestartPod,
            ActionRiskProfile {
                action_type: ActionType::RestartPod,
                risk_category: ActionRiskCategory::ReversibleMediumImpact,
                risk_score: 0.35,
                expected_downtime_seconds: 10.0,
                worst_case_downtime_seconds: 300.0,
                recovery_time_seconds: 180.0,
                reversible: false,
                blast_radius: "single_pod",
                estimated_cost_per_minute: 100.0,
                prerequisites: &["Multiple replicas available", "Service has health checks"],
                side_effects: &[
                    "Connection termination",
                    "In-flight request loss",
                    "Cache cold start",
                ],
            },
        );

        // Rollback deployment - high risk, significant impact
        profiles.insert(
            ActionType::RollbackDeployment,
            ActionRiskProfile {
                action_type: ActionType::RollbackDeployment,
                risk_category: ActionRiskCategory::IrreversibleHighImpact,
                risk_score: 0.50,
                expected_downtime_seconds: 60.0,
                worst_case_downtime_seconds: 1800.0,
                recovery_time_seconds: 600.0,
                reversible: false,
                blast_radius: "deployment",
                estimated_cost_per_minute: 500.0,
                prerequisites: &["Previous version available", "Database schema compatible"],
                side_effects: &[
                    "Feature loss",
                    "Potential data inconsistency",
                    "User experience change",
                ],
            },
        );

        // Toggle feature flag - low-medium risk, depends on flag
        profiles.insert(
            ActionType::ToggleFeatureFlag,
            ActionRiskProfile {
                action_type: ActionType::ToggleFeatureFlag,
                risk_category: ActionRiskCategory::IrreversibleLowImpact,
                risk_score: 0.20,
                expected_downtime_seconds: 0.0,
                worst_case_downtime_seconds: 60.0,
                recovery_time_seconds: 30.0,
                reversible: true,
                blast_radius: "deployment",
                estimated_cost_per_minute: 50.0,
                prerequisites: &["Feature flag exists", "Safe to disable feature"],
                side_effects: &["Feature unavailable to users", "Potential UX degradation"],
            },
        );

        // Clear cache - low risk, temporary impact
        profiles.insert(
            ActionType::ClearCache,
            ActionRiskProfile {
                action_type: ActionType::ClearCache,
                risk_category: ActionRiskCategory::ReversibleLowImpact,
                risk_score: 0.10,
                expected_downtime_seconds: 0.0,
                worst_case_downtime_seconds: 120.0,
                recovery_time_seconds: 60.0,
                reversible: false,
                blast_radius: "deployment",
                estimated_cost_per_minute: 20.0,
                prerequisites: &[
                    "Cache is not critical path",
                    "Service can handle cache miss load",
                ],
                side_effects: &["Increased database load", "Slower response times temporarily"],
            },
        );

        // Drain node - high risk, affects multiple services
        profiles.insert(
            ActionType::DrainNode,
            ActionRiskProfile {
                action_type: ActionType::DrainNode,
                risk_category: ActionRiskCategory::IrreversibleHighImpact,
                risk_score: 0.60,
                expected_downtime_seconds: 0.0,
                worst_case_downtime_seconds: 3600.0,
                recovery_time_seconds: 1800.0,
                reversible: false,
                blast_radius: "cluster",
                estimated_cost_per_minute: 1000.0,
                prerequisites: &["Cluster has spare capacity", "Not last healthy node"],
                side_effects: &[
                    "All pods on node restarted",
                    "Multiple services affected",
                    "Resource contention",
                ],
            },
        );

        Self { profiles }
    }

    pub fn get(&self, action_type: ActionType) -> Option<&ActionRiskProfile> {
        self.profiles.get(&action_type)
    }

    /// Rank actions by adjusted risk (lowest first):
    /// `adjusted = clamp(risk · criticality_mult − urgency_discount, 0, 1)`
    /// where criticality multiplies risk aversion and accumulated downtime
    /// buys risk tolerance (max 30% discount at 6+ minutes of downtime).
    pub fn rank_by_risk(
        &self,
        action_types: &[ActionType],
        service_criticality: &str,
        current_downtime_seconds: f64,
    ) -> Vec<(&ActionRiskProfile, f64)> {
        let criticality_mult = match service_criticality {
            "low" => 0.8,
            "high" => 1.2,
            "critical" => 1.5,
            _ => 1.0,
        };

        let downtime_minutes = current_downtime_seconds / 60.0;
        let urgency_discount = (downtime_minutes / 20.0).min(0.3);

        let mut ranked: Vec<(&ActionRiskProfile, f64)> = action_types
            .iter()
            .filter_map(|action_type| match self.get(*action_type) {
                Some(profile) => {
                    let adjusted =
                        (profile.risk_score * criticality_mult - urgency_discount).clamp(0.0, 1.0);
                    Some((profile, adjusted))
                }
                None => {
                    warn!(action = %action_type, "no risk profile, skipping");
                    None
                }
            })
            .collect();

        ranked.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));
        ranked
    }

    /// Expected cost = expected downtime · cost/min · blast multiplier.
    pub fn expected_cost(&self, action_type: ActionType, blast_multiplier: f64) -> f64 {
        self.get(action_type)
            .map(|p| p.expected_downtime_seconds / 60.0 * p.estimated_cost_per_minute * blast_multiplier)
            .unwrap_or(0.0)
    }

    /// Worst case = (worst downtime + recovery) · cost/min · blast multiplier.
    pub fn worst_case_cost(&self, action_type: ActionType, blast_multiplier: f64) -> f64 {
        self.get(action_type)
            .map(|p| {
                (p.worst_case_downtime_seconds + p.recovery_time_seconds) / 60.0
                    * p.estimated_cost_per_minute
                    * blast_multiplier
            })
            .unwrap_or(0.0)
    }

    /// Select the lowest-risk candidate whose confidence clears the floor.
    ///
    /// Returns the chosen action and a human-readable reasoning line; the
    /// line flags expensive high-risk picks for human approval.
    pub fn select_best_action(
        &self,
        candidates: &[ActionType],
        service_criticality: &str,
        current_downtime_seconds: f64,
        blast_multiplier: f64,
        min_confidence: f64,
        action_confidences: Option<&HashMap<ActionType, f64>>,
    ) -> Option<(ActionType, String)> {
        if candidates.is_empty() {
            return None;
        }

        let ranked = self.rank_by_risk(candidates, service_criticality, current_downtime_seconds);

        let eligible: Vec<&(&ActionRiskProfile, f64)> = ranked
            .iter()
            .filter(|(profile, _)| match action_confidences {
                Some(confidences) => confidences
                    .get(&profile.action_type)
                    .copied()
                    .unwrap_or(0.0)
                    >= min_confidence,
                None => true,
            })
            .collect();

        let (best_profile, best_risk) = eligible.first().map(|&&(p, r)| (p, r))?;

        let expected = self.expected_cost(best_profile.action_type, blast_multiplier);
        let worst = self.worst_case_cost(best_profile.action_type, blast_multiplier);

        let mut reasoning = format!(
            "Selected {} (risk: {:.2}, expected cost: ${:.2}, worst case: ${:.2})",
            best_profile.action_type, best_risk, expected, worst
        );
        if worst > 10_000.0 && best_profile.risk_score > 0.5 {
            reasoning.push_str(" - HIGH RISK, recommend human approval");
        }

        info!("{reasoning}");
        Some((best_profile.action_type, reasoning))
    }
}
