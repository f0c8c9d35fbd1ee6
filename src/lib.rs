//! AEGIS: Autonomous Incident Response
//!
//! End-to-end incident pipeline for microservice fleets.
//!
//! ## Architecture
//!
//! - **Perception**: sliding-window anomaly detection, alert dedup,
//!   cross-signal correlation
//! - **Reasoning**: model-proposed hypotheses scored by a deterministic
//!   confidence formula
//! - **Decision**: runbook-constrained action selection with blast-radius
//!   and risk-weighted ranking
//! - **Execution**: validate → dry-run → execute → rollback against the
//!   orchestrator, with post-action verification
//! - **Coordination**: cross-replica dedup, Postgres work queue, shared
//!   cache rate limiting, row-locked learning counters

pub mod api;
pub mod cache;
pub mod config;
pub mod decision;
pub mod execution;
pub mod learning;
pub mod metrics_client;
pub mod monitor;
pub mod perception;
pub mod ratelimit;
pub mod reasoning;
pub mod storage;
pub mod topology;
pub mod types;
pub mod worker;

// Re-export the core pipeline types
pub use types::{
    ActionRecord, ActionStatus, ActionType, AnomalyCategory, Evidence, Hypothesis, Incident,
    IncidentOutcome, IncidentPattern, IncidentStatus, RiskLevel, Severity,
};

// Re-export stage entry points
pub use decision::{ActionSelector, BlastRadiusCalculator, RunbookRegistry};
pub use execution::{PostActionVerifier, VerificationStatus};
pub use learning::LearningEngine;
pub use monitor::AnomalyMonitor;
pub use perception::{AlertDeduplicator, AnomalyDetector, SignalCorrelator};
pub use reasoning::HypothesisGenerator;
pub use topology::DependencyGraph;
