//! Perception Layer — turns raw observability data into structured events
//!
//! Three stages run before any reasoning happens:
//!
//! - **Anomaly detection**: sliding-window z-score over metric series
//! - **Alert deduplication**: fingerprint + time-window collapse, so alert
//!   storms never reach the reasoning layer
//! - **Signal correlation**: fuse metric/log/trace/event signals into
//!   incident candidates

pub mod alert_dedup;
pub mod anomaly_detector;
pub mod signal_correlator;

pub use alert_dedup::{Alert, AlertDeduplicator, AlertSeverity, DedupedAlert};
pub use anomaly_detector::{Anomaly, AnomalyDetector, categorize_anomaly};
pub use signal_correlator::{CorrelatedIncidentCandidate, Signal, SignalCorrelator, SignalType};
