//! Multi-Signal Correlation Engine
//!
//! Correlates metrics, logs, traces and events to identify incident
//! candidates. Requiring multiple corroborating signals of different types
//! eliminates single-metric alert fatigue: a candidate only exists when at
//! least two signals of at least two distinct types land in the same
//! service and time window.

use crate::perception::anomaly_detector::Anomaly;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use tracing::debug;

/// Minimum confidence for a candidate to be emitted.
const MIN_CANDIDATE_CONFIDENCE: f64 = 0.6;

/// Diversity bonus per distinct signal type, and its cap.
const DIVERSITY_BONUS_PER_TYPE: f64 = 0.1;
const DIVERSITY_BONUS_CAP: f64 = 0.3;

/// Type of observability signal.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum SignalType {
    Metric,
    Log,
    Trace,
    Event,
}

impl SignalType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalType::Metric => "metric",
            SignalType::Log => "log",
            SignalType::Trace => "trace",
            SignalType::Event => "event",
        }
    }

    /// Correlation weight per signal type. Metrics carry the most weight;
    /// events the least.
    fn weight(&self) -> f64 {
        match self {
            SignalType::Metric => 0.4,
            SignalType::Log => 0.3,
            SignalType::Trace => 0.3,
            SignalType::Event => 0.2,
        }
    }
}

impl std::fmt::Display for SignalType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Unified observability event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    pub signal_type: SignalType,
    /// Source system (prometheus, loki, jaeger, …)
    pub source: String,
    /// Signal identifier
    pub name: String,
    /// Numeric value or severity score
    pub value: f64,
    pub timestamp: DateTime<Utc>,
    pub labels: HashMap<String, String>,
    /// Anomaly score in [0, 1]
    pub anomaly_score: f64,
}

impl Signal {
    /// Service label with `app` fallback; unlabelled signals group under
    /// "unknown".
    pub fn service(&self) -> &str {
        self.labels
            .get("service")
            .or_else(|| self.labels.get("app"))
            .map(String::as_str)
            .unwrap_or("unknown")
    }

    /// Convert anomaly detections into metric signals for correlation.
    pub fn from_anomalies(anomalies: &[Anomaly]) -> Vec<Signal> {
        anomalies
            .iter()
            .map(|a| Signal {
                signal_type: SignalType::Metric,
                source: "metrics".to_string(),
                name: a.metric_name.clone(),
                value: a.current_value,
                timestamp: DateTime::from_timestamp(a.timestamp as i64, 0)
                    .unwrap_or_else(Utc::now),
                labels: a.labels.clone(),
                anomaly_score: a.confidence,
            })
            .collect()
    }
}

/// A correlated incident candidate with multiple supporting signals.
///
/// Ephemeral: owned by the correlation stage, never persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorrelatedIncidentCandidate {
    pub service: String,
    pub title: String,
    pub description: String,
    /// (max anomaly score + mean anomaly score) / 2
    pub severity_score: f64,
    pub signals: Vec<Signal>,
    pub confidence: f64,
}

/// Correlates signals into incident candidates.
#[derive(Debug, Clone)]
pub struct SignalCorrelator {
    correlation_window: Duration,
    min_signal_count: usize,
}

impl Default for SignalCorrelator {
    fn default() -> Self {
        Self::new(300, 2)
    }
}

impl SignalCorrelator {
    pub fn new(correlation_window_seconds: i64, min_signal_count: usize) -> Self {
        Self {
            correlation_window: Duration::seconds(correlation_window_seconds),
            min_signal_count,
        }
    }

    /// Correlate signals to identify incident candidates, sorted by
    /// confidence descending.
    pub fn correlate(
        &self,
        signals: &[Signal],
        service_filter: Option<&str>,
    ) -> Vec<CorrelatedIncidentCandidate> {
        let mut candidates = Vec::new();

        for (service, service_signals) in self.group_by_service(signals, service_filter) {
            for window in self.partition_windows(service_signals) {
                if window.len() < self.min_signal_count {
                    continue;
                }

                let types: HashSet<SignalType> =
                    window.iter().map(|s| s.signal_type).collect();
                if types.len() < 2 {
                    continue;
                }

                let confidence = self.window_confidence(&window);
                if confidence < MIN_CANDIDATE_CONFIDENCE {
                    debug!(
                        service = %service,
                        confidence,
                        signals = window.len(),
                        "correlation window below confidence floor"
                    );
                    continue;
                }

                candidates.push(self.build_candidate(&service, window, confidence));
            }
        }

        candidates.sort_by(|a, b| {
            b.confidence
                .partial_cmp(&a.confidence)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        candidates
    }

    fn group_by_service<'a>(
        &self,
        signals: &'a [Signal],
        service_filter: Option<&str>,
    ) -> HashMap<String, Vec<&'a Signal>> {
        let mut groups: HashMap<String, Vec<&Signal>> = HashMap::new();
        for signal in signals {
            let service = signal.service();
            if let Some(filter) = service_filter {
                if service != filter {
                    continue;
                }
            }
            groups.entry(service.to_string()).or_default().push(signal);
        }
        groups
    }

    /// Partition a service's signals into time windows: a window closes
    /// when the next signal is more than the window length after the
    /// window's first signal.
    fn partition_windows<'a>(&self, mut signals: Vec<&'a Signal>) -> Vec<Vec<&'a Signal>> {
        signals.sort_by_key(|s| s.timestamp);

        let mut windows: Vec<Vec<&Signal>> = Vec::new();
        let mut current: Vec<&Signal> = Vec::new();

        for signal in signals {
            let in_window = current
                .first()
                .map(|first| signal.timestamp - first.timestamp <= self.correlation_window)
                .unwrap_or(true);

            if in_window {
                current.push(signal);
            } else {
                windows.push(std::mem::take(&mut current));
                current.push(signal);
            }
        }
        if !current.is_empty() {
            windows.push(current);
        }
        windows
    }

    /// Weighted average of anomaly scores by signal-type weight, plus a
    /// diversity bonus, clamped at 1.0.
    fn window_confidence(&self, window: &[&Signal]) -> f64 {
        if window.is_empty() {
            return 0.0;
        }

        let types: HashSet<SignalType> = window.iter().map(|s| s.signal_type).collect();
        let diversity_bonus = (types.len() as f64 * DIVERSITY_BONUS_PER_TYPE).min(DIVERSITY_BONUS_CAP);

        let mut weighted = 0.0;
        let mut total_weight = 0.0;
        for signal in window {
            let w = signal.signal_type.weight();
            weighted += signal.anomaly_score * w;
            total_weight += w;
        }
        let avg = if total_weight > 0.0 {
            weighted / total_weight
        } else {
            0.0
        };

        (avg + diversity_bonus).min(1.0)
    }

    fn build_candidate(
        &self,
        service: &str,
        window: Vec<&Signal>,
        confidence: f64,
    ) -> CorrelatedIncidentCandidate {
        let max_score = window.iter().map(|s| s.anomaly_score).fold(0.0, f64::max);
        let mean_score =
            window.iter().map(|s| s.anomaly_score).sum::<f64>() / window.len() as f64;
        let severity_score = (max_score + mean_score) / 2.0;

        let mut description_lines = vec!["Correlated signals indicate an incident:".to_string()];
        for signal in &window {
            description_lines.push(format!(
                "  - {}: {} (score: {:.2})",
                signal.signal_type, signal.name, signal.anomaly_score
            ));
        }

        CorrelatedIncidentCandidate {
            service: service.to_string(),
            title: format!("Multiple anomalies detected in {service}"),
            description: description_lines.join("\n"),
            severity_score,
            signals: window.into_iter().cloned().collect(),
            confidence,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signal(
        signal_type: SignalType,
        service: &str,
        name: &str,
        score: f64,
        offset_secs: i64,
    ) -> Signal {
        let mut labels = HashMap::new();
        labels.insert("service".to_string(), service.to_string());
        Signal {
            signal_type,
            source: "test".to_string(),
            name: name.to_string(),
            value: score,
            timestamp: Utc::now() + Duration::seconds(offset_secs),
            labels,
            anomaly_score: score,
        }
    }

    #[test]
    fn metric_plus_log_yields_candidate() {
        let signals = vec![
            signal(SignalType::Metric, "payment-service", "error_rate", 0.85, 0),
            signal(SignalType::Log, "payment-service", "error_burst", 0.80, 30),
        ];

        let candidates = SignalCorrelator::default().correlate(&signals, None);
        assert_eq!(candidates.len(), 1);
        let c = &candidates[0];
        assert!(c.confidence >= 0.6);
        assert_eq!(c.signals.len(), 2);
        assert_eq!(c.service, "payment-service");
    }

    #[test]
    fn single_type_windows_are_discarded() {
        let signals = vec![
            signal(SignalType::Metric, "api", "error_rate", 0.9, 0),
            signal(SignalType::Metric, "api", "latency_p95", 0.9, 10),
        ];
        assert!(SignalCorrelator::default().correlate(&signals, None).is_empty());
    }

    #[test]
    fn below_min_count_is_discarded() {
        let signals = vec![signal(SignalType::Metric, "api", "error_rate", 0.95, 0)];
        assert!(SignalCorrelator::default().correlate(&signals, None).is_empty());
    }

    #[test]
    fn candidate_signals_share_service_and_window() {
        let window_secs = 300;
        let signals = vec![
            signal(SignalType::Metric, "api", "error_rate", 0.9, 0),
            signal(SignalType::Log, "api", "panic_lines", 0.8, 100),
            // Outside the window relative to the first signal
            signal(SignalType::Trace, "api", "slow_span", 0.9, 600),
            // Different service entirely
            signal(SignalType::Metric, "payment", "error_rate", 0.9, 0),
        ];

        let correlator = SignalCorrelator::new(window_secs, 2);
        let candidates = correlator.correlate(&signals, None);

        for candidate in &candidates {
            let first_ts = candidate
                .signals
                .iter()
                .map(|s| s.timestamp)
                .min()
                .unwrap();
            for s in &candidate.signals {
                assert_eq!(s.service(), candidate.service);
                assert!(s.timestamp - first_ts <= Duration::seconds(window_secs));
            }
        }
    }

    #[test]
    fn weak_signals_stay_below_floor() {
        let signals = vec![
            signal(SignalType::Metric, "api", "error_rate", 0.2, 0),
            signal(SignalType::Log, "api", "warn_lines", 0.2, 10),
        ];
        assert!(SignalCorrelator::default().correlate(&signals, None).is_empty());
    }

    #[test]
    fn service_filter_applies() {
        let signals = vec![
            signal(SignalType::Metric, "api", "error_rate", 0.9, 0),
            signal(SignalType::Log, "api", "errors", 0.9, 10),
            signal(SignalType::Metric, "payment", "error_rate", 0.9, 0),
            signal(SignalType::Log, "payment", "errors", 0.9, 10),
        ];

        let candidates = SignalCorrelator::default().correlate(&signals, Some("api"));
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].service, "api");
    }

    #[test]
    fn severity_score_is_mean_of_max_and_mean() {
        let signals = vec![
            signal(SignalType::Metric, "api", "error_rate", 1.0, 0),
            signal(SignalType::Log, "api", "errors", 0.6, 10),
        ];
        let candidates = SignalCorrelator::default().correlate(&signals, None);
        // max = 1.0, mean = 0.8 → severity = 0.9
        assert!((candidates[0].severity_score - 0.9).abs() < 1e-9);
    }

    #[test]
    fn anomalies_convert_to_metric_signals() {
        let anomaly = Anomaly {
            metric_name: "error_rate".to_string(),
            is_anomaly: true,
            current_value: 42.0,
            expected_value: 1.0,
            deviation_sigma: 6.0,
            confidence: 0.9,
            timestamp: Utc::now().timestamp() as f64,
            labels: HashMap::from([("service".to_string(), "api".to_string())]),
        };
        let signals = Signal::from_anomalies(&[anomaly]);
        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0].signal_type, SignalType::Metric);
        assert_eq!(signals[0].service(), "api");
        assert!((signals[0].anomaly_score - 0.9).abs() < f64::EPSILON);
    }
}
