//! Alert Deduplication and Severity Normalisation
//!
//! Alert storms corrupt reasoning, so they are collapsed before perception:
//! alerts are grouped by a stable fingerprint, windowed in time, and each
//! window emits one deduplicated record carrying the count and the highest
//! severity seen. Raw severity strings from heterogeneous sources are
//! normalised through an explicit table plus keyword fallback.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use tracing::warn;

/// Default deduplication window.
pub const DEFAULT_DEDUP_WINDOW_SECONDS: i64 = 300;

/// Normalised alert severity, ordered `Info < Low < Medium < High < Critical`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Info,
    Low,
    Medium,
    High,
    Critical,
}

impl AlertSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertSeverity::Info => "info",
            AlertSeverity::Low => "low",
            AlertSeverity::Medium => "medium",
            AlertSeverity::High => "high",
            AlertSeverity::Critical => "critical",
        }
    }
}

impl std::fmt::Display for AlertSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Single alert from a monitoring system.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    /// Source system (prometheus, pagerduty, cloudwatch, …)
    pub source: String,
    /// Alert name / rule name
    pub name: String,
    /// Affected service
    pub service: String,
    pub severity: AlertSeverity,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub labels: HashMap<String, String>,
    pub annotations: HashMap<String, String>,
}

/// Label keys excluded from fingerprinting — they vary per instance or
/// per evaluation and would defeat grouping.
const VOLATILE_LABELS: [&str; 4] = ["instance", "pod", "timestamp", "alertstate"];

impl Alert {
    /// Stable fingerprint over (service, name, stable labels).
    ///
    /// Two alerts with equal derived fingerprints compare equal under
    /// deduplication.
    pub fn fingerprint(&self) -> String {
        // BTreeMap gives a deterministic label order
        let stable: BTreeMap<&str, &str> = self
            .labels
            .iter()
            .filter(|(k, _)| !VOLATILE_LABELS.contains(&k.as_str()))
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();

        let mut fingerprint_str = format!("{}:{}:", self.service, self.name);
        for (k, v) in &stable {
            fingerprint_str.push_str(k);
            fingerprint_str.push('=');
            fingerprint_str.push_str(v);
            fingerprint_str.push(';');
        }

        let digest = md5::compute(fingerprint_str.as_bytes());
        format!("{digest:x}")[..16].to_string()
    }
}

/// Deduplicated alert with count and time range.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DedupedAlert {
    pub representative: Alert,
    /// Number of alerts collapsed into this record (≥ 1)
    pub count: usize,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    /// Highest severity seen in the window
    pub max_severity: AlertSeverity,
}

/// Deduplicates and normalises alerts before they reach perception.
#[derive(Debug, Clone)]
pub struct AlertDeduplicator {
    dedup_window: Duration,
    severity_map: HashMap<String, AlertSeverity>,
}

impl Default for AlertDeduplicator {
    fn default() -> Self {
        Self::new(DEFAULT_DEDUP_WINDOW_SECONDS)
    }
}

impl AlertDeduplicator {
    pub fn new(dedup_window_seconds: i64) -> Self {
        Self {
            dedup_window: Duration::seconds(dedup_window_seconds),
            severity_map: Self::default_severity_map(),
        }
    }

    /// Explicit severity mapping for known sources.
    fn default_severity_map() -> HashMap<String, AlertSeverity> {
        let mut map = HashMap::new();
        // Prometheus / Alertmanager
        map.insert("critical".to_string(), AlertSeverity::Critical);
        map.insert("warning".to_string(), AlertSeverity::Medium);
        map.insert("info".to_string(), AlertSeverity::Info);
        // PagerDuty
        map.insert("high".to_string(), AlertSeverity::High);
        map.insert("low".to_string(), AlertSeverity::Low);
        // CloudWatch
        map.insert("alarm".to_string(), AlertSeverity::High);
        map.insert("insufficient_data".to_string(), AlertSeverity::Low);
        map.insert("ok".to_string(), AlertSeverity::Info);
        map
    }

    /// Normalise a raw severity string via the table, then keyword fallback.
    /// Unknown severities default to medium and are logged.
    pub fn normalize_severity(&self, raw: &str) -> AlertSeverity {
        let normalized = raw.to_lowercase();
        let normalized = normalized.trim();

        if let Some(sev) = self.severity_map.get(normalized) {
            return *sev;
        }

        if normalized.contains("crit") || normalized.contains("fatal") {
            return AlertSeverity::Critical;
        }
        if normalized.contains("high") || normalized.contains("urgent") {
            return AlertSeverity::High;
        }
        if normalized.contains("warn") || normalized.contains("medium") {
            return AlertSeverity::Medium;
        }
        if normalized.contains("low") || normalized.contains("minor") {
            return AlertSeverity::Low;
        }

        warn!(raw_severity = raw, "unknown alert severity, defaulting to medium");
        AlertSeverity::Medium
    }

    /// Collapse a batch of alerts.
    ///
    /// Alerts are grouped by fingerprint, sorted by timestamp within each
    /// group, and split into windows: a new window opens whenever the next
    /// alert falls more than the window length after the window's first
    /// alert. One record is emitted per window. Alerts older than
    /// `max_age` (when given) are dropped up front.
    pub fn deduplicate(&self, alerts: &[Alert], max_age: Option<Duration>) -> Vec<DedupedAlert> {
        let cutoff = max_age.map(|age| Utc::now() - age);

        let mut groups: HashMap<String, Vec<&Alert>> = HashMap::new();
        for alert in alerts {
            if let Some(cutoff) = cutoff {
                if alert.timestamp < cutoff {
                    continue;
                }
            }
            groups.entry(alert.fingerprint()).or_default().push(alert);
        }

        let mut deduped = Vec::new();
        for (_, mut group) in groups {
            group.sort_by_key(|a| a.timestamp);

            let mut window: Vec<&Alert> = Vec::new();
            for alert in group {
                let window_open = window
                    .first()
                    .map(|first| alert.timestamp - first.timestamp <= self.dedup_window)
                    .unwrap_or(false);

                if window_open {
                    window.push(alert);
                } else {
                    if let Some(record) = self.emit_window(&window) {
                        deduped.push(record);
                    }
                    window = vec![alert];
                }
            }
            if let Some(record) = self.emit_window(&window) {
                deduped.push(record);
            }
        }

        // Highest severity first, then most recent
        deduped.sort_by(|a, b| {
            b.max_severity
                .cmp(&a.max_severity)
                .then(b.last_seen.cmp(&a.last_seen))
        });
        deduped
    }

    fn emit_window(&self, window: &[&Alert]) -> Option<DedupedAlert> {
        let first = window.first()?;
        let last = window.last()?;
        let max_severity = window.iter().map(|a| a.severity).max()?;

        Some(DedupedAlert {
            representative: (*first).clone(),
            count: window.len(),
            first_seen: first.timestamp,
            last_seen: last.timestamp,
            max_severity,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alert(name: &str, service: &str, severity: AlertSeverity, offset_secs: i64) -> Alert {
        Alert {
            source: "prometheus".to_string(),
            name: name.to_string(),
            service: service.to_string(),
            severity,
            message: format!("{name} firing"),
            timestamp: Utc::now() + Duration::seconds(offset_secs),
            labels: HashMap::new(),
            annotations: HashMap::new(),
        }
    }

    #[test]
    fn equal_fingerprints_for_volatile_label_differences() {
        let mut a = alert("HighErrorRate", "api", AlertSeverity::High, 0);
        let mut b = alert("HighErrorRate", "api", AlertSeverity::High, 10);
        a.labels.insert("instance".to_string(), "10.0.0.1".to_string());
        a.labels.insert("env".to_string(), "prod".to_string());
        b.labels.insert("instance".to_string(), "10.0.0.2".to_string());
        b.labels.insert("pod".to_string(), "api-7df9".to_string());
        b.labels.insert("env".to_string(), "prod".to_string());

        assert_eq!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn distinct_services_never_collapse() {
        let a = alert("HighErrorRate", "api", AlertSeverity::High, 0);
        let b = alert("HighErrorRate", "payment-service", AlertSeverity::High, 0);
        assert_ne!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn duplicates_within_window_collapse_with_count() {
        let alerts = vec![
            alert("HighErrorRate", "api", AlertSeverity::Medium, 0),
            alert("HighErrorRate", "api", AlertSeverity::High, 60),
            alert("HighErrorRate", "api", AlertSeverity::Medium, 120),
        ];

        let deduped = AlertDeduplicator::default().deduplicate(&alerts, None);
        assert_eq!(deduped.len(), 1);
        assert_eq!(deduped[0].count, 3);
        assert_eq!(deduped[0].max_severity, AlertSeverity::High);
    }

    #[test]
    fn window_boundary_opens_new_record() {
        let alerts = vec![
            alert("Flap", "api", AlertSeverity::Low, 0),
            alert("Flap", "api", AlertSeverity::Low, 100),
            // 400s after window start — beyond the 300s window
            alert("Flap", "api", AlertSeverity::Low, 400),
        ];

        let deduped = AlertDeduplicator::default().deduplicate(&alerts, None);
        assert_eq!(deduped.len(), 2);
        let counts: Vec<usize> = deduped.iter().map(|d| d.count).collect();
        assert!(counts.contains(&2) && counts.contains(&1));
    }

    #[test]
    fn permutation_invariance() {
        let base = vec![
            alert("A", "api", AlertSeverity::Low, 0),
            alert("A", "api", AlertSeverity::High, 30),
            alert("B", "api", AlertSeverity::Medium, 10),
            alert("B", "payment", AlertSeverity::Medium, 10),
            alert("A", "api", AlertSeverity::Low, 500),
        ];

        let dedup = AlertDeduplicator::default();
        let summarize = |records: Vec<DedupedAlert>| -> Vec<(String, usize)> {
            let mut pairs: Vec<(String, usize)> = records
                .iter()
                .map(|d| (d.representative.fingerprint(), d.count))
                .collect();
            pairs.sort();
            pairs
        };

        let forward = summarize(dedup.deduplicate(&base, None));
        let mut reversed = base.clone();
        reversed.reverse();
        let backward = summarize(dedup.deduplicate(&reversed, None));
        assert_eq!(forward, backward);

        let mut rotated = base;
        rotated.rotate_left(2);
        let rotated = summarize(dedup.deduplicate(&rotated, None));
        assert_eq!(forward, rotated);
    }

    #[test]
    fn severity_normalisation_table_and_keywords() {
        let d = AlertDeduplicator::default();
        assert_eq!(d.normalize_severity("critical"), AlertSeverity::Critical);
        assert_eq!(d.normalize_severity("warning"), AlertSeverity::Medium);
        assert_eq!(d.normalize_severity("ALARM"), AlertSeverity::High);
        assert_eq!(d.normalize_severity("FATAL ERROR"), AlertSeverity::Critical);
        assert_eq!(d.normalize_severity("urgent page"), AlertSeverity::High);
        assert_eq!(d.normalize_severity("minor"), AlertSeverity::Low);
        assert_eq!(d.normalize_severity("???"), AlertSeverity::Medium);
    }

    #[test]
    fn max_age_drops_stale_alerts() {
        let alerts = vec![
            alert("Old", "api", AlertSeverity::High, -7200),
            alert("Fresh", "api", AlertSeverity::High, -10),
        ];
        let deduped =
            AlertDeduplicator::default().deduplicate(&alerts, Some(Duration::minutes(60)));
        assert_eq!(deduped.len(), 1);
        assert_eq!(deduped[0].representative.name, "Fresh");
    }
}
