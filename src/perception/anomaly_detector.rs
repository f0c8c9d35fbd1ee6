//! Statistical Anomaly Detection — Sliding-Window Z-Score
//!
//! The detector learns a baseline from all points in a series except the
//! most recent one and checks the most recent point against it. A flat
//! baseline (σ = 0) falls back to a scale-normalised divergence so constant
//! series stay quiet while order-of-magnitude shifts are still flagged.

use crate::metrics_client::MetricSeries;
use crate::types::AnomalyCategory;
use statrs::statistics::Statistics;
use std::collections::HashMap;
use tracing::{info, warn};

/// Minimum points required before a series can be scored.
pub const MIN_POINTS_FOR_DETECTION: usize = 3;

/// Default z-score threshold.
pub const DEFAULT_SIGMA_THRESHOLD: f64 = 3.0;

/// Multiplier for the σ = 0 relative-divergence fallback.
const FLAT_BASELINE_SCALE: f64 = 10.0;

/// Result of checking the most recent point of a series.
///
/// Created by the detector; immutable thereafter.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Anomaly {
    pub metric_name: String,
    pub is_anomaly: bool,
    pub current_value: f64,
    pub expected_value: f64,
    /// |x − μ| / σ, or the flat-baseline divergence when σ = 0. Always ≥ 0.
    pub deviation_sigma: f64,
    /// Confidence in [0, 1], derived deterministically from the z-score.
    pub confidence: f64,
    /// Seconds since the epoch of the checked point.
    pub timestamp: f64,
    pub labels: HashMap<String, String>,
}

/// Z-score anomaly detector over metric time series.
#[derive(Debug, Clone, Copy)]
pub struct AnomalyDetector {
    threshold_sigma: f64,
}

impl Default for AnomalyDetector {
    fn default() -> Self {
        Self::new(DEFAULT_SIGMA_THRESHOLD)
    }
}

impl AnomalyDetector {
    pub fn new(threshold_sigma: f64) -> Self {
        Self { threshold_sigma }
    }

    /// Detect anomalies in a single series.
    ///
    /// Only the most recent point is checked; the rest of the series forms
    /// the baseline window. Insufficient data yields an empty result, not
    /// an error. NaN and infinite values are rejected as non-anomalies.
    pub fn detect(&self, series: &MetricSeries) -> Vec<Anomaly> {
        if series.points.len() < MIN_POINTS_FOR_DETECTION {
            warn!(
                metric = %series.metric_name,
                points = series.points.len(),
                "insufficient data points for detection"
            );
            return Vec::new();
        }

        let values: Vec<f64> = series.points.iter().map(|p| p.value).collect();
        let (baseline, last) = match values.split_last() {
            Some((last, baseline)) => (baseline, *last),
            None => return Vec::new(),
        };

        if !last.is_finite() || baseline.iter().any(|v| !v.is_finite()) {
            warn!(
                metric = %series.metric_name,
                "non-finite values in series, skipping detection"
            );
            return Vec::new();
        }

        let mean = baseline.mean();
        let stdev = if baseline.len() > 1 {
            baseline.std_dev()
        } else {
            0.0
        };

        let z_score = if stdev > 0.0 {
            (last - mean).abs() / stdev
        } else if (last - mean).abs() < f64::EPSILON {
            0.0
        } else {
            // Flat baseline: relative deviation normalised by the larger
            // magnitude, floored at 1.0 to avoid division by zero.
            let base = mean.abs().max(last.abs()).max(1.0);
            (last - mean).abs() / base * FLAT_BASELINE_SCALE
        };

        let is_anomaly = z_score > self.threshold_sigma;
        let confidence = self.confidence_for(z_score, is_anomaly);

        let point = match series.points.last() {
            Some(p) => p,
            None => return Vec::new(),
        };

        let anomaly = Anomaly {
            metric_name: series.metric_name.clone(),
            is_anomaly,
            current_value: last,
            expected_value: mean,
            deviation_sigma: z_score,
            confidence,
            timestamp: point.timestamp,
            labels: series.labels.clone(),
        };

        if is_anomaly {
            info!(
                metric = %series.metric_name,
                value = last,
                expected = mean,
                sigma = z_score,
                confidence,
                "anomaly detected"
            );
            vec![anomaly]
        } else {
            Vec::new()
        }
    }

    /// Detect anomalies across multiple series, sorted by confidence
    /// descending.
    pub fn detect_multiple(&self, series: &[MetricSeries]) -> Vec<Anomaly> {
        let mut anomalies: Vec<Anomaly> = series.iter().flat_map(|s| self.detect(s)).collect();
        anomalies.sort_by(|a, b| {
            b.confidence
                .partial_cmp(&a.confidence)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        anomalies
    }

    /// Confidence scales with the z-score beyond the threshold, capped at
    /// 0.99 to avoid overconfidence. Below threshold it stays under 0.4.
    fn confidence_for(&self, z_score: f64, is_anomaly: bool) -> f64 {
        if is_anomaly {
            let excess = z_score - self.threshold_sigma;
            (0.5 + excess / 10.0).min(0.99)
        } else {
            (z_score / self.threshold_sigma).max(0.0) * 0.4
        }
    }
}

/// Categorize an anomaly from its metric name and deviation direction.
pub fn categorize_anomaly(anomaly: &Anomaly) -> AnomalyCategory {
    let name = anomaly.metric_name.to_lowercase();
    let increasing = anomaly.current_value > anomaly.expected_value;

    if name.contains("error") || name.contains("failure") {
        if increasing {
            AnomalyCategory::ErrorSpike
        } else {
            AnomalyCategory::ErrorRecovery
        }
    } else if name.contains("latency") || name.contains("duration") {
        if increasing {
            AnomalyCategory::LatencySpike
        } else {
            AnomalyCategory::LatencyImprovement
        }
    } else if name.contains("memory") || name.contains("heap") {
        if increasing {
            AnomalyCategory::MemoryLeak
        } else {
            AnomalyCategory::MemoryRelease
        }
    } else if name.contains("cpu") {
        if increasing {
            AnomalyCategory::CpuSpike
        } else {
            AnomalyCategory::CpuDrop
        }
    } else if name.contains("request") || name.contains("throughput") {
        if increasing {
            AnomalyCategory::TrafficSpike
        } else {
            AnomalyCategory::TrafficDrop
        }
    } else {
        AnomalyCategory::MetricAnomaly
    }
}
