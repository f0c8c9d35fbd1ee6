//! Metric Backend Client — Prometheus-compatible HTTP API
//!
//! Instant and range queries against the time-series backend. Responses are
//! normalised into ordered [`MetricSeries`] values; missing series and empty
//! ranges are tolerated and surface as empty results, not errors.

use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use std::collections::HashMap;
use thiserror::Error;
use tracing::{debug, error};

/// Metric client errors
#[derive(Debug, Error)]
pub enum MetricError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("backend returned error status: {0}")]
    Backend(String),
    #[error("malformed backend response: {0}")]
    Malformed(String),
}

/// Single metric data point. Immutable once produced.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct MetricPoint {
    /// Seconds since the epoch (fractional)
    pub timestamp: f64,
    pub value: f64,
}

/// One time series returned by a query. Points are ordered by timestamp,
/// strictly monotonic. Lifetime is bound to a single query.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct MetricSeries {
    pub metric_name: String,
    pub labels: HashMap<String, String>,
    pub points: Vec<MetricPoint>,
}

impl MetricSeries {
    /// Most recent value in the series, if any.
    pub fn latest_value(&self) -> Option<f64> {
        self.points.last().map(|p| p.value)
    }
}

/// Async metric backend client with a pooled HTTP connection.
///
/// One instance per process; `reqwest::Client` handles pooling internally.
#[derive(Clone)]
pub struct MetricClient {
    http: reqwest::Client,
    base_url: String,
}

impl MetricClient {
    pub fn new(base_url: &str) -> Result<Self, MetricError> {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Execute an instant query. `time` defaults to now.
    pub async fn query(
        &self,
        query: &str,
        time: Option<DateTime<Utc>>,
    ) -> Result<Vec<MetricSeries>, MetricError> {
        let url = format!("{}/api/v1/query", self.base_url);

        let mut params: Vec<(&str, String)> = vec![("query", query.to_string())];
        if let Some(t) = time {
            params.push(("time", t.timestamp().to_string()));
        }

        let resp = self.http.get(&url).query(&params).send().await?;
        let body: QueryResponse = resp.error_for_status()?.json().await?;
        parse_query_response(query, body)
    }

    /// Execute a range query with a fixed step.
    pub async fn query_range(
        &self,
        query: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        step: &str,
    ) -> Result<Vec<MetricSeries>, MetricError> {
        let url = format!("{}/api/v1/query_range", self.base_url);

        let params: Vec<(&str, String)> = vec![
            ("query", query.to_string()),
            ("start", start.timestamp().to_string()),
            ("end", end.timestamp().to_string()),
            ("step", step.to_string()),
        ];

        let resp = self.http.get(&url).query(&params).send().await?;
        let body: QueryResponse = resp.error_for_status()?.json().await?;
        parse_query_response(query, body)
    }

    /// Fetch the standard health-signal bundle for a service over the
    /// lookback window: error rate, p95/p99 latency, request rate.
    ///
    /// Individual query failures are logged and yield missing entries, so
    /// one bad recording rule never sinks the whole poll.
    pub async fn service_metrics(
        &self,
        service_name: &str,
        lookback_minutes: i64,
    ) -> HashMap<String, Vec<MetricSeries>> {
        let end = Utc::now();
        let start = end - Duration::minutes(lookback_minutes);

        let queries = [
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
            (
                "memory_bytes",
                format!(r#"process_resident_memory_bytes{{service="{service_name}"}}"#),
            ),
            (
                "cpu_usage",
                format!(r#"rate(process_cpu_seconds_total{{service="{service_name}"}}[1m])"#),
            ),
        ];

        let mut out = HashMap::new();
        for (name, query) in queries {
            match self.query_range(&query, start, end, "15s").await {
                Ok(series) => {
                    debug!(service = service_name, metric = name, series = series.len(), "fetched metric");
                    out.insert(name.to_string(), series);
                }
                Err(e) => {
                    error!(service = service_name, metric = name, error = %e, "metric query failed");
                }
            }
        }
        out
    }
}

// ─── Wire format ──────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct QueryResponse {
    status: String,
    #[serde(default)]
    data: Option<QueryData>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct QueryData {
    #[serde(rename = "resultType")]
    #[allow(dead_code)]
    result_type: String,
    result: Vec<SeriesEntry>,
}

#[derive(Debug, Deserialize)]
struct SeriesEntry {
    metric: HashMap<String, String>,
    /// Range query: sequence of [ts, "value"] pairs
    #[serde(default)]
    values: Option<Vec<(f64, String)>>,
    /// Instant query: single [ts, "value"] pair
    #[serde(default)]
    value: Option<(f64, String)>,
}

fn parse_query_response(
    query: &str,
    body: QueryResponse,
) -> Result<Vec<MetricSeries>, MetricError> {
    if body.status != "success" {
        return Err(MetricError::Backend(
            body.error.unwrap_or_else(|| "unknown error".to_string()),
        ));
    }

    let data = match body.data {
        Some(d) => d,
        None => return Ok(Vec::new()),
    };

    let mut out = Vec::with_capacity(data.result.len());
    for entry in data.result {
        let metric_name = entry
            .metric
            .get("__name__")
            .cloned()
            .unwrap_or_else(|| query.to_string());

        let mut points = Vec::new();
        if let Some(values) = entry.values {
            for (ts, raw) in values {
                points.push(MetricPoint {
                    timestamp: ts,
                    value: parse_sample(&raw)?,
                });
            }
        } else if let Some((ts, raw)) = entry.value {
            points.push(MetricPoint {
                timestamp: ts,
                value: parse_sample(&raw)?,
            });
        }

        out.push(MetricSeries {
            metric_name,
            labels: entry.metric,
            points,
        });
    }

    Ok(out)
}

fn parse_sample(raw: &str) -> Result<f64, MetricError> {
    // Prometheus encodes sample values as strings; NaN/Inf are legal there
    // and must survive parsing (the detector rejects them later).
    match raw {
        "NaN" => Ok(f64::NAN),
        "+Inf" | "Inf" => Ok(f64::INFINITY),
        "-Inf" => Ok(f64::NEG_INFINITY),
        _ => raw
            .parse::<f64>()
            .map_err(|_| MetricError::Malformed(format!("unparseable sample value: {raw}"))),
    }
}

/// Build a MetricSeries directly (test helpers, simulation).
pub fn series_from_values(metric_name: &str, labels: &[(&str, &str)], values: &[f64]) -> MetricSeries {
    let base = Utc::now().timestamp() as f64 - values.len() as f64 * 15.0;
    MetricSeries {
        metric_name: metric_name.to_string(),
        labels: labels
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect(),
        points: values
            .iter()
            .enumerate()
            .map(|(i, v)| MetricPoint {
                timestamp: base + i as f64 * 15.0,
                value: *v,
            })
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_range_response() {
        let body: QueryResponse = serde_json::from_str(
            r#"{
                "status": "success",
                "data": {
                    "resultType": "matrix",
                    "result": [
                        {
                            "metric": {"__name__": "http_requests_total", "service": "api"},
                            "values": [[1700000000.0, "50.0"], [1700000015.0, "52.5"]]
                        }
                    ]
                }
            }"#,
        )
        .unwrap();

        let series = parse_query_response("q", body).unwrap();
        assert_eq!(series.len(), 1);
        assert_eq!(series[0].metric_name, "http_requests_total");
        assert_eq!(series[0].points.len(), 2);
        assert!((series[0].points[1].value - 52.5).abs() < f64::EPSILON);
    }

    #[test]
    fn parses_instant_response_and_missing_series() {
        let body: QueryResponse = serde_json::from_str(
            r#"{
                "status": "success",
                "data": {"resultType": "vector", "result": []}
            }"#,
        )
        .unwrap();
        let series = parse_query_response("up", body).unwrap();
        assert!(series.is_empty());
    }

    #[test]
    fn backend_error_surfaces() {
        let body: QueryResponse = serde_json::from_str(
            r#"{"status": "error", "error": "query timed out"}"#,
        )
        .unwrap();
        let err = parse_query_response("q", body).unwrap_err();
        assert!(matches!(err, MetricError::Backend(_)));
    }

    #[test]
    fn nan_and_inf_samples_parse() {
        assert!(parse_sample("NaN").unwrap().is_nan());
        assert!(parse_sample("+Inf").unwrap().is_infinite());
        assert!((parse_sample("1.25").unwrap() - 1.25).abs() < f64::EPSILON);
        assert!(parse_sample("bogus").is_err());
    }
}
