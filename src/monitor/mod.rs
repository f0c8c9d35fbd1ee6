//! Anomaly Monitor — periodic service-polling loop with cross-replica dedup
//!
//! Each tick polls the configured service list under a bounded concurrency
//! limit, runs anomaly detection, and creates-or-updates incidents for
//! significant anomalies. A shared-cache dedup key (`dedup:{service}` with
//! TTL = dedup window) prevents N replicas from reporting the same service
//! in the same window; an in-process map takes over when the cache is
//! unreachable. Two replicas that race past the cache still produce at
//! most one incident row thanks to the row lock in the deduplicator.

use crate::cache::SharedCache;
use crate::metrics_client::MetricClient;
use crate::perception::anomaly_detector::{categorize_anomaly, Anomaly, AnomalyDetector};
use crate::storage::incidents::{create_or_update_incident, NewIncident};
use crate::storage::{queue, StorageError};
use crate::types::Severity;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Monitor tuning, resolved from settings at construction.
#[derive(Debug, Clone)]
pub struct MonitorOptions {
    pub poll_interval: Duration,
    pub min_confidence: f64,
    pub dedup_window: Duration,
    pub concurrency: usize,
    pub sigma_threshold: f64,
    pub lookback_minutes: i64,
    pub monitored_services: Vec<String>,
}

impl Default for MonitorOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(60),
            min_confidence: 0.75,
            dedup_window: Duration::from_secs(600),
            concurrency: 5,
            sigma_threshold: 3.0,
            lookback_minutes: 5,
            monitored_services: Vec::new(),
        }
    }
}

/// Continuous monitoring service: polls metrics and creates incidents.
pub struct AnomalyMonitor {
    options: MonitorOptions,
    metrics: MetricClient,
    pool: PgPool,
    cache: Option<SharedCache>,
    detector: AnomalyDetector,
    /// Fallback dedup state, used only while the shared cache is down.
    fallback_recent: DashMap<String, DateTime<Utc>>,
    semaphore: Arc<Semaphore>,
}

impl AnomalyMonitor {
    pub fn new(
        options: MonitorOptions,
        metrics: MetricClient,
        pool: PgPool,
        cache: Option<SharedCache>,
    ) -> Arc<Self> {
        let detector = AnomalyDetector::new(options.sigma_threshold);
        let semaphore = Arc::new(Semaphore::new(options.concurrency.max(1)));
        Arc::new(Self {
            options,
            metrics,
            pool,
            cache,
            detector,
            fallback_recent: DashMap::new(),
            semaphore,
        })
    }

    /// Run the periodic loop until cancelled. Tick errors are logged and
    /// the loop continues on the next interval.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        info!(
            interval_secs = self.options.poll_interval.as_secs(),
            services = self.options.monitored_services.len(),
            "anomaly monitor started"
        );

        let mut ticker = tokio::time::interval(self.options.poll_interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.check_once().await;
                }
                _ = shutdown.cancelled() => {
                    info!("anomaly monitor stopped");
                    return;
                }
            }
        }
    }

    /// Run a single detection cycle. Public so an external scheduler can
    /// drive ticks without touching internal state.
    pub async fn check_once(&self) {
        let checks = self.options.monitored_services.iter().map(|service| async move {
            // Throttle concurrent polls to protect the metric backend
            let _permit = match self.semaphore.acquire().await {
                Ok(permit) => permit,
                Err(_) => return,
            };
            if let Err(e) = self.check_service(service).await {
                error!(service = %service, error = %e, "service check failed");
            }
        });

        futures::future::join_all(checks).await;
    }

    async fn check_service(&self, service: &str) -> Result<(), StorageError> {
        if self.is_recently_reported(service).await {
            return Ok(());
        }

        let service_metrics = self
            .metrics
            .service_metrics(service, self.options.lookback_minutes)
            .await;

        let all_series: Vec<_> = service_metrics.into_values().flatten().collect();
        let anomalies = self.detector.detect_multiple(&all_series);

        let significant: Vec<Anomaly> = anomalies
            .into_iter()
            .filter(|a| a.confidence >= self.options.min_confidence)
            .collect();

        if significant.is_empty() {
            return Ok(());
        }

        self.create_incident(service, &significant).await?;
        // Cache-write failure must not prevent incident creation, so the
        // dedup key is set after the commit and failures only log.
        self.mark_recently_reported(service).await;
        Ok(())
    }

    /// Check the distributed dedup key, falling back to the in-process map.
    async fn is_recently_reported(&self, service: &str) -> bool {
        if let Some(cache) = &self.cache {
            match cache.exists(&dedup_key(service)).await {
                Ok(exists) => return exists,
                Err(e) => {
                    warn!(service, error = %e, "dedup check degraded to in-memory fallback");
                }
            }
        }

        match self.fallback_recent.get(service) {
            Some(last) => {
                let window = ChronoDuration::from_std(self.options.dedup_window)
                    .unwrap_or_else(|_| ChronoDuration::seconds(600));
                Utc::now() - *last < window
            }
            None => false,
        }
    }

    /// Record that an incident was just created for this service.
    async fn mark_recently_reported(&self, service: &str) {
        if let Some(cache) = &self.cache {
            let ttl = self.options.dedup_window.as_secs();
            match cache.set_ex(&dedup_key(service), "1", ttl).await {
                Ok(()) => return,
                Err(e) => {
                    warn!(service, error = %e, "dedup mark degraded to in-memory fallback");
                }
            }
        }
        self.fallback_recent.insert(service.to_string(), Utc::now());
    }

    async fn create_incident(
        &self,
        service: &str,
        anomalies: &[Anomaly],
    ) -> Result<(), StorageError> {
        let max_deviation = anomalies
            .iter()
            .map(|a| a.deviation_sigma)
            .fold(0.0, f64::max);
        let severity = Severity::from_max_deviation(max_deviation);

        let (description, metrics_snapshot) = summarize_anomalies(anomalies);
        let lookback = crate::config::get().dedup.lookback_minutes(severity);

        let mut tx = self.pool.begin().await?;
        let (incident, created) = create_or_update_incident(
            &mut tx,
            NewIncident {
                title: format!("Anomalies detected in {service}"),
                description,
                severity,
                affected_service: service.to_string(),
                affected_components: vec![service.to_string()],
                metrics_snapshot,
                context: serde_json::json!({
                    "anomaly_count": anomalies.len(),
                    "max_deviation": max_deviation,
                    "auto_detected": true,
                }),
            },
            lookback,
        )
        .await?;
        if created {
            // Hand the fresh incident straight to the analysis workers
            crate::storage::incidents::set_incident_status(
                &mut tx,
                incident.id,
                crate::types::IncidentStatus::Analyzing,
            )
            .await?;
        }
        tx.commit().await?;

        info!(
            incident_id = %incident.id,
            service,
            severity = severity.as_str(),
            anomalies = anomalies.len(),
            created,
            "incident recorded"
        );

        if created {
            queue::enqueue_job(
                &self.pool,
                queue::job_type::ANALYZE_INCIDENT,
                incident.id,
                serde_json::Value::Null,
            )
            .await?;
        }

        Ok(())
    }
}

fn dedup_key(service: &str) -> String {
    format!("dedup:{service}")
}

/// Build the incident description (top 3 anomalies) and the per-metric
/// snapshot.
fn summarize_anomalies(anomalies: &[Anomaly]) -> (String, serde_json::Value) {
    let mut lines = vec!["Automatically detected anomalies:".to_string()];
    for anomaly in anomalies.iter().take(3) {
        let category = categorize_anomaly(anomaly);
        lines.push(format!(
            "- {}: {} ({:.1}\u{3c3} deviation)",
            anomaly.metric_name, category, anomaly.deviation_sigma
        ));
    }

    let mut snapshot = serde_json::Map::new();
    for anomaly in anomalies {
        snapshot.insert(
            anomaly.metric_name.clone(),
            serde_json::json!({
                "current": anomaly.current_value,
                "expected": anomaly.expected_value,
                "deviation_sigma": anomaly.deviation_sigma,
            }),
        );
    }

    (lines.join("\n"), serde_json::Value::Object(snapshot))
}
