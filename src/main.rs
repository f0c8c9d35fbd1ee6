//! aegisd - API server + anomaly monitor
//!
//! Runs the HTTP surface and the periodic anomaly-monitor loop in one
//! process. Analysis work is enqueued to the Postgres queue and handled by
//! the separate `worker` binary.
//!
//! # Usage
//!
//! ```bash
//! # Defaults: ./aegis.toml (or AEGIS_CONFIG), bind 0.0.0.0:8080
//! aegisd
//!
//! # Override the bind address and skip the monitor loop
//! aegisd --addr 127.0.0.1:9000 --no-monitor
//! ```
//!
//! # Environment Variables
//!
//! - `AEGIS_CONFIG`: path to the settings TOML
//! - `AEGIS_DATABASE_URL`, `AEGIS_REDIS_URL`, `AEGIS_METRICS_URL`: endpoint overrides
//! - `RUST_LOG`: logging filter (default: info)

use anyhow::{Context, Result};
use clap::Parser;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use aegis::api::{create_app, EngineState};
use aegis::cache::SharedCache;
use aegis::config::{self, Settings};
use aegis::learning::LearningEngine;
use aegis::metrics_client::MetricClient;
use aegis::monitor::{AnomalyMonitor, MonitorOptions};
use aegis::ratelimit::RateLimiter;
use aegis::storage::db;

#[derive(Parser, Debug)]
#[command(name = "aegisd")]
#[command(about = "AEGIS autonomous incident-response engine")]
#[command(version)]
struct CliArgs {
    /// Override the server bind address (default from settings)
    #[arg(short, long)]
    addr: Option<String>,

    /// Disable the anomaly monitor loop (API only)
    #[arg(long)]
    no_monitor: bool,

    /// Skip running database migrations at startup
    #[arg(long)]
    no_migrate: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = CliArgs::parse();
    config::init(Settings::load());
    let settings = config::get();

    // Datastore
    let pool = db::create_pool(&settings.endpoints.database_url)
        .await
        .context("failed to connect to PostgreSQL")?;
    if !args.no_migrate {
        db::run_migrations(&pool)
            .await
            .context("failed to run migrations")?;
    }

    // Shared cache: optional — everything degrades without it
    let cache = match SharedCache::connect(&settings.endpoints.redis_url).await {
        Ok(cache) => Some(cache),
        Err(e) => {
            warn!(error = %e, "shared cache unreachable at startup, running degraded");
            None
        }
    };

    // Metric backend
    let metrics = MetricClient::new(&settings.endpoints.metrics_url)
        .context("failed to build metric client")?;

    // Learning engine + pattern cache warmup
    let learning = Arc::new(LearningEngine::new(pool.clone()));
    if let Err(e) = learning.warmup().await {
        warn!(error = %e, "pattern cache warmup failed, starting cold");
    }

    // Rate limiters from config
    let limiter = |name: &str, fallback_max: u64, fallback_window: u64| {
        let (max, window) = settings
            .rate_limits
            .get(name)
            .map(|l| (l.max_requests, l.window_seconds))
            .unwrap_or((fallback_max, fallback_window));
        RateLimiter::new(name, max, window, cache.clone())
    };
    let llm_limiter = limiter("llm", 5, 60);
    let write_limiter = limiter("write", 30, 60);

    // Sanity-log the declarative registries so misconfigurations show up
    // at startup, not at selection time
    match aegis::topology::DependencyGraph::load(Path::new(&settings.files.service_dependencies)) {
        Ok(graph) => info!(services = graph.len(), "topology loaded"),
        Err(e) => warn!(error = %e, "topology failed to load"),
    }

    let shutdown = CancellationToken::new();

    // Anomaly monitor loop
    if !args.no_monitor {
        let monitor = AnomalyMonitor::new(
            MonitorOptions {
                poll_interval: Duration::from_secs(settings.monitor.poll_seconds),
                min_confidence: settings.monitor.min_confidence,
                dedup_window: Duration::from_secs(settings.monitor.dedup_window_minutes * 60),
                concurrency: settings.monitor.concurrency,
                sigma_threshold: settings.detection.sigma_threshold,
                lookback_minutes: settings.monitor.lookback_minutes,
                monitored_services: settings.monitor.monitored_services.clone(),
            },
            metrics.clone(),
            pool.clone(),
            cache.clone(),
        );
        tokio::spawn(monitor.run(shutdown.clone()));
    } else {
        info!("anomaly monitor disabled by --no-monitor");
    }

    // HTTP surface
    let state = EngineState {
        pool,
        learning,
        llm_limiter,
        write_limiter,
    };
    let app = create_app(state);

    let addr = args
        .addr
        .unwrap_or_else(|| settings.server.bind_addr.clone());
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(addr = %addr, "API server listening");

    let server_shutdown = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
            server_shutdown.cancel();
        })
        .await
        .context("server error")?;

    shutdown.cancel();
    info!("aegisd stopped");
    Ok(())
}
