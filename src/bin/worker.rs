//! worker - analysis and execution worker process
//!
//! Claims jobs from the Postgres queue and dispatches by type: incident
//! analysis (metrics → detection → hypothesis generation → action
//! recommendation) and action execution (executor → verification). Scale
//! horizontally by running more worker processes; the queue claim is
//! `FOR UPDATE SKIP LOCKED`, so replicas never collide.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use aegis::cache::SharedCache;
use aegis::config::{self, Settings};
use aegis::decision::{ActionRiskRegistry, ActionSelector, BlastRadiusCalculator, RunbookRegistry};
use aegis::execution::PostActionVerifier;
use aegis::metrics_client::MetricClient;
use aegis::perception::AnomalyDetector;
use aegis::reasoning::llm_client::HttpLlmClient;
use aegis::reasoning::HypothesisGenerator;
use aegis::storage::db;
use aegis::topology::DependencyGraph;
use aegis::types::ExecutionMode;
use aegis::worker::{run_worker, AnalysisDeps, ExecutionDeps, WorkerDeps};

#[derive(Parser, Debug)]
#[command(name = "worker")]
#[command(about = "AEGIS analysis worker")]
#[command(version)]
struct CliArgs {
    /// Number of concurrent worker tasks in this process
    #[arg(long, default_value = "1")]
    concurrency: usize,
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

    let pool = db::create_pool(&settings.endpoints.database_url)
        .await
        .context("failed to connect to PostgreSQL")?;

    let cache = match SharedCache::connect(&settings.endpoints.redis_url).await {
        Ok(cache) => Some(cache),
        Err(e) => {
            warn!(error = %e, "shared cache unreachable at startup, running degraded");
            None
        }
    };

    let metrics = MetricClient::new(&settings.endpoints.metrics_url)
        .context("failed to build metric client")?;

    let graph = Arc::new(
        DependencyGraph::load(Path::new(&settings.files.service_dependencies))
            .context("failed to load topology")?,
    );
    let runbooks = RunbookRegistry::load(Path::new(&settings.files.runbooks))
        .context("failed to load runbooks")?;

    let llm = Arc::new(
        HttpLlmClient::new(
            &settings.llm.endpoint,
            &settings.llm.model,
            &settings.llm.api_key,
        )
        .context("failed to build model client")?,
    );
    let generator = HypothesisGenerator::new(
        llm,
        cache.clone(),
        Arc::clone(&graph),
        settings.llm.temperature,
        settings.llm.max_tokens,
        settings.llm.cache_ttl_seconds,
    );

    let selector = ActionSelector::new(
        runbooks,
        settings.decision.confidence_approval_threshold,
    );

    let blast = BlastRadiusCalculator::new(
        metrics.clone(),
        Arc::clone(&graph),
        settings.blast.users_per_rps,
        settings.blast.revenue_per_user_hour,
    );

    let verifier = PostActionVerifier::new(
        metrics.clone(),
        settings.verification.stabilization_seconds,
        settings.verification.improvement_threshold_pct,
    );

    let execution_mode = if settings.decision.dry_run_mode {
        ExecutionMode::DryRun
    } else {
        ExecutionMode::Live
    };

    let deps = Arc::new(WorkerDeps {
        analysis: AnalysisDeps {
            pool: pool.clone(),
            metrics,
            generator,
            selector,
            blast,
            risks: ActionRiskRegistry::new(),
            graph,
            detector: AnomalyDetector::new(settings.detection.sigma_threshold),
            lookback_minutes: settings.monitor.lookback_minutes,
            execution_mode,
        },
        execution: ExecutionDeps {
            pool: pool.clone(),
            verifier,
            // No orchestrator client wired in this deployment profile —
            // executors report tagged simulation results.
            orchestrator: None,
            dry_run_mode: settings.decision.dry_run_mode,
        },
    });

    let shutdown = CancellationToken::new();
    let mut handles = Vec::new();
    for _ in 0..args.concurrency.max(1) {
        handles.push(tokio::spawn(run_worker(
            pool.clone(),
            Arc::clone(&deps),
            shutdown.clone(),
        )));
    }

    info!(workers = handles.len(), "worker process running");
    tokio::signal::ctrl_c().await.context("signal handler")?;
    info!("shutdown signal received");
    shutdown.cancel();

    for handle in handles {
        let _ = handle.await;
    }
    info!("worker stopped");
    Ok(())
}
