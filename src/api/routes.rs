//! API route definitions
//!
//! Endpoints for the incident pipeline:
//! - /api/v1/health - queue depth and liveness
//! - /api/v1/incidents - list / create (deduplicated)
//! - /api/v1/alerts - batch alert ingestion (dedupe → correlate → incidents)
//! - /api/v1/incidents/:id - detail, hypotheses, actions
//! - /api/v1/incidents/:id/analyze - enqueue analysis (202)
//! - /api/v1/incidents/:id/outcome - operator feedback
//! - /api/v1/actions/:id/approve - approval gate before execution (202)

use axum::routing::{get, post};
use axum::Router;

use super::handlers;
use super::EngineState;

/// Create all API routes.
pub fn api_routes(state: EngineState) -> Router {
    Router::new()
        .route("/health", get(handlers::get_health))
        .route("/incidents", get(handlers::list_incidents))
        .route("/incidents", post(handlers::create_incident))
        .route("/alerts", post(handlers::ingest_alerts))
        .route("/incidents/:id", get(handlers::get_incident))
        .route("/incidents/:id/analyze", post(handlers::trigger_analysis))
        .route("/incidents/:id/outcome", post(handlers::capture_outcome))
        .route("/incidents/:id/hypotheses", get(handlers::list_hypotheses))
        .route("/incidents/:id/actions", get(handlers::list_actions))
        .route("/actions/:id/approve", post(handlers::approve_action))
        .with_state(state)
}
