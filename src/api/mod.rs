//! REST API module using Axum
//!
//! Thin surface over the pipeline: incident CRUD with deduplication,
//! 202-style analysis triggering, and outcome capture. Everything heavy
//! runs in workers; handlers only enqueue and read.

pub mod envelope;
pub mod handlers;
mod routes;

use crate::learning::LearningEngine;
use crate::ratelimit::RateLimiter;
use axum::Router;
use sqlx::PgPool;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct EngineState {
    pub pool: PgPool,
    pub learning: Arc<LearningEngine>,
    pub llm_limiter: Arc<RateLimiter>,
    pub write_limiter: Arc<RateLimiter>,
}

/// Create the complete application router.
pub fn create_app(state: EngineState) -> Router {
    Router::new()
        .nest("/api/v1", routes::api_routes(state))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}
