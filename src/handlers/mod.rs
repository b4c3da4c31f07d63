//! HTTP endpoint handlers for the gateway.
//!
//! This module provides handlers for all HTTP endpoints:
//! - `/metrics`: all discovered instances merged into one document
//! - `/singleTargetMetrics/{app_id}/{instance_number}`: one instance
//! - `/discovery`: Prometheus HTTP service discovery
//! - `/cache/invalidate`: drop cached discovery results (POST)
//! - `/health`: Health check endpoint

pub mod cache;
pub mod discovery;
pub mod health;
pub mod metrics;

use axum::{
    routing::{get, post},
    Router,
};

use crate::state::SharedState;

// Re-export handlers
pub use cache::invalidate_cache_handler;
pub use discovery::discovery_handler;
pub use health::health_handler;
pub use metrics::{metrics_handler, single_target_handler};

/// Builds the router serving all endpoints.
pub fn router(state: SharedState) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route(
            "/singleTargetMetrics/{app_id}/{instance_number}",
            get(single_target_handler),
        )
        .route("/discovery", get(discovery_handler))
        .route("/cache/invalidate", post(invalidate_cache_handler))
        .route("/health", get(health_handler))
        .with_state(state)
}
