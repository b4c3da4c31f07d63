//! Cache invalidation endpoint handler.

use axum::{extract::State, http::StatusCode, response::IntoResponse};
use tracing::{info, instrument};

use crate::state::SharedState;

/// Handler for POST /cache/invalidate.
#[instrument(skip(state))]
pub async fn invalidate_cache_handler(State(state): State<SharedState>) -> impl IntoResponse {
    state.discoverer.invalidate();
    info!("Discovery cache invalidated on request");
    (StatusCode::OK, "Discovery cache invalidated\n")
}
