//! Metrics endpoint handlers for Prometheus scraping.
//!
//! `/metrics` scrapes every discovered instance and returns one merged
//! document; `/singleTargetMetrics/{app_id}/{instance_number}` scrapes a
//! single instance.

use axum::{
    extract::{Path, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use std::time::Instant;
use tracing::{debug, error, instrument, warn};

use crate::exposition::{encode_text, merge};
use crate::fetcher::GATEWAY_INSTANCE_HEADER;
use crate::internal_metrics::{render_additional, RequestMetrics};
use crate::model::{ContentType, FetchResult};
use crate::scrape::ScrapeError;
use crate::state::SharedState;

/// Error type for metrics endpoint failures.
#[derive(Debug)]
pub enum MetricsError {
    EncodingFailed,
    Scrape(ScrapeError),
}

impl From<ScrapeError> for MetricsError {
    fn from(e: ScrapeError) -> Self {
        Self::Scrape(e)
    }
}

impl IntoResponse for MetricsError {
    fn into_response(self) -> Response {
        match self {
            Self::EncodingFailed => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to encode metrics",
            )
                .into_response(),
            Self::Scrape(e @ ScrapeError::NoInstances) => {
                (StatusCode::NOT_FOUND, e.to_string()).into_response()
            }
            Self::Scrape(e @ ScrapeError::Loopback) => {
                (StatusCode::LOOP_DETECTED, e.to_string()).into_response()
            }
        }
    }
}

/// Rejects requests carrying our own gateway instance id.
fn reject_loopback(state: &SharedState, headers: &HeaderMap) -> Result<(), ScrapeError> {
    let own = headers
        .get(GATEWAY_INSTANCE_HEADER)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v == state.gateway_instance);
    if own {
        warn!("Rejecting scrape request sent by this gateway to itself");
        return Err(ScrapeError::Loopback);
    }
    Ok(())
}

fn document_response(body: String, content_type: ContentType) -> Response {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, content_type.header_value())],
        body,
    )
        .into_response()
}

/// Handler for the /metrics endpoint.
#[instrument(skip(state, headers))]
pub async fn metrics_handler(
    State(state): State<SharedState>,
    headers: HeaderMap,
) -> Result<Response, MetricsError> {
    let start = Instant::now();
    debug!("Processing /metrics request");
    reject_loopback(&state, &headers)?;

    let instances = state.discoverer.discover(None, None).await;
    if let Some(internal) = &state.internal_metrics {
        internal.retain_instances(&instances);
    }

    let report = state.orchestrator.scrape(instances, false).await;

    let request_metrics = RequestMetrics::new(true).map_err(|e| {
        error!("Failed to create request metrics: {}", e);
        MetricsError::EncodingFailed
    })?;
    request_metrics.record(&report);

    let primary = FetchResult::new(encode_text(&report.families), ContentType::Text004);
    let additional = render_additional(&request_metrics, state.internal_metrics.as_deref());
    let body = merge(Some(&primary), &additional);

    debug!(
        "Metrics request completed: {} families, {} bytes, {:.3}ms",
        report.families.len(),
        body.len(),
        start.elapsed().as_secs_f64() * 1000.0
    );

    Ok(document_response(body, ContentType::Text004))
}

/// Handler for the /singleTargetMetrics/{app_id}/{instance_number} endpoint.
#[instrument(skip(state, headers))]
pub async fn single_target_handler(
    State(state): State<SharedState>,
    Path((app_id, instance_number)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<Response, MetricsError> {
    debug!("Processing single target request");
    reject_loopback(&state, &headers)?;

    let instances = state
        .discoverer
        .discover(Some(&app_id), Some(&instance_number))
        .await;
    if instances.is_empty() {
        return Err(ScrapeError::NoInstances.into());
    }

    let label_enrichment = state.orchestrator.settings().label_enrichment;
    let mut report = state.orchestrator.scrape(instances, !label_enrichment).await;

    let request_metrics = RequestMetrics::new(label_enrichment).map_err(|e| {
        error!("Failed to create request metrics: {}", e);
        MetricsError::EncodingFailed
    })?;
    request_metrics.record(&report);
    let additional = render_additional(&request_metrics, state.internal_metrics.as_deref());

    let primary = if label_enrichment {
        Some(FetchResult::new(
            encode_text(&report.families),
            ContentType::Text004,
        ))
    } else {
        // Passed through untouched; the merge keeps the target's framing.
        report.raw.pop().map(|(_, raw)| raw)
    };

    let content_type = primary
        .as_ref()
        .map_or(ContentType::Text004, |p| p.content_type);
    let body = merge(primary.as_ref(), &additional);

    Ok(document_response(body, content_type))
}
