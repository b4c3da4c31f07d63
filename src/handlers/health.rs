//! Health check endpoint handler.
//!
//! This module provides the `/health` endpoint handler that returns a
//! plain-text liveness summary of the gateway.

use axum::{extract::State, http::StatusCode, response::IntoResponse};
use std::fmt::Write as FmtWrite;
use tracing::{debug, instrument};

use crate::state::SharedState;

// Time conversion constants
const SECONDS_PER_HOUR: f64 = 3600.0;
const MINUTES_PER_HOUR: f64 = 60.0;
const HOURS_PER_DAY: f64 = 24.0;

/// Footer text for human-readable HTTP endpoints.
pub const FOOTER_TEXT: &str = "Project: https://github.com/cansp-dev/herakles-scrape-gateway - More info: https://www.herakles.now - Support: exporter@herakles.now";

/// Formats an uptime in minutes, hours or days.
pub fn format_uptime(uptime_seconds: u64) -> String {
    let uptime_hours = uptime_seconds as f64 / SECONDS_PER_HOUR;
    if uptime_hours < 1.0 {
        format!("{:.1} minutes", uptime_hours * MINUTES_PER_HOUR)
    } else if uptime_hours < HOURS_PER_DAY {
        format!("{:.1} hours", uptime_hours)
    } else {
        format!("{:.1} days", uptime_hours / HOURS_PER_DAY)
    }
}

/// Handler for the /health endpoint.
#[instrument(skip(state))]
pub async fn health_handler(State(state): State<SharedState>) -> impl IntoResponse {
    debug!("Processing /health request");

    let uptime_str = format_uptime(state.start_time.elapsed().as_secs());
    let scraping = &state.config.scraping;

    let mut table = String::new();
    writeln!(table, "{:28} | {:>12}", "Setting", "Value").ok();
    writeln!(table, "{}", "-".repeat(43)).ok();
    writeln!(table, "{:28} | {:>12}", "Configured targets", state.discoverer.targets().len()).ok();
    writeln!(
        table,
        "{:28} | {:>12}",
        "Cached discovery results",
        state.discoverer.cache().len()
    )
    .ok();
    writeln!(table, "{:28} | {:>12}", "Scrape workers", scraping.threads).ok();
    writeln!(
        table,
        "{:28} | {:>12}",
        "Fetch timeout (ms)", scraping.fetch_timeout_ms
    )
    .ok();
    writeln!(
        table,
        "{:28} | {:>12}",
        "Max processing time (ms)", scraping.max_processing_time_ms
    )
    .ok();
    writeln!(
        table,
        "{:28} | {:>12}",
        "Label enrichment", scraping.label_enrichment
    )
    .ok();

    (
        StatusCode::OK,
        [("Content-Type", "text/plain; charset=utf-8")],
        format!("OK\n\nUptime: {uptime_str}\n\n{table}\n{FOOTER_TEXT}\n"),
    )
}
