//! Application state management for the gateway.
//!
//! This module defines the shared application state that is passed
//! to HTTP handlers.

use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

use crate::config::Config;
use crate::discovery::{CachingDiscoverer, StaticResolver, TargetKey};
use crate::fetcher::HttpFetcher;
use crate::internal_metrics::InternalMetrics;
use crate::scrape::{ScrapeOrchestrator, ScrapeSettings};

/// Type alias for shared application state.
pub type SharedState = Arc<AppState>;

/// Global application state shared across requests.
pub struct AppState {
    pub config: Arc<Config>,
    /// Sent with every outbound scrape to detect requests to ourselves.
    pub gateway_instance: String,
    pub discoverer: CachingDiscoverer,
    pub orchestrator: ScrapeOrchestrator<HttpFetcher>,
    /// Absent when internal metrics are disabled.
    pub internal_metrics: Option<Arc<InternalMetrics>>,
    /// Server start time for uptime calculation.
    pub start_time: Instant,
}

impl AppState {
    /// Wires discovery, fetching and internal metrics from a validated config.
    pub fn from_config(config: Config) -> anyhow::Result<Self> {
        let gateway_instance = uuid::Uuid::new_v4().to_string();
        debug!("Gateway instance id: {}", gateway_instance);

        let internal_metrics = if config.internal_metrics.enabled {
            Some(Arc::new(InternalMetrics::new(
                config.internal_metrics.label_prefix.clone(),
                config.internal_metrics.request_latency,
            )?))
        } else {
            None
        };

        let targets: Vec<TargetKey> = config.targets.iter().map(TargetKey::from).collect();
        let discoverer = CachingDiscoverer::new(
            targets,
            StaticResolver::new(&config.targets),
            config.cache.settings(),
        );
        if let Some(internal) = &internal_metrics {
            discoverer.cache().set_observer(internal.clone());
        }

        let mut orchestrator = ScrapeOrchestrator::new(
            HttpFetcher::new(gateway_instance.clone())?,
            ScrapeSettings::from(&config.scraping),
        );
        if let Some(internal) = &internal_metrics {
            orchestrator = orchestrator.with_internal_metrics(internal.clone());
        }

        info!(
            "Gateway configured with {} targets, {} scrape workers",
            config.targets.len(),
            config.scraping.threads
        );

        Ok(Self {
            config: Arc::new(config),
            gateway_instance,
            discoverer,
            orchestrator,
            internal_metrics,
            start_time: Instant::now(),
        })
    }

    /// Stops background work owned by the state.
    pub fn shutdown(&self) {
        self.discoverer.cache().shutdown();
    }
}
