//! Metrics about the gateway itself.
//!
//! [`InternalMetrics`] owns the process-wide registry (fetch failures, fetch
//! latency, cache statistics). [`RequestMetrics`] is built per scrape request
//! and carries the `up` indicator of every scraped instance. Both render into
//! exposition text marked with the gateway marker label, ready to be merged
//! behind the scraped document.

use ahash::AHashMap as HashMap;
use prometheus::{
    Encoder, Gauge, GaugeVec, HistogramOpts, HistogramVec, IntCounterVec, IntGaugeVec, Opts,
    Registry, TextEncoder,
};
use std::string::FromUtf8Error;
use std::sync::{Mutex, PoisonError};
use thiserror::Error;
use tracing::{debug, warn};

use crate::cache::CacheObserver;
use crate::discovery::Instance;
use crate::enrich::{own_label_names, Enricher, ALL_LABEL_NAMES};
use crate::exposition::{encode_text, parse};
use crate::scrape::ScrapeReport;

/// Prefix of every metric the gateway generates.
pub const METRIC_PREFIX: &str = "herakles_gateway";

const LATENCY_BUCKETS: [f64; 10] = [0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0];

#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("encoding metrics failed: {0}")]
    Prometheus(#[from] prometheus::Error),
    #[error("encoded metrics are not valid UTF-8: {0}")]
    Utf8(#[from] FromUtf8Error),
}

/// Encodes a registry and stamps every sample with the gateway marker label.
pub fn render_marked(registry: &Registry) -> Result<String, EncodeError> {
    let mut buffer = Vec::new();
    TextEncoder::new().encode(&registry.gather(), &mut buffer)?;
    let text = String::from_utf8(buffer)?;
    Ok(encode_text(&Enricher::PrefixOnly.enrich(&parse(&text))))
}

/// Process-wide gateway metrics.
pub struct InternalMetrics {
    registry: Registry,
    label_prefix: Option<String>,
    failed_requests: IntCounterVec,
    fetch_latency: Option<HistogramVec>,
    cache_size: IntGaugeVec,
    cache_expiry: IntCounterVec,
    cache_refresh_success: IntCounterVec,
    cache_refresh_failure: IntCounterVec,
    /// Instances with label children, by instance id.
    known_instances: Mutex<HashMap<String, Instance>>,
}

impl InternalMetrics {
    pub fn new(label_prefix: Option<String>, request_latency: bool) -> prometheus::Result<Self> {
        let registry = Registry::new();
        let label_prefix = label_prefix.filter(|p| !p.is_empty());
        let own_labels = own_label_names(label_prefix.as_deref());
        let own_labels: Vec<&str> = own_labels.iter().map(String::as_str).collect();

        let failed_requests = IntCounterVec::new(
            Opts::new(
                format!("{METRIC_PREFIX}_fetcher_failed_requests_total"),
                "Number of scrape requests to targets that failed",
            ),
            &own_labels,
        )?;
        registry.register(Box::new(failed_requests.clone()))?;

        let fetch_latency = if request_latency {
            let histogram = HistogramVec::new(
                HistogramOpts::new(
                    format!("{METRIC_PREFIX}_fetcher_latency_seconds"),
                    "Latency of scrape requests to targets",
                )
                .buckets(LATENCY_BUCKETS.to_vec()),
                &own_labels,
            )?;
            registry.register(Box::new(histogram.clone()))?;
            Some(histogram)
        } else {
            None
        };

        let cache_size = IntGaugeVec::new(
            Opts::new(
                format!("{METRIC_PREFIX}_cache_size"),
                "Number of entries held by a cache",
            ),
            &["cache_name"],
        )?;
        let cache_expiry = IntCounterVec::new(
            Opts::new(
                format!("{METRIC_PREFIX}_cache_expiry_total"),
                "Number of cache entries purged after not being used",
            ),
            &["cache_name"],
        )?;
        let cache_refresh_success = IntCounterVec::new(
            Opts::new(
                format!("{METRIC_PREFIX}_cache_refresh_success_total"),
                "Number of successful background refreshes of cache entries",
            ),
            &["cache_name"],
        )?;
        let cache_refresh_failure = IntCounterVec::new(
            Opts::new(
                format!("{METRIC_PREFIX}_cache_refresh_failure_total"),
                "Number of failed background refreshes of cache entries",
            ),
            &["cache_name"],
        )?;
        registry.register(Box::new(cache_size.clone()))?;
        registry.register(Box::new(cache_expiry.clone()))?;
        registry.register(Box::new(cache_refresh_success.clone()))?;
        registry.register(Box::new(cache_refresh_failure.clone()))?;

        Ok(Self {
            registry,
            label_prefix,
            failed_requests,
            fetch_latency,
            cache_size,
            cache_expiry,
            cache_refresh_success,
            cache_refresh_failure,
            known_instances: Mutex::new(HashMap::new()),
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Enricher for samples describing one instance. Its label values line
    /// up with the label names the per-instance vectors are registered with.
    fn enricher_for(&self, instance: &Instance) -> Enricher {
        Enricher::own_metrics(self.label_prefix.clone(), instance.origin())
    }

    fn remember(&self, instance: &Instance) {
        self.known_instances
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(instance.instance_id.clone())
            .or_insert_with(|| instance.clone());
    }

    pub fn record_failure(&self, instance: &Instance) {
        self.remember(instance);
        let values = self.enricher_for(instance).label_values();
        self.failed_requests
            .with_label_values(&label_refs(&values))
            .inc();
    }

    pub fn observe_latency(&self, instance: &Instance, seconds: f64) {
        if let Some(histogram) = &self.fetch_latency {
            self.remember(instance);
            let values = self.enricher_for(instance).label_values();
            histogram
                .with_label_values(&label_refs(&values))
                .observe(seconds);
        }
    }

    /// Removes all label children belonging to `instance`.
    pub fn deregister_instance(&self, instance: &Instance) {
        let values = self.enricher_for(instance).label_values();
        let values = label_refs(&values);
        // A missing child is not an error; the instance may never have failed.
        let _ = self.failed_requests.remove_label_values(&values);
        if let Some(histogram) = &self.fetch_latency {
            let _ = histogram.remove_label_values(&values);
        }
        self.known_instances
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&instance.instance_id);
        debug!("Deregistered metrics of instance {}", instance.instance_id);
    }

    /// Deregisters every known instance that is not part of `current`.
    pub fn retain_instances(&self, current: &[Instance]) {
        let vanished: Vec<Instance> = {
            let known = self
                .known_instances
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            known
                .values()
                .filter(|k| !current.iter().any(|c| c.instance_id == k.instance_id))
                .cloned()
                .collect()
        };
        for instance in &vanished {
            self.deregister_instance(instance);
        }
    }

    pub fn render(&self) -> Result<String, EncodeError> {
        render_marked(&self.registry)
    }
}

impl CacheObserver for InternalMetrics {
    fn on_size(&self, cache: &str, size: usize) {
        self.cache_size
            .with_label_values(&[cache])
            .set(i64::try_from(size).unwrap_or(i64::MAX));
    }

    fn on_expiry(&self, cache: &str) {
        self.cache_expiry.with_label_values(&[cache]).inc();
    }

    fn on_refresh(&self, cache: &str, success: bool) {
        let counter = if success {
            &self.cache_refresh_success
        } else {
            &self.cache_refresh_failure
        };
        counter.with_label_values(&[cache]).inc();
    }
}

/// Metrics describing a single scrape request.
pub struct RequestMetrics {
    registry: Registry,
    up: GaugeVec,
    scrape_duration: Gauge,
    origin_labels: bool,
}

impl RequestMetrics {
    /// With `origin_labels`, the `up` gauge is labelled like enriched samples;
    /// without, it carries no labels and describes a single instance.
    pub fn new(origin_labels: bool) -> prometheus::Result<Self> {
        let registry = Registry::new();
        let label_names: &[&str] = if origin_labels { &ALL_LABEL_NAMES } else { &[] };

        let up = GaugeVec::new(
            Opts::new(
                format!("{METRIC_PREFIX}_up"),
                "Whether the last scrape of the instance succeeded",
            ),
            label_names,
        )?;
        let scrape_duration = Gauge::new(
            format!("{METRIC_PREFIX}_scrape_duration_seconds"),
            "Duration of the scrape request in seconds",
        )?;
        registry.register(Box::new(up.clone()))?;
        registry.register(Box::new(scrape_duration.clone()))?;

        Ok(Self {
            registry,
            up,
            scrape_duration,
            origin_labels,
        })
    }

    pub fn set_up(&self, instance: &Instance, up: bool) {
        let value = if up { 1.0 } else { 0.0 };
        if self.origin_labels {
            let values = instance.origin().values();
            self.up.with_label_values(&label_refs(&values)).set(value);
        } else {
            let no_labels: [&str; 0] = [];
            self.up.with_label_values(&no_labels).set(value);
        }
    }

    /// Records the `up` state of every instance and the scrape duration.
    pub fn record(&self, report: &ScrapeReport) {
        for (instance, up) in &report.up {
            self.set_up(instance, *up);
        }
        self.scrape_duration.set(report.duration.as_secs_f64());
    }

    pub fn render(&self) -> Result<String, EncodeError> {
        render_marked(&self.registry)
    }
}

fn label_refs(values: &[String]) -> Vec<&str> {
    values.iter().map(String::as_str).collect()
}

/// Renders request and, if enabled, internal metrics as one document.
pub fn render_additional(request: &RequestMetrics, internal: Option<&InternalMetrics>) -> String {
    let mut out = match request.render() {
        Ok(text) => text,
        Err(e) => {
            warn!("Failed to render request metrics: {}", e);
            String::new()
        }
    };
    if let Some(internal) = internal {
        match internal.render() {
            Ok(text) => out.push_str(&text),
            Err(e) => warn!("Failed to render internal metrics: {}", e),
        }
    }
    out
}
