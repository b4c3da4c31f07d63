//! Herakles Scrape Gateway Library
//!
//! A Prometheus scrape gateway for platform-hosted applications. It discovers
//! the instances of configured applications, fetches their metrics
//! concurrently and re-exposes them as one document with origin labels.
//!
//! # Features
//!
//! - **Exposition parsing**: Prometheus text 0.0.4 and OpenMetrics framing
//! - **Label enrichment**: org, space, app and instance labels on every sample
//! - **Framing-safe merging**: exactly one `# EOF` at the end of OpenMetrics output
//! - **Single-flight cache**: one loader call per key, stale-while-revalidate refresh
//!
//! # Usage
//!
//! ```rust
//! use herakles_scrape_gateway::enrich::{Enricher, OriginLabels};
//! use herakles_scrape_gateway::exposition::{encode_text, parse};
//!
//! let families = parse("# TYPE requests_total counter\nrequests_total 12\n");
//! let origin = OriginLabels::new("org", "space", "shop", "shop-guid:0");
//! let enriched = Enricher::all_labels(origin).enrich(&families);
//!
//! let text = encode_text(&enriched);
//! assert!(text.contains("cf_instance_number=\"0\""));
//! ```

pub mod cache;
pub mod cli;
pub mod config;
pub mod discovery;
pub mod enrich;
pub mod exposition;
pub mod fetcher;
pub mod handlers;
pub mod internal_metrics;
pub mod model;
pub mod scrape;
pub mod state;

// Re-export main types for convenience
pub use cache::{CacheError, CacheSettings, RefreshMode, SingleFlightCache};
pub use discovery::{CachingDiscoverer, Instance, InstanceResolver, StaticResolver, TargetKey};
pub use enrich::{Enricher, OriginLabels};
pub use fetcher::{AuthEnricher, FetchError, Fetcher, HttpFetcher};
pub use model::{ContentType, FamilyMap, FetchResult, MetricFamily, MetricType, Sample};
pub use scrape::{ScrapeOrchestrator, ScrapeReport, ScrapeSettings};
