//! Configuration management for herakles-scrape-gateway.
//!
//! This module handles loading, merging, and validating configuration from files
//! and CLI arguments. It supports YAML, JSON, and TOML formats.

use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

use crate::cache::{CacheSettings, RefreshMode};
use crate::cli::{Args, ConfigFormat, LogLevel};
use crate::discovery::TargetKey;

// Default configuration constants
pub const DEFAULT_BIND_ADDR: &str = "0.0.0.0";
pub const DEFAULT_PORT: u16 = 9216;
pub const DEFAULT_METRICS_PATH: &str = "/metrics";

/// Scraping behaviour.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScrapingConfig {
    /// Number of concurrent fetch workers (default: 5)
    #[serde(default = "default_threads")]
    pub threads: usize,

    /// Budget for one complete scrape in milliseconds (default: 4000)
    #[serde(default = "default_max_processing_time_ms", alias = "max-processing-time-ms")]
    pub max_processing_time_ms: u64,

    /// Timeout of a single fetch in milliseconds (default: 3000)
    #[serde(default = "default_fetch_timeout_ms", alias = "fetch-timeout-ms")]
    pub fetch_timeout_ms: u64,

    /// Stamp origin labels on scraped samples (default: true)
    #[serde(default = "default_true", alias = "label-enrichment")]
    pub label_enrichment: bool,
}

fn default_threads() -> usize {
    5
}
fn default_max_processing_time_ms() -> u64 {
    4000
}
fn default_fetch_timeout_ms() -> u64 {
    3000
}
fn default_true() -> bool {
    true
}

impl Default for ScrapingConfig {
    fn default() -> Self {
        Self {
            threads: default_threads(),
            max_processing_time_ms: default_max_processing_time_ms(),
            fetch_timeout_ms: default_fetch_timeout_ms(),
            label_enrichment: default_true(),
        }
    }
}

impl ScrapingConfig {
    pub fn max_processing_time(&self) -> Duration {
        Duration::from_millis(self.max_processing_time_ms)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }
}

/// Discovery cache behaviour.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Reload discovery results older than this (default: 300)
    #[serde(default = "default_refresh_interval_secs", alias = "refresh-interval-secs")]
    pub refresh_interval_secs: u64,

    /// Drop discovery results unused for this long (default: 600)
    #[serde(default = "default_expiry_secs", alias = "expiry-secs")]
    pub expiry_secs: u64,

    /// Delay between two refresher sweeps in milliseconds (default: 1000)
    #[serde(default = "default_sweep_interval_ms", alias = "sweep-interval-ms")]
    pub sweep_interval_ms: u64,
}

fn default_refresh_interval_secs() -> u64 {
    300
}
fn default_expiry_secs() -> u64 {
    600
}
fn default_sweep_interval_ms() -> u64 {
    1000
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            refresh_interval_secs: default_refresh_interval_secs(),
            expiry_secs: default_expiry_secs(),
            sweep_interval_ms: default_sweep_interval_ms(),
        }
    }
}

impl CacheConfig {
    pub fn settings(&self) -> CacheSettings {
        CacheSettings {
            refresh_after: Some(Duration::from_secs(self.refresh_interval_secs)),
            expire_after: Some(Duration::from_secs(self.expiry_secs)),
            sweep_interval: Duration::from_millis(self.sweep_interval_ms),
            mode: RefreshMode::Background,
        }
    }
}

/// Metrics about the gateway itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InternalMetricsConfig {
    /// Expose herakles_gateway_* metrics (default: true)
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Prefix for the origin label names of internal metrics
    #[serde(default, alias = "label-prefix")]
    pub label_prefix: Option<String>,

    /// Record a fetch latency histogram per instance (default: false)
    #[serde(default, alias = "request-latency")]
    pub request_latency: bool,
}

impl Default for InternalMetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            label_prefix: None,
            request_latency: false,
        }
    }
}

/// Basic authentication for outbound scrapes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BasicAuthConfig {
    pub username: String,
    pub password: String,
}

/// One application to scrape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetConfig {
    #[serde(alias = "org-name")]
    pub org_name: String,
    #[serde(alias = "space-name")]
    pub space_name: String,
    #[serde(alias = "app-name")]
    pub app_name: String,

    /// Application id; defaults to the app name.
    #[serde(default, alias = "app-id")]
    pub app_id: Option<String>,

    /// Host (and optional port) the application is routed under.
    pub route: String,

    /// Metrics path (default: /metrics)
    #[serde(default = "default_metrics_path")]
    pub path: String,

    /// http | https (default: https)
    #[serde(default = "default_protocol")]
    pub protocol: String,

    /// Number of running instances (default: 1)
    #[serde(default = "default_instances")]
    pub instances: u32,

    #[serde(default, alias = "basic-auth")]
    pub basic_auth: Option<BasicAuthConfig>,
}

fn default_metrics_path() -> String {
    DEFAULT_METRICS_PATH.to_string()
}
fn default_protocol() -> String {
    "https".to_string()
}
fn default_instances() -> u32 {
    1
}

impl TargetConfig {
    pub fn app_id(&self) -> &str {
        self.app_id.as_deref().unwrap_or(&self.app_name)
    }
}

/// Gateway configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    // Server configuration
    pub port: Option<u16>,
    pub bind: Option<String>,

    // Logging
    #[serde(alias = "log-level")]
    pub log_level: Option<String>,

    #[serde(default)]
    pub scraping: ScrapingConfig,

    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default, alias = "internal-metrics")]
    pub internal_metrics: InternalMetricsConfig,

    // TOML cannot place a plain `targets = []` after the tables above.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub targets: Vec<TargetConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: Some(DEFAULT_BIND_ADDR.to_string()),
            port: Some(DEFAULT_PORT),
            log_level: Some("info".into()),
            scraping: ScrapingConfig::default(),
            cache: CacheConfig::default(),
            internal_metrics: InternalMetricsConfig::default(),
            targets: Vec::new(),
        }
    }
}

/// Validate effective config (used by --check-config and at startup)
///
/// Recoverable inconsistencies are corrected in place with a warning.
pub fn validate_effective_config(cfg: &mut Config) -> anyhow::Result<()> {
    let scraping = &mut cfg.scraping;
    if scraping.threads == 0 {
        bail!("scraping.threads must be greater than 0");
    }
    if scraping.max_processing_time_ms == 0 {
        bail!("scraping.max_processing_time_ms must be greater than 0");
    }
    if scraping.fetch_timeout_ms == 0 {
        bail!("scraping.fetch_timeout_ms must be greater than 0");
    }
    if scraping.fetch_timeout_ms > scraping.max_processing_time_ms {
        warn!(
            "scraping.fetch_timeout_ms ({}) exceeds scraping.max_processing_time_ms ({}), lowering it",
            scraping.fetch_timeout_ms, scraping.max_processing_time_ms
        );
        scraping.fetch_timeout_ms = scraping.max_processing_time_ms;
    }

    if cfg.cache.sweep_interval_ms == 0 {
        bail!("cache.sweep_interval_ms must be greater than 0");
    }

    if let Some(prefix) = cfg.internal_metrics.label_prefix.as_deref() {
        if !prefix.is_empty() && !is_valid_label_name(prefix) {
            bail!("internal_metrics.label_prefix '{}' is not a valid label name", prefix);
        }
    }

    let mut seen = ahash::AHashSet::new();
    for (idx, target) in cfg.targets.iter().enumerate() {
        if target.org_name.is_empty() || target.space_name.is_empty() || target.app_name.is_empty() {
            bail!("targets[{}]: org_name, space_name and app_name must not be empty", idx);
        }
        if target.route.is_empty() {
            bail!("targets[{}] ({}): route must not be empty", idx, target.app_name);
        }
        match target.protocol.as_str() {
            "http" | "https" => {}
            other => bail!(
                "targets[{}] ({}): invalid protocol '{}', expected 'http' or 'https'",
                idx,
                target.app_name,
                other
            ),
        }
        if !target.path.starts_with('/') {
            bail!(
                "targets[{}] ({}): path '{}' must start with '/'",
                idx,
                target.app_name,
                target.path
            );
        }
        if target.instances == 0 {
            bail!("targets[{}] ({}): instances must be at least 1", idx, target.app_name);
        }
        let key = TargetKey::from(target);
        if !seen.insert(key.clone()) {
            bail!("targets[{}]: duplicate target {}", idx, key);
        }
    }

    Ok(())
}

fn is_valid_label_name(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Resolves configuration from CLI args, config file, and defaults.
/// This enforces precedence: CLI (if provided) > config file > default.
pub fn resolve_config(args: &Args) -> anyhow::Result<Config> {
    let mut config = if args.no_config {
        Config::default()
    } else {
        load_config(args.config.as_deref())?
    };

    if let Some(bind_ip) = args.bind {
        config.bind = Some(bind_ip.to_string());
    }
    if let Some(cli_port) = args.port {
        config.port = Some(cli_port);
    }
    if let Some(level) = &args.log_level {
        config.log_level = Some(log_level_name(level).to_string());
    }

    // Scraping
    if let Some(threads) = args.threads {
        config.scraping.threads = threads;
    }
    if let Some(ms) = args.max_processing_time_ms {
        config.scraping.max_processing_time_ms = ms;
    }
    if let Some(ms) = args.fetch_timeout_ms {
        config.scraping.fetch_timeout_ms = ms;
    }
    if args.disable_label_enrichment {
        config.scraping.label_enrichment = false;
    }

    // Cache
    if let Some(secs) = args.cache_refresh_secs {
        config.cache.refresh_interval_secs = secs;
    }
    if let Some(secs) = args.cache_expiry_secs {
        config.cache.expiry_secs = secs;
    }

    if args.disable_internal_metrics {
        config.internal_metrics.enabled = false;
    }

    Ok(config)
}

pub fn log_level_name(level: &LogLevel) -> &'static str {
    match level {
        LogLevel::Off => "off",
        LogLevel::Error => "error",
        LogLevel::Warn => "warn",
        LogLevel::Info => "info",
        LogLevel::Debug => "debug",
        LogLevel::Trace => "trace",
    }
}

/// Configuration loading with multiple format support
pub fn load_config(path: Option<&Path>) -> anyhow::Result<Config> {
    let path = match path {
        Some(p) => p.to_path_buf(),
        None => {
            // Try default locations
            let defaults = [
                "/etc/herakles/scrape-gateway.yaml",
                "/etc/herakles/scrape-gateway.yml",
                "/etc/herakles/scrape-gateway.json",
                "./herakles-scrape-gateway.yaml",
                "./herakles-scrape-gateway.yml",
                "./herakles-scrape-gateway.json",
            ];

            match defaults.iter().find(|p| Path::new(p).exists()) {
                Some(p) => PathBuf::from(p),
                None => return Ok(Config::default()),
            }
        }
    };

    if !path.exists() {
        return Ok(Config::default());
    }

    let content = fs::read_to_string(&path)
        .with_context(|| format!("reading config file {}", path.display()))?;

    let config: Config = match path.extension().and_then(|s| s.to_str()) {
        Some("json") => serde_json::from_str(&content)
            .with_context(|| format!("parsing JSON config {}", path.display()))?,
        Some("toml") => toml::from_str(&content)
            .with_context(|| format!("parsing TOML config {}", path.display()))?,
        // Default to YAML
        _ => serde_yaml::from_str(&content)
            .with_context(|| format!("parsing YAML config {}", path.display()))?,
    };
    info!("Loaded configuration from: {}", path.display());
    Ok(config)
}

/// Renders configuration in the requested format
pub fn render_config(config: &Config, format: ConfigFormat) -> anyhow::Result<String> {
    let output = match format {
        ConfigFormat::Json => serde_json::to_string_pretty(config)?,
        ConfigFormat::Toml => toml::to_string_pretty(config)?,
        ConfigFormat::Yaml => serde_yaml::to_string(config)?,
    };
    Ok(output)
}

/// Shows configuration in requested format
pub fn show_config(config: &Config, format: ConfigFormat) -> anyhow::Result<()> {
    println!("{}", render_config(config, format)?);
    Ok(())
}
