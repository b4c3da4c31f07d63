//! Integration tests for configuration loading.
//!
//! Config files are written to temporary directories in every supported
//! format and loaded through `load_config`.

use std::fs;
use std::path::PathBuf;

use herakles_scrape_gateway::cli::ConfigFormat;
use herakles_scrape_gateway::config::{
    load_config, render_config, validate_effective_config, Config,
};

/// Writes `content` to `name` inside a fresh temporary directory.
fn write_config(name: &str, content: &str) -> (tempfile::TempDir, PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join(name);
    fs::write(&path, content).unwrap();
    (dir, path)
}

#[test]
fn test_yaml_config_with_kebab_case_keys() {
    let yaml = r#"
port: 9300
log-level: debug
scraping:
  threads: 8
  max-processing-time-ms: 5000
  fetch-timeout-ms: 2500
  label-enrichment: false
cache:
  refresh-interval-secs: 60
  expiry-secs: 120
internal-metrics:
  label-prefix: gw
  request-latency: true
targets:
  - org-name: acme
    space-name: prod
    app-name: shop
    app-id: 1f3c
    route: shop.apps.example.com
    path: /actuator/prometheus
    instances: 3
    basic-auth:
      username: scraper
      password: secret
"#;
    let (_dir, path) = write_config("gateway.yaml", yaml);
    let cfg = load_config(Some(&path)).unwrap();

    assert_eq!(cfg.port, Some(9300));
    assert_eq!(cfg.log_level.as_deref(), Some("debug"));
    assert_eq!(cfg.scraping.threads, 8);
    assert_eq!(cfg.scraping.max_processing_time_ms, 5000);
    assert_eq!(cfg.scraping.fetch_timeout_ms, 2500);
    assert!(!cfg.scraping.label_enrichment);
    assert_eq!(cfg.cache.refresh_interval_secs, 60);
    assert_eq!(cfg.cache.expiry_secs, 120);
    assert_eq!(cfg.internal_metrics.label_prefix.as_deref(), Some("gw"));
    assert!(cfg.internal_metrics.request_latency);

    let target = &cfg.targets[0];
    assert_eq!(target.app_id(), "1f3c");
    assert_eq!(target.protocol, "https");
    assert_eq!(target.instances, 3);
    assert_eq!(target.basic_auth.as_ref().unwrap().username, "scraper");
}

#[test]
fn test_json_config_defaults() {
    let json = r#"{
        "targets": [
            {"org_name": "acme", "space_name": "dev", "app_name": "api", "route": "api.local"}
        ]
    }"#;
    let (_dir, path) = write_config("gateway.json", json);
    let cfg = load_config(Some(&path)).unwrap();

    assert_eq!(cfg.port, None);
    assert_eq!(cfg.scraping.threads, 5);
    assert_eq!(cfg.scraping.max_processing_time_ms, 4000);
    assert_eq!(cfg.scraping.fetch_timeout_ms, 3000);
    assert!(cfg.scraping.label_enrichment);
    assert!(cfg.internal_metrics.enabled);

    let target = &cfg.targets[0];
    assert_eq!(target.app_id(), "api");
    assert_eq!(target.path, "/metrics");
    assert_eq!(target.instances, 1);
    assert!(target.basic_auth.is_none());
}

#[test]
fn test_toml_config() {
    let toml = r#"
port = 9400

[scraping]
threads = 2

[[targets]]
org_name = "acme"
space_name = "prod"
app_name = "worker"
route = "worker.local:8080"
protocol = "http"
"#;
    let (_dir, path) = write_config("gateway.toml", toml);
    let cfg = load_config(Some(&path)).unwrap();

    assert_eq!(cfg.port, Some(9400));
    assert_eq!(cfg.scraping.threads, 2);
    assert_eq!(cfg.targets[0].protocol, "http");
    assert_eq!(cfg.targets[0].route, "worker.local:8080");
}

#[test]
fn test_missing_file_yields_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = load_config(Some(&dir.path().join("absent.yaml"))).unwrap();
    assert!(cfg.targets.is_empty());
    assert_eq!(cfg.port, Config::default().port);
}

#[test]
fn test_malformed_file_is_an_error() {
    let (_dir, path) = write_config("broken.yaml", "scraping: [not, a, map\n");
    let err = load_config(Some(&path)).unwrap_err();
    assert!(format!("{err:#}").contains("parsing YAML config"));
}

#[test]
fn test_invalid_target_rejected() {
    let yaml = r#"
targets:
  - org_name: acme
    space_name: prod
    app_name: shop
    route: shop.local
    path: metrics
"#;
    let (_dir, path) = write_config("gateway.yml", yaml);
    let mut cfg = load_config(Some(&path)).unwrap();
    let err = validate_effective_config(&mut cfg).unwrap_err();
    assert!(err.to_string().contains("must start with '/'"));
}

#[test]
fn test_duplicate_targets_rejected() {
    let yaml = r#"
targets:
  - org_name: acme
    space_name: prod
    app_name: shop
    route: shop.local
    path: /metrics
  - org_name: acme
    space_name: prod
    app_name: shop
    route: shop.local
    path: /actuator/prometheus
"#;
    let (_dir, path) = write_config("gateway.yaml", yaml);
    let mut cfg = load_config(Some(&path)).unwrap();
    validate_effective_config(&mut cfg).unwrap();

    cfg.targets[1].path = "/metrics".to_string();
    let err = validate_effective_config(&mut cfg).unwrap_err();
    assert!(err.to_string().contains("duplicate target acme/prod/shop"));
}

#[test]
fn test_rendered_config_loads_back() {
    let mut cfg = Config::default();
    cfg.scraping.threads = 11;

    for (format, name) in [
        (ConfigFormat::Yaml, "out.yaml"),
        (ConfigFormat::Json, "out.json"),
        (ConfigFormat::Toml, "out.toml"),
    ] {
        let rendered = render_config(&cfg, format).unwrap();
        let (_dir, path) = write_config(name, &rendered);
        let loaded = load_config(Some(&path)).unwrap();
        assert_eq!(loaded.scraping.threads, 11);
        assert_eq!(loaded.port, cfg.port);
    }
}
