//! CLI arguments and subcommands for herakles-scrape-gateway.
//!
//! This module defines the command-line interface structure using the clap library,
//! including all flags, options, and subcommands.

use clap::{Parser, Subcommand, ValueEnum};
use std::net::IpAddr;
use std::path::PathBuf;

/// Log level options for CLI parsing
#[derive(Debug, Clone, ValueEnum)]
pub enum LogLevel {
    Off,
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

/// Configuration format options for output
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
pub enum ConfigFormat {
    #[default]
    Yaml,
    Json,
    Toml,
}

/// Main CLI arguments structure
#[derive(Parser, Debug, Default)]
#[command(
    name = "herakles-scrape-gateway",
    about = "Prometheus scrape gateway for platform-hosted app instances",
    long_about = "Prometheus scrape gateway for platform-hosted app instances.\n\n\
                  Discovers the instances of the configured applications, scrapes all of them \
                  concurrently and re-exposes their metrics as one document, each sample labelled \
                  with the org, space, app and instance it came from.",
    author = "Michael Moll <exporter@herakles.now> - Herakles",
    version = "0.1.0",
    propagate_version = true,
    after_help = "Project: https://github.com/cansp-dev/herakles-scrape-gateway - More info: https://www.herakles.now - Support: exporter@herakles.now"
)]
pub struct Args {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// HTTP listen port
    #[arg(short = 'p', long)]
    pub port: Option<u16>,

    /// Bind to specific interface/IP
    #[arg(long)]
    pub bind: Option<IpAddr>,

    /// Log level
    #[arg(long, value_enum)]
    pub log_level: Option<LogLevel>,

    /// Config file (YAML/JSON/TOML)
    #[arg(short = 'c', long)]
    pub config: Option<PathBuf>,

    /// Disable all config file loading
    #[arg(long)]
    pub no_config: bool,

    /// Print effective merged config and exit
    #[arg(long)]
    pub show_config: bool,

    /// Output format for --show-config
    #[arg(long, value_enum, default_value = "yaml")]
    pub config_format: ConfigFormat,

    /// Validate config and exit (return code 1 on error)
    #[arg(long)]
    pub check_config: bool,

    /// Number of concurrent scrape workers
    #[arg(long)]
    pub threads: Option<usize>,

    /// Upper bound for one complete scrape in milliseconds
    #[arg(long)]
    pub max_processing_time_ms: Option<u64>,

    /// Timeout of a single target fetch in milliseconds
    #[arg(long)]
    pub fetch_timeout_ms: Option<u64>,

    /// Pass target metrics through without origin labels
    #[arg(long)]
    pub disable_label_enrichment: bool,

    /// Refresh cached discovery results older than N seconds
    #[arg(long)]
    pub cache_refresh_secs: Option<u64>,

    /// Drop cached discovery results unused for N seconds
    #[arg(long)]
    pub cache_expiry_secs: Option<u64>,

    /// Disable internal herakles_gateway_* metrics
    #[arg(long)]
    pub disable_internal_metrics: bool,
}

/// Subcommands for additional functionality
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Resolve all configured targets and list their instances
    Targets {
        /// Output format
        #[arg(long, value_enum, default_value = "yaml")]
        format: ConfigFormat,
    },

    /// Scrape all targets once and print the merged document
    Scrape {
        /// Only scrape the application with this id
        #[arg(short = 'a', long)]
        app_id: Option<String>,
    },
}
