//! herakles-scrape-gateway - version 0.1.0
//!
//! Prometheus scrape gateway with tracing logging.
//! This is the main entry point that initializes the server and handles subcommands.

mod commands;

use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::{net::TcpListener, signal};
use tracing::{error, info, Level};

use commands::{command_scrape, command_targets};
use herakles_scrape_gateway::cli::{Args, Commands};
use herakles_scrape_gateway::config::{
    resolve_config, show_config, validate_effective_config, Config, DEFAULT_BIND_ADDR,
    DEFAULT_PORT,
};
use herakles_scrape_gateway::handlers;
use herakles_scrape_gateway::state::{AppState, SharedState};

/// Initializes tracing logging subsystem with configured log level.
fn setup_logging(config: &Config) {
    let level_name = config.log_level.as_deref().unwrap_or("info");
    let log_level = match level_name.to_ascii_lowercase().as_str() {
        "off" | "error" => Level::ERROR,
        "warn" => Level::WARN,
        "debug" => Level::DEBUG,
        "trace" => Level::TRACE,
        _ => Level::INFO,
    };

    let subscriber = tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber).expect("Failed to set tracing subscriber");

    info!("Logging initialized with level: {}", level_name);
}

/// Helper function to validate configuration.
/// Exits the process with error code 1 if validation fails.
fn ensure_valid_config(config: &mut Config) {
    if let Err(e) = validate_effective_config(config) {
        eprintln!("❌ Configuration invalid: {:#}", e);
        std::process::exit(1);
    }
}

/// Main application entry point.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Early config resolution for show/check modes
    if args.show_config || args.check_config {
        let mut config = resolve_config(&args)?;
        ensure_valid_config(&mut config);

        if args.check_config {
            println!(
                "✅ Configuration is valid ({} targets)",
                config.targets.len()
            );
            return Ok(());
        }

        return show_config(&config, args.config_format);
    }

    // Logging first so corrections made during validation are reported
    let mut config = resolve_config(&args)?;
    setup_logging(&config);
    ensure_valid_config(&mut config);

    let bind_ip_str = config
        .bind
        .clone()
        .unwrap_or_else(|| DEFAULT_BIND_ADDR.to_string());
    let port = config.port.unwrap_or(DEFAULT_PORT);

    let state: SharedState = Arc::new(AppState::from_config(config)?);

    // Handle subcommands
    if let Some(command) = &args.command {
        let result = match command {
            Commands::Targets { format } => command_targets(&state, *format).await,
            Commands::Scrape { app_id } => command_scrape(&state, app_id.as_deref()).await,
        };
        state.shutdown();
        return result;
    }

    if state.discoverer.targets().is_empty() {
        info!("No targets configured, /metrics will only expose gateway metrics");
    }

    // Setup graceful shutdown signal handlers
    let shutdown_signal = async {
        let ctrl_c = async {
            signal::ctrl_c()
                .await
                .expect("Failed to install Ctrl+C handler");
        };

        #[cfg(unix)]
        let terminate = async {
            signal::unix::signal(signal::unix::SignalKind::terminate())
                .expect("Failed to install signal handler")
                .recv()
                .await;
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {
                info!("Received SIGINT (Ctrl+C), shutting down gracefully...");
            }
            _ = terminate => {
                info!("Received SIGTERM, shutting down gracefully...");
            }
        }
    };

    // Configure HTTP server routes
    let addr: SocketAddr = format!("{}:{}", bind_ip_str, port).parse()?;
    let app = handlers::router(state.clone());

    let listener = TcpListener::bind(addr).await?;
    info!(
        "herakles-scrape-gateway listening on http://{}:{}",
        bind_ip_str, port
    );

    let server = axum::serve(listener, app);

    tokio::select! {
        result = server => {
            if let Err(e) = result {
                error!("Server error: {}", e);
                state.shutdown();
                return Err(e.into());
            }
        }
        _ = shutdown_signal => {
            info!("Shutdown signal received, exiting...");
        }
    }

    state.shutdown();
    info!("herakles-scrape-gateway stopped gracefully");
    Ok(())
}
