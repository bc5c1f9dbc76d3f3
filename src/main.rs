// Nightscout Exporter - Prometheus bridge for Nightscout glucose readings
//
// On every scrape the exporter fetches the Nightscout pebble document,
// takes the latest sensor glucose value and exposes it as a gauge.
//
// # Features
// - Pull-based: one upstream request per scrape, nothing cached
// - Scrapes are serialized, the gauge is never observed half-updated
// - Upstream failures never break the metrics endpoint
// - Bounded upstream deadline
//
// # Usage
// nightscout-exporter -telemetry.address :9552 -nightscout_endpoint <url>
//
// Example:
// nightscout-exporter -nightscout_endpoint "https://example.herokuapp.com/pebble?count=2&units=mgdl"

use anyhow::{Context, Result};
use std::env;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

// Module declarations
mod collector;
mod config;
mod fetcher;
mod server;

use collector::NightscoutCollector;
use config::{CliCommand, ExporterConfig};
use fetcher::PebbleFetcher;
use server::AppState;

/// Application entry point
///
/// This function:
/// 1. Parses command-line arguments
/// 2. Initializes logging
/// 3. Builds the collector and registers it
/// 4. Binds the listener and serves until Ctrl+C
///
/// Any startup failure (bad flags, unbindable address) exits non-zero.
fn main() -> ExitCode {
    let command = match config::parse_args(env::args().skip(1)) {
        Ok(command) => command,
        Err(e) => {
            eprintln!("error: {}\n\n{}", e, config::usage());
            return ExitCode::from(2);
        }
    };

    let config = match command {
        CliCommand::Run(config) => config,
        CliCommand::Help => {
            print!("{}", config::usage());
            return ExitCode::SUCCESS;
        }
        CliCommand::Version => {
            println!("nightscout-exporter {}", env!("CARGO_PKG_VERSION"));
            return ExitCode::SUCCESS;
        }
    };

    init_logging();

    match run(config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

/// Builds the exporter and runs the HTTP server to completion
///
/// The blocking HTTP client is created here, before the async runtime
/// exists, and is only driven from the blocking pool afterwards.
fn run(config: ExporterConfig) -> Result<()> {
    info!("=== Nightscout Exporter Starting ===");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!("Nightscout endpoint: {}", config.nightscout_url);
    info!("Fetch timeout: {}s", config.fetch_timeout.as_secs());

    let fetcher =
        PebbleFetcher::new(config.fetch_timeout).context("Failed to initialize HTTP client")?;

    let collector = NightscoutCollector::new(config.nightscout_url.clone(), fetcher)
        .context("Failed to create nightscout collector")?;

    let registry = prometheus::Registry::new();
    registry
        .register(Box::new(collector))
        .context("Failed to register nightscout collector")?;

    let state = Arc::new(AppState {
        registry,
        metrics_path: config.metrics_path.clone(),
    });

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to start async runtime")?;

    runtime.block_on(serve_until_shutdown(config, state))
}

/// Binds the listen address and serves until Ctrl+C
///
/// A bind failure is returned as an error, which exits the process non-zero.
async fn serve_until_shutdown(config: ExporterConfig, state: Arc<AppState>) -> Result<()> {
    let bind_address = config.bind_address();
    info!("Starting Server: {}", config.listen_address);

    let listener = tokio::net::TcpListener::bind(&bind_address)
        .await
        .with_context(|| format!("Failed to bind listen address {}", bind_address))?;

    info!("=== Nightscout Exporter Started Successfully ===");
    info!("Press Ctrl+C to stop");

    server::serve(listener, state, shutdown_signal())
        .await
        .context("HTTP server failed")?;

    info!("Nightscout exporter stopped");
    Ok(())
}

/// Resolves when the process receives Ctrl+C
async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
        // Without a signal handler, keep serving
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

/// Initializes the logging subsystem
///
/// Sets up structured logging with:
/// - Timestamp, level and target for each log entry
/// - Colored output when running in terminal
/// - JSON output when running as systemd service
///
/// # Log Levels
/// Default: INFO
/// Can be overridden with RUST_LOG environment variable
///
/// # Examples
/// ```bash
/// RUST_LOG=debug nightscout-exporter ...  # Show every scrape cycle
/// RUST_LOG=warn nightscout-exporter ...   # Only upstream failures and errors
/// ```
fn init_logging() {
    // Systemd sets INVOCATION_ID for the services it starts
    let is_systemd = env::var("INVOCATION_ID").is_ok();

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    if is_systemd {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_level(true)
                    .with_ansi(true),
            )
            .init();
    }
}
