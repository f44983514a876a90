use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info};

use gatehouse::config::GatehouseConfig;
use gatehouse::http::{AppState, HttpServer};
use gatehouse::mqtt::{GateRegistry, MqttPublisher};
use gatehouse::ratelimit::{spawn_sweeper, RateLimiter};
use gatehouse::telemetry::{self, LogFormat};

/// Rate-limited HTTP trigger for MQTT-driven gates.
#[derive(Parser, Debug)]
#[command(name = "gatehouse", version, about)]
struct Args {
    /// Path to the YAML configuration file
    #[arg(short, long, env = "GATEHOUSE_CONFIG", default_value = "config.yaml")]
    config: PathBuf,

    /// Override `server.listen_addr` from the configuration
    #[arg(short, long)]
    listen: Option<SocketAddr>,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Json)]
    log_format: LogFormat,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    telemetry::init(args.log_format)
        .map_err(|e| anyhow::anyhow!("failed to initialise logging: {}", e))?;

    info!(version = env!("CARGO_PKG_VERSION"), "Starting Gatehouse");

    let mut config = match GatehouseConfig::from_file(&args.config) {
        Ok(config) => config,
        Err(e) => {
            error!(path = %args.config.display(), error = %e, "Failed to load configuration");
            return Err(e.into());
        }
    };
    if let Some(listen) = args.listen {
        config.server.listen_addr = listen;
    }

    let rate_limiter = Arc::new(RateLimiter::from_config(&config.rate_limiting)?);
    info!(
        quota = rate_limiter.quota(),
        window_secs = rate_limiter.window().as_secs(),
        "Rate limiter initialized"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let sweeper = spawn_sweeper(
        Arc::clone(&rate_limiter),
        Duration::from_secs(config.rate_limiting.sweep_interval_secs),
        shutdown_rx,
    );

    let publisher = Arc::new(MqttPublisher::start(&config.mqtt)?);
    if let Err(e) = publisher.wait_connected(publisher.connect_timeout()).await {
        // Keep serving; the client reconnects in the background.
        error!(error = %e, "Failed to connect to MQTT broker");
    }

    let gates = GateRegistry::new(config.mqtt.gates.clone());
    info!(gates = ?gates.names().collect::<Vec<_>>(), "Gates configured");

    let state = AppState {
        rate_limiter,
        gates: Arc::new(gates),
        publisher: publisher.clone(),
        publish_timeout: config.publish_timeout(),
    };

    HttpServer::new(config.server.listen_addr, state)
        .with_request_timeout(config.server.request_timeout())
        .with_shutdown_timeout(config.server.shutdown_timeout())
        .serve_with_shutdown(shutdown_signal())
        .await?;

    info!("Shutting down Gatehouse");
    let _ = shutdown_tx.send(true);
    publisher.disconnect().await;
    if let Some(handle) = sweeper {
        let _ = handle.await;
    }

    info!("Gatehouse stopped");
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
