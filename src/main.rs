use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use tokengate::config::{BackendKind, TokengateConfig};
use tokengate::grpc::GrpcServer;
use tokengate::ratelimit::RateLimiter;

/// Token-bucket rate limiting service.
#[derive(Debug, Parser)]
#[command(name = "tokengate", version, about)]
struct Cli {
    /// YAML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Address for the gRPC server
    #[arg(long)]
    grpc_addr: Option<SocketAddr>,

    /// Bucket store to use
    #[arg(long, value_enum)]
    backend: Option<BackendKind>,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    info!("Starting Tokengate Rate Limiting Service");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let mut config = TokengateConfig::load(cli.config.as_deref())?;
    if let Some(addr) = cli.grpc_addr {
        config.server.grpc_addr = addr;
    }
    if let Some(backend) = cli.backend {
        config.rate_limiting.backend = backend;
    }
    config.validate()?;

    info!(
        environment = %config.environment,
        grpc_addr = %config.server.grpc_addr,
        backend = ?config.resolved_backend(),
        requests_per_minute = config.rate_limiting.requests_per_minute,
        "Configuration loaded"
    );

    if !config.rate_limiting.enabled {
        warn!("Rate limiting is disabled, every call will be admitted");
    }

    let rate_limiter = Arc::new(RateLimiter::from_config(&config).await?);
    info!(backend = rate_limiter.backend_name(), "Rate limiter initialized");

    let grpc_server = GrpcServer::new(config.server.grpc_addr, Arc::clone(&rate_limiter));

    // Run the server with graceful shutdown on Ctrl+C
    grpc_server
        .serve_with_shutdown(shutdown_signal())
        .await?;

    rate_limiter.shutdown().await;

    info!("Tokengate Rate Limiting Service stopped");
    Ok(())
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true);

    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
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
                warn!(error = %e, "Failed to install SIGTERM handler");
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
