//! sotto-server: encrypted chat relay.
//!
//! Accepts WebSocket connections on a single endpoint, tracks presence,
//! enforces per-source admission limits, and fans opaque encrypted payloads
//! out to connected peers. Plaintext never reaches this process.

use clap::Parser;
use sotto_server::{ChatServer, ServerConfig};
use std::path::PathBuf;
use tracing::{error, info};

/// sotto-server — encrypted chat relay
#[derive(Parser, Debug)]
#[command(name = "sotto-server", version, about = "Encrypted chat relay")]
struct Cli {
    /// Bind address
    #[arg(long)]
    bind: Option<String>,

    /// Listen port
    #[arg(short, long)]
    port: Option<u16>,

    /// Config file path
    #[arg(long, default_value = "~/.sotto/config.toml")]
    config: String,

    /// Stale-connection sweep interval in seconds
    #[arg(long)]
    sweep_interval: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize tracing
    use tracing_subscriber::EnvFilter;
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    // Load server config (file + CLI overrides)
    let config_path = PathBuf::from(&cli.config);
    let server_config = match ServerConfig::load(
        Some(&config_path),
        cli.bind.as_deref(),
        cli.port,
        cli.sweep_interval,
    ) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "failed to load config");
            std::process::exit(1);
        }
    };

    info!(
        version = env!("CARGO_PKG_VERSION"),
        port = server_config.port,
        "starting sotto-server"
    );

    let relay = ChatServer::new(server_config);

    tokio::select! {
        result = relay.run() => {
            if let Err(e) = result {
                error!(error = %e, "server error");
                std::process::exit(1);
            }
        }
        _ = shutdown_signal() => {
            info!("received shutdown signal");
        }
    }

    info!("sotto-server stopped");
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
