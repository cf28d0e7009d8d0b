//! tabrelay-server: terminal relay daemon.
//!
//! Serves the session HTTP API and the per-tab WebSocket attach endpoint, and
//! bridges attached clients to local PTYs or remote terminal resources.

use clap::Parser;
use std::net::IpAddr;
use std::path::PathBuf;
use tabrelay_server::config::{CliOverrides, ServerConfig, UpstreamMode};
use tabrelay_server::server::{build_resource, RelayServer};
use tracing::{error, info};

/// tabrelay-server — shared terminal relay
#[derive(Parser, Debug)]
#[command(name = "tabrelay-server", version, about = "Shared terminal relay")]
struct Cli {
    /// Listen address
    #[arg(long)]
    bind: Option<IpAddr>,

    /// Listen port
    #[arg(short, long)]
    port: Option<u16>,

    /// Config file path
    #[arg(long, default_value = "~/.tabrelay/config.toml")]
    config: String,

    /// Where terminal resources live
    #[arg(long, value_enum)]
    upstream: Option<UpstreamMode>,

    /// Command to run in each PTY (pty mode)
    #[arg(long)]
    command: Option<String>,

    /// Upstream WebSocket URL template (websocket mode)
    #[arg(long)]
    upstream_url: Option<String>,

    /// Maximum concurrent sessions
    #[arg(long)]
    max_sessions: Option<usize>,

    /// Seconds without activity before a session expires
    #[arg(long)]
    session_ttl: Option<u64>,

    /// Seconds a hub keeps its upstream after the last client leaves
    #[arg(long)]
    idle_grace: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    use tracing_subscriber::EnvFilter;
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "starting tabrelay-server");

    let overrides = CliOverrides {
        bind: cli.bind,
        port: cli.port,
        max_sessions: cli.max_sessions,
        session_ttl: cli.session_ttl,
        idle_grace: cli.idle_grace,
        upstream_mode: cli.upstream,
        command: cli.command,
        upstream_url: cli.upstream_url,
    };
    let config = match ServerConfig::load(Some(&PathBuf::from(&cli.config)), overrides) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "failed to load config");
            std::process::exit(1);
        }
    };

    let resource = match build_resource(&config) {
        Ok(r) => r,
        Err(e) => {
            error!(error = %e, "failed to create terminal resource client");
            std::process::exit(1);
        }
    };

    let server = RelayServer::new(config, resource);
    if let Err(e) = server.run(shutdown_signal()).await {
        error!(error = %e, "server error");
        std::process::exit(1);
    }

    info!("tabrelay-server stopped");
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
