//! Wiremesh Daemon
//!
//! Receives versioned network-map snapshots over the control socket and
//! reconciles peer connections, DNS, routes and SSH authorization.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use wiremesh_daemon::config::DaemonConfig;
use wiremesh_daemon::control::ControlServer;
use wiremesh_daemon::dataplane::{NullConnector, NullRouteManager};
use wiremesh_daemon::dns::DnsServer;
use wiremesh_daemon::engine::{Engine, EngineConfig};
use wiremesh_daemon::sshd;

#[derive(Parser)]
#[command(name = "wiremeshd")]
#[command(about = "Wiremesh client daemon - reconciles mesh state from snapshots")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "/etc/wiremesh/config.toml")]
    config: PathBuf,

    /// Control socket path (overrides the configuration file)
    #[arg(short, long)]
    socket: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    info!("wiremesh daemon v{}", env!("CARGO_PKG_VERSION"));

    let mut config = DaemonConfig::load(&cli.config)?;
    if let Some(socket) = cli.socket {
        config.control_socket = socket;
    }

    let ssh_host_key = match &config.ssh.host_key_path {
        Some(path) => tokio::fs::read(path).await?,
        None => Vec::new(),
    };

    let cancel = CancellationToken::new();

    let dns = Arc::new(DnsServer::new(config.dns_listen, cancel.child_token()));
    let engine = Arc::new(Mutex::new(Engine::new(
        EngineConfig {
            ssh_host_key,
            ssh_port: config.ssh.port,
        },
        Arc::new(NullConnector),
        Arc::new(NullRouteManager),
        sshd::disabled_factory(),
        cancel.child_token(),
    )));

    let control = ControlServer::new(engine.clone(), dns.clone(), cancel.child_token());
    let control_handle = tokio::spawn(control.serve(config.control_socket.clone()));

    info!(
        "daemon started, control socket at {}",
        config.control_socket.display()
    );

    // Wait for shutdown signal
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("received shutdown signal");
        }
        result = control_handle => {
            match result {
                Ok(Err(e)) => error!("control server error: {}", e),
                Err(e) => error!("control server task failed: {}", e),
                _ => {}
            }
        }
    }

    cancel.cancel();
    dns.shutdown().await;
    engine.lock().await.shutdown().await;

    info!("daemon shutdown complete");
    Ok(())
}
