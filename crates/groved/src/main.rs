//! groved -- the background daemon that supervises AI coding agent
//! instances.
//!
//! Listens on a Unix domain socket at `<root>/groved.sock` and handles
//! commands from the grove CLI. Normally started automatically; you do not
//! need to run it by hand.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use grove_daemon::{container, server, Supervisor};

/// Background daemon for grove.
#[derive(Parser, Debug)]
#[command(name = "groved", version, about)]
struct Cli {
    /// Data directory (env: GROVE_ROOT; default: ~/.grove)
    #[arg(long)]
    root: Option<PathBuf>,
}

fn default_root() -> PathBuf {
    if let Some(root) = std::env::var_os("GROVE_ROOT") {
        return PathBuf::from(root);
    }
    let home = std::env::var_os("HOME").unwrap_or_else(|| "/tmp".into());
    PathBuf::from(home).join(".grove")
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    let root = cli.root.unwrap_or_else(default_root);

    // Recoverable init failures exit zero so a service manager does not
    // restart-loop on a machine where Docker is simply not running yet.
    if let Err(e) = container::validate_docker() {
        error!("{e}");
        return ExitCode::SUCCESS;
    }

    let supervisor = match Supervisor::new(&root) {
        Ok(s) => s,
        Err(e) => {
            error!(root = %root.display(), "daemon init: {e}");
            return ExitCode::SUCCESS;
        }
    };

    match run(supervisor) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("daemon run: {e}");
            ExitCode::FAILURE
        }
    }
}

#[tokio::main]
async fn run(supervisor: Arc<Supervisor>) -> anyhow::Result<()> {
    let socket_path = supervisor.socket_path();
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    // Graceful shutdown on SIGINT / SIGTERM: stop accepting, remove the
    // socket, exit. In-flight instances keep their persisted snapshots and
    // reload as CRASHED on the next start.
    tokio::spawn(async move {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("received SIGINT, shutting down"),
            _ = sigterm.recv() => info!("received SIGTERM, shutting down"),
        }
        let _ = shutdown_tx.send(true);
    });

    server::serve(supervisor, &socket_path, shutdown_rx).await?;
    Ok(())
}
