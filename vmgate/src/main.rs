mod cli;
mod config;
mod connection;
mod core;
mod download;
mod hypervisor;
mod interact;
mod keystore;
mod progress;
mod server;
mod session;
#[cfg(test)]
mod testutil;
mod workers;

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rand::Rng;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::core::Core;
use crate::download::HttpDownloader;
use crate::hypervisor::{HypervisorPlatform, NoDriversPlatform};
use crate::keystore::TrustStore;
use crate::server::ServerState;

#[derive(Parser)]
#[command(name = "vmgate", about = "Local trust broker for browser-driven virtual machines")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the daemon (loopback HTTP + WebSocket).
    Serve {
        /// Path to config file (TOML).
        #[arg(long, short)]
        config: Option<PathBuf>,
    },
    /// Verify prerequisites without starting the daemon. Exits 0 if all pass.
    Check {
        /// Path to config file (TOML).
        #[arg(long, short)]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Check { config } => {
            let config = cli::load_config(config)?;
            cli::run_check(&config)?;
        }
        Commands::Serve { config } => {
            let config = cli::load_config(config)?;
            serve(config).await?;
        }
    }

    Ok(())
}

async fn serve(config: Config) -> Result<()> {
    std::fs::create_dir_all(&config.server.state_dir)
        .with_context(|| format!("creating state dir {}", config.server.state_dir.display()))?;

    // Exclusive instance lock: two daemons on one state dir would race
    // the session registry and fight over the port.
    let lock_file = std::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .open(config.server.lock_path())
        .context("failed to open instance lock file")?;
    use std::os::unix::io::AsRawFd;
    if unsafe { libc::flock(lock_file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) } != 0 {
        anyhow::bail!(
            "Another vmgate instance is already running.\n\
             Stop it first, or open http://127.0.0.1:{}/control.html to inspect it.",
            config.server.port
        );
    }
    // lock_file must stay alive for the entire serve duration.

    let host_key = load_or_create_host_key(&config.server.host_key_path())?;

    let keystore = Arc::new(TrustStore::new(
        config.trust.authorized_url.clone(),
        config.trust.local_auth_key.clone(),
    ));
    let downloader = Arc::new(HttpDownloader::new());
    // Driver backends register here when compiled in.
    let platform: Arc<dyn HypervisorPlatform> = Arc::new(NoDriversPlatform);

    let core = Core::new(config.clone(), platform, keystore, downloader, host_key);
    core.sync_hypervisor_reflection().await;
    if core.hypervisor().await.is_none() {
        info!("no hypervisor detected; session requests will route through the installer gate");
    }

    let state = ServerState::new(core.clone());
    let app = server::router(state.clone());
    let addr = SocketAddr::from((config.server.bind_addr, config.server.port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {}", addr))?;
    info!(%addr, "vmgate listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(core, state, config.server.idle_exit_secs))
        .await?;

    info!("vmgate shut down");
    drop(lock_file);
    Ok(())
}

/// Resolves when the daemon should exit: a termination signal, a
/// privileged `stopService`, or the idle deadline with no connections.
async fn shutdown_signal(core: Arc<Core>, state: Arc<ServerState>, idle_exit_secs: u64) {
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .expect("failed to register SIGTERM handler");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("received SIGINT, shutting down");
        }
        _ = sigterm.recv() => {
            info!("received SIGTERM, shutting down");
        }
        _ = core.wait_shutdown() => {
            info!("stop requested over the wire, shutting down");
        }
        _ = idle_exit(state, idle_exit_secs) => {
            info!(idle_exit_secs, "no connections, exiting");
        }
    }
}

async fn idle_exit(state: Arc<ServerState>, idle_exit_secs: u64) {
    let deadline = Duration::from_secs(idle_exit_secs);
    let mut interval = tokio::time::interval(Duration::from_secs(1));
    loop {
        interval.tick().await;
        if state.live() == 0 && state.idle_for() >= deadline {
            return;
        }
    }
}

/// The per-install host key feeds the per-domain host id. Generated once
/// and persisted so the id stays stable across restarts.
fn load_or_create_host_key(path: &Path) -> Result<String> {
    if let Ok(existing) = std::fs::read_to_string(path) {
        let existing = existing.trim().to_string();
        if !existing.is_empty() {
            return Ok(existing);
        }
    }

    let mut rng = rand::thread_rng();
    let bytes: [u8; 32] = rng.gen();
    let key: String = bytes.iter().map(|b| format!("{:02x}", b)).collect();
    std::fs::write(path, &key)
        .with_context(|| format!("writing host key {}", path.display()))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let _ = std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600));
    }
    Ok(key)
}
