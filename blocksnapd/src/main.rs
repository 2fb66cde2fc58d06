use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use log::{info, warn};
use tokio::net::TcpListener;
use tokio::signal::unix::{SignalKind, signal};

use blocksnapd::api::{AppState, all_routes};
use blocksnapd::config::Config;
use blocksnapd::mount::MountWatcher;
use blocksnapd::registry::Registry;

#[derive(Parser, Debug)]
#[command(name = "blocksnapd")]
#[command(about = "Block device snapshot and incremental tracking daemon")]
struct Args {
    /// Path to config file
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,
    /// Override the configured listen address
    #[arg(long)]
    listen: Option<String>,
    /// Disable the mount-table watcher (automatic transitions)
    #[arg(long)]
    no_mount_watcher: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();

    let config = match args.config.clone() {
        Some(path) => Config::load_from(path),
        None => Config::load(),
    };

    let registry = Registry::new(config.engine.clone());

    let watcher = if config.daemon.mount_watcher && !args.no_mount_watcher {
        let watcher = MountWatcher::spawn(
            Arc::clone(&registry),
            Duration::from_millis(config.daemon.mount_poll_ms),
        )
        .context("failed to start mount watcher")?;
        info!("mount watcher polling every {}ms", config.daemon.mount_poll_ms);
        Some(watcher)
    } else {
        info!("mount watcher disabled; automatic transitions are off");
        None
    };

    let listen = args.listen.unwrap_or_else(|| config.daemon.listen.clone());
    let state = Arc::new(AppState {
        registry: Arc::clone(&registry),
    });
    let api = all_routes(state);
    let listener = TcpListener::bind(&listen)
        .await
        .with_context(|| format!("failed to bind control surface on {listen}"))?;
    info!("control surface on http://{listen}");

    tokio::spawn(async move {
        if let Err(err) = axum::serve(listener, api).await {
            eprintln!("server error: {err}");
        }
    });

    let mut sigterm = signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("interrupt received, shutting down"),
        _ = sigterm.recv() => info!("SIGTERM received, shutting down"),
    }

    if let Some(watcher) = watcher {
        watcher.stop();
    }

    // Destroying every tracer restores the submit paths, joins the workers
    // and removes the COW files; surviving a restart is what reload is for.
    let teardown = tokio::task::spawn_blocking(move || {
        let devices = {
            let _guard = registry.lock_control();
            registry.tracers()
        };
        for dev in devices {
            info!("destroying tracer minor {}", dev.minor());
            let _guard = registry.lock_control();
            dev.destroy(&registry);
        }
    });
    if teardown.await.is_err() {
        warn!("teardown task failed");
    }

    Ok(())
}
