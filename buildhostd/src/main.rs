//! buildhostd - build server node.
//!
//! Usually started by the `buildhost` client when no compatible server is
//! running. Serves one build (or, with node reuse, builds until idle) and
//! exits.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use buildhost_common::config::{load_settings, resolve_config_path};
use buildhost_common::{logging, CommandBuildEngine, EnvSwitches};
use buildhost_protocol::{Handshake, ServerIdentity};
use buildhostd::{ServerNode, ServerNodeConfig, ShutdownReason};
use clap::Parser;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

const DAEMON_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser, Debug)]
#[command(name = "buildhostd", version)]
#[command(about = "buildhost build server node")]
struct Cli {
    /// Path to buildhost.toml (or use BUILDHOST_CONFIG)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,

    /// Session salt mixed into the handshake (or use BUILDHOST_SESSION_SALT)
    #[arg(long, allow_negative_numbers = true)]
    salt: Option<i32>,

    /// Keep serving builds until idle instead of exiting after one
    #[arg(long)]
    node_reuse: bool,

    /// Directory holding the running/busy lock files
    #[arg(long)]
    lock_dir: Option<PathBuf>,

    /// Directory for the channel socket (Unix)
    #[arg(long)]
    channel_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let switches = EnvSwitches::from_env();
    logging::init_tracing("info", cli.debug, switches.debug_comm);

    match run(cli, switches).await {
        Ok(ShutdownReason::BusyInvariantViolated) => ExitCode::FAILURE,
        Ok(_) => ExitCode::SUCCESS,
        Err(err) => {
            error!("buildhostd failed: {:#}", err);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli, switches: EnvSwitches) -> Result<ShutdownReason> {
    let config_path = resolve_config_path(cli.config);
    let mut settings = load_settings(config_path.as_deref()).context("failed to load settings")?;
    if cli.node_reuse {
        settings.server.node_reuse = true;
    }
    if let Some(dir) = cli.lock_dir {
        settings.lock_dir = Some(dir);
    }
    if let Some(dir) = cli.channel_dir {
        settings.channel_dir = Some(dir);
    }
    // The node leaves the launch directory; relative paths must not follow it.
    settings.lock_dir = settings.lock_dir.map(absolutize).transpose()?;
    settings.channel_dir = settings.channel_dir.map(absolutize).transpose()?;
    settings.server.rest_dir = settings.server.rest_dir.map(absolutize).transpose()?;

    info!(
        "{}",
        buildhost_build_info::formatted_banner("buildhostd", DAEMON_VERSION)
    );
    if let Some(path) = config_path.as_ref() {
        info!("Using configuration {}", path.display());
    }

    let salt = cli.salt.or(switches.session_salt);
    let identity = ServerIdentity::new(
        Handshake::for_server(settings.server.node_reuse, salt),
        &settings,
    );
    let node: ServerNode = ServerNode::new(
        ServerNodeConfig {
            handshake: identity.handshake,
            channel: identity.channel,
            locks: identity.locks,
            settings: settings.server,
        },
        Arc::new(CommandBuildEngine::new()),
    );
    spawn_signal_handlers(node.shutdown_token());

    let reason = node.run().await?;
    match reason {
        ShutdownReason::BusyInvariantViolated => {
            error!("Shut down after busy-lock invariant violation")
        }
        ShutdownReason::AlreadyRunning => {
            info!("Another server already serves this identity; exiting")
        }
        other => info!(?other, "Server node stopped"),
    }
    Ok(reason)
}

fn absolutize(path: PathBuf) -> Result<PathBuf> {
    if path.is_absolute() {
        return Ok(path);
    }
    let cwd = std::env::current_dir().context("failed to read working directory")?;
    Ok(cwd.join(path))
}

fn spawn_signal_handlers(shutdown: CancellationToken) {
    let ctrl_c = shutdown.clone();
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            info!("Received Ctrl+C; shutting down server node");
            ctrl_c.cancel();
        }
    });

    #[cfg(unix)]
    {
        let mut sigterm = match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(stream) => stream,
            Err(err) => {
                warn!("Failed to install SIGTERM handler: {}", err);
                return;
            }
        };
        tokio::spawn(async move {
            if sigterm.recv().await.is_some() {
                info!("Received SIGTERM; shutting down server node");
                shutdown.cancel();
            }
        });
    }
}
