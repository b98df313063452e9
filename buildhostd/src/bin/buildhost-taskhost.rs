//! buildhost-taskhost - runs a single task for the process that launched it.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use buildhost_common::config::{load_settings, resolve_config_path};
use buildhost_common::{logging, EnvSwitches};
use buildhost_protocol::{ChannelName, Handshake, TaskResultKind};
use buildhostd::{TaskHostConfig, TaskHostExit, TaskHostNode, TaskRegistry};
use clap::Parser;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "buildhost-taskhost", version)]
#[command(about = "buildhost out-of-process task host")]
struct Cli {
    /// Salt chosen by the launcher; isolates this host's channel
    #[arg(long, allow_negative_numbers = true)]
    salt: i32,

    /// Request the low-priority handshake flavour
    #[arg(long)]
    low_priority: bool,

    /// Directory for the channel socket (Unix)
    #[arg(long)]
    channel_dir: Option<PathBuf>,

    /// Path to buildhost.toml (or use BUILDHOST_CONFIG)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let switches = EnvSwitches::from_env();
    logging::init_tracing("info", cli.debug, switches.debug_comm);

    match run(cli).await {
        Ok(TaskHostExit::Completed(TaskResultKind::Success)) => ExitCode::SUCCESS,
        Ok(exit) => {
            info!(?exit, "task host finished without a successful task");
            ExitCode::FAILURE
        }
        Err(err) => {
            error!("buildhost-taskhost failed: {:#}", err);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<TaskHostExit> {
    let config_path = resolve_config_path(cli.config);
    let settings = load_settings(config_path.as_deref()).context("failed to load settings")?;
    info!(
        "{}",
        buildhost_build_info::formatted_banner("buildhost-taskhost", env!("CARGO_PKG_VERSION"))
    );

    let handshake = Handshake::for_task_host(cli.low_priority, Some(cli.salt));
    let channel_dir = cli.channel_dir.or(settings.channel_dir);
    let channel = ChannelName::for_handshake(&handshake, channel_dir.as_deref());
    let node: TaskHostNode = TaskHostNode::new(
        TaskHostConfig {
            handshake,
            channel,
            handshake_timeout: settings.task_host.handshake_timeout(),
            accept_timeout: settings.task_host.launch_timeout(),
        },
        TaskRegistry::with_builtins(),
    );

    let shutdown = node.shutdown_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received Ctrl+C; stopping task host");
            shutdown.cancel();
        }
    });

    node.run().await
}
