//! buildhost - run a build, on a shared server node when enabled.
//!
//! With `BUILDHOST_USE_SERVER=1` (or `--server`) the build goes to a server
//! node, which is started on demand. A busy or unreachable server falls back
//! to building in-process with identical exit semantics.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use buildhost_common::config::{load_settings, resolve_config_path, Settings};
use buildhost_common::{
    logging, BuildContext, BuildEngine, CommandBuildEngine, EnvSwitches, ExitType, StdConsole,
};
use buildhost_protocol::{LogKind, ServerIdentity, TaskCommand, TaskResultKind};
use buildhostd_client::{
    BuildClient, BuildRequest, ClientExitType, ProcessLauncher, TaskHostFailure, TaskHostLauncher,
};
use clap::Parser;
use serde_json::json;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "buildhost", version)]
#[command(about = "Run builds, optionally through a shared build server")]
struct Cli {
    /// Command line to build
    #[arg(trailing_var_arg = true)]
    command: Vec<String>,

    /// Path to buildhost.toml (or use BUILDHOST_CONFIG)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,

    /// Route the build through a server node (same as BUILDHOST_USE_SERVER=1)
    #[arg(long)]
    server: bool,

    /// Print whether a server node for this configuration is running
    #[arg(long, conflicts_with = "task")]
    server_status: bool,

    /// Print --server-status as JSON
    #[arg(long, requires = "server_status")]
    json: bool,

    /// Run a single task in a task host instead of a build
    #[arg(long)]
    task: Option<String>,

    /// Task parameter as NAME=VALUE (repeatable)
    #[arg(long = "param", value_parser = parse_param)]
    params: Vec<(String, String)>,

    /// Task timeout in milliseconds
    #[arg(long)]
    task_timeout_ms: Option<i64>,
}

fn parse_param(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((name, value)) if !name.trim().is_empty() => {
            Ok((name.trim().to_string(), value.to_string()))
        }
        _ => Err(format!("expected NAME=VALUE, got '{}'", raw)),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let switches = EnvSwitches::from_env();
    logging::init_tracing("warn", cli.debug, switches.debug_comm);

    match run(cli, switches).await {
        Ok(code) => ExitCode::from(code),
        Err(err) => {
            eprintln!("buildhost: {:#}", err);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli, switches: EnvSwitches) -> Result<u8> {
    let config_path = resolve_config_path(cli.config.clone());
    let settings = load_settings(config_path.as_deref()).context("failed to load settings")?;
    info!(
        "{}",
        buildhost_build_info::formatted_banner("buildhost", env!("CARGO_PKG_VERSION"))
    );

    let launcher = Arc::new(ProcessLauncher {
        server_binary: settings.client.server_binary.clone(),
        taskhost_binary: settings.task_host.binary.clone(),
        config_path,
        lock_dir: settings.lock_dir.clone(),
        channel_dir: settings.channel_dir.clone(),
        debug: cli.debug,
    });

    if cli.server_status {
        print_server_status(&settings, &switches, cli.json)?;
        return Ok(0);
    }

    let cancel = CancellationToken::new();
    spawn_ctrl_c(cancel.clone());

    if let Some(task_name) = cli.task {
        return run_task(&settings, launcher, task_name, cli.params, cli.task_timeout_ms, cancel)
            .await;
    }

    if cli.command.is_empty() {
        bail!("nothing to build: pass a command line");
    }
    let request = BuildRequest::from_current_process(cli.command.join(" "))
        .context("failed to capture build context")?;

    if cli.server || switches.use_server {
        let identity = ServerIdentity::from_settings(&settings, &switches);
        let mut client: BuildClient = BuildClient::new(identity, settings.client.clone(), launcher);
        let outcome = client.execute(&request, &StdConsole, cancel.clone()).await;
        match outcome.exit_type {
            ClientExitType::Success => return Ok(exit_code(outcome.build_exit_type())),
            ClientExitType::Unexpected => {
                bail!("lost the connection to the build server mid-build")
            }
            other => warn!(outcome = ?other, "server unavailable; building in-process"),
        }
    }

    let exit_type = build_in_process(request, cancel).await?;
    Ok(exit_code(exit_type))
}

fn exit_code(exit_type: ExitType) -> u8 {
    exit_type.process_exit_code() as u8
}

async fn build_in_process(request: BuildRequest, cancel: CancellationToken) -> Result<ExitType> {
    let ctx = BuildContext {
        command_line: request.command_line,
        working_directory: request.startup_directory,
        environment: request.environment,
        culture: request.culture,
        ui_culture: request.ui_culture,
        console: Arc::new(StdConsole),
        cancellation: cancel,
    };
    let outcome = tokio::task::spawn_blocking(move || CommandBuildEngine::new().build(&ctx))
        .await
        .context("in-process build crashed")?;
    info!(exit_code = outcome.exit_code, exit_type = outcome.exit_type.label(), "build finished");
    Ok(outcome.exit_type)
}

fn print_server_status(settings: &Settings, switches: &EnvSwitches, as_json: bool) -> Result<()> {
    let identity = ServerIdentity::from_settings(settings, switches);
    let status = identity
        .locks
        .status()
        .context("failed to probe server locks")?;
    if as_json {
        let report = json!({
            "status": status,
            "fingerprint": identity.handshake.fingerprint(),
            "channel": identity.channel.addr(),
            "lock_dir": identity.locks.scope().dir(),
            "node_reuse": settings.server.node_reuse,
        });
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!(
            "server {}: {:?} ({})",
            identity.handshake.fingerprint(),
            status,
            identity.channel.addr()
        );
    }
    Ok(())
}

async fn run_task(
    settings: &Settings,
    launcher: Arc<ProcessLauncher>,
    task_name: String,
    params: Vec<(String, String)>,
    timeout_ms: Option<i64>,
    cancel: CancellationToken,
) -> Result<u8> {
    let request = BuildRequest::from_current_process(String::new())
        .context("failed to capture task context")?;
    let command = TaskCommand {
        task_name,
        working_directory: request.startup_directory.to_string_lossy().into_owned(),
        environment: request.environment,
        parameters: params.into_iter().collect::<BTreeMap<_, _>>(),
        culture: request.culture,
        ui_culture: request.ui_culture,
        timeout_ms,
    };

    let host: TaskHostLauncher =
        TaskHostLauncher::new(launcher, settings.task_host.clone(), settings.channel_dir.clone());
    let result = host
        .run_task(
            command,
            |event| match event.kind {
                LogKind::Message => println!("{}", event.text),
                LogKind::Warning => eprintln!("warning: {}", event.text),
                LogKind::Error => eprintln!("error: {}", event.text),
            },
            cancel,
        )
        .await;

    match result {
        Ok(done) => {
            for (name, value) in &done.outputs {
                println!("{} = {}", name, value);
            }
            if done.result == TaskResultKind::Success {
                return Ok(0);
            }
            eprintln!(
                "task {:?}: {}",
                done.result,
                done.error.unwrap_or_else(|| "no details".to_string())
            );
            Ok(1)
        }
        Err(TaskHostFailure::Setup(reason)) => bail!("task host could not run the task: {}", reason),
        Err(err @ TaskHostFailure::Execution(_)) => Err(err.into()),
    }
}

fn spawn_ctrl_c(cancel: CancellationToken) {
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            info!("Received Ctrl+C; cancelling");
            cancel.cancel();
        }
    });
}
