//! Task host node: runs exactly one task for a launcher.
//!
//! Conversation: `TaskCommand` -> zero or more `LogMessage` -> one
//! `TaskComplete`. A `Cancel` may arrive at any time before completion and is
//! unioned with the task's own timeout.

use std::marker::PhantomData;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use buildhost_protocol::{
    ChannelName, DefaultBackend, Handshake, IpcBackend, IpcListener, LinkStatus, NodeEndpoint,
    Packet, PacketFactory, TaskCommand, TaskComplete, TaskResultKind,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::runners::{TaskContext, TaskError, TaskLog, TaskRegistry};

pub struct TaskHostConfig {
    pub handshake: Handshake,
    pub channel: ChannelName,
    pub handshake_timeout: Duration,
    /// How long to wait for the launcher to connect.
    pub accept_timeout: Duration,
}

/// How the task host ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskHostExit {
    Completed(TaskResultKind),
    /// Launcher never connected, or never sent a `TaskCommand`.
    NoTask,
    ShutdownRequested,
}

pub struct TaskHostNode<B: IpcBackend = DefaultBackend> {
    config: TaskHostConfig,
    registry: Arc<TaskRegistry>,
    shutdown: CancellationToken,
    _backend: PhantomData<B>,
}

impl<B: IpcBackend> TaskHostNode<B> {
    pub fn new(config: TaskHostConfig, registry: TaskRegistry) -> Self {
        Self {
            config,
            registry: Arc::new(registry),
            shutdown: CancellationToken::new(),
            _backend: PhantomData,
        }
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub async fn run(&self) -> Result<TaskHostExit> {
        let addr = self.config.channel.addr().to_string();
        let mut listener = B::bind(&addr)
            .await
            .with_context(|| format!("task host failed to listen on {}", addr))?;
        debug!(%addr, "task host listening");

        let deadline = tokio::time::sleep(self.config.accept_timeout);
        tokio::pin!(deadline);
        let endpoint = loop {
            let stream = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => return Ok(TaskHostExit::ShutdownRequested),
                _ = &mut deadline => {
                    warn!("launcher never connected");
                    return Ok(TaskHostExit::NoTask);
                }
                accepted = listener.accept() => accepted.context("task host accept failed")?,
            };
            match NodeEndpoint::establish(stream, &self.config.handshake, self.config.handshake_timeout).await {
                Ok(endpoint) => break endpoint,
                Err(err) => warn!("rejected launcher connection: {}", err),
            }
        };

        self.serve(endpoint).await
    }

    async fn serve(&self, mut endpoint: NodeEndpoint<B::Stream>) -> Result<TaskHostExit> {
        let conn_shutdown = self.shutdown.child_token();
        let mut pump = endpoint.start_pump(
            Arc::new(PacketFactory::for_task_host()),
            None,
            conn_shutdown.clone(),
        )?;

        // Wait for the command; a Cancel before it means there is nothing to run.
        let command = loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => return Ok(TaskHostExit::ShutdownRequested),
                packet = pump.recv() => match packet {
                    Some(Packet::TaskCommand(command)) => break command,
                    Some(Packet::Cancel(_)) => {
                        info!("cancelled before any task was sent");
                        let done = TaskComplete::with_error(TaskResultKind::Failure, "cancelled before start");
                        endpoint.send(&done.into()).await?;
                        return Ok(TaskHostExit::Completed(TaskResultKind::Failure));
                    }
                    Some(other) => warn!(packet = ?other.packet_type(), "ignoring unexpected packet"),
                    None => return Ok(TaskHostExit::NoTask),
                },
            }
        };

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Packet>();
        let cancel = CancellationToken::new();
        arm_timeout(&cancel, command.timeout_ms);
        let mut task = tokio::spawn(run_task(self.registry.clone(), command, TaskLog::new(out_tx), cancel.clone()));

        let mut launcher_open = true;
        let complete = loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled(), if !cancel.is_cancelled() => cancel.cancel(),
                packet = pump.recv(), if launcher_open => match packet {
                    Some(Packet::Cancel(_)) => {
                        info!("task cancelled by launcher");
                        cancel.cancel();
                    }
                    Some(other) => warn!(packet = ?other.packet_type(), "ignoring packet during task"),
                    None => {
                        // Launcher gone: nobody will read the result.
                        launcher_open = false;
                        cancel.cancel();
                    }
                },
                Some(log) = out_rx.recv() => {
                    if let Err(err) = endpoint.send(&log).await {
                        warn!("lost launcher while relaying logs: {}", err);
                        launcher_open = false;
                        cancel.cancel();
                    }
                }
                done = &mut task => {
                    break done.unwrap_or_else(|err| {
                        TaskComplete::with_error(TaskResultKind::CrashedDuringExecution, err.to_string())
                    });
                }
            }
        };

        let result = complete.result;
        if launcher_open && endpoint.status() == LinkStatus::Active {
            // Logs queued before completion go out first.
            while let Ok(log) = out_rx.try_recv() {
                endpoint.send(&log).await?;
            }
            endpoint.send(&complete.into()).await?;
            endpoint.disconnect().await;
        }
        conn_shutdown.cancel();
        let _ = pump.join().await;
        info!(?result, "task finished");
        Ok(TaskHostExit::Completed(result))
    }
}

fn arm_timeout(cancel: &CancellationToken, timeout_ms: Option<i64>) {
    let Some(ms) = timeout_ms.filter(|ms| *ms > 0) else {
        return;
    };
    let cancel = cancel.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = cancel.cancelled() => {}
            _ = tokio::time::sleep(Duration::from_millis(ms as u64)) => {
                info!(timeout_ms = ms, "task timed out");
                cancel.cancel();
            }
        }
    });
}

async fn run_task(
    registry: Arc<TaskRegistry>,
    command: TaskCommand,
    log: TaskLog,
    cancel: CancellationToken,
) -> TaskComplete {
    let Some(runner) = registry.get(&command.task_name) else {
        warn!(task = %command.task_name, "unknown task");
        return TaskComplete::with_error(
            TaskResultKind::CrashedDuringInitialization,
            format!("task \"{}\" is not known to this host", command.task_name),
        );
    };

    let ctx = TaskContext {
        parameters: command.parameters,
        working_directory: PathBuf::from(command.working_directory),
        environment: command.environment,
        log,
        cancellation: cancel,
    };
    let task_name = command.task_name;
    let joined = tokio::task::spawn_blocking(move || {
        std::panic::catch_unwind(AssertUnwindSafe(|| runner.execute(&ctx)))
    })
    .await;

    match joined {
        Ok(Ok(Ok(outputs))) => TaskComplete::success(outputs),
        Ok(Ok(Err(TaskError::MissingParameter(name)))) => TaskComplete::with_error(
            TaskResultKind::CrashedDuringInitialization,
            format!("{}: required parameter {} is missing", task_name, name),
        ),
        Ok(Ok(Err(err))) => TaskComplete::with_error(TaskResultKind::Failure, err.to_string()),
        Ok(Err(_)) | Err(_) => TaskComplete::with_error(
            TaskResultKind::CrashedDuringExecution,
            format!("{} panicked", task_name),
        ),
    }
}
