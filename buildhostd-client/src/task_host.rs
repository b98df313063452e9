//! Launcher side of the task-host conversation.
//!
//! Each task gets a fresh host under a random salt, so its channel can never
//! collide with a server node or another task host.

use std::marker::PhantomData;
use std::path::PathBuf;
use std::sync::Arc;

use buildhost_common::config::TaskHostSettings;
use buildhost_protocol::endpoint::connect;
use buildhost_protocol::{
    Cancel, ChannelName, DefaultBackend, Handshake, IpcBackend, LogEvent, Packet, PacketFactory,
    PacketType, TaskCommand, TaskComplete,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::launcher::HostSpawner;

/// Why a task produced no `TaskComplete`.
#[derive(Debug, thiserror::Error)]
pub enum TaskHostFailure {
    /// The host never ran anything; a generic error is enough.
    #[error("task host could not be started: {0}")]
    Setup(String),
    /// The host died with the task started; side effects may already exist.
    #[error("task host failed while running the task: {0}")]
    Execution(String),
}

pub struct TaskHostLauncher<B: IpcBackend = DefaultBackend> {
    spawner: Arc<dyn HostSpawner>,
    settings: TaskHostSettings,
    channel_dir: Option<PathBuf>,
    low_priority: bool,
    _backend: PhantomData<B>,
}

impl<B: IpcBackend> TaskHostLauncher<B> {
    pub fn new(
        spawner: Arc<dyn HostSpawner>,
        settings: TaskHostSettings,
        channel_dir: Option<PathBuf>,
    ) -> Self {
        Self {
            spawner,
            settings,
            channel_dir,
            low_priority: false,
            _backend: PhantomData,
        }
    }

    pub fn low_priority(mut self, low_priority: bool) -> Self {
        self.low_priority = low_priority;
        self
    }

    /// Run `command` in a fresh task host. `on_log` sees every `LogMessage`
    /// in arrival order; cancelling `cancel` sends a `Cancel` packet.
    pub async fn run_task<F>(
        &self,
        command: TaskCommand,
        mut on_log: F,
        cancel: CancellationToken,
    ) -> Result<TaskComplete, TaskHostFailure>
    where
        F: FnMut(LogEvent),
    {
        let salt = rand::random::<i32>();
        let handshake = Handshake::for_task_host(self.low_priority, Some(salt));
        let channel = ChannelName::for_handshake(&handshake, self.channel_dir.as_deref());
        let task_name = command.task_name.clone();

        self.spawner
            .spawn(&handshake, &channel)
            .map_err(|err| TaskHostFailure::Setup(err.to_string()))?;
        debug!(task = %task_name, channel = %channel.name(), "task host spawned");

        let mut endpoint = connect::<B>(
            channel.addr(),
            &handshake,
            self.settings.launch_timeout(),
            self.settings.handshake_timeout(),
        )
        .await
        .map_err(|err| TaskHostFailure::Setup(err.to_string()))?;

        let conn_shutdown = CancellationToken::new();
        let mut pump = endpoint
            .start_pump(
                Arc::new(PacketFactory::for_task_launcher()),
                Some(PacketType::TaskComplete),
                conn_shutdown.clone(),
            )
            .map_err(|err| TaskHostFailure::Setup(err.to_string()))?;
        if let Err(err) = endpoint.send(&command.into()).await {
            conn_shutdown.cancel();
            return Err(TaskHostFailure::Setup(err.to_string()));
        }

        let mut cancel_sent = false;
        let complete = loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled(), if !cancel_sent => {
                    cancel_sent = true;
                    info!(task = %task_name, "cancelling task");
                    if let Err(err) = endpoint.send(&Cancel.into()).await {
                        warn!("failed to send cancel to task host: {}", err);
                    }
                }
                packet = pump.recv() => match packet {
                    Some(Packet::LogMessage(message)) => on_log(message.event),
                    Some(Packet::TaskComplete(done)) => break Some(done),
                    Some(other) => warn!(packet = ?other.packet_type(), "ignoring unexpected packet"),
                    None => break None,
                },
            }
        };
        endpoint.disconnect().await;
        conn_shutdown.cancel();
        let pump_exit = pump.join().await;

        match complete {
            Some(done) => {
                debug!(task = %task_name, result = ?done.result, "task complete");
                Ok(done)
            }
            None => Err(TaskHostFailure::Execution(format!(
                "task host for {} disconnected before completing ({:?})",
                task_name, pump_exit
            ))),
        }
    }
}
