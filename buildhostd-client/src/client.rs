//! Client orchestrator: reuse or start a server node, hand it one build and
//! relay its console until the result arrives.
//!
//! `NotConnected -> Connecting -> Connected -> AwaitingResult -> Done`, with
//! `Fallback` when the server is busy or unreachable and `Unexpected` when
//! the conversation breaks after it started.

use std::collections::BTreeMap;
use std::io;
use std::marker::PhantomData;
use std::path::PathBuf;
use std::sync::Arc;

use buildhost_common::config::ClientSettings;
use buildhost_common::{ConsoleSink, ExitType, NamedLock, ServerStatus};
use buildhost_protocol::endpoint::connect;
use buildhost_protocol::{
    BuildCommand, BuildResult, Cancel, DefaultBackend, IpcBackend, LinkError, Packet,
    PacketFactory, PacketType, ServerIdentity,
};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::launcher::ServerLauncher;

/// Closed set of client outcomes; each one needs its own handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientExitType {
    /// The server ran the build and reported a result (which may be a failure).
    Success,
    ServerBusy,
    ConnectionError,
    LaunchError,
    Unexpected,
}

impl ClientExitType {
    /// Nothing reached a server, so running the build in-process is safe.
    pub fn should_fall_back(self) -> bool {
        matches!(
            self,
            Self::ServerBusy | Self::ConnectionError | Self::LaunchError
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    NotConnected,
    Connecting,
    Connected,
    AwaitingResult,
    Done,
    Fallback,
    Unexpected,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientOutcome {
    pub exit_type: ClientExitType,
    /// Present only for [`ClientExitType::Success`].
    pub result: Option<BuildResult>,
}

impl ClientOutcome {
    fn without_result(exit_type: ClientExitType) -> Self {
        Self {
            exit_type,
            result: None,
        }
    }

    pub fn build_exit_type(&self) -> ExitType {
        self.result
            .as_ref()
            .map(BuildResult::exit_type)
            .unwrap_or(ExitType::Unexpected)
    }

    /// 0 only when the server reported `Success`.
    pub fn process_exit_code(&self) -> i32 {
        self.build_exit_type().process_exit_code()
    }
}

/// Everything the server needs to reproduce this invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildRequest {
    pub command_line: String,
    pub startup_directory: PathBuf,
    pub environment: BTreeMap<String, String>,
    pub culture: String,
    pub ui_culture: String,
}

impl BuildRequest {
    /// Snapshot the current directory, environment and locale.
    pub fn from_current_process(command_line: impl Into<String>) -> io::Result<Self> {
        let environment: BTreeMap<String, String> = std::env::vars().collect();
        let culture = culture_from_env(&environment, &["LC_ALL", "LC_CTYPE", "LANG"]);
        let ui_culture = culture_from_env(&environment, &["LC_ALL", "LC_MESSAGES", "LANG"]);
        Ok(Self {
            command_line: command_line.into(),
            startup_directory: std::env::current_dir()?,
            environment,
            culture,
            ui_culture,
        })
    }

    pub fn to_command(&self) -> BuildCommand {
        BuildCommand {
            command_line: self.command_line.clone(),
            startup_directory: self.startup_directory.to_string_lossy().into_owned(),
            environment: self.environment.clone(),
            culture: self.culture.clone(),
            ui_culture: self.ui_culture.clone(),
        }
    }
}

/// `en_US.UTF-8` -> `en-US`; `C`/`POSIX` and unset -> empty (invariant).
fn culture_from_env(env: &BTreeMap<String, String>, keys: &[&str]) -> String {
    let raw = keys
        .iter()
        .filter_map(|key| env.get(*key))
        .find(|value| !value.trim().is_empty());
    let Some(raw) = raw else {
        return String::new();
    };
    let name = raw
        .split(['.', '@'])
        .next()
        .unwrap_or_default()
        .trim()
        .replace('_', "-");
    if name == "C" || name == "POSIX" {
        String::new()
    } else {
        name
    }
}

pub struct BuildClient<B: IpcBackend = DefaultBackend> {
    identity: ServerIdentity,
    settings: ClientSettings,
    launcher: Arc<dyn ServerLauncher>,
    state: ClientState,
    _backend: PhantomData<B>,
}

impl<B: IpcBackend> BuildClient<B> {
    pub fn new(
        identity: ServerIdentity,
        settings: ClientSettings,
        launcher: Arc<dyn ServerLauncher>,
    ) -> Self {
        Self {
            identity,
            settings,
            launcher,
            state: ClientState::NotConnected,
            _backend: PhantomData,
        }
    }

    pub fn state(&self) -> ClientState {
        self.state
    }

    fn set_state(&mut self, next: ClientState) {
        debug!(from = ?self.state, to = ?next, "client state");
        self.state = next;
    }

    fn fall_back(&mut self, exit_type: ClientExitType) -> ClientOutcome {
        self.set_state(ClientState::Fallback);
        ClientOutcome::without_result(exit_type)
    }

    fn unexpected(&mut self) -> ClientOutcome {
        self.set_state(ClientState::Unexpected);
        ClientOutcome::without_result(ClientExitType::Unexpected)
    }

    /// Run one build on a server node, rendering its console on `console`.
    /// Cancelling `cancel` forwards a `Cancel` packet; the server still
    /// answers with a `BuildResult`.
    pub async fn execute(
        &mut self,
        request: &BuildRequest,
        console: &dyn ConsoleSink,
        cancel: CancellationToken,
    ) -> ClientOutcome {
        self.set_state(ClientState::Connecting);
        let fingerprint = self.identity.handshake.fingerprint();

        let status = match self.identity.locks.status() {
            Ok(status) => status,
            Err(err) => {
                warn!(%fingerprint, "cannot probe server locks: {}", err);
                return self.fall_back(ClientExitType::ConnectionError);
            }
        };
        debug!(%fingerprint, ?status, "server status");

        // Held until our handshake completes so racing clients see the new server.
        let mut launch_guard: Option<NamedLock> = None;
        let connect_timeout = match status {
            ServerStatus::Busy => {
                info!(%fingerprint, "server is busy");
                return self.fall_back(ClientExitType::ServerBusy);
            }
            ServerStatus::Idle => self.settings.existing_server_connect_timeout(),
            ServerStatus::NotRunning => match self.launch_server().await {
                Ok(Launched::Fresh(guard)) => {
                    launch_guard = Some(guard);
                    self.settings.fresh_server_connect_timeout()
                }
                Ok(Launched::ByOther(ServerStatus::Busy)) => {
                    return self.fall_back(ClientExitType::ServerBusy)
                }
                Ok(Launched::ByOther(_)) => self.settings.existing_server_connect_timeout(),
                Err(exit_type) => return self.fall_back(exit_type),
            },
        };

        let mut endpoint = match connect::<B>(
            self.identity.channel.addr(),
            &self.identity.handshake,
            connect_timeout,
            self.settings.handshake_timeout(),
        )
        .await
        {
            Ok(endpoint) => endpoint,
            Err(err) => {
                match &err {
                    LinkError::Handshake(_) => warn!(%fingerprint, "server rejected handshake: {}", err),
                    _ => info!(%fingerprint, "cannot reach server: {}", err),
                }
                return self.fall_back(ClientExitType::ConnectionError);
            }
        };
        drop(launch_guard);
        self.set_state(ClientState::Connected);

        let conn_shutdown = CancellationToken::new();
        let mut pump = match endpoint.start_pump(
            Arc::new(PacketFactory::for_client()),
            Some(PacketType::BuildResult),
            conn_shutdown.clone(),
        ) {
            Ok(pump) => pump,
            Err(err) => {
                warn!("failed to start packet pump: {}", err);
                return self.unexpected();
            }
        };

        if let Err(err) = endpoint.send(&request.to_command().into()).await {
            warn!("failed to send build command: {}", err);
            conn_shutdown.cancel();
            return self.unexpected();
        }
        self.set_state(ClientState::AwaitingResult);

        let mut cancel_sent = false;
        let result = loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled(), if !cancel_sent => {
                    cancel_sent = true;
                    info!("forwarding cancel to server");
                    if let Err(err) = endpoint.send(&Cancel.into()).await {
                        warn!("failed to send cancel: {}", err);
                    }
                }
                packet = pump.recv() => match packet {
                    Some(Packet::ConsoleWrite(write)) => console.write(write.stream, &write.text),
                    Some(Packet::BuildResult(result)) => break Some(result),
                    Some(other) => warn!(packet = ?other.packet_type(), "ignoring unexpected packet"),
                    None => break None,
                },
            }
        };
        console.flush();
        endpoint.disconnect().await;
        conn_shutdown.cancel();
        let pump_exit = pump.join().await;

        match result {
            Some(result) => {
                debug!(exit_code = result.exit_code, exit_type = %result.exit_type, "build result");
                self.set_state(ClientState::Done);
                ClientOutcome {
                    exit_type: ClientExitType::Success,
                    result: Some(result),
                }
            }
            None => {
                warn!(?pump_exit, "connection lost before build result");
                self.unexpected()
            }
        }
    }

    /// Start a server unless a racing client already did.
    async fn launch_server(&self) -> Result<Launched, ClientExitType> {
        let locks = &self.identity.locks;
        let guard = match locks
            .acquire_launch_lock(self.settings.fresh_server_connect_timeout())
            .await
        {
            Ok(Some(guard)) => guard,
            Ok(None) => {
                warn!("timed out waiting for another client's server launch");
                return Err(ClientExitType::LaunchError);
            }
            Err(err) => {
                warn!("cannot take launch lock: {}", err);
                return Err(ClientExitType::LaunchError);
            }
        };

        match locks.status() {
            Ok(ServerStatus::NotRunning) => {}
            Ok(status) => {
                debug!(?status, "server appeared while waiting to launch");
                return Ok(Launched::ByOther(status));
            }
            Err(err) => {
                warn!("cannot probe server locks: {}", err);
                return Err(ClientExitType::ConnectionError);
            }
        }

        match self.launcher.launch(&self.identity) {
            Ok(()) => Ok(Launched::Fresh(guard)),
            Err(err) => {
                warn!("failed to launch server: {}", err);
                Err(ClientExitType::LaunchError)
            }
        }
    }
}

enum Launched {
    Fresh(NamedLock),
    ByOther(ServerStatus),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn only_pre_conversation_failures_fall_back() {
        assert!(ClientExitType::ServerBusy.should_fall_back());
        assert!(ClientExitType::ConnectionError.should_fall_back());
        assert!(ClientExitType::LaunchError.should_fall_back());
        assert!(!ClientExitType::Success.should_fall_back());
        assert!(!ClientExitType::Unexpected.should_fall_back());
    }

    #[test]
    fn outcome_exit_code_follows_build_result() {
        let ok = ClientOutcome {
            exit_type: ClientExitType::Success,
            result: Some(BuildResult::new(0, ExitType::Success)),
        };
        assert_eq!(ok.process_exit_code(), 0);

        let failed = ClientOutcome {
            exit_type: ClientExitType::Success,
            result: Some(BuildResult::new(1, ExitType::BuildError)),
        };
        assert_eq!(failed.process_exit_code(), 1);

        let lost = ClientOutcome::without_result(ClientExitType::Unexpected);
        assert_eq!(lost.build_exit_type(), ExitType::Unexpected);
        assert_eq!(lost.process_exit_code(), 1);
    }

    #[test]
    fn culture_comes_from_locale_variables() {
        let vars = env(&[("LANG", "en_US.UTF-8"), ("LC_MESSAGES", "fr_FR@euro")]);
        assert_eq!(culture_from_env(&vars, &["LC_ALL", "LC_CTYPE", "LANG"]), "en-US");
        assert_eq!(
            culture_from_env(&vars, &["LC_ALL", "LC_MESSAGES", "LANG"]),
            "fr-FR"
        );
        assert_eq!(culture_from_env(&env(&[("LANG", "C")]), &["LANG"]), "");
        assert_eq!(culture_from_env(&env(&[]), &["LANG"]), "");
    }

    #[test]
    fn request_maps_onto_build_command() {
        let request = BuildRequest {
            command_line: "build.proj".into(),
            startup_directory: PathBuf::from("/work"),
            environment: env(&[("X", "1")]),
            culture: "en-US".into(),
            ui_culture: "en-US".into(),
        };
        let command = request.to_command();
        assert_eq!(command.command_line, "build.proj");
        assert_eq!(command.startup_directory, "/work");
        assert_eq!(command.environment.get("X").map(String::as_str), Some("1"));
    }
}
