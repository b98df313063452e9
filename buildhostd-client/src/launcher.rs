//! Locating and starting the buildhost worker binaries.

use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use buildhost_protocol::{ChannelName, Handshake, HandshakeOptions, ServerIdentity};
use tokio::process::Command;
use tracing::{debug, info, warn};

pub const SERVER_BINARY: &str = "buildhostd";
pub const TASKHOST_BINARY: &str = "buildhost-taskhost";

#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error("{name} binary not found (looked in {candidates:?})")]
    BinaryNotFound {
        name: String,
        candidates: Vec<PathBuf>,
    },
    #[error("failed to spawn {binary}: {source}")]
    Spawn {
        binary: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Resolve a worker binary: configured path, then next to the current
/// executable, then the workspace `target/{debug,release}` directories.
pub fn find_binary(name: &str, configured: Option<&Path>) -> Result<PathBuf, LaunchError> {
    if let Some(path) = configured {
        if path.is_file() {
            debug!("Using configured {} binary: {}", name, path.display());
            return Ok(path.to_path_buf());
        }
        warn!("Configured {} binary {} does not exist", name, path.display());
    }

    let file_name = format!("{}{}", name, std::env::consts::EXE_SUFFIX);
    let mut candidates = Vec::new();
    if let Ok(exe_path) = std::env::current_exe() {
        if let Some(parent) = exe_path.parent() {
            candidates.push(parent.join(&file_name));
            // Test binaries live one level down, in target/<profile>/deps.
            candidates.push(parent.join("..").join(&file_name));
        }
    }
    candidates.push(PathBuf::from("./target/debug").join(&file_name));
    candidates.push(PathBuf::from("./target/release").join(&file_name));

    for candidate in &candidates {
        if candidate.is_file() {
            let path = candidate
                .canonicalize()
                .unwrap_or_else(|_| candidate.clone());
            debug!("Found {} binary at {}", name, path.display());
            return Ok(path);
        }
    }
    Err(LaunchError::BinaryNotFound {
        name: name.to_string(),
        candidates,
    })
}

/// Children start in the temp dir, so forwarded paths must not be relative.
fn absolute(path: &Path) -> PathBuf {
    if path.is_absolute() {
        return path.to_path_buf();
    }
    match std::env::current_dir() {
        Ok(cwd) => cwd.join(path),
        Err(err) => {
            warn!("cannot resolve {} against the working directory: {}", path.display(), err);
            path.to_path_buf()
        }
    }
}

/// Starts a server node for an identity. The node takes the running lock
/// itself; the launcher only has to get the process going.
pub trait ServerLauncher: Send + Sync {
    fn launch(&self, identity: &ServerIdentity) -> Result<(), LaunchError>;
}

/// Starts a task host that will listen on `channel` with `handshake`.
pub trait HostSpawner: Send + Sync {
    fn spawn(&self, handshake: &Handshake, channel: &ChannelName) -> Result<(), LaunchError>;
}

/// Launches worker binaries as detached child processes.
#[derive(Debug, Clone, Default)]
pub struct ProcessLauncher {
    pub server_binary: Option<PathBuf>,
    pub taskhost_binary: Option<PathBuf>,
    /// Forwarded as `--config` so the child derives the same settings.
    pub config_path: Option<PathBuf>,
    pub lock_dir: Option<PathBuf>,
    pub channel_dir: Option<PathBuf>,
    pub debug: bool,
}

impl ProcessLauncher {
    fn spawn_detached(&self, binary: &Path, args: Vec<OsString>) -> Result<u32, LaunchError> {
        let binary = absolute(binary);
        let mut cmd = Command::new(&binary);
        // Workers outlive the build; they must not hold the user's directory open.
        cmd.args(args)
            .current_dir(std::env::temp_dir())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(if self.debug {
                Stdio::inherit()
            } else {
                Stdio::null()
            });
        #[cfg(unix)]
        {
            // Keep Ctrl+C aimed at the client from reaching the worker.
            cmd.process_group(0);
        }
        let mut child = cmd.spawn().map_err(|source| LaunchError::Spawn {
            binary: binary.clone(),
            source,
        })?;
        let pid = child.id().unwrap_or_default();
        tokio::spawn(async move {
            let _ = child.wait().await;
        });
        Ok(pid)
    }

    fn common_args(&self) -> Vec<OsString> {
        let mut args = Vec::new();
        if let Some(path) = &self.config_path {
            args.push("--config".into());
            args.push(absolute(path).into());
        }
        if let Some(dir) = &self.channel_dir {
            args.push("--channel-dir".into());
            args.push(absolute(dir).into());
        }
        if self.debug {
            args.push("--debug".into());
        }
        args
    }
}

impl ServerLauncher for ProcessLauncher {
    fn launch(&self, identity: &ServerIdentity) -> Result<(), LaunchError> {
        let binary = find_binary(SERVER_BINARY, self.server_binary.as_deref())?;
        let mut args = self.common_args();
        if let Some(salt) = identity.handshake.salt {
            args.push("--salt".into());
            args.push(salt.to_string().into());
        }
        if identity.handshake.options.contains(HandshakeOptions::NODE_REUSE) {
            args.push("--node-reuse".into());
        }
        if let Some(dir) = &self.lock_dir {
            args.push("--lock-dir".into());
            args.push(absolute(dir).into());
        }
        let pid = self.spawn_detached(&binary, args)?;
        info!(pid, fingerprint = %identity.handshake.fingerprint(), "Spawned {}", binary.display());
        Ok(())
    }
}

impl HostSpawner for ProcessLauncher {
    fn spawn(&self, handshake: &Handshake, _channel: &ChannelName) -> Result<(), LaunchError> {
        let binary = find_binary(TASKHOST_BINARY, self.taskhost_binary.as_deref())?;
        let mut args = self.common_args();
        let salt = handshake.salt.unwrap_or_default();
        args.push("--salt".into());
        args.push(salt.to_string().into());
        if handshake.options.contains(HandshakeOptions::LOW_PRIORITY) {
            args.push("--low-priority".into());
        }
        let pid = self.spawn_detached(&binary, args)?;
        debug!(pid, "Spawned {}", binary.display());
        Ok(())
    }
}
