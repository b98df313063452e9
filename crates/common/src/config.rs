use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub const CONFIG_ENV: &str = "BUILDHOST_CONFIG";
pub const CONFIG_FILE_NAME: &str = "buildhost.toml";
pub const USE_SERVER_ENV: &str = "BUILDHOST_USE_SERVER";
pub const DEBUG_COMM_ENV: &str = "BUILDHOST_DEBUG_COMM";
pub const SESSION_SALT_ENV: &str = "BUILDHOST_SESSION_SALT";
pub const LOCK_DIR_ENV: &str = "BUILDHOST_LOCK_DIR";
pub const SERVER_BINARY_ENV: &str = "BUILDHOST_SERVER_BINARY";
pub const TASKHOST_BINARY_ENV: &str = "BUILDHOST_TASKHOST_BINARY";

pub const DEFAULT_EXISTING_SERVER_CONNECT_TIMEOUT_MS: u64 = 1_000;
pub const DEFAULT_FRESH_SERVER_CONNECT_TIMEOUT_MS: u64 = 20_000;
pub const DEFAULT_HANDSHAKE_TIMEOUT_MS: u64 = 5_000;
pub const DEFAULT_CONSOLE_FLUSH_INTERVAL_MS: u64 = 100;
pub const DEFAULT_CONSOLE_FLUSH_THRESHOLD: usize = 64 * 1024;
pub const DEFAULT_IDLE_SHUTDOWN_SECS: u64 = 15 * 60;
pub const DEFAULT_TASK_HOST_LAUNCH_TIMEOUT_MS: u64 = 20_000;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {}: {source}", .path.display())]
    Read { path: PathBuf, source: io::Error },
    #[error("failed to parse config {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

/// Settings loaded from `buildhost.toml`; every field has a default.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub client: ClientSettings,
    #[serde(default)]
    pub server: ServerSettings,
    #[serde(default)]
    pub task_host: TaskHostSettings,
    /// Directory holding Unix domain sockets. Ignored on Windows.
    #[serde(default)]
    pub channel_dir: Option<PathBuf>,
    /// Directory holding the running/busy/launch lock files.
    #[serde(default)]
    pub lock_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientSettings {
    #[serde(default = "default_existing_server_connect_timeout_ms")]
    pub existing_server_connect_timeout_ms: u64,
    #[serde(default = "default_fresh_server_connect_timeout_ms")]
    pub fresh_server_connect_timeout_ms: u64,
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,
    #[serde(default)]
    pub server_binary: Option<PathBuf>,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            existing_server_connect_timeout_ms: DEFAULT_EXISTING_SERVER_CONNECT_TIMEOUT_MS,
            fresh_server_connect_timeout_ms: DEFAULT_FRESH_SERVER_CONNECT_TIMEOUT_MS,
            handshake_timeout_ms: DEFAULT_HANDSHAKE_TIMEOUT_MS,
            server_binary: None,
        }
    }
}

impl ClientSettings {
    pub fn existing_server_connect_timeout(&self) -> Duration {
        Duration::from_millis(self.existing_server_connect_timeout_ms)
    }

    pub fn fresh_server_connect_timeout(&self) -> Duration {
        Duration::from_millis(self.fresh_server_connect_timeout_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    /// Keep listening after a build instead of exiting.
    #[serde(default)]
    pub node_reuse: bool,
    /// Idle time before a reusable node exits; 0 disables idle shutdown.
    #[serde(default = "default_idle_shutdown_secs")]
    pub idle_shutdown_secs: u64,
    #[serde(default = "default_console_flush_interval_ms")]
    pub console_flush_interval_ms: u64,
    #[serde(default = "default_console_flush_threshold")]
    pub console_flush_threshold_bytes: usize,
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,
    /// Apply the requested cwd/environment to the server process while a build runs.
    #[serde(default = "default_true")]
    pub apply_process_context: bool,
    /// Working directory between builds. Defaults to the temp dir.
    #[serde(default)]
    pub rest_dir: Option<PathBuf>,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            node_reuse: false,
            idle_shutdown_secs: DEFAULT_IDLE_SHUTDOWN_SECS,
            console_flush_interval_ms: DEFAULT_CONSOLE_FLUSH_INTERVAL_MS,
            console_flush_threshold_bytes: DEFAULT_CONSOLE_FLUSH_THRESHOLD,
            handshake_timeout_ms: DEFAULT_HANDSHAKE_TIMEOUT_MS,
            apply_process_context: true,
            rest_dir: None,
        }
    }
}

impl ServerSettings {
    pub fn idle_shutdown(&self) -> Option<Duration> {
        (self.idle_shutdown_secs > 0).then(|| Duration::from_secs(self.idle_shutdown_secs))
    }

    pub fn console_flush_interval(&self) -> Duration {
        Duration::from_millis(self.console_flush_interval_ms.max(1))
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn rest_dir(&self) -> PathBuf {
        self.rest_dir.clone().unwrap_or_else(std::env::temp_dir)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskHostSettings {
    /// How long the launcher waits for a fresh host to accept, and how long a
    /// host waits for its launcher to connect.
    #[serde(default = "default_task_host_launch_timeout_ms")]
    pub launch_timeout_ms: u64,
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,
    #[serde(default)]
    pub binary: Option<PathBuf>,
}

impl Default for TaskHostSettings {
    fn default() -> Self {
        Self {
            launch_timeout_ms: DEFAULT_TASK_HOST_LAUNCH_TIMEOUT_MS,
            handshake_timeout_ms: DEFAULT_HANDSHAKE_TIMEOUT_MS,
            binary: None,
        }
    }
}

impl TaskHostSettings {
    pub fn launch_timeout(&self) -> Duration {
        Duration::from_millis(self.launch_timeout_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }
}

fn default_existing_server_connect_timeout_ms() -> u64 {
    DEFAULT_EXISTING_SERVER_CONNECT_TIMEOUT_MS
}

fn default_fresh_server_connect_timeout_ms() -> u64 {
    DEFAULT_FRESH_SERVER_CONNECT_TIMEOUT_MS
}

fn default_handshake_timeout_ms() -> u64 {
    DEFAULT_HANDSHAKE_TIMEOUT_MS
}

fn default_idle_shutdown_secs() -> u64 {
    DEFAULT_IDLE_SHUTDOWN_SECS
}

fn default_console_flush_interval_ms() -> u64 {
    DEFAULT_CONSOLE_FLUSH_INTERVAL_MS
}

fn default_console_flush_threshold() -> usize {
    DEFAULT_CONSOLE_FLUSH_THRESHOLD
}

fn default_task_host_launch_timeout_ms() -> u64 {
    DEFAULT_TASK_HOST_LAUNCH_TIMEOUT_MS
}

fn default_true() -> bool {
    true
}

/// Resolve the config file: explicit path → `BUILDHOST_CONFIG` → `./buildhost.toml` if present.
pub fn resolve_config_path(explicit: Option<PathBuf>) -> Option<PathBuf> {
    explicit
        .or_else(|| std::env::var(CONFIG_ENV).ok().map(PathBuf::from))
        .or_else(|| {
            let candidate = std::env::current_dir().ok()?.join(CONFIG_FILE_NAME);
            candidate.is_file().then_some(candidate)
        })
}

/// Load settings from `path` (defaults when `None` or missing) and apply env overrides.
pub fn load_settings(path: Option<&Path>) -> Result<Settings, ConfigError> {
    let mut settings = match path {
        Some(path) if path.exists() => {
            let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
                path: path.to_path_buf(),
                source,
            })?;
            parse_settings(&contents).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?
        }
        _ => Settings::default(),
    };
    settings.apply_env_overrides(|name| std::env::var(name).ok());
    Ok(settings)
}

pub fn parse_settings(contents: &str) -> Result<Settings, toml::de::Error> {
    toml::from_str(contents)
}

impl Settings {
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |name: &str| lookup(name).filter(|value| !value.trim().is_empty());
        if let Some(dir) = non_empty(LOCK_DIR_ENV) {
            self.lock_dir = Some(PathBuf::from(dir));
        }
        if let Some(binary) = non_empty(SERVER_BINARY_ENV) {
            self.client.server_binary = Some(PathBuf::from(binary));
        }
        if let Some(binary) = non_empty(TASKHOST_BINARY_ENV) {
            self.task_host.binary = Some(PathBuf::from(binary));
        }
    }
}

/// Process-level switches read from the environment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvSwitches {
    /// Route builds through a server node instead of building in-process.
    pub use_server: bool,
    /// Trace every handshake component and frame header.
    pub debug_comm: bool,
    pub session_salt: Option<i32>,
}

impl EnvSwitches {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let session_salt = lookup(SESSION_SALT_ENV).and_then(|raw| {
            let trimmed = raw.trim();
            if trimmed.is_empty() {
                return None;
            }
            match trimmed.parse::<i32>() {
                Ok(value) => Some(value),
                Err(err) => {
                    tracing::warn!("Invalid {} value '{}': {}", SESSION_SALT_ENV, raw, err);
                    None
                }
            }
        });

        Self {
            use_server: lookup(USE_SERVER_ENV)
                .and_then(|v| parse_bool(&v))
                .unwrap_or(false),
            debug_comm: lookup(DEBUG_COMM_ENV)
                .and_then(|v| parse_bool(&v))
                .unwrap_or(false),
            session_salt,
        }
    }
}

pub fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::tempdir;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn defaults_apply_for_empty_file() {
        let settings = parse_settings("").expect("parse empty config");
        assert_eq!(settings.client.existing_server_connect_timeout_ms, 1_000);
        assert_eq!(settings.client.fresh_server_connect_timeout_ms, 20_000);
        assert!(!settings.server.node_reuse);
        assert!(settings.server.apply_process_context);
        assert_eq!(settings.server.rest_dir(), std::env::temp_dir());
        assert_eq!(settings.server.console_flush_threshold_bytes, 64 * 1024);
        assert!(settings.lock_dir.is_none());
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let settings = parse_settings(
            r#"
            lock_dir = "/var/tmp/bh-locks"

            [server]
            node_reuse = true
            idle_shutdown_secs = 0

            [client]
            handshake_timeout_ms = 250
            "#,
        )
        .expect("parse config");

        assert!(settings.server.node_reuse);
        assert_eq!(settings.server.idle_shutdown(), None);
        assert_eq!(settings.server.console_flush_interval_ms, 100);
        assert_eq!(
            settings.client.handshake_timeout(),
            Duration::from_millis(250)
        );
        assert_eq!(settings.client.existing_server_connect_timeout_ms, 1_000);
        assert_eq!(settings.lock_dir, Some(PathBuf::from("/var/tmp/bh-locks")));
    }

    #[test]
    fn load_settings_reports_parse_errors_with_path() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join(CONFIG_FILE_NAME);
        std::fs::write(&path, "[server\nnode_reuse = ").expect("write config");

        let err = load_settings(Some(&path)).expect_err("invalid toml");
        assert!(matches!(err, ConfigError::Parse { .. }));
        assert!(err.to_string().contains(CONFIG_FILE_NAME));
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempdir().expect("tempdir");
        let settings =
            load_settings(Some(&dir.path().join("absent.toml"))).expect("defaults for missing");
        assert_eq!(settings.task_host.launch_timeout_ms, 20_000);
    }

    #[test]
    fn env_overrides_replace_paths() {
        let mut settings = Settings::default();
        settings.apply_env_overrides(lookup_from(&[
            (LOCK_DIR_ENV, "/tmp/locks-x"),
            (SERVER_BINARY_ENV, "/opt/bh/buildhostd"),
            (TASKHOST_BINARY_ENV, "  "),
        ]));
        assert_eq!(settings.lock_dir, Some(PathBuf::from("/tmp/locks-x")));
        assert_eq!(
            settings.client.server_binary,
            Some(PathBuf::from("/opt/bh/buildhostd"))
        );
        assert!(settings.task_host.binary.is_none());
    }

    #[test]
    fn switches_parse_bool_spellings_and_salt() {
        let switches = EnvSwitches::from_lookup(lookup_from(&[
            (USE_SERVER_ENV, "yes"),
            (DEBUG_COMM_ENV, "0"),
            (SESSION_SALT_ENV, "-42"),
        ]));
        assert_eq!(
            switches,
            EnvSwitches {
                use_server: true,
                debug_comm: false,
                session_salt: Some(-42),
            }
        );

        let defaults = EnvSwitches::from_lookup(lookup_from(&[
            (USE_SERVER_ENV, "maybe"),
            (SESSION_SALT_ENV, "not-a-number"),
        ]));
        assert_eq!(defaults, EnvSwitches::default());
    }
}
