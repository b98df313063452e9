#![cfg(unix)]

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use buildhost_common::config::Settings;
use buildhost_common::{
    BuildContext, BuildEngine, BuildOutcome, ConsoleSink, ConsoleStream, EnvSwitches, ExitType,
    ServerStatus,
};
use buildhost_protocol::{
    ChannelName, Handshake, LogEvent, ServerIdentity, TaskCommand, TaskResultKind,
};
use buildhostd::{ServerNode, ServerNodeConfig, TaskHostConfig, TaskHostNode, TaskRegistry};
use buildhostd_client::{
    BuildClient, BuildRequest, ClientExitType, ClientState, HostSpawner, LaunchError,
    ServerLauncher, TaskHostFailure, TaskHostLauncher,
};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

const WAIT: Duration = Duration::from_secs(10);

/// Console that records what it was given, in order.
#[derive(Default)]
struct CapturedConsole {
    writes: Mutex<Vec<(ConsoleStream, String)>>,
    on_write: Mutex<Option<CancellationToken>>,
}

impl CapturedConsole {
    fn text(&self, stream: ConsoleStream) -> String {
        self.writes
            .lock()
            .unwrap()
            .iter()
            .filter(|(s, _)| *s == stream)
            .map(|(_, text)| text.as_str())
            .collect()
    }
}

impl ConsoleSink for CapturedConsole {
    fn write(&self, stream: ConsoleStream, text: &str) {
        self.writes.lock().unwrap().push((stream, text.to_string()));
        if let Some(token) = self.on_write.lock().unwrap().take() {
            token.cancel();
        }
    }
}

struct BuildingEngine;

impl BuildEngine for BuildingEngine {
    fn build(&self, ctx: &BuildContext) -> BuildOutcome {
        ctx.console.write(ConsoleStream::Stdout, "Building...\n");
        BuildOutcome::success()
    }
}

struct WaitForCancelEngine;

impl BuildEngine for WaitForCancelEngine {
    fn build(&self, ctx: &BuildContext) -> BuildOutcome {
        ctx.console.write(ConsoleStream::Stdout, "started\n");
        ctx.console.flush();
        let deadline = std::time::Instant::now() + WAIT;
        while !ctx.cancellation.is_cancelled() && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        BuildOutcome::new(1, ExitType::BuildError)
    }
}

/// Starts server nodes inside this test process.
struct InProcessLauncher {
    settings: Settings,
    engine: Arc<dyn BuildEngine>,
    launches: AtomicUsize,
}

impl ServerLauncher for InProcessLauncher {
    fn launch(&self, identity: &ServerIdentity) -> Result<(), LaunchError> {
        self.launches.fetch_add(1, Ordering::SeqCst);
        let node: ServerNode = ServerNode::new(
            ServerNodeConfig {
                handshake: identity.handshake.clone(),
                channel: identity.channel.clone(),
                locks: identity.locks.clone(),
                settings: self.settings.server.clone(),
            },
            self.engine.clone(),
        );
        tokio::spawn(async move {
            let _ = node.run().await;
        });
        Ok(())
    }
}

struct FailingLauncher;

impl ServerLauncher for FailingLauncher {
    fn launch(&self, _identity: &ServerIdentity) -> Result<(), LaunchError> {
        Err(LaunchError::BinaryNotFound {
            name: "buildhostd".to_string(),
            candidates: Vec::new(),
        })
    }
}

struct Fixture {
    _dir: TempDir,
    settings: Settings,
    identity: ServerIdentity,
}

fn fixture(node_reuse: bool) -> Fixture {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut settings = Settings {
        lock_dir: Some(dir.path().join("locks")),
        channel_dir: Some(dir.path().to_path_buf()),
        ..Settings::default()
    };
    settings.server.node_reuse = node_reuse;
    settings.server.console_flush_interval_ms = 10;
    settings.server.apply_process_context = false;
    settings.client.existing_server_connect_timeout_ms = 300;
    settings.client.fresh_server_connect_timeout_ms = 5_000;
    let switches = EnvSwitches {
        session_salt: Some(77),
        ..EnvSwitches::default()
    };
    let identity = ServerIdentity::from_settings(&settings, &switches);
    Fixture {
        _dir: dir,
        settings,
        identity,
    }
}

fn launcher(fixture: &Fixture, engine: Arc<dyn BuildEngine>) -> Arc<InProcessLauncher> {
    Arc::new(InProcessLauncher {
        settings: fixture.settings.clone(),
        engine,
        launches: AtomicUsize::new(0),
    })
}

fn request() -> BuildRequest {
    BuildRequest {
        command_line: "build.proj".to_string(),
        startup_directory: PathBuf::from("/work"),
        environment: BTreeMap::from([("X".to_string(), "1".to_string())]),
        culture: String::new(),
        ui_culture: String::new(),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn client_starts_server_and_prints_console() {
    let fixture = fixture(false);
    let launcher = launcher(&fixture, Arc::new(BuildingEngine));
    let mut client: BuildClient = BuildClient::new(
        fixture.identity.clone(),
        fixture.settings.client.clone(),
        launcher.clone(),
    );
    let console = CapturedConsole::default();

    let outcome = tokio::time::timeout(
        WAIT,
        client.execute(&request(), &console, CancellationToken::new()),
    )
    .await
    .unwrap();

    assert_eq!(outcome.exit_type, ClientExitType::Success);
    assert_eq!(outcome.build_exit_type(), ExitType::Success);
    assert_eq!(outcome.process_exit_code(), 0);
    assert_eq!(console.text(ConsoleStream::Stdout), "Building...\n");
    assert_eq!(client.state(), ClientState::Done);
    assert_eq!(launcher.launches.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn busy_server_is_not_contacted() {
    let fixture = fixture(false);
    let _running = fixture.identity.locks.try_become_the_server().unwrap().unwrap();
    let _busy = fixture.identity.locks.try_mark_busy().unwrap().unwrap();
    let launcher = launcher(&fixture, Arc::new(BuildingEngine));
    let mut client: BuildClient = BuildClient::new(
        fixture.identity.clone(),
        fixture.settings.client.clone(),
        launcher.clone(),
    );

    let outcome = client
        .execute(&request(), &CapturedConsole::default(), CancellationToken::new())
        .await;
    assert_eq!(outcome.exit_type, ClientExitType::ServerBusy);
    assert!(outcome.exit_type.should_fall_back());
    assert!(outcome.result.is_none());
    assert_eq!(client.state(), ClientState::Fallback);
    assert_eq!(launcher.launches.load(Ordering::SeqCst), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn launch_failure_is_reported_as_launch_error() {
    let fixture = fixture(false);
    let mut client: BuildClient = BuildClient::new(
        fixture.identity.clone(),
        fixture.settings.client.clone(),
        Arc::new(FailingLauncher),
    );
    let outcome = client
        .execute(&request(), &CapturedConsole::default(), CancellationToken::new())
        .await;
    assert_eq!(outcome.exit_type, ClientExitType::LaunchError);
    assert!(outcome.exit_type.should_fall_back());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn unreachable_server_is_a_connection_error() {
    let fixture = fixture(false);
    // Someone owns the identity but never listens.
    let _running = fixture.identity.locks.try_become_the_server().unwrap().unwrap();
    let launcher = launcher(&fixture, Arc::new(BuildingEngine));
    let mut client: BuildClient = BuildClient::new(
        fixture.identity.clone(),
        fixture.settings.client.clone(),
        launcher.clone(),
    );
    let outcome = client
        .execute(&request(), &CapturedConsole::default(), CancellationToken::new())
        .await;
    assert_eq!(outcome.exit_type, ClientExitType::ConnectionError);
    assert_eq!(launcher.launches.load(Ordering::SeqCst), 0);
}

/// Holds each build long enough for a racing client to find the server busy.
#[derive(Default)]
struct SlowEngine {
    started: AtomicUsize,
}

impl BuildEngine for SlowEngine {
    fn build(&self, ctx: &BuildContext) -> BuildOutcome {
        self.started.fetch_add(1, Ordering::SeqCst);
        ctx.console.write(ConsoleStream::Stdout, "Building...\n");
        std::thread::sleep(Duration::from_millis(150));
        BuildOutcome::success()
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn racing_clients_launch_one_server() {
    let fixture = fixture(true);
    let engine = Arc::new(SlowEngine::default());
    let launcher = launcher(&fixture, engine.clone());

    let mut handles = Vec::new();
    for _ in 0..2 {
        let identity = fixture.identity.clone();
        let settings = fixture.settings.client.clone();
        let launcher = launcher.clone();
        let engine = engine.clone();
        handles.push(tokio::spawn(async move {
            let mut client: BuildClient =
                BuildClient::new(identity.clone(), settings, launcher);
            let console = CapturedConsole::default();
            let outcome = client
                .execute(&request(), &console, CancellationToken::new())
                .await;
            // Busy is only a fair answer while the other client's build is running.
            let server_was_building = engine.started.load(Ordering::SeqCst) > 0
                || identity.locks.status().unwrap() == ServerStatus::Busy;
            (
                outcome.exit_type,
                console.text(ConsoleStream::Stdout),
                server_was_building,
            )
        }));
    }

    let mut served = 0;
    for handle in handles {
        let (exit_type, stdout, server_was_building) =
            tokio::time::timeout(WAIT, handle).await.unwrap().unwrap();
        match exit_type {
            ClientExitType::Success => {
                served += 1;
                assert_eq!(stdout, "Building...\n");
            }
            ClientExitType::ServerBusy => {
                assert!(server_was_building, "reported busy with no build running");
                assert!(stdout.is_empty());
            }
            other => panic!("unexpected outcome {:?}", other),
        }
    }
    assert!(served >= 1);
    assert_eq!(launcher.launches.load(Ordering::SeqCst), 1);
    assert_eq!(engine.started.load(Ordering::SeqCst), served);
    assert_ne!(
        fixture.identity.locks.status().unwrap(),
        ServerStatus::NotRunning
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cancel_is_forwarded_and_result_still_arrives() {
    let fixture = fixture(false);
    let launcher = launcher(&fixture, Arc::new(WaitForCancelEngine));
    let mut client: BuildClient = BuildClient::new(
        fixture.identity.clone(),
        fixture.settings.client.clone(),
        launcher,
    );
    let cancel = CancellationToken::new();
    let console = CapturedConsole::default();
    *console.on_write.lock().unwrap() = Some(cancel.clone());

    let outcome = tokio::time::timeout(WAIT, client.execute(&request(), &console, cancel))
        .await
        .unwrap();
    assert_eq!(outcome.exit_type, ClientExitType::Success);
    assert_eq!(outcome.build_exit_type(), ExitType::BuildError);
    assert_eq!(outcome.process_exit_code(), 1);
    assert_eq!(console.text(ConsoleStream::Stdout), "started\n");
}

/// Runs task hosts inside this test process.
struct InProcessSpawner;

impl HostSpawner for InProcessSpawner {
    fn spawn(&self, handshake: &Handshake, channel: &ChannelName) -> Result<(), LaunchError> {
        let node: TaskHostNode = TaskHostNode::new(
            TaskHostConfig {
                handshake: handshake.clone(),
                channel: channel.clone(),
                handshake_timeout: Duration::from_secs(2),
                accept_timeout: WAIT,
            },
            TaskRegistry::with_builtins(),
        );
        tokio::spawn(async move {
            let _ = node.run().await;
        });
        Ok(())
    }
}

struct RefusingSpawner;

impl HostSpawner for RefusingSpawner {
    fn spawn(&self, _handshake: &Handshake, _channel: &ChannelName) -> Result<(), LaunchError> {
        Err(LaunchError::BinaryNotFound {
            name: "buildhost-taskhost".to_string(),
            candidates: Vec::new(),
        })
    }
}

fn message_task(text: &str) -> TaskCommand {
    TaskCommand {
        task_name: "Message".to_string(),
        working_directory: std::env::temp_dir().to_string_lossy().into_owned(),
        parameters: BTreeMap::from([("Text".to_string(), text.to_string())]),
        ..TaskCommand::default()
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn task_runs_in_fresh_host() {
    let dir = tempfile::tempdir().unwrap();
    let settings = Settings::default();
    let host: TaskHostLauncher = TaskHostLauncher::new(
        Arc::new(InProcessSpawner),
        settings.task_host,
        Some(dir.path().to_path_buf()),
    );

    let mut logs: Vec<LogEvent> = Vec::new();
    let done = tokio::time::timeout(
        WAIT,
        host.run_task(
            message_task("from the host"),
            |event| logs.push(event),
            CancellationToken::new(),
        ),
    )
    .await
    .unwrap()
    .expect("task completes");

    assert_eq!(done.result, TaskResultKind::Success);
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].text, "from the host");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn spawn_failure_is_a_setup_failure() {
    let host: TaskHostLauncher = TaskHostLauncher::new(
        Arc::new(RefusingSpawner),
        Settings::default().task_host,
        None,
    );
    let err = host
        .run_task(message_task("never"), |_| {}, CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, TaskHostFailure::Setup(_)));
}
