//! Build server node.
//!
//! Owns the running lock for its handshake identity, listens on the derived
//! channel and serves one build per connection. While a build runs on a
//! blocking worker the control loop keeps draining the packet pump, so a
//! `Cancel` from the client reaches the build promptly.

use std::marker::PhantomData;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use buildhost_common::config::ServerSettings;
use buildhost_common::{
    BuildContext, BuildEngine, BuildOutcome, ExitType, LockError, NamedLock, ProcessContextScope,
    ServerLocks, park_in,
};
use buildhost_protocol::{
    BuildCommand, BuildResult, ChannelName, DefaultBackend, Handshake, IpcBackend, IpcListener,
    NodeEndpoint, Packet, PacketFactory, PacketType, PumpHandle,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::console::RedirectedConsole;

/// Why [`ServerNode::run`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    /// One build served; the minimal node lifecycle ends here.
    BuildCompleted,
    /// Another process already owns this identity.
    AlreadyRunning,
    IdleTimeout,
    ShutdownRequested,
    /// A build command arrived while the busy lock was unavailable.
    BusyInvariantViolated,
}

/// Result of one accepted connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Served {
    BuildCompleted,
    ClientGone,
    Shutdown,
    BusyInvariantViolated,
}

pub struct ServerNodeConfig {
    pub handshake: Handshake,
    pub channel: ChannelName,
    pub locks: ServerLocks,
    pub settings: ServerSettings,
}

pub struct ServerNode<B: IpcBackend = DefaultBackend> {
    config: ServerNodeConfig,
    engine: Arc<dyn BuildEngine>,
    shutdown: CancellationToken,
    _backend: PhantomData<B>,
}

struct InFlight {
    handle: JoinHandle<BuildOutcome>,
    cancel: CancellationToken,
    console: Arc<RedirectedConsole>,
    flusher: JoinHandle<()>,
    busy: NamedLock,
}

impl<B: IpcBackend> ServerNode<B> {
    pub fn new(config: ServerNodeConfig, engine: Arc<dyn BuildEngine>) -> Self {
        Self {
            config,
            engine,
            shutdown: CancellationToken::new(),
            _backend: PhantomData,
        }
    }

    /// Cancel this to stop the node from outside (signals, tests).
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub async fn run(&self) -> Result<ShutdownReason> {
        let fingerprint = self.config.locks.fingerprint().to_string();
        let _running = match off_runtime(&self.config.locks, ServerLocks::try_become_the_server)
            .await
            .context("failed to take running lock")?
        {
            Some(lock) => lock,
            None => {
                info!(%fingerprint, "another server already owns this identity");
                return Ok(ShutdownReason::AlreadyRunning);
            }
        };

        if self.config.settings.apply_process_context {
            park_in(&self.config.settings.rest_dir());
        }

        let addr = self.config.channel.addr().to_string();
        let mut listener = B::bind(&addr)
            .await
            .with_context(|| format!("failed to listen on {}", addr))?;
        info!(%addr, %fingerprint, node_reuse = self.config.settings.node_reuse, "server node listening");

        let idle = self.config.settings.idle_shutdown();
        loop {
            let stream = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => return Ok(ShutdownReason::ShutdownRequested),
                _ = idle_timer(idle) => {
                    info!(?idle, "no connection within idle timeout");
                    return Ok(ShutdownReason::IdleTimeout);
                }
                accepted = listener.accept() => match accepted {
                    Ok(stream) => stream,
                    Err(err) => {
                        warn!("accept failed: {}", err);
                        continue;
                    }
                },
            };

            let endpoint = match NodeEndpoint::establish(
                stream,
                &self.config.handshake,
                self.config.settings.handshake_timeout(),
            )
            .await
            {
                Ok(endpoint) => endpoint,
                Err(err) => {
                    warn!("rejected connection: {}", err);
                    continue;
                }
            };
            debug!("client handshake accepted");

            match self.serve(endpoint).await {
                Served::BuildCompleted if self.config.settings.node_reuse => {
                    debug!("build served; node reuse enabled, listening again");
                }
                Served::BuildCompleted => return Ok(ShutdownReason::BuildCompleted),
                Served::ClientGone => debug!("client left; listening again"),
                Served::Shutdown => return Ok(ShutdownReason::ShutdownRequested),
                Served::BusyInvariantViolated => {
                    return Ok(ShutdownReason::BusyInvariantViolated)
                }
            }
        }
    }

    async fn serve(&self, mut endpoint: NodeEndpoint<B::Stream>) -> Served {
        let conn_shutdown = self.shutdown.child_token();
        let mut pump = match endpoint.start_pump(
            Arc::new(PacketFactory::for_server()),
            None,
            conn_shutdown.clone(),
        ) {
            Ok(pump) => pump,
            Err(err) => {
                warn!("failed to start packet pump: {}", err);
                return Served::ClientGone;
            }
        };

        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let writer = tokio::spawn(write_until_result(endpoint, out_rx));

        let mut build: Option<InFlight> = None;
        let mut released_busy: Option<NamedLock> = None;
        let served = loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break Served::Shutdown,
                packet = pump.recv() => {
                    let Some(first) = packet else {
                        if build.is_some() {
                            warn!("client vanished mid-build; cancelling");
                        }
                        break Served::ClientGone;
                    };
                    let mut batch = vec![first];
                    batch.extend(pump.drain());
                    if let Some(verdict) = self.dispatch(batch, &mut build, &out_tx).await {
                        break verdict;
                    }
                }
                outcome = wait_build(&mut build) => {
                    if let Some(build) = build.take() {
                        released_busy = Some(self.deliver(build, outcome, &out_tx).await);
                    }
                    break Served::BuildCompleted;
                }
            }
        };

        // Never leave a build running behind a closed connection.
        if let Some(mut build) = build.take() {
            build.cancel.cancel();
            let outcome = (&mut build.handle).await;
            released_busy = Some(self.deliver(build, outcome, &out_tx).await);
        }

        drop(out_tx);
        conn_shutdown.cancel();
        report_pump_exit(pump).await;
        match writer.await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!("failed to deliver packets to client: {}", err),
            Err(err) => error!("writer task failed: {}", err),
        }
        // Released only after BuildResult has left the writer.
        drop(released_busy);
        served
    }

    /// Handle one wake-up's worth of packets. `Some` ends the connection.
    async fn dispatch(
        &self,
        batch: Vec<Packet>,
        build: &mut Option<InFlight>,
        out: &mpsc::UnboundedSender<Packet>,
    ) -> Option<Served> {
        for packet in batch {
            match packet {
                Packet::BuildCommand(command) => {
                    if build.is_some() {
                        error!("second build command on one connection; shutting down");
                        if let Some(build) = build.as_ref() {
                            build.cancel.cancel();
                        }
                        return Some(Served::BusyInvariantViolated);
                    }
                    let marked = off_runtime(&self.config.locks, ServerLocks::try_mark_busy).await;
                    let busy = match marked {
                        Ok(Some(lock)) => lock,
                        Ok(None) => {
                            error!("busy lock already held while accepting a build; shutting down");
                            let _ = out.send(BuildResult::new(-1, ExitType::Unexpected).into());
                            return Some(Served::BusyInvariantViolated);
                        }
                        Err(err) => {
                            error!("failed to take busy lock: {:#}; shutting down", err);
                            let _ = out.send(BuildResult::new(-1, ExitType::Unexpected).into());
                            return Some(Served::BusyInvariantViolated);
                        }
                    };
                    *build = Some(self.start_build(command, busy, out));
                }
                Packet::Cancel(_) => match build.as_ref() {
                    Some(build) => {
                        info!("cancel requested by client");
                        build.cancel.cancel();
                    }
                    None => debug!("cancel with no build in flight"),
                },
                other => warn!(packet = ?other.packet_type(), "ignoring unexpected packet"),
            }
        }
        None
    }

    fn start_build(
        &self,
        command: BuildCommand,
        busy: NamedLock,
        out: &mpsc::UnboundedSender<Packet>,
    ) -> InFlight {
        info!(command = %command.command_line, cwd = %command.startup_directory, "starting build");
        let settings = &self.config.settings;
        let console = Arc::new(RedirectedConsole::new(
            out.clone(),
            settings.console_flush_threshold_bytes,
        ));
        let flusher = console.spawn_flusher(settings.console_flush_interval());
        let cancel = CancellationToken::new();

        let ctx = BuildContext {
            command_line: command.command_line,
            working_directory: PathBuf::from(command.startup_directory),
            environment: command.environment,
            culture: command.culture,
            ui_culture: command.ui_culture,
            console: console.clone(),
            cancellation: cancel.clone(),
        };
        let engine = self.engine.clone();
        let apply_context = settings.apply_process_context;
        let rest_dir = settings.rest_dir();
        let handle = tokio::task::spawn_blocking(move || {
            // Only the busy-lock holder mutates process globals; the scope restores them.
            let _scope = apply_context.then(|| {
                ProcessContextScope::enter(&ctx.working_directory, &ctx.environment, &rest_dir)
            });
            engine.build(&ctx)
        });

        InFlight {
            handle,
            cancel,
            console,
            flusher,
            busy,
        }
    }

    /// Flush console output and queue `BuildResult`. Returns the busy lock
    /// for the caller to release once the result has been written.
    async fn deliver(
        &self,
        build: InFlight,
        outcome: Result<BuildOutcome, tokio::task::JoinError>,
        out: &mpsc::UnboundedSender<Packet>,
    ) -> NamedLock {
        let outcome = outcome.unwrap_or_else(|err| {
            error!("build engine crashed: {}", err);
            BuildOutcome::unexpected()
        });
        let InFlight {
            console,
            flusher,
            busy,
            ..
        } = build;
        console.close();
        let _ = flusher.await;
        info!(
            exit_code = outcome.exit_code,
            exit_type = outcome.exit_type.label(),
            "build finished"
        );
        let _ = out.send(BuildResult::new(outcome.exit_code, outcome.exit_type).into());
        busy
    }
}

/// Lock attempts may sleep through a probe grace; keep them off the async workers.
async fn off_runtime(
    locks: &ServerLocks,
    attempt: fn(&ServerLocks) -> Result<Option<NamedLock>, LockError>,
) -> Result<Option<NamedLock>> {
    let locks = locks.clone();
    let held = tokio::task::spawn_blocking(move || attempt(&locks))
        .await
        .context("lock attempt panicked")??;
    Ok(held)
}

async fn idle_timer(idle: Option<Duration>) {
    match idle {
        Some(after) => tokio::time::sleep(after).await,
        None => std::future::pending().await,
    }
}

async fn wait_build(
    build: &mut Option<InFlight>,
) -> Result<BuildOutcome, tokio::task::JoinError> {
    match build {
        Some(build) => (&mut build.handle).await,
        None => std::future::pending().await,
    }
}

/// Writer half of a connection: sends queued packets, stopping after the
/// terminal `BuildResult` or when every sender is gone.
async fn write_until_result<S>(
    mut endpoint: NodeEndpoint<S>,
    mut queue: mpsc::UnboundedReceiver<Packet>,
) -> Result<(), buildhost_protocol::LinkError>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    while let Some(packet) = queue.recv().await {
        let terminal = packet.packet_type() == PacketType::BuildResult;
        endpoint.send(&packet).await?;
        if terminal {
            break;
        }
    }
    endpoint.disconnect().await;
    Ok(())
}

async fn report_pump_exit(pump: PumpHandle) {
    let exit = pump.join().await;
    if exit.is_failure() {
        warn!(?exit, "packet pump stopped on error");
    } else {
        debug!(?exit, "packet pump stopped");
    }
}
