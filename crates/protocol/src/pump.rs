//! Background packet pump.
//!
//! One task per connection reads frames and pushes decoded packets into an
//! unbounded inbox, so the consumer can keep receiving control packets
//! (`Cancel`) while it is busy elsewhere. Shutdown always wins over a ready
//! frame. Failures never cross the task boundary as panics: they set a sticky
//! flag, close the inbox and come back from [`PumpHandle::join`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::io::AsyncRead;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::frame::{FrameError, FrameReader, PacketFactory};
use crate::packets::{Packet, PacketType};

/// Why a pump stopped.
#[derive(Debug)]
pub enum PumpExit {
    Shutdown,
    TerminalPacket,
    PeerClosed,
    Failed(FrameError),
    Panicked(String),
}

impl PumpExit {
    pub fn is_failure(&self) -> bool {
        matches!(self, PumpExit::Failed(_) | PumpExit::Panicked(_))
    }
}

pub struct PumpHandle {
    inbox: mpsc::UnboundedReceiver<Packet>,
    shutdown: CancellationToken,
    failed: Arc<AtomicBool>,
    task: JoinHandle<PumpExit>,
}

/// Start pumping `reader`. The pump stops after delivering a `terminal`
/// packet, on shutdown, on peer close, or on the first frame error.
pub fn spawn_pump<R>(
    reader: R,
    factory: Arc<PacketFactory>,
    terminal: Option<PacketType>,
    shutdown: CancellationToken,
) -> PumpHandle
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let (tx, inbox) = mpsc::unbounded_channel();
    let failed = Arc::new(AtomicBool::new(false));
    let task = tokio::spawn(run_pump(
        FrameReader::new(reader),
        factory,
        terminal,
        shutdown.clone(),
        tx,
        failed.clone(),
    ));
    PumpHandle {
        inbox,
        shutdown,
        failed,
        task,
    }
}

async fn run_pump<R>(
    mut reader: FrameReader<R>,
    factory: Arc<PacketFactory>,
    terminal: Option<PacketType>,
    shutdown: CancellationToken,
    inbox: mpsc::UnboundedSender<Packet>,
    failed: Arc<AtomicBool>,
) -> PumpExit
where
    R: AsyncRead + Unpin,
{
    loop {
        if shutdown.is_cancelled() {
            return PumpExit::Shutdown;
        }
        let next = tokio::select! {
            biased;
            _ = shutdown.cancelled() => {
                trace!("pump observed shutdown");
                return PumpExit::Shutdown;
            }
            frame = reader.read_frame(&factory) => frame,
        };

        match next {
            Ok(packet) => {
                // A frame that completed alongside shutdown is dropped.
                if shutdown.is_cancelled() {
                    return PumpExit::Shutdown;
                }
                let packet_type = packet.packet_type();
                trace!(packet = ?packet_type, "pump delivered packet");
                if inbox.send(packet).is_err() {
                    debug!("pump consumer went away");
                    return PumpExit::Shutdown;
                }
                if terminal == Some(packet_type) {
                    return PumpExit::TerminalPacket;
                }
            }
            Err(err) if err.is_peer_closed() => {
                debug!("pump: peer closed connection");
                return PumpExit::PeerClosed;
            }
            Err(err) => {
                warn!("pump failed: {}", err);
                failed.store(true, Ordering::SeqCst);
                return PumpExit::Failed(err);
            }
        }
    }
}

impl PumpHandle {
    /// Next packet; `None` once the pump has stopped and the inbox is drained.
    pub async fn recv(&mut self) -> Option<Packet> {
        self.inbox.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Packet> {
        self.inbox.try_recv().ok()
    }

    /// Everything already queued, without waiting.
    pub fn drain(&mut self) -> Vec<Packet> {
        let mut packets = Vec::new();
        while let Ok(packet) = self.inbox.try_recv() {
            packets.push(packet);
        }
        packets
    }

    /// Sticky: stays set once a frame error has been observed.
    pub fn has_failed(&self) -> bool {
        self.failed.load(Ordering::SeqCst)
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the pump task and report why it stopped.
    pub async fn join(self) -> PumpExit {
        match self.task.await {
            Ok(exit) => exit,
            Err(err) => {
                self.failed.store(true, Ordering::SeqCst);
                if err.is_cancelled() {
                    PumpExit::Shutdown
                } else {
                    PumpExit::Panicked(err.to_string())
                }
            }
        }
    }
}
