//! Handshaken packet endpoint over one byte stream.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::frame::{write_frame, FrameError, PacketFactory};
use crate::handshake::{perform_handshake, Handshake, HandshakeError};
use crate::ipc::{connect_with_timeout, IpcBackend};
use crate::packets::{Packet, PacketType};
use crate::pump::{spawn_pump, PumpHandle};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkStatus {
    Inactive,
    Active,
    Failed,
}

impl LinkStatus {
    /// `Failed` is terminal; everything else follows Inactive -> Active -> (Inactive | Failed).
    pub fn can_transition_to(self, next: LinkStatus) -> bool {
        use LinkStatus::*;
        matches!(
            (self, next),
            (Inactive, Active) | (Inactive, Failed) | (Active, Inactive) | (Active, Failed)
        )
    }
}

impl fmt::Display for LinkStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            LinkStatus::Inactive => "inactive",
            LinkStatus::Active => "active",
            LinkStatus::Failed => "failed",
        };
        f.write_str(label)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error("invalid link transition {from} -> {to}")]
    InvalidTransition { from: LinkStatus, to: LinkStatus },
    #[error("link is {0}, not active")]
    NotActive(LinkStatus),
    #[error("packet pump already started")]
    PumpStarted,
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Handshake(#[from] HandshakeError),
    #[error(transparent)]
    Frame(#[from] FrameError),
}

/// One side of a node conversation.
pub struct NodeEndpoint<S> {
    status: LinkStatus,
    reader: Option<ReadHalf<S>>,
    writer: WriteHalf<S>,
}

impl<S> NodeEndpoint<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /// Handshake over an already-open stream. The stream is dropped on failure.
    pub async fn establish(
        mut stream: S,
        handshake: &Handshake,
        timeout: Duration,
    ) -> Result<Self, LinkError> {
        perform_handshake(&mut stream, handshake, timeout).await?;
        let (reader, writer) = tokio::io::split(stream);
        let mut endpoint = Self {
            status: LinkStatus::Inactive,
            reader: Some(reader),
            writer,
        };
        endpoint.transition(LinkStatus::Active)?;
        Ok(endpoint)
    }

    pub fn status(&self) -> LinkStatus {
        self.status
    }

    fn transition(&mut self, next: LinkStatus) -> Result<(), LinkError> {
        if !self.status.can_transition_to(next) {
            return Err(LinkError::InvalidTransition {
                from: self.status,
                to: next,
            });
        }
        trace!(from = %self.status, to = %next, "link status");
        self.status = next;
        Ok(())
    }

    fn fail(&mut self) {
        if self.status != LinkStatus::Failed {
            let _ = self.transition(LinkStatus::Failed);
        }
    }

    /// Mark a link failed after an error observed elsewhere (e.g. by the pump).
    pub fn mark_failed(&mut self) {
        self.fail();
    }

    pub async fn send(&mut self, packet: &Packet) -> Result<(), LinkError> {
        if self.status != LinkStatus::Active {
            return Err(LinkError::NotActive(self.status));
        }
        match write_frame(&mut self.writer, packet).await {
            Ok(()) => Ok(()),
            Err(err) => {
                debug!(packet = ?packet.packet_type(), "send failed: {}", err);
                self.fail();
                Err(err.into())
            }
        }
    }

    /// Hand the read half to a background pump.
    pub fn start_pump(
        &mut self,
        factory: Arc<PacketFactory>,
        terminal: Option<PacketType>,
        shutdown: CancellationToken,
    ) -> Result<PumpHandle, LinkError> {
        if self.status != LinkStatus::Active {
            return Err(LinkError::NotActive(self.status));
        }
        let reader = self.reader.take().ok_or(LinkError::PumpStarted)?;
        Ok(spawn_pump(reader, factory, terminal, shutdown))
    }

    /// Flush and close the write side. A failed link stays failed.
    pub async fn disconnect(&mut self) {
        if self.status == LinkStatus::Active {
            let _ = self.writer.shutdown().await;
            let _ = self.transition(LinkStatus::Inactive);
        }
    }
}

/// Connect over `B`, retrying until `connect_timeout`, then handshake.
pub async fn connect<B>(
    addr: &str,
    handshake: &Handshake,
    connect_timeout: Duration,
    handshake_timeout: Duration,
) -> Result<NodeEndpoint<B::Stream>, LinkError>
where
    B: IpcBackend,
{
    let stream = connect_with_timeout::<B>(addr, connect_timeout)
        .await
        .map_err(|source| LinkError::Connect {
            addr: addr.to_string(),
            source,
        })?;
    debug!(%addr, "connected, starting handshake");
    NodeEndpoint::establish(stream, handshake, handshake_timeout).await
}
