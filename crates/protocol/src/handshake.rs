//! Connection handshake.
//!
//! Both ends write the same vector of big-endian `i32` components followed by
//! [`END_OF_HANDSHAKE`], then read the peer's vector and compare. Nothing
//! else is trusted on a connection until the vectors match. The same
//! components hash into the fingerprint that names the channel and the
//! server locks, so incompatible builds never meet on one channel.

use std::fmt;
use std::io;
use std::ops::BitOr;
use std::time::Duration;

use sha2::{Digest, Sha256};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, trace};

/// Sentinel written after the last component.
pub const END_OF_HANDSHAKE: i32 = -0x2A2A_2A2A;

/// Bumped whenever framing or packet layouts change incompatibly.
pub const PROTOCOL_EPOCH: i32 = 1;

#[cfg(unix)]
const MIN_HANDSHAKE_TIMEOUT: Duration = Duration::from_millis(50);

const FINGERPRINT_LEN: usize = 16;

/// Feature flags folded into the handshake.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct HandshakeOptions(u32);

impl HandshakeOptions {
    pub const NONE: Self = Self(0);
    pub const TASK_HOST: Self = Self(1 << 0);
    pub const SERVER: Self = Self(1 << 1);
    pub const NODE_REUSE: Self = Self(1 << 2);
    pub const LOW_PRIORITY: Self = Self(1 << 3);
    pub const X64: Self = Self(1 << 4);
    pub const ARM64: Self = Self(1 << 5);

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Architecture flag of the running binary.
    pub fn host_architecture() -> Self {
        if cfg!(target_arch = "x86_64") {
            Self::X64
        } else if cfg!(target_arch = "aarch64") {
            Self::ARM64
        } else {
            Self::NONE
        }
    }
}

impl BitOr for HandshakeOptions {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl fmt::Debug for HandshakeOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = [
            (Self::TASK_HOST, "TASK_HOST"),
            (Self::SERVER, "SERVER"),
            (Self::NODE_REUSE, "NODE_REUSE"),
            (Self::LOW_PRIORITY, "LOW_PRIORITY"),
            (Self::X64, "X64"),
            (Self::ARM64, "ARM64"),
        ];
        let set: Vec<&str> = names
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect();
        if set.is_empty() {
            f.write_str("NONE")
        } else {
            f.write_str(&set.join(" | "))
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub epoch: i32,
    pub major: i32,
    pub minor: i32,
    pub patch: i32,
    pub options: HandshakeOptions,
    pub salt: Option<i32>,
}

impl Handshake {
    /// Handshake of this binary for the given role flags.
    pub fn current(role: HandshakeOptions, salt: Option<i32>) -> Self {
        let version = buildhost_build_info::version();
        Self {
            epoch: PROTOCOL_EPOCH,
            major: version.major,
            minor: version.minor,
            patch: version.patch,
            options: role | HandshakeOptions::host_architecture(),
            salt,
        }
    }

    pub fn for_server(node_reuse: bool, salt: Option<i32>) -> Self {
        let mut role = HandshakeOptions::SERVER;
        if node_reuse {
            role = role | HandshakeOptions::NODE_REUSE;
        }
        Self::current(role, salt)
    }

    pub fn for_task_host(low_priority: bool, salt: Option<i32>) -> Self {
        let mut role = HandshakeOptions::TASK_HOST;
        if low_priority {
            role = role | HandshakeOptions::LOW_PRIORITY;
        }
        Self::current(role, salt)
    }

    /// Ordered components as exchanged on the wire, sentinel excluded.
    pub fn components(&self) -> Vec<i32> {
        let mut components = vec![
            self.options.bits() as i32,
            self.epoch,
            self.major,
            self.minor,
            self.patch,
        ];
        if let Some(salt) = self.salt {
            components.push(salt);
        }
        components
    }

    /// Stable hex digest of the components; names channels and locks.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        for component in self.components() {
            hasher.update(component.to_be_bytes());
        }
        let digest = hex::encode(hasher.finalize());
        digest[..FINGERPRINT_LEN].to_string()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    #[error("handshake timed out after {0:?}")]
    Timeout(Duration),
    #[error("peer closed the connection after {received} of {expected} handshake components")]
    Truncated { expected: usize, received: usize },
    #[error("handshake component {index} mismatch: expected {expected}, got {actual}")]
    ComponentMismatch {
        index: usize,
        expected: i32,
        actual: i32,
    },
    #[error("peer sent {received} handshake components, expected {expected}")]
    TooFewComponents { expected: usize, received: usize },
    #[error("expected end-of-handshake marker, got {actual}")]
    SentinelMismatch { actual: i32 },
    #[error("handshake I/O failed: {0}")]
    Io(#[from] io::Error),
}

/// Clamp a requested handshake timeout to what the platform can honour.
pub fn effective_timeout(requested: Duration) -> Duration {
    #[cfg(unix)]
    {
        requested.max(MIN_HANDSHAKE_TIMEOUT)
    }
    #[cfg(not(unix))]
    {
        requested
    }
}

/// Exchange and verify handshakes. On error the caller must drop the stream.
pub async fn perform_handshake<S>(
    stream: &mut S,
    expected: &Handshake,
    timeout: Duration,
) -> Result<(), HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let timeout = effective_timeout(timeout);
    match tokio::time::timeout(timeout, exchange(stream, expected)).await {
        Ok(result) => result,
        Err(_) => {
            debug!(?timeout, "handshake timed out");
            Err(HandshakeError::Timeout(timeout))
        }
    }
}

async fn exchange<S>(stream: &mut S, expected: &Handshake) -> Result<(), HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let components = expected.components();

    let mut out = Vec::with_capacity((components.len() + 1) * 4);
    for component in &components {
        out.extend_from_slice(&component.to_be_bytes());
    }
    out.extend_from_slice(&END_OF_HANDSHAKE.to_be_bytes());
    stream.write_all(&out).await?;
    stream.flush().await?;
    trace!(options = ?expected.options, ?components, "sent handshake");

    for (index, want) in components.iter().enumerate() {
        let got = read_component(stream, components.len(), index).await?;
        trace!(index, got, "received handshake component");
        if got == END_OF_HANDSHAKE {
            return Err(HandshakeError::TooFewComponents {
                expected: components.len(),
                received: index,
            });
        }
        if got != *want {
            return Err(HandshakeError::ComponentMismatch {
                index,
                expected: *want,
                actual: got,
            });
        }
    }

    let sentinel = read_component(stream, components.len(), components.len()).await?;
    if sentinel != END_OF_HANDSHAKE {
        return Err(HandshakeError::SentinelMismatch { actual: sentinel });
    }
    trace!("handshake complete");
    Ok(())
}

async fn read_component<S>(stream: &mut S, expected: usize, index: usize) -> Result<i32, HandshakeError>
where
    S: AsyncRead + Unpin,
{
    let mut raw = [0u8; 4];
    match stream.read_exact(&mut raw).await {
        Ok(_) => Ok(i32::from_be_bytes(raw)),
        Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => Err(HandshakeError::Truncated {
            expected,
            received: index,
        }),
        Err(err) => Err(HandshakeError::Io(err)),
    }
}
