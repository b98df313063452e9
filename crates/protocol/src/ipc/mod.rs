//! Local byte-stream transports: Unix domain sockets and Windows named pipes.

use std::io;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::{sleep, Instant};
use tracing::trace;

use crate::handshake::Handshake;

#[async_trait]
pub trait IpcBackend: Send + Sync + 'static {
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;
    type Listener: IpcListener<Stream = Self::Stream> + Send + 'static;

    async fn bind(addr: &str) -> io::Result<Self::Listener>;
    async fn connect(addr: &str) -> io::Result<Self::Stream>;
}

#[async_trait]
pub trait IpcListener: Send {
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;
    async fn accept(&mut self) -> io::Result<Self::Stream>;
}

#[cfg(unix)]
pub mod unix;

#[cfg(windows)]
pub mod windows;

#[cfg(unix)]
pub type DefaultBackend = unix::UnixIpcBackend;

#[cfg(windows)]
pub type DefaultBackend = windows::WindowsIpcBackend;

const CHANNEL_PREFIX: &str = "buildhost";
const CONNECT_RETRY_INTERVAL: Duration = Duration::from_millis(50);

/// Platform address of the channel for one handshake identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelName {
    name: String,
    addr: String,
}

impl ChannelName {
    /// `buildhost-<fingerprint>`, under `dir` (or `/tmp`) on Unix and as a
    /// named pipe on Windows.
    pub fn for_handshake(handshake: &Handshake, dir: Option<&Path>) -> Self {
        let name = format!("{}-{}", CHANNEL_PREFIX, handshake.fingerprint());
        let addr = platform_addr(&name, dir);
        Self { name, addr }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }
}

#[cfg(unix)]
fn platform_addr(name: &str, dir: Option<&Path>) -> String {
    // Socket paths are limited to ~100 bytes, so stay under a short directory.
    let dir = dir
        .map(Path::to_path_buf)
        .unwrap_or_else(|| std::path::PathBuf::from("/tmp"));
    dir.join(format!("{}.sock", name)).to_string_lossy().into_owned()
}

#[cfg(not(unix))]
fn platform_addr(name: &str, _dir: Option<&Path>) -> String {
    format!(r"\\.\pipe\{}", name)
}

/// Retry `connect` until it succeeds or `timeout` elapses.
pub async fn connect_with_timeout<B>(addr: &str, timeout: Duration) -> io::Result<B::Stream>
where
    B: IpcBackend,
{
    let deadline = Instant::now() + timeout;
    loop {
        match B::connect(addr).await {
            Ok(stream) => return Ok(stream),
            Err(err) => {
                if Instant::now() >= deadline {
                    return Err(err);
                }
                trace!(%addr, "connect attempt failed: {}", err);
                sleep(CONNECT_RETRY_INTERVAL).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handshake::HandshakeOptions;

    #[test]
    fn channel_name_follows_fingerprint() {
        let hs = Handshake::current(HandshakeOptions::SERVER, None);
        let channel = ChannelName::for_handshake(&hs, None);
        assert_eq!(channel.name(), format!("buildhost-{}", hs.fingerprint()));
        #[cfg(unix)]
        assert_eq!(
            channel.addr(),
            format!("/tmp/buildhost-{}.sock", hs.fingerprint())
        );
        #[cfg(windows)]
        assert!(channel.addr().starts_with(r"\\.\pipe\buildhost-"));

        let other = Handshake::current(HandshakeOptions::TASK_HOST, None);
        assert_ne!(ChannelName::for_handshake(&other, None), channel);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn connect_gives_up_after_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let addr = dir.path().join("nobody.sock");
        let started = std::time::Instant::now();
        let err = connect_with_timeout::<DefaultBackend>(
            addr.to_str().unwrap(),
            Duration::from_millis(150),
        )
        .await;
        assert!(err.is_err());
        assert!(started.elapsed() >= Duration::from_millis(150));
    }
}
