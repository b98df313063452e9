use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::net::{UnixListener, UnixStream};

use super::{IpcBackend, IpcListener};

pub struct UnixIpcBackend;

/// Removes its socket file when dropped.
pub struct UnixIpcListener {
    inner: UnixListener,
    path: PathBuf,
}

#[async_trait]
impl IpcBackend for UnixIpcBackend {
    type Stream = UnixStream;
    type Listener = UnixIpcListener;

    async fn bind(addr: &str) -> io::Result<Self::Listener> {
        if let Some(parent) = Path::new(addr).parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }
        // Only the holder of the running lock binds, so a leftover file is stale.
        let _ = std::fs::remove_file(addr);
        let listener = UnixListener::bind(addr)?;
        Ok(UnixIpcListener {
            inner: listener,
            path: PathBuf::from(addr),
        })
    }

    async fn connect(addr: &str) -> io::Result<Self::Stream> {
        UnixStream::connect(addr).await
    }
}

#[async_trait]
impl IpcListener for UnixIpcListener {
    type Stream = UnixStream;

    async fn accept(&mut self) -> io::Result<Self::Stream> {
        let (stream, _addr) = self.inner.accept().await?;
        Ok(stream)
    }
}

impl Drop for UnixIpcListener {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}
