use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::windows::named_pipe::{
    ClientOptions, NamedPipeClient, NamedPipeServer, ServerOptions,
};

use super::{IpcBackend, IpcListener};

pub struct WindowsIpcBackend;

pub struct WindowsIpcListener {
    name: String,
    server: NamedPipeServer,
}

/// Accepted (server) or connected (client) end of a named pipe.
pub enum WindowsPipeStream {
    Server(NamedPipeServer),
    Client(NamedPipeClient),
}

impl AsyncRead for WindowsPipeStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            WindowsPipeStream::Server(s) => Pin::new(s).poll_read(cx, buf),
            WindowsPipeStream::Client(c) => Pin::new(c).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for WindowsPipeStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            WindowsPipeStream::Server(s) => Pin::new(s).poll_write(cx, buf),
            WindowsPipeStream::Client(c) => Pin::new(c).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            WindowsPipeStream::Server(s) => Pin::new(s).poll_flush(cx),
            WindowsPipeStream::Client(c) => Pin::new(c).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            WindowsPipeStream::Server(s) => Pin::new(s).poll_shutdown(cx),
            WindowsPipeStream::Client(c) => Pin::new(c).poll_shutdown(cx),
        }
    }
}

#[async_trait]
impl IpcBackend for WindowsIpcBackend {
    type Stream = WindowsPipeStream;
    type Listener = WindowsIpcListener;

    async fn bind(addr: &str) -> io::Result<Self::Listener> {
        let name = normalize_pipe_name(addr);
        // Fails if another process already owns this pipe name.
        let server = ServerOptions::new()
            .first_pipe_instance(true)
            .create(&name)?;
        Ok(WindowsIpcListener { name, server })
    }

    async fn connect(addr: &str) -> io::Result<Self::Stream> {
        let name = normalize_pipe_name(addr);
        let client = ClientOptions::new().open(&name)?;
        Ok(WindowsPipeStream::Client(client))
    }
}

#[async_trait]
impl IpcListener for WindowsIpcListener {
    type Stream = WindowsPipeStream;

    async fn accept(&mut self) -> io::Result<Self::Stream> {
        self.server.connect().await?;
        // Hand out the connected instance and queue a fresh one for the next client.
        let connected = std::mem::replace(
            &mut self.server,
            ServerOptions::new().create(&self.name)?,
        );
        Ok(WindowsPipeStream::Server(connected))
    }
}

fn normalize_pipe_name(addr: &str) -> String {
    let trimmed = addr.trim();
    if trimmed.starts_with(r"\\.\pipe\") {
        trimmed.to_string()
    } else if let Some(name) = trimmed.strip_prefix("pipe:") {
        format!(r"\\.\pipe\{}", name)
    } else {
        format!(r"\\.\pipe\{}", trimmed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pipe_names_are_normalized() {
        assert_eq!(normalize_pipe_name("buildhost-ab"), r"\\.\pipe\buildhost-ab");
        assert_eq!(normalize_pipe_name("pipe:buildhost-ab"), r"\\.\pipe\buildhost-ab");
        assert_eq!(
            normalize_pipe_name(r"\\.\pipe\buildhost-ab"),
            r"\\.\pipe\buildhost-ab"
        );
    }
}
