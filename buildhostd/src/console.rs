//! Console redirection for a build running inside the server node.
//!
//! Text written by the build is buffered per stream and shipped as
//! `ConsoleWrite` packets when a stream's buffer crosses the size threshold,
//! on every flush tick, and when the console is closed. Each stream's text
//! leaves in the order it was written.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use buildhost_common::{ConsoleSink, ConsoleStream};
use buildhost_protocol::{ConsoleWrite, Packet};
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::trace;

#[derive(Default)]
struct Pending {
    stdout: String,
    stderr: String,
}

impl Pending {
    fn buffer(&mut self, stream: ConsoleStream) -> &mut String {
        match stream {
            ConsoleStream::Stdout => &mut self.stdout,
            ConsoleStream::Stderr => &mut self.stderr,
        }
    }
}

pub struct RedirectedConsole {
    pending: Mutex<Pending>,
    out: UnboundedSender<Packet>,
    threshold: usize,
    closed: CancellationToken,
}

impl RedirectedConsole {
    pub fn new(out: UnboundedSender<Packet>, threshold: usize) -> Self {
        Self {
            pending: Mutex::new(Pending::default()),
            out,
            threshold: threshold.max(1),
            closed: CancellationToken::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Pending> {
        // A panicking build must not wedge result delivery.
        self.pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Periodic flush until [`RedirectedConsole::close`].
    pub fn spawn_flusher(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let console = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;
                    _ = console.closed.cancelled() => break,
                    _ = ticker.tick() => console.flush_all(),
                }
            }
        })
    }

    fn send_stream(&self, pending: &mut Pending, stream: ConsoleStream) {
        let buffer = pending.buffer(stream);
        if buffer.is_empty() {
            return;
        }
        let text = std::mem::take(buffer);
        trace!(?stream, len = text.len(), "console flush");
        // Receiver gone means the connection is gone; output has nowhere to go.
        let _ = self.out.send(ConsoleWrite { text, stream }.into());
    }

    pub fn flush_all(&self) {
        let mut pending = self.lock();
        self.send_stream(&mut pending, ConsoleStream::Stdout);
        self.send_stream(&mut pending, ConsoleStream::Stderr);
    }

    /// Flush what is left and stop the periodic flusher.
    pub fn close(&self) {
        self.flush_all();
        self.closed.cancel();
    }
}

impl ConsoleSink for RedirectedConsole {
    fn write(&self, stream: ConsoleStream, text: &str) {
        if text.is_empty() {
            return;
        }
        let mut pending = self.lock();
        pending.buffer(stream).push_str(text);
        if pending.buffer(stream).len() >= self.threshold {
            self.send_stream(&mut pending, stream);
        }
    }

    fn flush(&self) {
        self.flush_all();
    }
}
