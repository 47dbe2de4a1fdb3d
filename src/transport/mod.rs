//! Transports carrying the line protocol to the engine.
//!
//! Both concrete channels (subprocess pipes and a TCP socket) reduce to the
//! same capability: write a line, receive the next line before a deadline,
//! close. The handshake and request/response logic in [`crate::client`] is
//! written once against the [`Transport`] trait.
//!
//! # Inbound path
//!
//! ```text
//! ┌──────────────┐  chunks   ┌──────────────────┐  poll every 10ms  ┌──────────┐
//! │ reader task  │ ────────► │ Inbox            │ ◄──────────────── │  client  │
//! │ (AsyncRead)  │           │ LineBuffer+close │                   │          │
//! └──────────────┘           └──────────────────┘                   └──────────┘
//! ```
//!
//! The reader task owns the read half and appends raw chunks to the inbox.
//! Waiting for a line is bounded cooperative polling against an absolute
//! deadline, so partial data stays buffered between polls and a close is
//! noticed within one poll interval.

mod process;
mod socket;

pub use process::ProcessTransport;
pub use socket::connect_socket;

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

use crate::config::{BridgeConfig, TransportChoice};
use crate::error::{BridgeError, CloseReason, Result};
use crate::framing::{LineBuffer, MAX_LINE_BYTES};

/// Sleep between inbox polls while waiting for a line.
pub const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Size of a single read from the underlying stream.
const READ_CHUNK: usize = 8 * 1024;

/// Which concrete channel a transport uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    /// Headless engine subprocess over stdin/stdout.
    Process,
    /// Live engine instance over TCP.
    Socket,
}

impl TransportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::Process => "process",
            TransportKind::Socket => "socket",
        }
    }
}

/// A bidirectional line channel to one engine instance.
///
/// Implementations are owned exclusively by one client; nothing else writes
/// to or closes them.
#[async_trait]
pub trait Transport: Send {
    fn kind(&self) -> TransportKind;

    /// Write one already-framed line (including its `\n`) and flush.
    async fn send_line(&mut self, line: &str) -> Result<()>;

    /// Wait for the next complete line.
    ///
    /// Returns `Ok(None)` once `deadline` passes. After the peer has gone,
    /// lines it finished writing are still returned, then
    /// `Err(BridgeError::Closed)`. After a local `close()` nothing more is
    /// returned.
    async fn recv_line(&mut self, deadline: Instant) -> Result<Option<String>>;

    /// Take every complete line that is already buffered, without waiting.
    fn drain_lines(&mut self) -> Vec<String>;

    /// Why the transport closed, if it has.
    fn close_reason(&self) -> Option<CloseReason>;

    /// Release all I/O resources. Never fails; problems are logged.
    async fn close(&mut self);
}

/// Opens a fresh transport to an engine.
///
/// [`BridgeConfig`] implements this for the configured transport variant;
/// tests substitute in-memory engines.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn Transport>>;
}

#[async_trait]
impl Connector for BridgeConfig {
    async fn connect(&self) -> Result<Box<dyn Transport>> {
        match self.transport {
            TransportChoice::Process => Ok(Box::new(ProcessTransport::spawn(&self.process)?)),
            TransportChoice::Socket => Ok(Box::new(
                connect_socket(&self.socket, self.start_timeout()).await?,
            )),
        }
    }
}

#[derive(Debug, Default)]
struct InboxState {
    buffer: LineBuffer,
    closed: Option<CloseReason>,
    /// The reader has seen the end of the stream.
    eof: bool,
}

/// Shared inbound buffer between a reader task and the owning transport.
#[derive(Debug, Clone, Default)]
pub struct Inbox {
    state: Arc<Mutex<InboxState>>,
}

impl Inbox {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, InboxState> {
        // Nothing panics while holding the lock, but never let poisoning
        // take the bridge down with it.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Append a raw chunk. Closes the inbox if a line grows past the limit.
    pub fn push(&self, chunk: &[u8]) {
        let mut state = self.lock();
        if !state.buffer.extend(chunk) {
            let discarded = state.buffer.clear();
            if state.closed.is_none() {
                state.closed = Some(CloseReason::ReadFailed(format!(
                    "line exceeds {} bytes ({} bytes discarded)",
                    MAX_LINE_BYTES, discarded
                )));
            }
        }
    }

    /// Mark the inbox closed. The first reason recorded wins.
    pub fn close(&self, reason: CloseReason) {
        let mut state = self.lock();
        if state.closed.is_none() {
            debug!(%reason, "transport closed");
            state.closed = Some(reason);
        }
    }

    pub fn closed(&self) -> Option<CloseReason> {
        self.lock().closed.clone()
    }

    /// Record that the reader reached the end of the stream.
    pub fn mark_eof(&self) {
        self.lock().eof = true;
    }

    /// Wait until the reader reaches EOF, the inbox closes, or `grace` passes.
    pub async fn wait_for_eof(&self, grace: Duration) {
        let deadline = Instant::now() + grace;
        loop {
            {
                let state = self.lock();
                if state.eof || state.closed.is_some() {
                    return;
                }
            }
            let now = Instant::now();
            if now >= deadline {
                debug!("engine output still open after {}ms", grace.as_millis());
                return;
            }
            tokio::time::sleep(POLL_INTERVAL.min(deadline - now)).await;
        }
    }

    pub fn drain_lines(&self) -> Vec<String> {
        let mut state = self.lock();
        std::iter::from_fn(|| state.buffer.next_line()).collect()
    }

    /// Poll for the next line until `deadline`.
    ///
    /// Complete lines the peer wrote before going away are still handed out
    /// ahead of the close. A local stop discards them.
    pub async fn next_line(&self, deadline: Instant) -> Result<Option<String>> {
        loop {
            {
                let mut state = self.lock();
                if state.closed != Some(CloseReason::Stopped) {
                    if let Some(line) = state.buffer.next_line() {
                        return Ok(Some(line));
                    }
                }
                if let Some(reason) = &state.closed {
                    return Err(BridgeError::Closed(reason.clone()));
                }
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(POLL_INTERVAL.min(deadline - now)).await;
        }
    }
}

/// Spawn a task that copies `reader` into `inbox` until EOF or error.
///
/// With `close_on_eof`, EOF closes the inbox as `ConnectionClosed`. The
/// subprocess transport passes `false`: EOF is only marked, and its exit
/// monitor records the exit status once the output is drained.
pub fn spawn_reader<R>(mut reader: R, inbox: Inbox, close_on_eof: bool) -> JoinHandle<()>
where
    R: AsyncRead + Send + Unpin + 'static,
{
    tokio::spawn(async move {
        let mut chunk = vec![0u8; READ_CHUNK];
        loop {
            match reader.read(&mut chunk).await {
                Ok(0) => {
                    debug!("engine output reached EOF");
                    inbox.mark_eof();
                    if close_on_eof {
                        inbox.close(CloseReason::ConnectionClosed);
                    }
                    return;
                }
                Ok(n) => {
                    inbox.push(&chunk[..n]);
                    if inbox.closed().is_some() {
                        return;
                    }
                }
                Err(e) => {
                    inbox.mark_eof();
                    inbox.close(CloseReason::ReadFailed(e.to_string()));
                    return;
                }
            }
        }
    })
}

/// Line transport over any async byte stream pair.
///
/// Used directly for TCP, wrapped by [`ProcessTransport`] for pipes, and
/// handy over `tokio::io::duplex` in tests.
pub struct StreamTransport {
    kind: TransportKind,
    writer: Box<dyn AsyncWrite + Send + Unpin>,
    inbox: Inbox,
    reader_task: JoinHandle<()>,
}

impl StreamTransport {
    /// Build a transport whose inbox closes when `reader` hits EOF.
    pub fn new<R, W>(kind: TransportKind, reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let inbox = Inbox::new();
        let reader_task = spawn_reader(reader, inbox.clone(), true);
        Self::from_parts(kind, writer, inbox, reader_task)
    }

    pub(crate) fn from_parts<W>(
        kind: TransportKind,
        writer: W,
        inbox: Inbox,
        reader_task: JoinHandle<()>,
    ) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            kind,
            writer: Box::new(writer),
            inbox,
            reader_task,
        }
    }

    pub fn inbox(&self) -> &Inbox {
        &self.inbox
    }
}

#[async_trait]
impl Transport for StreamTransport {
    fn kind(&self) -> TransportKind {
        self.kind
    }

    async fn send_line(&mut self, line: &str) -> Result<()> {
        if let Some(reason) = self.inbox.closed() {
            return Err(BridgeError::Closed(reason));
        }

        let written = async {
            self.writer.write_all(line.as_bytes()).await?;
            self.writer.flush().await
        }
        .await;

        match written {
            Ok(()) => Ok(()),
            // A broken pipe usually means the peer is gone; report why if known.
            Err(e) => Err(match self.inbox.closed() {
                Some(reason) => BridgeError::Closed(reason),
                None => BridgeError::Io(e),
            }),
        }
    }

    async fn recv_line(&mut self, deadline: Instant) -> Result<Option<String>> {
        self.inbox.next_line(deadline).await
    }

    fn drain_lines(&mut self) -> Vec<String> {
        self.inbox.drain_lines()
    }

    fn close_reason(&self) -> Option<CloseReason> {
        self.inbox.closed()
    }

    async fn close(&mut self) {
        self.inbox.close(CloseReason::Stopped);
        if let Err(e) = self.writer.shutdown().await {
            debug!(error = %e, "writer shutdown failed");
        }
        self.reader_task.abort();
    }
}

impl Drop for StreamTransport {
    fn drop(&mut self) {
        self.reader_task.abort();
    }
}
