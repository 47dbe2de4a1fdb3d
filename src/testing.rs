//! In-memory engine for unit tests.
//!
//! `FakeEngine` is a [`Connector`] whose every connection is a
//! `tokio::io::duplex` pipe served by a task that writes a startup preamble
//! and answers each request line with whatever the handler returns.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{duplex, AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};

use crate::error::Result;
use crate::transport::{Connector, StreamTransport, Transport, TransportKind};

/// What the fake engine does with one request.
pub(crate) enum Reply {
    /// Write `text` (plus `\n`) after `delay`.
    Lines { delay: Duration, text: String },
    /// Never answer.
    Silent,
    /// Close the connection.
    Hangup,
}

impl Reply {
    pub(crate) fn line(text: &str) -> Self {
        Reply::Lines {
            delay: Duration::ZERO,
            text: text.to_string(),
        }
    }

    pub(crate) fn delayed(delay: Duration, text: &str) -> Self {
        Reply::Lines {
            delay,
            text: text.to_string(),
        }
    }
}

type Handler = Arc<dyn Fn(&Value) -> Reply + Send + Sync>;

pub(crate) struct FakeEngine {
    preamble: String,
    kind: TransportKind,
    handler: Handler,
    requests: Arc<Mutex<Vec<Value>>>,
    connections: Arc<AtomicUsize>,
}

impl FakeEngine {
    pub(crate) fn new(handler: impl Fn(&Value) -> Reply + Send + Sync + 'static) -> Self {
        Self {
            preamble: "{\"ready\":true}\n".to_string(),
            kind: TransportKind::Process,
            handler: Arc::new(handler),
            requests: Arc::new(Mutex::new(Vec::new())),
            connections: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub(crate) fn with_preamble(mut self, preamble: &str) -> Self {
        self.preamble = preamble.to_string();
        self
    }

    pub(crate) fn with_kind(mut self, kind: TransportKind) -> Self {
        self.kind = kind;
        self
    }

    /// Every request received so far, across all connections.
    pub(crate) fn requests(&self) -> Vec<Value> {
        self.requests.lock().unwrap().clone()
    }

    pub(crate) fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    pub(crate) async fn wait_for_requests(&self, count: usize, timeout: Duration) {
        let waited = tokio::time::timeout(timeout, async {
            while self.requests.lock().unwrap().len() < count {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await;
        assert!(waited.is_ok(), "engine never received {} requests", count);
    }
}

#[async_trait]
impl Connector for FakeEngine {
    async fn connect(&self) -> Result<Box<dyn Transport>> {
        self.connections.fetch_add(1, Ordering::SeqCst);

        let (client_io, engine_io) = duplex(256 * 1024);
        tokio::spawn(serve(
            engine_io,
            self.preamble.clone(),
            Arc::clone(&self.handler),
            Arc::clone(&self.requests),
        ));

        let (read, write) = tokio::io::split(client_io);
        Ok(Box::new(StreamTransport::new(self.kind, read, write)))
    }
}

async fn serve(
    engine_io: DuplexStream,
    preamble: String,
    handler: Handler,
    requests: Arc<Mutex<Vec<Value>>>,
) {
    let (read, mut write) = tokio::io::split(engine_io);
    if write.write_all(preamble.as_bytes()).await.is_err() {
        return;
    }

    let mut lines = BufReader::new(read).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let Ok(request) = serde_json::from_str::<Value>(&line) else {
            continue;
        };
        requests.lock().unwrap().push(request.clone());

        match handler(&request) {
            Reply::Lines { delay, text } => {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                if write.write_all(format!("{}\n", text).as_bytes()).await.is_err() {
                    return;
                }
            }
            Reply::Silent => {}
            Reply::Hangup => return,
        }
    }
}
