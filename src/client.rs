//! Engine client: one transport, one request at a time.
//!
//! `EngineClient` owns a single [`Transport`], runs the readiness handshake
//! on `start()`, and then exchanges strictly alternating request/response
//! lines. The typed operations (`get_stats`, `set_tree`, ...) live in
//! [`crate::ops`] and all funnel through [`EngineClient::call`].
//!
//! # Single-flight
//!
//! The protocol is half-duplex with no request ids, so a second request
//! issued while one is outstanding is rejected immediately with
//! [`BridgeError::Busy`] rather than queued.
//!
//! # Stale responses
//!
//! The engine answers every request exactly once, in order. When a request
//! times out (or its caller gives up) the answer still arrives later, so the
//! client keeps a count of answers it is owed and discards that many
//! responses before accepting the one for the current request.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde_json::{Map, Value};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::config::BridgeConfig;
use crate::error::{BridgeError, Result};
use crate::framing::{self, preview, Decoded, Request, Response};
use crate::handshake::{self, HANDSHAKE_MAX_LINES};
use crate::transport::{Connector, Transport, TransportKind};

/// Non-protocol lines tolerated while waiting for one response.
pub const RESPONSE_MAX_LINES: usize = 100;

/// How long `stop()` waits for the engine to acknowledge `quit`.
const QUIT_GRACE: Duration = Duration::from_millis(500);

struct ClientInner {
    transport: Option<Box<dyn Transport>>,
    /// Responses the engine still owes for requests nobody is waiting on.
    owed_responses: usize,
}

/// Releases the in-flight flag when the request finishes or is dropped.
struct FlightGuard<'a>(&'a AtomicBool);

impl<'a> FlightGuard<'a> {
    fn acquire(flag: &'a AtomicBool, action: &str) -> Result<Self> {
        if flag.swap(true, Ordering::AcqRel) {
            return Err(BridgeError::Busy {
                action: action.to_string(),
            });
        }
        Ok(Self(flag))
    }
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Client for one engine instance.
///
/// # Connection Lifecycle
///
/// - `new()` - constructed empty, no transport
/// - `start()` / `start_with()` - connect and wait for the readiness banner
/// - `call()` and the typed operations - one request/response each
/// - `stop()` - best-effort `quit`, close the transport, back to empty
///
/// Once the transport reports exit or close the client is dead: every call
/// fails with `BridgeError::Closed` until it is stopped and started again.
///
/// # Example
///
/// ```ignore
/// use pob_bridge::{BridgeConfig, EngineClient};
///
/// let config = BridgeConfig::from_env()?;
/// let client = EngineClient::from_config(&config);
/// client.start(&config).await?;
///
/// let stats = client.get_stats(Some(&["Life", "TotalDPS"])).await?;
/// ```
pub struct EngineClient {
    inner: Mutex<ClientInner>,
    in_flight: AtomicBool,
    ready: AtomicBool,
    request_timeout: Duration,
    start_timeout: Duration,
}

impl std::fmt::Debug for EngineClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineClient")
            .field("in_flight", &self.in_flight)
            .field("ready", &self.ready)
            .field("request_timeout", &self.request_timeout)
            .field("start_timeout", &self.start_timeout)
            .finish_non_exhaustive()
    }
}

impl EngineClient {
    pub fn new(request_timeout: Duration, start_timeout: Duration) -> Self {
        Self {
            inner: Mutex::new(ClientInner {
                transport: None,
                owed_responses: 0,
            }),
            in_flight: AtomicBool::new(false),
            ready: AtomicBool::new(false),
            request_timeout,
            start_timeout,
        }
    }

    pub fn from_config(config: &BridgeConfig) -> Self {
        Self::new(config.request_timeout(), config.start_timeout())
    }

    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    /// True once the handshake has completed and until `stop()`.
    ///
    /// A ready client may still be dead if its transport has since closed.
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    /// Open a transport through `connector` and complete the handshake.
    ///
    /// Does nothing if the client is already started.
    pub async fn start(&self, connector: &dyn Connector) -> Result<()> {
        if self.is_ready() {
            return Ok(());
        }
        let transport = connector.connect().await?;
        self.start_with(transport).await
    }

    /// Complete the handshake over an already-open transport.
    ///
    /// On failure the transport is closed before the error is returned.
    pub async fn start_with(&self, mut transport: Box<dyn Transport>) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.transport.is_some() {
            transport.close().await;
            return Ok(());
        }

        let deadline = Instant::now() + self.start_timeout;
        match handshake::await_ready(transport.as_mut(), HANDSHAKE_MAX_LINES, deadline).await {
            Ok(scanned) => {
                info!(
                    transport = transport.kind().as_str(),
                    "Engine ready after {} startup lines", scanned
                );
                inner.transport = Some(transport);
                inner.owed_responses = 0;
                self.ready.store(true, Ordering::Release);
                Ok(())
            }
            Err(e) => {
                transport.close().await;
                Err(e)
            }
        }
    }

    /// Kind of the current transport, if started.
    pub async fn transport_kind(&self) -> Option<TransportKind> {
        self.inner.lock().await.transport.as_ref().map(|t| t.kind())
    }

    /// Send `{action, params}` and return the result fields of an `ok` reply.
    ///
    /// # Errors
    ///
    /// - `BridgeError::Busy` if another request is outstanding (nothing is written)
    /// - `BridgeError::NotStarted` before `start()` completes
    /// - `BridgeError::Timeout` if no response arrives within the request timeout
    /// - `BridgeError::Remote` if the engine answers `{ok: false, error}`
    /// - `BridgeError::Protocol` for malformed replies
    /// - `BridgeError::Closed` once the transport has exited or closed
    pub async fn call(&self, action: &str, params: Option<Value>) -> Result<Map<String, Value>> {
        self.exchange(action, params, None).await
    }

    /// Like [`call`](Self::call), but only over the given transport kind.
    pub(crate) async fn call_on(
        &self,
        kind: TransportKind,
        action: &str,
        params: Option<Value>,
    ) -> Result<Map<String, Value>> {
        self.exchange(action, params, Some(kind)).await
    }

    async fn exchange(
        &self,
        action: &str,
        params: Option<Value>,
        required: Option<TransportKind>,
    ) -> Result<Map<String, Value>> {
        // Claimed before the first await so a concurrent caller fails fast.
        let _flight = FlightGuard::acquire(&self.in_flight, action)?;

        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;
        let transport = match inner.transport.as_mut() {
            Some(transport) if self.is_ready() => transport,
            _ => return Err(BridgeError::NotStarted),
        };
        if let Some(reason) = transport.close_reason() {
            return Err(BridgeError::Closed(reason));
        }
        if let Some(kind) = required {
            if transport.kind() != kind {
                return Err(BridgeError::Unsupported {
                    action: action.to_string(),
                    transport: transport.kind().as_str(),
                });
            }
        }

        discard_unsolicited(transport.as_mut(), &mut inner.owed_responses);

        let line = framing::encode(&Request::new(action, params)).map_err(|e| {
            BridgeError::Protocol {
                action: action.to_string(),
                detail: format!("failed to encode request: {}", e),
            }
        })?;
        debug!(action, "-> {}", preview(line.trim_end()));
        transport.send_line(&line).await?;
        // Owed until a response is read, even if this future is dropped.
        inner.owed_responses += 1;

        let deadline = Instant::now() + self.request_timeout;
        let response = read_response(
            transport.as_mut(),
            action,
            deadline,
            self.request_timeout,
            &mut inner.owed_responses,
        )
        .await?;

        if response.ok {
            Ok(response.fields)
        } else {
            Err(BridgeError::Remote {
                action: action.to_string(),
                message: response
                    .error
                    .unwrap_or_else(|| "engine reported failure without a message".to_string()),
            })
        }
    }

    /// Best-effort `quit`, then close the transport and return to empty.
    ///
    /// Never fails: quit and termination errors are logged and dropped.
    pub async fn stop(&self) {
        let mut inner = self.inner.lock().await;
        self.ready.store(false, Ordering::Release);
        inner.owed_responses = 0;

        let Some(mut transport) = inner.transport.take() else {
            return;
        };

        if transport.close_reason().is_none() {
            if let Err(e) = send_quit(transport.as_mut()).await {
                debug!(error = %e, "quit request failed; terminating engine anyway");
            }
        }
        transport.close().await;
        info!(transport = transport.kind().as_str(), "Engine client stopped");
    }
}

/// Drop lines that arrived while nobody was waiting.
///
/// Complete JSON responses pay down the owed count first; anything else is
/// unsolicited. A partial trailing line stays buffered.
fn discard_unsolicited(transport: &mut dyn Transport, owed_responses: &mut usize) {
    for line in transport.drain_lines() {
        match framing::decode(&line) {
            Decoded::Message(_) if *owed_responses > 0 => {
                *owed_responses -= 1;
                debug!(line = %preview(&line), "Discarding stale response");
            }
            _ => debug!(line = %preview(&line), "Discarding unsolicited line"),
        }
    }
}

/// Wait for the response to the request just sent.
///
/// Expects `owed_responses` to include that request. Noise and malformed
/// lines are skipped up to [`RESPONSE_MAX_LINES`]; responses owed to earlier,
/// abandoned requests are discarded.
async fn read_response(
    transport: &mut dyn Transport,
    action: &str,
    deadline: Instant,
    timeout: Duration,
    owed_responses: &mut usize,
) -> Result<Response> {
    let mut skipped = 0;

    loop {
        let Some(line) = transport.recv_line(deadline).await? else {
            return Err(BridgeError::Timeout {
                action: action.to_string(),
                after: timeout,
            });
        };

        match framing::decode(&line) {
            Decoded::Message(value) => {
                if *owed_responses > 1 {
                    *owed_responses -= 1;
                    debug!(action, line = %preview(&line), "Discarding stale response");
                    continue;
                }
                *owed_responses = 0;
                debug!(action, "<- {}", preview(&line));
                return Response::from_value(value).map_err(|detail| BridgeError::Protocol {
                    action: action.to_string(),
                    detail,
                });
            }
            Decoded::Noise | Decoded::Malformed(_) => {
                skipped += 1;
                debug!(action, line = %preview(&line), "Skipping non-protocol line");
                if skipped >= RESPONSE_MAX_LINES {
                    return Err(BridgeError::Protocol {
                        action: action.to_string(),
                        detail: format!("no response among {} lines", skipped),
                    });
                }
            }
        }
    }
}

async fn send_quit(transport: &mut dyn Transport) -> Result<()> {
    let line = framing::encode(&Request::new("quit", None)).map_err(|e| BridgeError::Protocol {
        action: "quit".to_string(),
        detail: e.to_string(),
    })?;
    transport.send_line(&line).await?;
    // Give the engine a moment to acknowledge; any answer (or none) is fine.
    let _ = transport.recv_line(Instant::now() + QUIT_GRACE).await;
    Ok(())
}
