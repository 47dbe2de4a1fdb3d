//! Error taxonomy for the engine bridge.
//!
//! Every failure a caller can observe is a [`BridgeError`]. The variants map
//! onto the ways a bridge call can go wrong: bad configuration, a launch or
//! readiness failure, a per-request timeout, a malformed reply, an error
//! reported by the engine itself, or the transport dying underneath us.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// Why a transport stopped delivering lines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// The engine subprocess exited.
    Exited {
        /// Exit code, if the process exited normally.
        code: Option<i32>,
        /// Terminating signal, if the process was killed (unix only).
        signal: Option<i32>,
    },
    /// The remote end closed the TCP connection.
    ConnectionClosed,
    /// Reading from the transport failed.
    ReadFailed(String),
    /// The transport was closed locally by `stop()`.
    Stopped,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::Exited {
                code: Some(code), ..
            } => write!(f, "engine process exited with code {}", code),
            CloseReason::Exited {
                signal: Some(signal),
                ..
            } => write!(f, "engine process terminated by signal {}", signal),
            CloseReason::Exited { .. } => write!(f, "engine process exited"),
            CloseReason::ConnectionClosed => write!(f, "connection closed by engine"),
            CloseReason::ReadFailed(msg) => write!(f, "read from engine failed: {}", msg),
            CloseReason::Stopped => write!(f, "transport stopped"),
        }
    }
}

/// Bridge-level error types.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// Bridge disabled, or a required connection parameter is missing/invalid.
    #[error("Bridge configuration error: {0}")]
    Config(String),

    /// The engine process could not be spawned.
    #[error("Failed to spawn engine `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// The TCP connection to a running engine could not be opened.
    #[error("Failed to connect to engine at {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// No readiness banner was observed.
    #[error("Engine did not signal readiness after {scanned} lines: {detail}")]
    Startup { scanned: usize, detail: String },

    /// No complete response line arrived before the per-request deadline.
    #[error("Request `{action}` timed out after {}ms", .after.as_millis())]
    Timeout { action: String, after: Duration },

    /// A reply line was not a well-formed response.
    #[error("Protocol error during `{action}`: {detail}")]
    Protocol { action: String, detail: String },

    /// The engine answered `{ok: false, error}`. Displays the engine's message verbatim.
    #[error("{message}")]
    Remote { action: String, message: String },

    /// The transport exited or closed; the client is permanently dead.
    #[error("{0}")]
    Closed(CloseReason),

    /// A request was issued while another one was still awaiting its response.
    #[error("Request `{action}` rejected: another request is already in flight")]
    Busy { action: String },

    /// An operation was called before `start()` completed its handshake.
    #[error("Engine client is not started")]
    NotStarted,

    /// The operation needs a live (socket) engine.
    #[error("`{action}` is not supported over the {transport} transport")]
    Unsupported {
        action: String,
        transport: &'static str,
    },

    /// Every warm-up probe attempt failed.
    #[error("Engine warm-up failed after {attempts} attempts: {last}")]
    WarmUp { attempts: u32, last: String },

    /// I/O error while writing to the transport.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl BridgeError {
    /// True if the error means the client can never be used again.
    pub fn is_fatal(&self) -> bool {
        matches!(self, BridgeError::Closed(_))
    }
}

/// Convenience alias used across the crate.
pub type Result<T, E = BridgeError> = std::result::Result<T, E>;
