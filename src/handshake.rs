//! Startup readiness handshake.
//!
//! The engine boots inside an interpreter that logs freely to the same
//! stream before it is able to serve requests. When it is live it emits
//! `{"ready":true}`; everything before that banner is discarded.

use serde_json::Value;
use tokio::time::Instant;
use tracing::debug;

use crate::error::{BridgeError, Result};
use crate::framing::{decode, preview, Decoded};
use crate::transport::Transport;

/// Lines scanned for the readiness banner before giving up.
pub const HANDSHAKE_MAX_LINES: usize = 50;

/// True if `line` is the readiness banner.
pub fn is_ready_banner(line: &str) -> bool {
    match decode(line) {
        Decoded::Message(value) => value.get("ready").and_then(Value::as_bool) == Some(true),
        _ => false,
    }
}

/// Read lines until the readiness banner appears.
///
/// Returns the number of lines scanned, banner included.
///
/// # Errors
///
/// - `BridgeError::Startup` if `max_lines` lines pass without a banner, or
///   `deadline` passes first
/// - `BridgeError::Closed` if the transport dies during startup
pub async fn await_ready(
    transport: &mut dyn Transport,
    max_lines: usize,
    deadline: Instant,
) -> Result<usize> {
    let started = Instant::now();

    for scanned in 0..max_lines {
        let Some(line) = transport.recv_line(deadline).await? else {
            return Err(BridgeError::Startup {
                scanned,
                detail: format!(
                    "no readiness banner within {}ms",
                    started.elapsed().as_millis()
                ),
            });
        };

        if is_ready_banner(&line) {
            return Ok(scanned + 1);
        }
        debug!(line = %preview(&line), "Discarding startup output");
    }

    Err(BridgeError::Startup {
        scanned: max_lines,
        detail: "line limit reached".to_string(),
    })
}
