//! TCP connection to an already-running engine instance.
//!
//! A live GUI instance keeps its own incremental calculation state, which is
//! why the client exposes a couple of extra operations over this transport.

use std::time::Duration;

use tokio::net::TcpStream;
use tracing::info;

use super::{StreamTransport, TransportKind};
use crate::config::SocketConfig;
use crate::error::{BridgeError, Result};

/// Connect to the engine at `config.host:config.port`.
///
/// The returned transport closes its inbox when the engine closes the
/// connection. The readiness handshake is left to the client.
///
/// # Errors
///
/// Returns `BridgeError::Connect` if the connection is refused, cannot be
/// resolved, or does not complete within `connect_timeout`.
pub async fn connect_socket(
    config: &SocketConfig,
    connect_timeout: Duration,
) -> Result<StreamTransport> {
    let addr = config.addr();
    info!("Connecting to engine at {}", addr);

    let connect_error = |source: std::io::Error| BridgeError::Connect {
        addr: addr.clone(),
        source,
    };

    let stream = tokio::time::timeout(connect_timeout, TcpStream::connect(&addr))
        .await
        .map_err(|_| {
            connect_error(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                format!("connect timed out after {}ms", connect_timeout.as_millis()),
            ))
        })?
        .map_err(connect_error)?;

    // Requests are single small lines; don't let Nagle hold them back.
    stream.set_nodelay(true).map_err(connect_error)?;

    let (read_half, write_half) = stream.into_split();
    Ok(StreamTransport::new(
        TransportKind::Socket,
        read_half,
        write_half,
    ))
}
