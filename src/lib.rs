//! Path of Building engine bridge.
//!
//! This library drives a headless Path of Building engine (running under
//! LuaJIT) over a line-oriented JSON protocol:
//!
//! - `framing` - one JSON object per `\n`-terminated line
//! - `handshake` - skip startup noise until `{"ready":true}`
//! - `transport` - subprocess pipes or a TCP socket behind one trait
//! - `client` - single-flight request/response with timeouts
//! - `ops` - typed operations (`get_stats`, `set_tree`, ...)
//! - `session` - lazily started, warmed-up, shared client
//!
//! # Usage
//!
//! ```ignore
//! use std::sync::Arc;
//! use pob_bridge::{BridgeConfig, BridgeSession};
//!
//! let session = Arc::new(BridgeSession::new(BridgeConfig::from_env()?));
//! let client = session.ensure_client().await?;
//! client.load_build_xml(&xml, Some("imported")).await?;
//! let stats = client.get_stats(Some(&["Life", "TotalDPS"])).await?;
//! session.stop_client().await;
//! ```

pub mod client;
pub mod config;
pub mod error;
pub mod framing;
pub mod handshake;
pub mod ops;
pub mod session;
pub mod transport;

#[cfg(test)]
mod testing;

pub use client::EngineClient;
pub use config::{BridgeConfig, ProcessConfig, SocketConfig, TransportChoice, WarmUpPolicy};
pub use error::{BridgeError, CloseReason, Result};
pub use ops::{MainSelection, NewItem, TreeDelta, TreeSpec};
pub use session::{BridgeSession, MinimalBuildProbe, SessionState, WarmUpProbe};
pub use transport::{Connector, Transport, TransportKind};
