//! Process-wide engine session.
//!
//! `BridgeSession` owns at most one [`EngineClient`]. Callers share the
//! session through an `Arc` and ask it for a client with
//! [`ensure_client`](BridgeSession::ensure_client); the first caller pays for
//! connecting, the handshake and the warm-up probe, everyone else gets the
//! published client.

use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::client::EngineClient;
use crate::config::BridgeConfig;
use crate::error::{BridgeError, Result};
use crate::transport::Connector;

/// Where the session is in bringing up its client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Uninitialized,
    /// Connecting and waiting for the readiness banner.
    Starting,
    /// Handshake done, running the warm-up probe.
    Probing,
    Ready,
}

/// Confirms that a freshly started engine can actually serve requests.
///
/// The outer process answers the handshake before its build subsystem has
/// finished loading, so the session probes with a real request until it
/// succeeds or the [`WarmUpPolicy`](crate::config::WarmUpPolicy) runs out.
#[async_trait]
pub trait WarmUpProbe: Send + Sync {
    async fn probe(&self, client: &EngineClient) -> Result<()>;
}

/// Smallest build document the engine accepts.
pub const MINIMAL_BUILD_XML: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<PathOfBuilding>
	<Build level="1" targetVersion="3_0" className="Scion" ascendClassName="None" mainSocketGroup="1"/>
	<Tree activeSpec="1">
		<Spec treeVersion="3_25" classId="0" ascendClassId="0" nodes=""/>
	</Tree>
	<Skills/>
	<Items/>
	<Config/>
</PathOfBuilding>
"#;

/// Default probe: load [`MINIMAL_BUILD_XML`].
#[derive(Debug, Clone, Copy, Default)]
pub struct MinimalBuildProbe;

#[async_trait]
impl WarmUpProbe for MinimalBuildProbe {
    async fn probe(&self, client: &EngineClient) -> Result<()> {
        client.load_build_xml(MINIMAL_BUILD_XML, Some("warm-up")).await
    }
}

/// Resets the session state to `Uninitialized` unless disarmed, so a
/// cancelled or failed construction never leaves it stuck mid-start.
struct StateReset<'a> {
    state: &'a Mutex<SessionState>,
    armed: bool,
}

impl Drop for StateReset<'_> {
    fn drop(&mut self) {
        if self.armed {
            *self.state.lock().unwrap_or_else(|e| e.into_inner()) = SessionState::Uninitialized;
        }
    }
}

/// Lazily constructed, shared engine client.
///
/// # Example
///
/// ```ignore
/// use std::sync::Arc;
/// use pob_bridge::{BridgeConfig, BridgeSession};
///
/// let session = Arc::new(BridgeSession::new(BridgeConfig::from_env()?));
/// let client = session.ensure_client().await?;
/// let info = client.get_build_info().await?;
/// session.stop_client().await;
/// ```
pub struct BridgeSession {
    config: BridgeConfig,
    connector: Arc<dyn Connector>,
    probe: Arc<dyn WarmUpProbe>,
    client: RwLock<Option<Arc<EngineClient>>>,
    state: Mutex<SessionState>,
    /// Serializes construction and teardown.
    gate: tokio::sync::Mutex<()>,
}

impl BridgeSession {
    /// Session that reaches the engine the way `config` describes.
    pub fn new(config: BridgeConfig) -> Self {
        let connector = Arc::new(config.clone());
        Self::with_connector(config, connector)
    }

    /// Session with a custom way of opening transports.
    ///
    /// `config` still supplies the timeouts and warm-up policy.
    pub fn with_connector(config: BridgeConfig, connector: Arc<dyn Connector>) -> Self {
        Self {
            config,
            connector,
            probe: Arc::new(MinimalBuildProbe),
            client: RwLock::new(None),
            state: Mutex::new(SessionState::Uninitialized),
            gate: tokio::sync::Mutex::new(()),
        }
    }

    /// Replace the warm-up probe.
    pub fn with_probe(mut self, probe: Arc<dyn WarmUpProbe>) -> Self {
        self.probe = probe;
        self
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, state: SessionState) {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = state;
    }

    /// The published client, if any. Never starts anything.
    pub fn get_client(&self) -> Option<Arc<EngineClient>> {
        self.client
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Return the published client, constructing and warming one up first
    /// if there is none.
    ///
    /// Concurrent callers wait for a single construction and all receive the
    /// same client.
    ///
    /// # Errors
    ///
    /// - `BridgeError::Config` if the bridge is disabled or misconfigured
    /// - any start error (`Spawn`, `Connect`, `Startup`, `Closed`)
    /// - `BridgeError::WarmUp` when every probe attempt failed
    ///
    /// On error nothing is published and the session is `Uninitialized`.
    pub async fn ensure_client(&self) -> Result<Arc<EngineClient>> {
        if !self.config.enabled {
            return Err(BridgeError::Config(
                "engine bridge is disabled (POB_BRIDGE_ENABLED)".to_string(),
            ));
        }
        if let Some(client) = self.get_client() {
            return Ok(client);
        }

        let _gate = self.gate.lock().await;
        // Someone else may have finished while we queued.
        if let Some(client) = self.get_client() {
            return Ok(client);
        }
        self.config.validate()?;

        let mut reset = StateReset {
            state: &self.state,
            armed: true,
        };

        self.set_state(SessionState::Starting);
        let client = Arc::new(EngineClient::from_config(&self.config));
        client.start(self.connector.as_ref()).await?;

        self.set_state(SessionState::Probing);
        if let Err(e) = self.warm_up(&client).await {
            // Never hand out a half-initialized engine; the next call starts clean.
            client.stop().await;
            return Err(e);
        }

        *self.client.write().unwrap_or_else(|e| e.into_inner()) = Some(Arc::clone(&client));
        reset.armed = false;
        self.set_state(SessionState::Ready);
        info!(transport = ?self.config.transport, "Engine session ready");
        Ok(client)
    }

    /// Probe until success, a fatal error, or the policy runs out.
    async fn warm_up(&self, client: &EngineClient) -> Result<()> {
        let policy = self.config.warmup;
        if policy.attempts == 0 {
            return Ok(());
        }

        let mut last = String::new();
        for attempt in 1..=policy.attempts {
            match self.probe.probe(client).await {
                Ok(()) => {
                    debug!(attempt, "Warm-up probe succeeded");
                    return Ok(());
                }
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    warn!(attempt, attempts = policy.attempts, error = %e, "Warm-up probe failed");
                    last = e.to_string();
                }
            }
            if attempt < policy.attempts {
                tokio::time::sleep(policy.interval()).await;
            }
        }

        Err(BridgeError::WarmUp {
            attempts: policy.attempts,
            last,
        })
    }

    /// Stop and forget the client. Safe to call when there is none.
    pub async fn stop_client(&self) {
        let _gate = self.gate.lock().await;
        let client = self
            .client
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .take();

        if let Some(client) = client {
            client.stop().await;
            info!("Engine session stopped");
        }
        self.set_state(SessionState::Uninitialized);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WarmUpPolicy;
    use crate::error::CloseReason;
    use crate::testing::{FakeEngine, Reply};
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::time::Duration;

    fn config(attempts: u32) -> BridgeConfig {
        BridgeConfig {
            request_timeout_ms: 2_000,
            start_timeout_ms: 2_000,
            warmup: WarmUpPolicy {
                attempts,
                interval_ms: 20,
            },
            ..BridgeConfig::default()
        }
    }

    fn session(config: BridgeConfig, engine: &Arc<FakeEngine>) -> BridgeSession {
        let connector: Arc<dyn Connector> = engine.clone();
        BridgeSession::with_connector(config, connector)
    }

    fn healthy_engine() -> Arc<FakeEngine> {
        Arc::new(FakeEngine::new(|_| Reply::line("{\"ok\":true}")))
    }

    fn actions(engine: &FakeEngine) -> Vec<String> {
        engine
            .requests()
            .iter()
            .filter_map(|r| r["action"].as_str().map(String::from))
            .collect()
    }

    #[tokio::test]
    async fn test_ensure_client_starts_and_probes_once() {
        let engine = healthy_engine();
        let session = session(config(5), &engine);
        assert_eq!(session.state(), SessionState::Uninitialized);
        assert!(session.get_client().is_none());

        let client = session.ensure_client().await.unwrap();
        assert!(client.is_ready());
        assert_eq!(session.state(), SessionState::Ready);

        let probe = &engine.requests()[0];
        assert_eq!(probe["action"], json!("load_build_xml"));
        assert_eq!(probe["params"]["name"], json!("warm-up"));

        // Second call returns the same client without side effects.
        let again = session.ensure_client().await.unwrap();
        assert!(Arc::ptr_eq(&client, &again));
        assert_eq!(engine.connections(), 1);
        assert_eq!(engine.requests().len(), 1);
    }

    #[tokio::test]
    async fn test_warm_up_exhaustion_names_attempts() {
        let engine = Arc::new(FakeEngine::new(|request| {
            match request["action"].as_str() {
                Some("load_build_xml") => {
                    Reply::line("{\"ok\":false,\"error\":\"build subsystem not ready\"}")
                }
                _ => Reply::line("{\"ok\":true}"),
            }
        }));
        let session = session(config(5), &engine);

        let started_at = std::time::Instant::now();
        let err = session.ensure_client().await.unwrap_err();
        match &err {
            BridgeError::WarmUp { attempts, last } => {
                assert_eq!(*attempts, 5);
                assert_eq!(last, "build subsystem not ready");
            }
            other => panic!("Expected WarmUp error, got {:?}", other),
        }
        assert!(err.to_string().contains("5 attempts"));
        // Four gaps between five attempts.
        assert!(started_at.elapsed() >= Duration::from_millis(80));

        let probes = actions(&engine)
            .iter()
            .filter(|a| *a == "load_build_xml")
            .count();
        assert_eq!(probes, 5);
        assert_eq!(session.state(), SessionState::Uninitialized);
        assert!(session.get_client().is_none());
    }

    #[tokio::test]
    async fn test_failed_warm_up_discards_client() {
        let healthy = Arc::new(AtomicBool::new(false));
        let engine = {
            let healthy = Arc::clone(&healthy);
            Arc::new(FakeEngine::new(move |request| {
                if request["action"] == json!("load_build_xml") && !healthy.load(Ordering::SeqCst) {
                    Reply::line("{\"ok\":false,\"error\":\"not yet\"}")
                } else {
                    Reply::line("{\"ok\":true}")
                }
            }))
        };
        let session = session(config(2), &engine);

        assert!(session.ensure_client().await.is_err());
        // The half-initialized engine was told to quit.
        assert_eq!(
            actions(&engine),
            vec!["load_build_xml", "load_build_xml", "quit"]
        );

        healthy.store(true, Ordering::SeqCst);
        let client = session.ensure_client().await.unwrap();
        assert!(client.ping().await.unwrap());
        assert_eq!(engine.connections(), 2);
    }

    #[tokio::test]
    async fn test_warm_up_retries_until_probe_succeeds() {
        struct FlakyProbe(AtomicU32);

        #[async_trait]
        impl WarmUpProbe for FlakyProbe {
            async fn probe(&self, client: &EngineClient) -> Result<()> {
                let attempt = self.0.fetch_add(1, Ordering::SeqCst) + 1;
                if attempt < 3 {
                    return Err(BridgeError::Remote {
                        action: "ping".to_string(),
                        message: format!("attempt {} too early", attempt),
                    });
                }
                client.ping().await.map(drop)
            }
        }

        let engine = healthy_engine();
        let probe = Arc::new(FlakyProbe(AtomicU32::new(0)));
        let session = session(config(5), &engine).with_probe(probe.clone());

        session.ensure_client().await.unwrap();
        assert_eq!(probe.0.load(Ordering::SeqCst), 3);
        assert_eq!(actions(&engine), vec!["ping"]);
    }

    #[tokio::test]
    async fn test_fatal_probe_error_stops_retrying() {
        let engine = Arc::new(FakeEngine::new(|_| Reply::Hangup));
        let session = session(config(5), &engine);

        let err = session.ensure_client().await.unwrap_err();
        assert!(matches!(err, BridgeError::Closed(CloseReason::ConnectionClosed)));
        assert_eq!(engine.requests().len(), 1);
        assert_eq!(session.state(), SessionState::Uninitialized);
    }

    #[tokio::test]
    async fn test_zero_attempts_skips_warm_up() {
        let engine = healthy_engine();
        let session = session(config(0), &engine);

        session.ensure_client().await.unwrap();
        assert!(engine.requests().is_empty());
    }

    #[tokio::test]
    async fn test_disabled_bridge_fails_fast() {
        let engine = healthy_engine();
        let session = session(
            BridgeConfig {
                enabled: false,
                ..config(5)
            },
            &engine,
        );

        let err = session.ensure_client().await.unwrap_err();
        assert!(matches!(err, BridgeError::Config(_)));
        assert_eq!(engine.connections(), 0);
        assert_eq!(session.state(), SessionState::Uninitialized);
    }

    #[tokio::test]
    async fn test_start_failure_resets_state() {
        let engine = Arc::new(
            FakeEngine::new(|_| Reply::line("{\"ok\":true}")).with_preamble("still booting\n"),
        );
        let mut config = config(5);
        config.start_timeout_ms = 100;
        let session = session(config, &engine);

        let err = session.ensure_client().await.unwrap_err();
        assert!(matches!(err, BridgeError::Startup { .. }));
        assert_eq!(session.state(), SessionState::Uninitialized);
        assert!(session.get_client().is_none());
    }

    #[tokio::test]
    async fn test_concurrent_ensure_builds_once() {
        let engine = Arc::new(FakeEngine::new(|_| {
            Reply::delayed(Duration::from_millis(50), "{\"ok\":true}")
        }));
        let session = Arc::new(session(config(5), &engine));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let session = Arc::clone(&session);
                tokio::spawn(async move { session.ensure_client().await })
            })
            .collect();

        let mut clients = Vec::new();
        for handle in handles {
            clients.push(handle.await.unwrap().unwrap());
        }
        assert!(clients.iter().all(|c| Arc::ptr_eq(c, &clients[0])));
        assert_eq!(engine.connections(), 1);
    }

    #[tokio::test]
    async fn test_stop_client_without_client() {
        let engine = healthy_engine();
        let session = session(config(5), &engine);

        session.stop_client().await;
        assert_eq!(session.state(), SessionState::Uninitialized);
        assert_eq!(engine.connections(), 0);
    }

    #[tokio::test]
    async fn test_stop_client_then_restart() {
        let engine = healthy_engine();
        let session = session(config(5), &engine);

        let first = session.ensure_client().await.unwrap();
        session.stop_client().await;
        assert_eq!(session.state(), SessionState::Uninitialized);
        assert!(session.get_client().is_none());
        assert!(!first.is_ready());

        let second = session.ensure_client().await.unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(engine.connections(), 2);
    }
}
