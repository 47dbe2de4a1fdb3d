//! Bridge configuration.
//!
//! Configuration comes from the environment ([`BridgeConfig::from_env`]) or
//! from any serde source (all fields have defaults). Everything the bridge
//! needs to reach the engine lives here: which transport to use, how to
//! launch or reach the engine, and the timeouts and warm-up policy.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{BridgeError, Result};

/// Environment variable the engine checks to run in line-protocol API mode.
pub const API_MODE_VAR: &str = "POB_API_STDIO";

const DEFAULT_PROGRAM: &str = "luajit";
const DEFAULT_SCRIPT: &str = "HeadlessWrapper.lua";
const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 31337;
const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_START_TIMEOUT_MS: u64 = 15_000;

/// Which transport variant the session constructs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportChoice {
    /// Spawn a headless engine subprocess.
    #[default]
    #[serde(alias = "stdio")]
    Process,
    /// Connect to a running engine over TCP.
    #[serde(alias = "tcp")]
    Socket,
}

impl FromStr for TransportChoice {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "process" | "stdio" => Ok(TransportChoice::Process),
            "socket" | "tcp" => Ok(TransportChoice::Socket),
            other => Err(BridgeError::Config(format!(
                "unknown transport `{}` (expected `process` or `tcp`)",
                other
            ))),
        }
    }
}

/// How to launch the headless engine.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ProcessConfig {
    /// Interpreter executable.
    pub program: String,
    /// Interpreter arguments (normally the API entry script).
    pub args: Vec<String>,
    /// Engine source directory; also used to extend the interpreter search path.
    pub cwd: Option<PathBuf>,
    /// Extra environment variables for the child.
    pub env: BTreeMap<String, String>,
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            program: DEFAULT_PROGRAM.to_string(),
            args: vec![DEFAULT_SCRIPT.to_string()],
            cwd: None,
            env: BTreeMap::new(),
        }
    }
}

impl ProcessConfig {
    /// Environment additions for the child process.
    ///
    /// Prepends the engine directory's module locations to `LUA_PATH` and
    /// `LUA_CPATH` (keeping the interpreter defaults via `;;`), sets the
    /// API-mode flag, then applies the configured extras, which win.
    pub fn command_env(&self) -> Vec<(String, String)> {
        let mut vars = Vec::new();

        if let Some(dir) = &self.cwd {
            let dir = dir.display();
            let lib_ext = if cfg!(windows) { "dll" } else { "so" };

            let lua_path = format!(
                "{dir}/?.lua;{dir}/runtime/lua/?.lua;{dir}/runtime/lua/?/init.lua"
            );
            let lua_cpath = format!("{dir}/?.{lib_ext};{dir}/runtime/?.{lib_ext}");

            vars.push(("LUA_PATH".to_string(), extend_search_path(&lua_path, "LUA_PATH")));
            vars.push((
                "LUA_CPATH".to_string(),
                extend_search_path(&lua_cpath, "LUA_CPATH"),
            ));
        }

        vars.push((API_MODE_VAR.to_string(), "1".to_string()));
        vars.extend(self.env.iter().map(|(k, v)| (k.clone(), v.clone())));
        vars
    }
}

/// `ours;inherited` if the variable is already set, else `ours;;`.
fn extend_search_path(ours: &str, var: &str) -> String {
    match std::env::var(var) {
        Ok(existing) if !existing.is_empty() => format!("{};{}", ours, existing),
        _ => format!("{};;", ours),
    }
}

/// Where a running engine listens.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SocketConfig {
    pub host: String,
    pub port: u16,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
        }
    }
}

impl SocketConfig {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Bounded post-handshake readiness probing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct WarmUpPolicy {
    /// Total probe attempts before giving up.
    pub attempts: u32,
    /// Fixed spacing between attempts.
    pub interval_ms: u64,
}

impl Default for WarmUpPolicy {
    fn default() -> Self {
        Self {
            attempts: 5,
            interval_ms: 2_000,
        }
    }
}

impl WarmUpPolicy {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

/// Complete bridge configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// When false, `ensure_client` refuses to start anything.
    pub enabled: bool,
    pub transport: TransportChoice,
    pub process: ProcessConfig,
    pub socket: SocketConfig,
    /// Deadline for one request/response exchange.
    pub request_timeout_ms: u64,
    /// Deadline for connecting and observing the readiness banner.
    pub start_timeout_ms: u64,
    pub warmup: WarmUpPolicy,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            transport: TransportChoice::default(),
            process: ProcessConfig::default(),
            socket: SocketConfig::default(),
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
            start_timeout_ms: DEFAULT_START_TIMEOUT_MS,
            warmup: WarmUpPolicy::default(),
        }
    }
}

impl BridgeConfig {
    /// Load configuration from `POB_*` environment variables.
    ///
    /// | Variable | Meaning |
    /// |---|---|
    /// | `POB_BRIDGE_ENABLED` | `0`/`false`/`no`/`off` disables the bridge |
    /// | `POB_BRIDGE_TRANSPORT` | `process` or `tcp` |
    /// | `POB_LUAJIT` | interpreter executable |
    /// | `POB_API_ARGS` | whitespace-separated interpreter arguments |
    /// | `POB_FORK_PATH` | engine working directory |
    /// | `POB_API_HOST`, `POB_API_PORT` | TCP endpoint |
    /// | `POB_TIMEOUT_MS`, `POB_START_TIMEOUT_MS` | timeouts |
    /// | `POB_WARMUP_ATTEMPTS`, `POB_WARMUP_INTERVAL_MS` | warm-up policy |
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an injectable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(value) = lookup("POB_BRIDGE_ENABLED") {
            config.enabled = parse_flag("POB_BRIDGE_ENABLED", &value)?;
        }
        if let Some(value) = lookup("POB_BRIDGE_TRANSPORT") {
            config.transport = value.parse()?;
        }
        if let Some(program) = lookup("POB_LUAJIT") {
            config.process.program = program;
        }
        if let Some(args) = lookup("POB_API_ARGS") {
            config.process.args = args.split_whitespace().map(String::from).collect();
        }
        config.process.cwd = Some(resolve_engine_dir(lookup("POB_FORK_PATH")));
        if let Some(host) = lookup("POB_API_HOST") {
            config.socket.host = host;
        }
        if let Some(port) = lookup("POB_API_PORT") {
            config.socket.port = parse_number("POB_API_PORT", &port)?;
        }
        if let Some(ms) = lookup("POB_TIMEOUT_MS") {
            config.request_timeout_ms = parse_number("POB_TIMEOUT_MS", &ms)?;
        }
        if let Some(ms) = lookup("POB_START_TIMEOUT_MS") {
            config.start_timeout_ms = parse_number("POB_START_TIMEOUT_MS", &ms)?;
        }
        if let Some(n) = lookup("POB_WARMUP_ATTEMPTS") {
            config.warmup.attempts = parse_number("POB_WARMUP_ATTEMPTS", &n)?;
        }
        if let Some(ms) = lookup("POB_WARMUP_INTERVAL_MS") {
            config.warmup.interval_ms = parse_number("POB_WARMUP_INTERVAL_MS", &ms)?;
        }

        Ok(config)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn start_timeout(&self) -> Duration {
        Duration::from_millis(self.start_timeout_ms)
    }

    /// Check that the parameters for the selected transport are usable.
    pub fn validate(&self) -> Result<()> {
        if !self.enabled {
            return Err(BridgeError::Config(
                "engine bridge is disabled (POB_BRIDGE_ENABLED)".to_string(),
            ));
        }
        if self.request_timeout_ms == 0 || self.start_timeout_ms == 0 {
            return Err(BridgeError::Config("timeouts must be non-zero".to_string()));
        }
        match self.transport {
            TransportChoice::Process => {
                if self.process.program.trim().is_empty() {
                    return Err(BridgeError::Config(
                        "no engine interpreter configured (POB_LUAJIT)".to_string(),
                    ));
                }
                if let Some(cwd) = &self.process.cwd {
                    if !cwd.is_dir() {
                        return Err(BridgeError::Config(format!(
                            "engine directory {} does not exist (POB_FORK_PATH)",
                            cwd.display()
                        )));
                    }
                }
            }
            TransportChoice::Socket => {
                if self.socket.host.trim().is_empty() || self.socket.port == 0 {
                    return Err(BridgeError::Config(format!(
                        "invalid engine address `{}` (POB_API_HOST/POB_API_PORT)",
                        self.socket.addr()
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Resolve the default engine source directory.
///
/// Resolution order:
/// 1. `$POB_FORK_PATH`
/// 2. `<data dir>/PathOfBuilding/src` (e.g. `~/.local/share` on Linux)
/// 3. `./src` relative to the working directory
pub fn default_engine_dir() -> PathBuf {
    resolve_engine_dir(std::env::var("POB_FORK_PATH").ok())
}

fn resolve_engine_dir(fork_path: Option<String>) -> PathBuf {
    if let Some(path) = fork_path {
        return PathBuf::from(path);
    }
    installed_engine_dir()
}

/// Steps 2 and 3 of [`default_engine_dir`].
fn installed_engine_dir() -> PathBuf {
    if let Some(data_dir) = dirs::data_dir() {
        let candidate = data_dir.join("PathOfBuilding").join("src");
        if candidate.is_dir() {
            return candidate;
        }
    }

    PathBuf::from("src")
}

fn parse_flag(var: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(BridgeError::Config(format!(
            "{} must be a boolean, got `{}`",
            var, other
        ))),
    }
}

fn parse_number<T: FromStr>(var: &str, value: &str) -> Result<T> {
    value.trim().parse().map_err(|_| {
        BridgeError::Config(format!("{} must be a number, got `{}`", var, value))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = BridgeConfig::default();
        assert!(config.enabled);
        assert_eq!(config.transport, TransportChoice::Process);
        assert_eq!(config.process.program, "luajit");
        assert_eq!(config.socket.addr(), "127.0.0.1:31337");
        assert_eq!(config.warmup.attempts, 5);
        assert_eq!(config.warmup.interval(), Duration::from_secs(2));
        assert_eq!(config.request_timeout(), Duration::from_secs(10));
    }

    #[test]
    fn test_from_lookup_overrides() {
        let config = BridgeConfig::from_lookup(lookup_from(&[
            ("POB_BRIDGE_TRANSPORT", "tcp"),
            ("POB_API_HOST", "10.0.0.5"),
            ("POB_API_PORT", "4000"),
            ("POB_TIMEOUT_MS", "2500"),
            ("POB_API_ARGS", "HeadlessWrapper.lua  --api"),
            ("POB_FORK_PATH", "/opt/pob/src"),
            ("POB_WARMUP_ATTEMPTS", "3"),
        ]))
        .unwrap();

        assert_eq!(config.transport, TransportChoice::Socket);
        assert_eq!(config.socket.addr(), "10.0.0.5:4000");
        assert_eq!(config.request_timeout(), Duration::from_millis(2500));
        assert_eq!(config.process.args, vec!["HeadlessWrapper.lua", "--api"]);
        assert_eq!(config.process.cwd, Some(PathBuf::from("/opt/pob/src")));
        assert_eq!(config.warmup.attempts, 3);
    }

    #[test]
    fn test_from_lookup_ignores_process_environment() {
        // Whatever POB_FORK_PATH the test process has, an empty lookup must not see it.
        let config = BridgeConfig::from_lookup(lookup_from(&[])).unwrap();
        assert_eq!(config.process.cwd, Some(installed_engine_dir()));
    }

    #[test]
    fn test_from_lookup_rejects_garbage() {
        let err = BridgeConfig::from_lookup(lookup_from(&[("POB_API_PORT", "http")])).unwrap_err();
        assert!(matches!(err, BridgeError::Config(_)));

        let err =
            BridgeConfig::from_lookup(lookup_from(&[("POB_BRIDGE_ENABLED", "maybe")])).unwrap_err();
        assert!(err.to_string().contains("POB_BRIDGE_ENABLED"));

        let err =
            BridgeConfig::from_lookup(lookup_from(&[("POB_BRIDGE_TRANSPORT", "carrier-pigeon")]))
                .unwrap_err();
        assert!(err.to_string().contains("carrier-pigeon"));
    }

    #[test]
    fn test_disabled_flag() {
        let config =
            BridgeConfig::from_lookup(lookup_from(&[("POB_BRIDGE_ENABLED", "off")])).unwrap();
        assert!(!config.enabled);
        assert!(matches!(config.validate(), Err(BridgeError::Config(_))));
    }

    #[test]
    fn test_validate_socket_params() {
        let mut config = BridgeConfig {
            transport: TransportChoice::Socket,
            ..BridgeConfig::default()
        };
        assert!(config.validate().is_ok());

        config.socket.port = 0;
        assert!(matches!(config.validate(), Err(BridgeError::Config(_))));
    }

    #[test]
    fn test_validate_process_params() {
        let mut config = BridgeConfig::default();
        config.process.program = "  ".to_string();
        assert!(config.validate().is_err());

        config.process.program = "luajit".to_string();
        config.process.cwd = Some(PathBuf::from("/nonexistent/pob/src"));
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("/nonexistent/pob/src"));
    }

    #[test]
    fn test_command_env_sets_search_path_and_api_flag() {
        let mut env = BTreeMap::new();
        env.insert("POB_EXTRA".to_string(), "x".to_string());
        let config = ProcessConfig {
            cwd: Some(PathBuf::from("/opt/pob/src")),
            env,
            ..ProcessConfig::default()
        };

        let vars: HashMap<String, String> = config.command_env().into_iter().collect();
        assert_eq!(vars.get(API_MODE_VAR).map(String::as_str), Some("1"));
        assert_eq!(vars.get("POB_EXTRA").map(String::as_str), Some("x"));

        let lua_path = &vars["LUA_PATH"];
        assert!(lua_path.starts_with("/opt/pob/src/?.lua;/opt/pob/src/runtime/lua/?.lua;"));
        assert!(vars["LUA_CPATH"].contains("/opt/pob/src/runtime/?."));
    }

    #[test]
    fn test_command_env_without_cwd_only_sets_flag() {
        let vars = ProcessConfig::default().command_env();
        assert_eq!(vars, vec![(API_MODE_VAR.to_string(), "1".to_string())]);
    }

    #[test]
    fn test_deserialize_partial_config() {
        let config: BridgeConfig = serde_json::from_str(
            r#"{"transport": "tcp", "socket": {"port": 5555}, "warmup": {"attempts": 2}}"#,
        )
        .unwrap();
        assert_eq!(config.transport, TransportChoice::Socket);
        assert_eq!(config.socket.addr(), "127.0.0.1:5555");
        assert_eq!(config.warmup.attempts, 2);
        assert_eq!(config.warmup.interval_ms, 2_000);
    }
}
