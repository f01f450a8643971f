use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Top-level configuration for the vmgate daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub trust: TrustConfig,
    pub throttle: ThrottleConfig,
    pub monitor: MonitorConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            trust: TrustConfig::default(),
            throttle: ThrottleConfig::default(),
            monitor: MonitorConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading config: {}", path.display()))?;
        let config: Config =
            toml::from_str(&content).with_context(|| format!("parsing config: {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            self.server.bind_addr.is_loopback(),
            "server.bind_addr must be a loopback address (pages reach the daemon on localhost only)"
        );
        anyhow::ensure!(self.server.port != 0, "server.port must be non-zero");
        anyhow::ensure!(
            self.server.idle_exit_secs >= 1,
            "server.idle_exit_secs must be >= 1"
        );
        anyhow::ensure!(
            !self.trust.authorized_url.is_empty(),
            "trust.authorized_url must not be empty"
        );
        anyhow::ensure!(self.throttle.tries >= 1, "throttle.tries must be >= 1");
        anyhow::ensure!(
            self.throttle.timespan_ms >= 1000,
            "throttle.timespan_ms must be >= 1000"
        );
        anyhow::ensure!(
            self.monitor.tick_interval_secs >= 1,
            "monitor.tick_interval_secs must be >= 1"
        );
        anyhow::ensure!(
            self.monitor.slow_probe_every_ticks >= 1,
            "monitor.slow_probe_every_ticks must be >= 1"
        );
        anyhow::ensure!(
            self.monitor.apiport_down_retries >= 1,
            "monitor.apiport_down_retries must be >= 1"
        );
        Ok(())
    }
}

/// Listening surface and daemon lifetime.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to bind. Must be loopback.
    pub bind_addr: Ipv4Addr,
    /// HTTP + WebSocket port. Pages hardcode 5624.
    pub port: u16,
    /// Exit after this many seconds with zero live connections.
    pub idle_exit_secs: u64,
    /// Directory for the instance lock and the per-install host key.
    pub state_dir: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: Ipv4Addr::LOCALHOST,
            port: vmgate_protocol::DAEMON_PORT,
            idle_exit_secs: 10,
            state_dir: PathBuf::from("/var/lib/vmgate"),
        }
    }
}

impl ServerConfig {
    /// Path of the exclusive instance lock file.
    pub fn lock_path(&self) -> PathBuf {
        self.state_dir.join("vmgate.lock")
    }

    /// Path of the persisted per-install host key.
    pub fn host_key_path(&self) -> PathBuf {
        self.state_dir.join("host.key")
    }
}

/// Trust-store endpoints and hypervisor gating.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrustConfig {
    /// URL of the signed authorized-domain list.
    pub authorized_url: String,
    /// Local privileged auth key. Empty disables privileged handshakes.
    pub local_auth_key: String,
    /// Minimum acceptable hypervisor version; older (or missing)
    /// installations route through the installer gate.
    pub min_hv_version: String,
}

impl Default for TrustConfig {
    fn default() -> Self {
        Self {
            authorized_url: "https://vmgate.io/keys/authorized.txt".into(),
            local_auth_key: String::new(),
            min_hv_version: "4.3.0".into(),
        }
    }
}

/// Per-connection rate limit on user-denied session requests.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct ThrottleConfig {
    /// Window within which consecutive denials accumulate.
    pub timespan_ms: u64,
    /// Denials inside one window before the connection is blocked.
    pub tries: u32,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            timespan_ms: 10_000,
            tries: 3,
        }
    }
}

/// Session monitor cadence and API-liveness hysteresis.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Seconds between monitor ticks.
    pub tick_interval_secs: u64,
    /// Probe timeout while waiting for the in-guest API to come up.
    pub fast_probe_timeout_secs: u64,
    /// Probe timeout for the periodic still-alive check.
    pub slow_probe_timeout_secs: u64,
    /// Run the slow probe once every this many ticks.
    pub slow_probe_every_ticks: u32,
    /// Consecutive failed slow probes before the API is declared offline.
    pub apiport_down_retries: u32,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: 1,
            fast_probe_timeout_secs: 1,
            slow_probe_timeout_secs: 10,
            slow_probe_every_ticks: 10,
            apiport_down_retries: 2,
        }
    }
}
