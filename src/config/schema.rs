use std::time::Duration;

use serde::Deserialize;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub keepalive: KeepaliveConfig,
}

/// Storage-node endpoint. One pool exists per distinct target.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize)]
pub struct TargetConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    #[serde(default)]
    pub schema: Option<String>,
}

impl TargetConfig {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Interning key for the pool directory.
    pub fn key(&self) -> String {
        format!("{}:{}/{}", self.host, self.port, self.user)
    }
}

/// Pool and request limits
#[derive(Debug, Clone, Deserialize)]
pub struct PoolConfig {
    /// Cap on sockets to one storage node
    #[serde(default = "default_max_transports")]
    pub max_transports_per_target: usize,
    /// Cap on multiplexed sessions per socket
    #[serde(default = "default_max_sessions")]
    pub max_sessions_per_transport: usize,
    /// Initial and replenishment window for streamed row chunks
    #[serde(default = "default_query_token")]
    pub default_query_token: u32,
    /// Upper bound on acquire wait; zero fails saturated acquires immediately
    #[serde(default = "default_acquire_timeout_ms")]
    pub acquire_timeout_ms: u64,
    /// Reap idle sessions older than this
    #[serde(default = "default_idle_session_ttl_ms")]
    pub idle_session_ttl_ms: u64,
    /// Capture acquire-site stacks and warn when a session is released with
    /// an open transaction
    #[serde(default)]
    pub enable_trx_leak_check: bool,
    /// Default per-call network wait
    #[serde(default = "default_network_timeout_ms")]
    pub network_timeout_ms: u64,
}

fn default_max_transports() -> usize {
    4
}

fn default_max_sessions() -> usize {
    32
}

fn default_query_token() -> u32 {
    32
}

fn default_acquire_timeout_ms() -> u64 {
    5_000
}

fn default_idle_session_ttl_ms() -> u64 {
    300_000
}

fn default_network_timeout_ms() -> u64 {
    30_000
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_transports_per_target: default_max_transports(),
            max_sessions_per_transport: default_max_sessions(),
            default_query_token: default_query_token(),
            acquire_timeout_ms: default_acquire_timeout_ms(),
            idle_session_ttl_ms: default_idle_session_ttl_ms(),
            enable_trx_leak_check: false,
            network_timeout_ms: default_network_timeout_ms(),
        }
    }
}

impl PoolConfig {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    pub fn idle_session_ttl(&self) -> Duration {
        Duration::from_millis(self.idle_session_ttl_ms)
    }

    pub fn network_timeout(&self) -> Duration {
        Duration::from_millis(self.network_timeout_ms)
    }
}

/// Transport liveness probing
#[derive(Debug, Clone, Deserialize)]
pub struct KeepaliveConfig {
    /// Send a no-op after this much send/receive silence
    #[serde(default = "default_keepalive_interval_ms")]
    pub interval_ms: u64,
    /// Fail the transport when a probe goes unanswered this long
    #[serde(default = "default_keepalive_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_keepalive_interval_ms() -> u64 {
    30_000
}

fn default_keepalive_timeout_ms() -> u64 {
    10_000
}

impl Default for KeepaliveConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_keepalive_interval_ms(),
            timeout_ms: default_keepalive_timeout_ms(),
        }
    }
}

impl KeepaliveConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}
