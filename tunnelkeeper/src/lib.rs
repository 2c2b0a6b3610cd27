use std::time::Duration;

use camino::Utf8PathBuf;

pub mod access_log;
pub mod edge;
pub mod http;
pub mod library;
pub mod metrics;
pub mod monitor;
pub mod staging;
pub mod store;
pub mod token;
pub mod tunnel;

pub mod defaults {
    pub const DEFAULT_HTTP_LISTEN_ADDR: &str = "127.0.0.1:7677";

    pub const DEFAULT_MAX_TUNNEL_SECONDS: u64 = 3600;
    pub const DEFAULT_STALL_TIMEOUT_SECONDS: u64 = 300;
    pub const DEFAULT_GRACE_PERIOD_SECONDS: u64 = 3600;
    pub const DEFAULT_LIBRARY_ROOT: &str = "/data";

    pub const DEFAULT_MONITOR_TICK_SECONDS: u64 = 5;
    pub const DEFAULT_RECONCILE_INTERVAL_SECONDS: u64 = 300;
    pub const DEFAULT_TOKEN_SWEEP_INTERVAL_SECONDS: u64 = 60;
    pub const DEFAULT_EDGE_TIMEOUT_SECONDS: u64 = 30;
    pub const DEFAULT_HTTP_SHUTDOWN_GRACE_SECONDS: u64 = 10;

    /// Checkpoint the access-log read offset after this many applied events
    /// or this much wall clock, whichever comes first.
    pub const DEFAULT_CHECKPOINT_EVERY_EVENTS: u64 = 100;
    pub const DEFAULT_CHECKPOINT_INTERVAL_SECONDS: u64 = 10;

    /// Destroyed tunnels kept for `GET /admin/history`.
    pub const DEFAULT_HISTORY_LIMIT: usize = 1000;

    /// Window for the best-effort distinct-request-id connection estimate.
    pub const DEFAULT_ACTIVE_WINDOW_SECONDS: u64 = 30;
}

/// Runtime configuration of the tunnelkeeper process. Assembled by the
/// binary from CLI flags and the environment; immutable afterwards.
#[derive(Debug, Clone)]
pub struct TunnelKeeperConf {
    pub listen_http_addr: String,

    /// Read-only root of shareable files.
    pub library_root: Utf8PathBuf,
    /// Directory holding one subdirectory per live tunnel; each contains a
    /// read-only link to the staged file.
    pub staging_root: Utf8PathBuf,
    /// Access log written by the static file server; tailed by the monitor.
    pub access_log_path: Utf8PathBuf,

    pub state_store_url: String,
    /// HMAC secret for capability tokens, at least 32 bytes.
    pub jwt_secret: Vec<u8>,

    /// Edge provider CLI; invoked as `<cmd> publish|unpublish|list ...`.
    pub edge_command: String,
    pub edge_timeout: Duration,

    /// Upper bound on tunnel lifetime; requested TTLs are clamped to it.
    pub max_tunnel_lifetime: Duration,
    /// Idle threshold after which a partially-downloaded tunnel is stalled.
    pub stall_timeout: Duration,
    /// How long a completed tunnel keeps its public route.
    pub grace_period: Duration,

    pub monitor_tick_interval: Duration,
    pub reconcile_interval: Duration,
    pub token_sweep_interval: Duration,
    pub http_shutdown_grace: Duration,

    pub checkpoint_every_events: u64,
    pub checkpoint_interval: Duration,
    pub history_limit: usize,
    pub active_window: Duration,
}

impl TunnelKeeperConf {
    #[cfg(test)]
    pub(crate) fn dummy() -> Self {
        use defaults::*;
        TunnelKeeperConf {
            listen_http_addr: DEFAULT_HTTP_LISTEN_ADDR.to_string(),
            library_root: Utf8PathBuf::from("./library"),
            staging_root: Utf8PathBuf::from("./staging"),
            access_log_path: Utf8PathBuf::from("./access.log"),
            state_store_url: "memory://".to_string(),
            jwt_secret: b"test-secret-test-secret-test-secret!".to_vec(),
            edge_command: "/bin/false".to_string(),
            edge_timeout: Duration::from_secs(DEFAULT_EDGE_TIMEOUT_SECONDS),
            max_tunnel_lifetime: Duration::from_secs(DEFAULT_MAX_TUNNEL_SECONDS),
            stall_timeout: Duration::from_secs(DEFAULT_STALL_TIMEOUT_SECONDS),
            grace_period: Duration::from_secs(DEFAULT_GRACE_PERIOD_SECONDS),
            monitor_tick_interval: Duration::from_secs(DEFAULT_MONITOR_TICK_SECONDS),
            reconcile_interval: Duration::from_secs(DEFAULT_RECONCILE_INTERVAL_SECONDS),
            token_sweep_interval: Duration::from_secs(DEFAULT_TOKEN_SWEEP_INTERVAL_SECONDS),
            http_shutdown_grace: Duration::from_secs(DEFAULT_HTTP_SHUTDOWN_GRACE_SECONDS),
            checkpoint_every_events: DEFAULT_CHECKPOINT_EVERY_EVENTS,
            checkpoint_interval: Duration::from_secs(DEFAULT_CHECKPOINT_INTERVAL_SECONDS),
            history_limit: DEFAULT_HISTORY_LIMIT,
            active_window: Duration::from_secs(DEFAULT_ACTIVE_WINDOW_SECONDS),
        }
    }
}
