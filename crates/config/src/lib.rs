//! Gateway configuration from environment variables.
//!
//! Every knob has a built-in default; `ARC_*` variables override. Duration
//! variables are integer seconds.

use std::time::Duration;

use tracing::warn;

/// Runtime configuration for the realtime gateway.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Listen address (`ARC_HTTP_ADDR`).
    pub http_addr: String,
    /// SQLite database url (`ARC_DB_URL`).
    pub db_url: String,
    /// Per-frame read limit in bytes (`ARC_READ_LIMIT_BYTES`).
    pub read_limit_bytes: usize,
    /// Outbound queue depth per client (`ARC_OUTBOUND_QUEUE`).
    pub outbound_queue: usize,
    /// Heartbeat ping cadence (`ARC_PING_INTERVAL`).
    pub ping_interval: Duration,
    /// Close after this long without a pong (`ARC_PONG_TIMEOUT`).
    pub pong_timeout: Duration,
    /// Handshake deadline (`ARC_HELLO_TIMEOUT`).
    pub hello_timeout: Duration,
    /// Send deadline, covering retries (`ARC_SEND_TIMEOUT`).
    pub send_timeout: Duration,
    /// History fetch deadline (`ARC_FETCH_TIMEOUT`).
    pub fetch_timeout: Duration,
    /// Per-envelope write deadline (`ARC_WRITE_TIMEOUT`).
    pub write_timeout: Duration,
    /// Drain window on shutdown (`ARC_SHUTDOWN_GRACE`).
    pub shutdown_grace: Duration,
    /// History page ceiling (`ARC_MAX_HISTORY_LIMIT`).
    pub max_history_limit: u32,
    /// Malformed-frame tolerance on an active connection (`ARC_STRIKE_LIMIT`).
    pub strike_limit: u32,
    /// Dev mode: anonymous sessions and public-room auto-creation
    /// (`ARC_DEV_ALLOW_ANON`).
    pub dev_allow_anon: bool,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            http_addr: "127.0.0.1:8080".into(),
            db_url: "sqlite://arc.db?mode=rwc".into(),
            read_limit_bytes: 1_048_576,
            outbound_queue: 256,
            ping_interval: Duration::from_secs(20),
            pong_timeout: Duration::from_secs(60),
            hello_timeout: Duration::from_secs(10),
            send_timeout: Duration::from_secs(10),
            fetch_timeout: Duration::from_secs(10),
            write_timeout: Duration::from_secs(5),
            shutdown_grace: Duration::from_secs(10),
            max_history_limit: 200,
            strike_limit: 3,
            dev_allow_anon: false,
        }
    }
}

impl GatewayConfig {
    /// Load from process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from an arbitrary lookup function. Tests use this instead of
    /// mutating process environment.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut cfg = Self::default();
        if let Some(v) = lookup("ARC_HTTP_ADDR") {
            cfg.http_addr = v;
        }
        if let Some(v) = lookup("ARC_DB_URL") {
            cfg.db_url = v;
        }
        set_usize(&lookup, "ARC_READ_LIMIT_BYTES", &mut cfg.read_limit_bytes);
        set_usize(&lookup, "ARC_OUTBOUND_QUEUE", &mut cfg.outbound_queue);
        set_secs(&lookup, "ARC_PING_INTERVAL", &mut cfg.ping_interval);
        set_secs(&lookup, "ARC_PONG_TIMEOUT", &mut cfg.pong_timeout);
        set_secs(&lookup, "ARC_HELLO_TIMEOUT", &mut cfg.hello_timeout);
        set_secs(&lookup, "ARC_SEND_TIMEOUT", &mut cfg.send_timeout);
        set_secs(&lookup, "ARC_FETCH_TIMEOUT", &mut cfg.fetch_timeout);
        set_secs(&lookup, "ARC_WRITE_TIMEOUT", &mut cfg.write_timeout);
        set_secs(&lookup, "ARC_SHUTDOWN_GRACE", &mut cfg.shutdown_grace);
        set_u32(&lookup, "ARC_MAX_HISTORY_LIMIT", &mut cfg.max_history_limit);
        set_u32(&lookup, "ARC_STRIKE_LIMIT", &mut cfg.strike_limit);
        if let Some(v) = lookup("ARC_DEV_ALLOW_ANON") {
            cfg.dev_allow_anon = matches!(v.as_str(), "1" | "true" | "yes");
        }
        cfg
    }
}

fn set_usize(lookup: &impl Fn(&str) -> Option<String>, key: &str, slot: &mut usize) {
    if let Some(raw) = lookup(key) {
        match raw.parse() {
            Ok(v) => *slot = v,
            Err(_) => warn!(key, value = %raw, "ignoring unparseable config value"),
        }
    }
}

fn set_u32(lookup: &impl Fn(&str) -> Option<String>, key: &str, slot: &mut u32) {
    if let Some(raw) = lookup(key) {
        match raw.parse() {
            Ok(v) => *slot = v,
            Err(_) => warn!(key, value = %raw, "ignoring unparseable config value"),
        }
    }
}

fn set_secs(lookup: &impl Fn(&str) -> Option<String>, key: &str, slot: &mut Duration) {
    if let Some(raw) = lookup(key) {
        match raw.parse::<u64>() {
            Ok(v) => *slot = Duration::from_secs(v),
            Err(_) => warn!(key, value = %raw, "ignoring unparseable config value"),
        }
    }
}
