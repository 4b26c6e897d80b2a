//! Configuration data structures for the gateway.
//!
//! These types map directly to TOML (also JSON / YAML) configuration files and to the
//! records handed over by whatever store owns proxy definitions. They are serde‑friendly
//! and carry defaults so that minimal route definitions remain concise.
use std::{collections::HashMap, time::Duration};

use serde::{Deserialize, Serialize};

/// Prefix of the host application's data API; routes may not live under it.
pub const RESERVED_API_PREFIX: &str = "/api/";
/// Prefix of the host application's admin UI; routes may not live under it.
pub const RESERVED_ADMIN_PREFIX: &str = "/_/";

pub const DEFAULT_ROUTE_TIMEOUT_SECS: u64 = 30;
pub const MAX_ROUTE_TIMEOUT_SECS: u64 = 300;
pub const MAX_CONCURRENT_LIMIT: u32 = 10_000;

fn default_true() -> bool {
    true
}

fn default_route_timeout() -> u64 {
    DEFAULT_ROUTE_TIMEOUT_SECS
}

fn default_listen_addr() -> String {
    "127.0.0.1:8090".to_string()
}

fn default_metrics_path() -> String {
    "/api/gateway/metrics".to_string()
}

/// Top level configuration consumed by the binary and the file provider.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct GatewayConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    #[serde(default = "default_metrics_path")]
    pub metrics_path: String,
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub proxies: Vec<RouteConfig>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            metrics_path: default_metrics_path(),
            transport: TransportConfig::default(),
            proxies: Vec::new(),
        }
    }
}

/// One configured route: an intercept path plus its upstream and policies.
///
/// Once placed in the routing table a `RouteConfig` is never mutated; a reload
/// replaces the whole entry.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct RouteConfig {
    pub id: String,
    /// Intercept path, e.g. `/-/openai`.
    pub path: String,
    /// Upstream base URL, e.g. `https://api.openai.com/v1`.
    pub upstream: String,
    #[serde(default = "default_true")]
    pub strip_path: bool,
    /// Opaque rule expression handed to the access evaluator.
    #[serde(default)]
    pub access_rule: String,
    /// Header name -> template; resolved by the header builder.
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// Overall request timeout in seconds.
    #[serde(default = "default_route_timeout")]
    pub timeout: u64,
    #[serde(default = "default_true")]
    pub active: bool,
    /// 0 means unlimited.
    #[serde(default)]
    pub max_concurrent: u32,
    #[serde(default)]
    pub circuit_breaker: Option<CircuitBreakerConfig>,
    #[serde(default)]
    pub timeout_config: Option<TimeoutConfig>,
}

impl RouteConfig {
    /// Minimal active route with every optional field at its default.
    pub fn new(id: impl Into<String>, path: impl Into<String>, upstream: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            path: path.into(),
            upstream: upstream.into(),
            strip_path: true,
            access_rule: String::new(),
            headers: HashMap::new(),
            timeout: DEFAULT_ROUTE_TIMEOUT_SECS,
            active: true,
            max_concurrent: 0,
            circuit_breaker: None,
            timeout_config: None,
        }
    }

    /// Effective overall timeout, falling back to the default for zero.
    pub fn request_timeout(&self) -> Duration {
        if self.timeout == 0 {
            Duration::from_secs(DEFAULT_ROUTE_TIMEOUT_SECS)
        } else {
            Duration::from_secs(self.timeout)
        }
    }
}

/// Per‑route circuit breaker settings (all durations in seconds).
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    pub enabled: bool,
    pub failure_threshold: u32,
    pub recovery_timeout: u64,
    pub half_open_requests: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            failure_threshold: 5,
            recovery_timeout: 30,
            half_open_requests: 1,
        }
    }
}

/// Settings for the shared outbound transport.
///
/// Values are signed so that nonsense input can be normalised instead of rejected;
/// see [`TransportConfig::resolve`].
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(default)]
pub struct TransportConfig {
    /// Seconds allowed to establish a TCP connection.
    pub dial_timeout: i64,
    /// TCP keep-alive interval in seconds.
    pub dial_keep_alive: i64,
    /// Seconds to wait for the first response byte; 0 waits forever.
    pub response_header_timeout: i64,
    /// Seconds an idle pooled connection is kept.
    pub idle_conn_timeout: i64,
    /// Ceiling for `max_idle_conns_per_host`. The client pool has no transport-wide idle
    /// limit, so this is not enforced as a total cap on its own.
    pub max_idle_conns: i64,
    /// Idle connections kept per upstream host.
    pub max_idle_conns_per_host: i64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            dial_timeout: 2,
            dial_keep_alive: 30,
            response_header_timeout: 30,
            idle_conn_timeout: 90,
            max_idle_conns: 1000,
            max_idle_conns_per_host: 100,
        }
    }
}

/// Normalised transport settings with every fallback applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportSettings {
    pub dial_timeout: Duration,
    pub keep_alive: Duration,
    /// `None` means the first byte may take arbitrarily long.
    pub response_header_timeout: Option<Duration>,
    pub idle_timeout: Duration,
    /// Only bounds `max_idle_conns_per_host`; not applied to the pool directly.
    pub max_idle_conns: usize,
    pub max_idle_conns_per_host: usize,
}

impl TransportConfig {
    /// Apply fallbacks: non-positive values take the documented defaults, except
    /// `response_header_timeout == 0`, which explicitly disables the first-byte limit.
    pub fn resolve(&self) -> TransportSettings {
        let defaults = Self::default();
        let secs = |value: i64, default: i64| {
            Duration::from_secs(if value > 0 { value } else { default } as u64)
        };
        let count = |value: i64, default: i64| (if value > 0 { value } else { default }) as usize;

        let response_header_timeout = match self.response_header_timeout {
            0 => None,
            v if v > 0 => Some(Duration::from_secs(v as u64)),
            _ => Some(Duration::from_secs(defaults.response_header_timeout as u64)),
        };

        let max_idle_conns = count(self.max_idle_conns, defaults.max_idle_conns);
        let max_idle_conns_per_host =
            count(self.max_idle_conns_per_host, defaults.max_idle_conns_per_host).min(max_idle_conns);

        TransportSettings {
            dial_timeout: secs(self.dial_timeout, defaults.dial_timeout),
            keep_alive: secs(self.dial_keep_alive, defaults.dial_keep_alive),
            response_header_timeout,
            idle_timeout: secs(self.idle_conn_timeout, defaults.idle_conn_timeout),
            max_idle_conns,
            max_idle_conns_per_host,
        }
    }
}

/// Fine-grained per-route timeout override (seconds).
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(default)]
pub struct TimeoutConfig {
    pub dial: i64,
    pub response_header: i64,
    pub idle: i64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            dial: 2,
            response_header: 30,
            idle: 90,
        }
    }
}

impl TimeoutConfig {
    /// Overlay these timeouts on top of a base transport config; pool sizing is kept.
    pub fn to_transport_config(&self, base: &TransportConfig) -> TransportConfig {
        TransportConfig {
            dial_timeout: self.dial,
            response_header_timeout: self.response_header,
            idle_conn_timeout: self.idle,
            ..*base
        }
    }
}
