//! Per-route gateway metrics with a Prometheus text exposition.
//!
//! Every route gets a [`RouteMetrics`] block of atomic counters, created lazily on
//! first observation and kept for the lifetime of the collector (a route reload does
//! not reset it). The collector is an explicitly constructed component owned by the
//! routing manager rather than a process-wide recorder.
//!
//! Exported families (label `proxy`):
//! * `gateway_requests_total` (counter)
//! * `gateway_errors_total` (counter, 5xx only)
//! * `gateway_active_connections` (gauge)
//! * `gateway_circuit_breaker_state` (gauge: 0 closed, 1 open, 2 half-open)
//! * `gateway_request_duration_seconds` (histogram)
//!
//! [`ActiveConnectionGuard`] uses `Drop` to keep the active gauge balanced even when a
//! request exits early.
use std::{
    fmt::Write as _,
    sync::{
        Arc,
        atomic::{AtomicI64, AtomicU8, AtomicU64, Ordering},
    },
    time::Duration,
};

use scc::HashMap;

use crate::core::circuit_breaker::CircuitState;

pub const GATEWAY_REQUESTS_TOTAL: &str = "gateway_requests_total";
pub const GATEWAY_ERRORS_TOTAL: &str = "gateway_errors_total";
pub const GATEWAY_ACTIVE_CONNECTIONS: &str = "gateway_active_connections";
pub const GATEWAY_CIRCUIT_BREAKER_STATE: &str = "gateway_circuit_breaker_state";
pub const GATEWAY_REQUEST_DURATION_SECONDS: &str = "gateway_request_duration_seconds";

/// Upper bounds (seconds) of the latency histogram buckets; `+Inf` is implicit.
pub const HISTOGRAM_BUCKETS: [f64; 9] = [0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0];

/// Atomic counters for one route.
#[derive(Debug, Default)]
pub struct RouteMetrics {
    requests_total: AtomicU64,
    errors_total: AtomicU64,
    latency_sum_ns: AtomicU64,
    latency_count: AtomicU64,
    active: AtomicI64,
    circuit_state: AtomicU8,
    /// Non-cumulative: one slot per bucket plus the overflow slot.
    histogram: [AtomicU64; HISTOGRAM_BUCKETS.len() + 1],
}

impl RouteMetrics {
    pub fn record_request(&self, status: u16, duration: Duration) {
        self.requests_total.fetch_add(1, Ordering::Relaxed);
        if status >= 500 {
            self.errors_total.fetch_add(1, Ordering::Relaxed);
        }

        let nanos = u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX);
        self.latency_sum_ns.fetch_add(nanos, Ordering::Relaxed);
        self.latency_count.fetch_add(1, Ordering::Relaxed);

        let secs = duration.as_secs_f64();
        let slot = HISTOGRAM_BUCKETS
            .iter()
            .position(|bound| secs <= *bound)
            .unwrap_or(HISTOGRAM_BUCKETS.len());
        self.histogram[slot].fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_active(&self) {
        self.active.fetch_add(1, Ordering::Relaxed);
    }

    pub fn decr_active(&self) {
        self.active.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn active(&self) -> i64 {
        self.active.load(Ordering::Relaxed)
    }

    pub fn set_circuit_state(&self, state: CircuitState) {
        self.circuit_state.store(state.as_gauge(), Ordering::Relaxed);
    }

    pub fn circuit_state(&self) -> CircuitState {
        CircuitState::from_gauge(self.circuit_state.load(Ordering::Relaxed))
            .unwrap_or(CircuitState::Closed)
    }

    pub fn stats(&self) -> RouteStats {
        let requests_total = self.requests_total.load(Ordering::Relaxed);
        let errors_total = self.errors_total.load(Ordering::Relaxed);
        let sum = self.latency_sum_ns.load(Ordering::Relaxed);
        let count = self.latency_count.load(Ordering::Relaxed);
        let avg_latency = if count == 0 {
            Duration::ZERO
        } else {
            Duration::from_nanos(sum / count)
        };
        RouteStats {
            requests_total,
            errors_total,
            avg_latency,
        }
    }

    /// Zero counters and histogram; the active gauge and circuit state are live values
    /// and are left alone.
    fn reset(&self) {
        self.requests_total.store(0, Ordering::Relaxed);
        self.errors_total.store(0, Ordering::Relaxed);
        self.latency_sum_ns.store(0, Ordering::Relaxed);
        self.latency_count.store(0, Ordering::Relaxed);
        for slot in &self.histogram {
            slot.store(0, Ordering::Relaxed);
        }
    }
}

/// Point-in-time summary of one route's counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouteStats {
    pub requests_total: u64,
    pub errors_total: u64,
    pub avg_latency: Duration,
}

impl RouteStats {
    /// Fraction of non-5xx requests; 1.0 when nothing has been recorded.
    pub fn success_rate(&self) -> f64 {
        if self.requests_total == 0 {
            return 1.0;
        }
        let ok = self.requests_total.saturating_sub(self.errors_total);
        ok as f64 / self.requests_total as f64
    }
}

/// Registry of per-route metrics.
#[derive(Debug, Default)]
pub struct MetricsCollector {
    routes: HashMap<String, Arc<RouteMetrics>>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handle for a route, created on first use.
    pub fn route(&self, name: &str) -> Arc<RouteMetrics> {
        if let Some(existing) = self.existing(name) {
            return existing;
        }

        let created = Arc::new(RouteMetrics::default());
        match self.routes.insert(name.to_string(), Arc::clone(&created)) {
            Ok(()) => created,
            // Lost the race to another first observation; use the winner's block.
            Err(_) => self.existing(name).unwrap_or(created),
        }
    }

    fn existing(&self, name: &str) -> Option<Arc<RouteMetrics>> {
        self.routes.read(name, |_, m| Arc::clone(m))
    }

    pub fn record_request(&self, route: &str, status: u16, duration: Duration) {
        self.route(route).record_request(status, duration);
    }

    pub fn incr_active(&self, route: &str) {
        self.route(route).incr_active();
    }

    pub fn decr_active(&self, route: &str) {
        self.route(route).decr_active();
    }

    pub fn active(&self, route: &str) -> i64 {
        self.existing(route).map_or(0, |m| m.active())
    }

    pub fn set_circuit_state(&self, route: &str, state: CircuitState) {
        self.route(route).set_circuit_state(state);
    }

    pub fn circuit_state(&self, route: &str) -> CircuitState {
        self.existing(route)
            .map_or(CircuitState::Closed, |m| m.circuit_state())
    }

    /// Summary for a route; `None` when the route has never been observed.
    pub fn stats(&self, route: &str) -> Option<RouteStats> {
        self.existing(route).map(|m| m.stats())
    }

    /// Names of all observed routes, sorted.
    pub fn route_names(&self) -> Vec<String> {
        let mut names = Vec::with_capacity(self.routes.len());
        self.routes.scan(|name, _| names.push(name.clone()));
        names.sort();
        names
    }

    /// Administrative reset of every route's counters.
    pub fn reset(&self) {
        let mut count = 0usize;
        self.routes.scan(|_, metrics| {
            metrics.reset();
            count += 1;
        });
        tracing::info!("Gateway metrics reset for {} route(s)", count);
    }

    /// Render all routes in the Prometheus text exposition format.
    pub fn render(&self) -> String {
        let mut snapshot: Vec<(String, Arc<RouteMetrics>)> = Vec::with_capacity(self.routes.len());
        self.routes
            .scan(|name, m| snapshot.push((name.clone(), Arc::clone(m))));
        snapshot.sort_by(|a, b| a.0.cmp(&b.0));

        let mut out = String::with_capacity(512 + snapshot.len() * 1024);
        let headers = [
            (GATEWAY_REQUESTS_TOTAL, "Total number of requests", "counter"),
            (GATEWAY_ERRORS_TOTAL, "Total number of errors (5xx)", "counter"),
            (
                GATEWAY_ACTIVE_CONNECTIONS,
                "Current number of active connections",
                "gauge",
            ),
            (
                GATEWAY_CIRCUIT_BREAKER_STATE,
                "Circuit breaker state (0=closed, 1=open, 2=half-open)",
                "gauge",
            ),
            (
                GATEWAY_REQUEST_DURATION_SECONDS,
                "Request duration histogram",
                "histogram",
            ),
        ];
        for (name, help, kind) in headers {
            let _ = writeln!(out, "# HELP {name} {help}");
            let _ = writeln!(out, "# TYPE {name} {kind}");
        }

        for (name, m) in &snapshot {
            let label = escape_label(name);
            let _ = writeln!(
                out,
                "{GATEWAY_REQUESTS_TOTAL}{{proxy=\"{label}\"}} {}",
                m.requests_total.load(Ordering::Relaxed)
            );
            let _ = writeln!(
                out,
                "{GATEWAY_ERRORS_TOTAL}{{proxy=\"{label}\"}} {}",
                m.errors_total.load(Ordering::Relaxed)
            );
            let _ = writeln!(
                out,
                "{GATEWAY_ACTIVE_CONNECTIONS}{{proxy=\"{label}\"}} {}",
                m.active()
            );
            let _ = writeln!(
                out,
                "{GATEWAY_CIRCUIT_BREAKER_STATE}{{proxy=\"{label}\"}} {}",
                m.circuit_state.load(Ordering::Relaxed)
            );

            let mut cumulative = 0u64;
            for (i, bound) in HISTOGRAM_BUCKETS.iter().enumerate() {
                cumulative += m.histogram[i].load(Ordering::Relaxed);
                let _ = writeln!(
                    out,
                    "{GATEWAY_REQUEST_DURATION_SECONDS}_bucket{{proxy=\"{label}\",le=\"{bound}\"}} {cumulative}"
                );
            }
            cumulative += m.histogram[HISTOGRAM_BUCKETS.len()].load(Ordering::Relaxed);
            let _ = writeln!(
                out,
                "{GATEWAY_REQUEST_DURATION_SECONDS}_bucket{{proxy=\"{label}\",le=\"+Inf\"}} {cumulative}"
            );

            let sum_secs = m.latency_sum_ns.load(Ordering::Relaxed) as f64 / 1e9;
            let _ = writeln!(
                out,
                "{GATEWAY_REQUEST_DURATION_SECONDS}_sum{{proxy=\"{label}\"}} {sum_secs:.6}"
            );
            let _ = writeln!(
                out,
                "{GATEWAY_REQUEST_DURATION_SECONDS}_count{{proxy=\"{label}\"}} {}",
                m.latency_count.load(Ordering::Relaxed)
            );
        }

        out
    }
}

fn escape_label(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
}

/// RAII helper holding one unit of a route's active-connection gauge.
#[derive(Debug)]
pub struct ActiveConnectionGuard {
    metrics: Arc<RouteMetrics>,
}

impl ActiveConnectionGuard {
    pub fn new(metrics: Arc<RouteMetrics>) -> Self {
        metrics.incr_active();
        Self { metrics }
    }
}

impl Drop for ActiveConnectionGuard {
    fn drop(&mut self) {
        self.metrics.decr_active();
    }
}
