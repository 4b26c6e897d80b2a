//! Hot-reloadable routing table and the per-route admission state that hangs off it.
//!
//! The `RoutingManager` is the composition root of the gateway core. It owns the shared
//! upstream client, the relay buffer pool and the metrics collector, and it publishes an
//! immutable [`RoutingTable`] through `ArcSwap`:
//! * `set_proxies` builds a complete new table (limiters, breakers, route clients) and
//!   publishes it with a single pointer swap
//! * `match_proxy` loads the current snapshot without blocking writers
//! * requests keep the `Arc<RouteEntry>` they matched, so a reload never affects them
//!
//! Entries are sorted by descending path length so that the first segment-aligned
//! prefix match is also the most specific one.
use std::{collections::HashMap, fmt, sync::Arc};

use arc_swap::ArcSwap;

use crate::{
    config::models::RouteConfig,
    core::{
        buffer_pool::BufferPool, circuit_breaker::CircuitBreaker,
        concurrency::ConcurrencyLimiter,
    },
    metrics::{MetricsCollector, RouteMetrics},
    ports::http_client::{HttpClient, HttpClientFactory},
};

/// Shared components injected into the routing manager.
#[derive(Clone)]
pub struct GatewayComponents {
    /// Client shared by every route without timeout overrides.
    pub transport: Arc<dyn HttpClient>,
    /// Builds dedicated clients for routes with `timeout_config`; without a factory
    /// such routes use the shared client.
    pub client_factory: Option<Arc<dyn HttpClientFactory>>,
    pub buffer_pool: Arc<BufferPool>,
    pub metrics: Arc<MetricsCollector>,
}

impl GatewayComponents {
    /// Components around a single client, with a default pool and fresh metrics.
    pub fn new(transport: Arc<dyn HttpClient>) -> Self {
        Self {
            transport,
            client_factory: None,
            buffer_pool: Arc::new(BufferPool::default()),
            metrics: Arc::new(MetricsCollector::new()),
        }
    }
}

/// One active route together with the admission state built for it.
pub struct RouteEntry {
    pub config: RouteConfig,
    pub limiter: Arc<ConcurrencyLimiter>,
    pub breaker: Arc<CircuitBreaker>,
    /// Dedicated client when the route overrides transport timeouts.
    pub client: Option<Arc<dyn HttpClient>>,
    /// Metrics handle, keyed by the route's intercept path.
    pub metrics: Arc<RouteMetrics>,
}

impl fmt::Debug for RouteEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RouteEntry")
            .field("config", &self.config)
            .field("limiter", &self.limiter)
            .field("breaker", &self.breaker)
            .field("dedicated_client", &self.client.is_some())
            .finish()
    }
}

impl RouteEntry {
    /// Whether this route claims `path`: a prefix match that ends on a segment boundary.
    pub fn matches(&self, path: &str) -> bool {
        path_matches(&self.config.path, path)
    }
}

fn path_matches(prefix: &str, path: &str) -> bool {
    match path.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with('/'),
        None => false,
    }
}

/// Immutable snapshot of the active routes.
#[derive(Debug, Default)]
pub struct RoutingTable {
    entries: Vec<Arc<RouteEntry>>,
    by_id: HashMap<String, Arc<RouteEntry>>,
}

impl RoutingTable {
    pub fn entries(&self) -> &[Arc<RouteEntry>] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&Arc<RouteEntry>> {
        self.by_id.get(id)
    }

    pub fn find(&self, path: &str) -> Option<&Arc<RouteEntry>> {
        self.entries.iter().find(|entry| entry.matches(path))
    }
}

pub struct RoutingManager {
    table: ArcSwap<RoutingTable>,
    components: GatewayComponents,
}

impl fmt::Debug for RoutingManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RoutingManager")
            .field("routes", &self.table.load().len())
            .finish()
    }
}

impl RoutingManager {
    /// Create a manager with an empty routing table.
    pub fn new(components: GatewayComponents) -> Self {
        Self {
            table: ArcSwap::from_pointee(RoutingTable::default()),
            components,
        }
    }

    /// Replace the routing table with `configs`.
    ///
    /// Inactive routes are dropped. Limiters and breakers are rebuilt from scratch;
    /// requests admitted under the previous table keep the instances they hold.
    pub fn set_proxies(&self, configs: Vec<RouteConfig>) {
        let total = configs.len();
        let mut entries: Vec<Arc<RouteEntry>> = configs
            .into_iter()
            .filter(|config| config.active)
            .map(|config| Arc::new(self.build_entry(config)))
            .collect();

        // Stable sort keeps configuration order among equal-length paths.
        entries.sort_by(|a, b| b.config.path.len().cmp(&a.config.path.len()));

        let by_id = entries
            .iter()
            .map(|entry| (entry.config.id.clone(), Arc::clone(entry)))
            .collect();

        let table = RoutingTable { entries, by_id };
        tracing::info!(
            "Routing table reloaded: {} active route(s) of {} configured",
            table.len(),
            total
        );
        self.table.store(Arc::new(table));
    }

    fn build_entry(&self, config: RouteConfig) -> RouteEntry {
        let limiter = Arc::new(ConcurrencyLimiter::new(config.max_concurrent));
        let breaker = Arc::new(CircuitBreaker::from_config(config.circuit_breaker.as_ref()));

        let client = match (&config.timeout_config, &self.components.client_factory) {
            (Some(timeouts), Some(factory)) => match factory.with_timeouts(timeouts) {
                Ok(client) => Some(client),
                Err(e) => {
                    tracing::error!(
                        "Failed to build dedicated client for route '{}', using shared transport: {}",
                        config.path,
                        e
                    );
                    None
                }
            },
            _ => None,
        };

        let metrics = self.components.metrics.route(&config.path);
        metrics.set_circuit_state(breaker.state());

        tracing::debug!(
            "Route '{}' -> {} (strip_path={}, max_concurrent={}, circuit_breaker={})",
            config.path,
            config.upstream,
            config.strip_path,
            config.max_concurrent,
            breaker.is_enabled()
        );

        RouteEntry {
            config,
            limiter,
            breaker,
            client,
            metrics,
        }
    }

    /// Find the most specific active route for `path`.
    pub fn match_proxy(&self, path: &str) -> Option<Arc<RouteEntry>> {
        self.table.load().find(path).cloned()
    }

    /// Current table snapshot.
    pub fn table(&self) -> Arc<RoutingTable> {
        self.table.load_full()
    }

    /// Configurations of the active routes, most specific first.
    pub fn proxies(&self) -> Vec<RouteConfig> {
        self.table
            .load()
            .entries
            .iter()
            .map(|entry| entry.config.clone())
            .collect()
    }

    /// Limiter for a route id; `None` for unknown or uncapped routes.
    pub fn limiter(&self, id: &str) -> Option<Arc<ConcurrencyLimiter>> {
        self.table
            .load()
            .get(id)
            .filter(|entry| entry.limiter.is_bounded())
            .map(|entry| Arc::clone(&entry.limiter))
    }

    /// Breaker for a route id; `None` for unknown routes or disabled breakers.
    pub fn circuit_breaker(&self, id: &str) -> Option<Arc<CircuitBreaker>> {
        self.table
            .load()
            .get(id)
            .filter(|entry| entry.breaker.is_enabled())
            .map(|entry| Arc::clone(&entry.breaker))
    }

    /// Client to use for a matched route.
    pub fn client_for(&self, entry: &RouteEntry) -> Arc<dyn HttpClient> {
        entry
            .client
            .clone()
            .unwrap_or_else(|| Arc::clone(&self.components.transport))
    }

    pub fn transport(&self) -> &Arc<dyn HttpClient> {
        &self.components.transport
    }

    pub fn buffer_pool(&self) -> &Arc<BufferPool> {
        &self.components.buffer_pool
    }

    pub fn metrics(&self) -> &Arc<MetricsCollector> {
        &self.components.metrics
    }

    /// Upstream URL for `path_and_query` on `route`.
    ///
    /// Strips the route prefix when `strip_path` is set, keeps the query string, makes
    /// sure a non-empty path starts with `/` and joins onto the upstream base without
    /// doubling the slash.
    pub fn build_upstream_url(route: &RouteConfig, path_and_query: &str) -> String {
        let upstream = route.upstream.trim_end_matches('/');

        let forwarded = if route.strip_path {
            path_and_query
                .strip_prefix(route.path.as_str())
                .unwrap_or(path_and_query)
        } else {
            path_and_query
        };

        let (path, query) = match forwarded.find('?') {
            Some(idx) => forwarded.split_at(idx),
            None => (forwarded, ""),
        };

        let mut url = String::with_capacity(upstream.len() + path.len() + query.len() + 1);
        url.push_str(upstream);
        if !path.is_empty() && !path.starts_with('/') {
            url.push('/');
        }
        url.push_str(path);
        url.push_str(query);
        url
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::{
        config::models::{CircuitBreakerConfig, TimeoutConfig},
        core::circuit_breaker::CircuitState,
        ports::http_client::{HttpClientError, HttpClientResult, UpstreamRequest, UpstreamResponse},
    };

    struct NullClient;

    #[async_trait]
    impl HttpClient for NullClient {
        async fn send_request(&self, _req: UpstreamRequest) -> HttpClientResult<UpstreamResponse> {
            Err(HttpClientError::ConnectionError("null client".into()))
        }
    }

    struct CountingFactory(std::sync::atomic::AtomicUsize);

    impl HttpClientFactory for CountingFactory {
        fn with_timeouts(&self, _timeouts: &TimeoutConfig) -> HttpClientResult<Arc<dyn HttpClient>> {
            self.0.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok(Arc::new(NullClient))
        }
    }

    fn manager() -> RoutingManager {
        RoutingManager::new(GatewayComponents::new(Arc::new(NullClient)))
    }

    fn route(id: &str, path: &str) -> RouteConfig {
        RouteConfig::new(id, path, "http://localhost:9000")
    }

    #[test]
    fn test_path_matches_segment_boundary() {
        assert!(path_matches("/-/openai", "/-/openai"));
        assert!(path_matches("/-/openai", "/-/openai/v1/chat"));
        assert!(!path_matches("/-/openai", "/-/openaiextra"));
        assert!(!path_matches("/-/openai", "/-/open"));
    }

    #[test]
    fn test_longest_prefix_wins() {
        let mgr = manager();
        mgr.set_proxies(vec![route("a", "/a"), route("ab", "/a/b")]);

        assert_eq!(mgr.match_proxy("/a/b/c").unwrap().config.id, "ab");
        assert_eq!(mgr.match_proxy("/a/c").unwrap().config.id, "a");
        assert!(mgr.match_proxy("/b").is_none());
    }

    #[test]
    fn test_inactive_routes_are_excluded() {
        let mgr = manager();
        let mut disabled = route("x", "/-/x");
        disabled.active = false;
        mgr.set_proxies(vec![disabled, route("y", "/-/y")]);

        assert!(mgr.match_proxy("/-/x/anything").is_none());
        assert_eq!(mgr.proxies().len(), 1);
        assert!(mgr.table().get("x").is_none());
    }

    #[test]
    fn test_limiters_and_breakers_only_for_configured_routes() {
        let mgr = manager();
        let mut capped = route("capped", "/-/capped");
        capped.max_concurrent = 2;
        capped.circuit_breaker = Some(CircuitBreakerConfig {
            enabled: true,
            ..CircuitBreakerConfig::default()
        });
        let mut disabled_breaker = route("plain", "/-/plain");
        disabled_breaker.circuit_breaker = Some(CircuitBreakerConfig::default());
        mgr.set_proxies(vec![capped, disabled_breaker]);

        assert_eq!(mgr.limiter("capped").unwrap().max(), Some(2));
        assert!(mgr.circuit_breaker("capped").is_some());
        assert!(mgr.limiter("plain").is_none());
        assert!(mgr.circuit_breaker("plain").is_none());
        assert!(mgr.limiter("missing").is_none());

        // Absent admission state is transparent on the matched entry.
        let entry = mgr.match_proxy("/-/plain").unwrap();
        assert!(entry.limiter.try_acquire());
        assert!(!entry.breaker.is_open());
    }

    #[test]
    fn test_reload_rebuilds_admission_state() {
        let mgr = manager();
        let mut capped = route("capped", "/-/capped");
        capped.max_concurrent = 1;
        mgr.set_proxies(vec![capped.clone()]);

        let old = mgr.limiter("capped").unwrap();
        assert!(old.try_acquire());

        mgr.set_proxies(vec![capped]);
        let new = mgr.limiter("capped").unwrap();
        assert!(!Arc::ptr_eq(&old, &new));
        assert_eq!(new.in_use(), 0);
        assert_eq!(old.in_use(), 1);
    }

    #[test]
    fn test_metrics_survive_reload() {
        let mgr = manager();
        mgr.set_proxies(vec![route("a", "/-/a")]);
        mgr.match_proxy("/-/a")
            .unwrap()
            .metrics
            .record_request(200, std::time::Duration::from_millis(1));

        mgr.set_proxies(vec![route("a", "/-/a")]);
        let stats = mgr.metrics().stats("/-/a").unwrap();
        assert_eq!(stats.requests_total, 1);
        assert_eq!(mgr.metrics().circuit_state("/-/a"), CircuitState::Closed);
    }

    #[test]
    fn test_dedicated_clients_for_timeout_overrides() {
        let factory = Arc::new(CountingFactory(Default::default()));
        let mut components = GatewayComponents::new(Arc::new(NullClient));
        components.client_factory = Some(factory.clone() as Arc<dyn HttpClientFactory>);
        let mgr = RoutingManager::new(components);

        let mut slow = route("slow", "/-/slow");
        slow.timeout_config = Some(TimeoutConfig::default());
        mgr.set_proxies(vec![slow, route("fast", "/-/fast")]);

        assert_eq!(factory.0.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert!(mgr.match_proxy("/-/slow").unwrap().client.is_some());
        let fast = mgr.match_proxy("/-/fast").unwrap();
        assert!(fast.client.is_none());
        assert!(Arc::ptr_eq(&mgr.client_for(&fast), mgr.transport()));
    }

    #[test]
    fn test_build_upstream_url() {
        let mut cfg = RouteConfig::new("x", "/-/x", "https://api.example.com");
        assert_eq!(
            RoutingManager::build_upstream_url(&cfg, "/-/x/v1/chat?model=gpt-4"),
            "https://api.example.com/v1/chat?model=gpt-4"
        );

        cfg.strip_path = false;
        assert_eq!(
            RoutingManager::build_upstream_url(&cfg, "/-/x/v1/chat?model=gpt-4"),
            "https://api.example.com/-/x/v1/chat?model=gpt-4"
        );
    }

    #[test]
    fn test_build_upstream_url_edges() {
        let cfg = RouteConfig::new("x", "/-/x", "https://api.example.com/v1/");
        assert_eq!(
            RoutingManager::build_upstream_url(&cfg, "/-/x"),
            "https://api.example.com/v1"
        );
        assert_eq!(
            RoutingManager::build_upstream_url(&cfg, "/-/x?q=1"),
            "https://api.example.com/v1?q=1"
        );
        assert_eq!(
            RoutingManager::build_upstream_url(&cfg, "/-/x/models"),
            "https://api.example.com/v1/models"
        );
    }
}
