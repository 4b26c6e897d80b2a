//! Request dispatcher: admission control, outbound request surgery and response relay.
//!
//! Per request, in order:
//! 1. protocol-upgrade requests are rejected (501)
//! 2. the path is matched against the routing table (404)
//! 3. the route's access rule is evaluated (401 / 403)
//! 4. an open circuit breaker rejects (503), a full limiter rejects (429)
//! 5. the outbound request is rewritten and sent through the route's client
//! 6. the upstream answer is normalised and streamed back
//! 7. the outcome is recorded once the relayed body has finished
use std::{io, net::SocketAddr, sync::Arc, time::Duration};

use axum::{
    Router,
    body::Body as AxumBody,
    extract::{ConnectInfo, State},
    http::{HeaderMap, HeaderName, HeaderValue, Request, Response, header},
    response::IntoResponse,
    routing::get,
};
use bytes::Bytes;
use futures_util::StreamExt;
use tokio::{
    sync::mpsc,
    time::{Instant, MissedTickBehavior},
};
use tokio_stream::wrappers::ReceiverStream;
use tracing::Instrument;

use crate::{
    core::{
        buffer_pool::BufferPool,
        circuit_breaker::CircuitState,
        concurrency::LimiterPermit,
        failure::normalize_status,
        routing::{RouteEntry, RoutingManager},
    },
    error::{DEFAULT_RETRY_AFTER_SECS, GatewayError},
    metrics::ActiveConnectionGuard,
    ports::{
        access::{AccessEvaluator, AuthIdentity, HeaderBuilder},
        http_client::{UpstreamBody, UpstreamRequest},
    },
    tracing_setup::{create_request_span, create_upstream_span},
};

/// Headers that only describe a single connection and are never forwarded.
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

/// Longest time coalesced body bytes may sit in a relay buffer.
pub const FLUSH_INTERVAL: Duration = Duration::from_millis(100);

const RELAY_CHANNEL_CAPACITY: usize = 16;
const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");
const X_FORWARDED_HOST: HeaderName = HeaderName::from_static("x-forwarded-host");
const X_FORWARDED_PROTO: HeaderName = HeaderName::from_static("x-forwarded-proto");
const X_REQUEST_ID: &str = "x-request-id";

/// Reverse-proxy handler for every route in the routing table.
#[derive(Clone)]
pub struct GatewayHandler {
    manager: Arc<RoutingManager>,
    access: Arc<dyn AccessEvaluator>,
    header_builder: Arc<dyn HeaderBuilder>,
}

impl GatewayHandler {
    pub fn new(
        manager: Arc<RoutingManager>,
        access: Arc<dyn AccessEvaluator>,
        header_builder: Arc<dyn HeaderBuilder>,
    ) -> Self {
        Self {
            manager,
            access,
            header_builder,
        }
    }

    pub fn manager(&self) -> &Arc<RoutingManager> {
        &self.manager
    }

    /// Axum router: the metrics endpoint at `metrics_path`, everything else dispatched.
    pub fn router(self, metrics_path: &str) -> Router {
        Router::new()
            .route(metrics_path, get(metrics_handler))
            .fallback(proxy_handler)
            .with_state(self)
    }

    /// Dispatch one request. Failures are rendered as JSON error responses.
    pub async fn handle_request(&self, req: Request<AxumBody>) -> Response<AxumBody> {
        let request_id = req
            .headers()
            .get(X_REQUEST_ID)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("-")
            .to_string();
        let span = create_request_span(req.method().as_str(), req.uri().path(), &request_id);

        let started = Instant::now();
        let response = self.dispatch(req, started).instrument(span.clone()).await;

        span.record("http.status_code", response.status().as_u16());
        span.record("duration_ms", started.elapsed().as_millis() as u64);
        response
    }

    async fn dispatch(&self, req: Request<AxumBody>, started: Instant) -> Response<AxumBody> {
        if is_upgrade_request(req.headers()) {
            tracing::debug!("Rejecting protocol upgrade for {}", req.uri().path());
            return GatewayError::UpgradeNotSupported.into_response();
        }

        let path = req.uri().path().to_string();
        let Some(entry) = self.manager.match_proxy(&path) else {
            tracing::debug!("No proxy matches {}", path);
            return GatewayError::RouteNotFound { path }.into_response();
        };
        tracing::Span::current().record("route", entry.config.path.as_str());

        let identity = req.extensions().get::<AuthIdentity>().cloned();
        let decision = self
            .access
            .evaluate(&entry.config.access_rule, identity.as_ref());
        if let Some(err) = GatewayError::from_access(decision) {
            tracing::debug!("Access to '{}' denied: {:?}", entry.config.path, decision);
            return err.into_response();
        }

        if entry.breaker.is_open() {
            entry.metrics.set_circuit_state(CircuitState::Open);
            tracing::debug!("Circuit open for '{}', rejecting", entry.config.path);
            return GatewayError::CircuitOpen.into_response();
        }
        entry.metrics.set_circuit_state(entry.breaker.state());

        let Some(permit) = entry.limiter.try_permit() else {
            tracing::debug!(
                "Concurrency limit {:?} reached for '{}'",
                entry.limiter.max(),
                entry.config.path
            );
            return GatewayError::ConcurrencyLimited {
                retry_after_secs: DEFAULT_RETRY_AFTER_SECS,
            }
            .into_response();
        };

        let mut guard = RequestGuard {
            active: Some(ActiveConnectionGuard::new(Arc::clone(&entry.metrics))),
            entry: Arc::clone(&entry),
            started,
            outcome: None,
            permit: Some(permit),
        };

        let (parts, body) = req.into_parts();
        let remote = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| *addr);
        let path_and_query = parts
            .uri
            .path_and_query()
            .map_or(path.as_str(), |pq| pq.as_str());
        let url = RoutingManager::build_upstream_url(&entry.config, path_and_query);
        let headers = self.outbound_headers(&parts, &entry, identity.as_ref(), remote);

        let timeout = entry.config.request_timeout();
        let upstream_span = create_upstream_span(&entry.config.path, &url, parts.method.as_str());
        let request = UpstreamRequest {
            method: parts.method.clone(),
            url: url.clone(),
            headers,
            body,
            timeout,
        };

        let client = self.manager.client_for(&entry);
        let result = client
            .send_request(request)
            .instrument(upstream_span.clone())
            .await;

        let upstream = match result {
            Ok(upstream) => upstream,
            Err(e) => {
                let err = GatewayError::from_upstream(&e);
                tracing::warn!(
                    "{} {} -> {} failed: {}",
                    parts.method,
                    path,
                    url,
                    e
                );
                guard.outcome = Some(Outcome::Failed(err.status().as_u16()));
                drop(guard);
                return err.into_response();
            }
        };

        let status = normalize_status(upstream.status);
        if status.as_u16() != upstream.status {
            tracing::warn!(
                "Upstream {} returned invalid status {}, relaying {}",
                url,
                upstream.status,
                status
            );
        }
        upstream_span.record("http.status_code", status.as_u16());
        guard.outcome = Some(Outcome::Responded(status.as_u16()));

        tracing::debug!(
            "{} {} -> {} answered {} (peer {:?})",
            parts.method,
            path,
            url,
            status,
            remote
        );

        let mut headers = upstream.headers;
        strip_hop_by_hop(&mut headers);
        let event_stream = is_event_stream(&headers);

        let body = match upstream.body {
            Some(stream) => {
                let deadline = started + timeout;
                relay(
                    stream,
                    Arc::clone(self.manager.buffer_pool()),
                    event_stream,
                    deadline,
                    guard,
                )
            }
            None => AxumBody::empty(),
        };

        let mut response = Response::new(body);
        *response.status_mut() = status;
        *response.headers_mut() = headers;
        response
    }

    /// Rewrite the inbound headers for the upstream.
    ///
    /// `Host` is dropped so the client addresses the upstream by its own authority, and
    /// compression is disabled so relayed bodies always match their declared length.
    fn outbound_headers(
        &self,
        parts: &axum::http::request::Parts,
        entry: &RouteEntry,
        identity: Option<&AuthIdentity>,
        remote: Option<SocketAddr>,
    ) -> HeaderMap {
        let mut headers = parts.headers.clone();
        strip_hop_by_hop(&mut headers);

        let inbound_host = headers
            .remove(header::HOST)
            .or_else(|| {
                parts
                    .uri
                    .authority()
                    .and_then(|a| HeaderValue::from_str(a.as_str()).ok())
            });

        headers.insert(
            header::ACCEPT_ENCODING,
            HeaderValue::from_static("identity"),
        );

        if !headers.contains_key(&X_FORWARDED_FOR) {
            if let Some(value) =
                remote.and_then(|addr| HeaderValue::from_str(&addr.ip().to_string()).ok())
            {
                headers.insert(X_FORWARDED_FOR, value);
            }
        }
        if let Some(host) = inbound_host {
            headers.insert(X_FORWARDED_HOST, host);
        }
        if !headers.contains_key(&X_FORWARDED_PROTO) {
            headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static("http"));
        }

        if !entry.config.headers.is_empty() {
            match self.header_builder.build(&entry.config.headers, identity) {
                Ok(extra) => {
                    for (name, value) in &extra {
                        if !value.is_empty() {
                            headers.insert(name.clone(), value.clone());
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(
                        "Failed to resolve headers for route '{}': {}",
                        entry.config.path,
                        e
                    );
                }
            }
        }

        headers
    }
}

async fn proxy_handler(
    State(handler): State<GatewayHandler>,
    req: Request<AxumBody>,
) -> Response<AxumBody> {
    handler.handle_request(req).await
}

async fn metrics_handler(State(handler): State<GatewayHandler>) -> impl IntoResponse {
    (
        [(
            header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        handler.manager.metrics().render(),
    )
}

/// `Connection: upgrade` together with `Upgrade: websocket`, case-insensitively.
pub fn is_upgrade_request(headers: &HeaderMap) -> bool {
    let connection_upgrade = connection_tokens(headers).any(|t| t.eq_ignore_ascii_case("upgrade"));
    let websocket = headers
        .get(header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.trim().eq_ignore_ascii_case("websocket"));
    connection_upgrade && websocket
}

fn connection_tokens(headers: &HeaderMap) -> impl Iterator<Item = &str> {
    headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

/// Remove hop-by-hop headers, including any listed in `Connection`.
fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let named: Vec<String> = connection_tokens(headers)
        .map(str::to_ascii_lowercase)
        .collect();
    for name in &named {
        headers.remove(name.as_str());
    }
    for name in HOP_BY_HOP_HEADERS {
        headers.remove(*name);
    }
}

fn is_event_stream(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.trim_start().starts_with("text/event-stream"))
}

/// What is known about a request once the upstream has answered or failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    /// The upstream answered with this (normalised) status.
    Responded(u16),
    /// Delivery failed (transport error or broken body); the status relayed to the client.
    Failed(u16),
}

impl Outcome {
    fn status(self) -> u16 {
        match self {
            Self::Responded(status) | Self::Failed(status) => status,
        }
    }

    fn is_failure(self) -> bool {
        match self {
            Self::Responded(status) => status >= 500,
            Self::Failed(_) => true,
        }
    }

    fn into_failed(self) -> Self {
        Self::Failed(self.status())
    }
}

/// Holds everything a proxied request owns until its response body is finished, and
/// records the outcome when dropped.
///
/// A guard dropped without an outcome belongs to a request abandoned before the upstream
/// answered. It releases its admission slot but records nothing.
struct RequestGuard {
    entry: Arc<RouteEntry>,
    started: Instant,
    outcome: Option<Outcome>,
    permit: Option<LimiterPermit>,
    active: Option<ActiveConnectionGuard>,
}

impl Drop for RequestGuard {
    fn drop(&mut self) {
        let elapsed = self.started.elapsed();

        match self.outcome {
            Some(outcome) => {
                let metrics = &self.entry.metrics;
                metrics.record_request(outcome.status(), elapsed);

                let breaker = &self.entry.breaker;
                if outcome.is_failure() {
                    breaker.record_failure();
                } else {
                    breaker.record_success();
                }
                metrics.set_circuit_state(breaker.state());

                tracing::debug!(
                    "Request on '{}' finished with {} in {:?}",
                    self.entry.config.path,
                    outcome.status(),
                    elapsed
                );
            }
            None => {
                tracing::debug!(
                    "Request on '{}' abandoned after {:?} before the upstream answered",
                    self.entry.config.path,
                    elapsed
                );
            }
        }

        self.active.take();
        self.permit.take();
    }
}

enum RelayEnd {
    Complete,
    ClientGone,
    Failed,
}

/// Stream `upstream` into a response body on a separate task.
fn relay(
    upstream: UpstreamBody,
    pool: Arc<BufferPool>,
    event_stream: bool,
    deadline: Instant,
    mut guard: RequestGuard,
) -> AxumBody {
    let (tx, rx) = mpsc::channel::<io::Result<Bytes>>(RELAY_CHANNEL_CAPACITY);
    tokio::spawn(async move {
        let end = pump(upstream, &tx, &pool, event_stream, deadline).await;
        if let RelayEnd::Failed = end {
            guard.outcome = guard.outcome.map(Outcome::into_failed);
        }
        // Record before the body stream ends so readers observe the outcome.
        drop(guard);
        drop(tx);
    });
    AxumBody::from_stream(ReceiverStream::new(rx))
}

async fn pump(
    mut upstream: UpstreamBody,
    tx: &mpsc::Sender<io::Result<Bytes>>,
    pool: &Arc<BufferPool>,
    event_stream: bool,
    deadline: Instant,
) -> RelayEnd {
    let mut buffer = pool.get();
    let mut flush = tokio::time::interval_at(Instant::now() + FLUSH_INTERVAL, FLUSH_INTERVAL);
    flush.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let expired = tokio::time::sleep_until(deadline);
    tokio::pin!(expired);

    loop {
        tokio::select! {
            _ = tx.closed() => {
                tracing::debug!("Client went away, dropping upstream body");
                return RelayEnd::ClientGone;
            }
            _ = &mut expired => {
                tracing::warn!("Upstream body exceeded the request deadline, aborting relay");
                let _ = tx
                    .send(Err(io::Error::new(
                        io::ErrorKind::TimedOut,
                        "upstream body exceeded request timeout",
                    )))
                    .await;
                return RelayEnd::Failed;
            }
            _ = flush.tick(), if !buffer.is_empty() => {
                if tx.send(Ok(buffer.take_bytes())).await.is_err() {
                    return RelayEnd::ClientGone;
                }
            }
            frame = upstream.next() => match frame {
                Some(Ok(chunk)) => {
                    if event_stream {
                        if tx.send(Ok(chunk)).await.is_err() {
                            return RelayEnd::ClientGone;
                        }
                        continue;
                    }

                    if chunk.len() > buffer.remaining() {
                        if !buffer.is_empty() && tx.send(Ok(buffer.take_bytes())).await.is_err() {
                            return RelayEnd::ClientGone;
                        }
                        if chunk.len() >= pool.buffer_size() {
                            if tx.send(Ok(chunk)).await.is_err() {
                                return RelayEnd::ClientGone;
                            }
                            continue;
                        }
                    }
                    buffer.extend_from_slice(&chunk);
                    if buffer.is_full() && tx.send(Ok(buffer.take_bytes())).await.is_err() {
                        return RelayEnd::ClientGone;
                    }
                }
                Some(Err(e)) => {
                    tracing::warn!("Upstream body failed mid-stream: {}", e);
                    let _ = tx.send(Err(io::Error::other(e))).await;
                    return RelayEnd::Failed;
                }
                None => {
                    if !buffer.is_empty() && tx.send(Ok(buffer.take_bytes())).await.is_err() {
                        return RelayEnd::ClientGone;
                    }
                    return RelayEnd::Complete;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::HashMap,
        sync::Mutex,
    };

    use async_trait::async_trait;
    use axum::http::StatusCode;
    use futures_util::stream;
    use http_body_util::BodyExt;

    use super::*;
    use crate::{
        adapters::access::{BasicRuleEvaluator, LiteralHeaderBuilder},
        config::models::{CircuitBreakerConfig, RouteConfig},
        core::routing::GatewayComponents,
        ports::http_client::{HttpClient, HttpClientError, HttpClientResult, UpstreamResponse},
    };

    #[derive(Debug, Clone)]
    struct Seen {
        url: String,
        headers: HeaderMap,
        timeout: Duration,
    }

    enum Reply {
        Status(u16, &'static str),
        NoBody(u16),
        Fail(fn() -> HttpClientError),
        /// One event-stream frame, then the upstream goes quiet without closing.
        Stalled,
        /// The upstream never answers.
        Hang,
    }

    struct MockClient {
        reply: Reply,
        seen: Mutex<Vec<Seen>>,
    }

    impl MockClient {
        fn new(reply: Reply) -> Arc<Self> {
            Arc::new(Self {
                reply,
                seen: Mutex::new(Vec::new()),
            })
        }

        fn last(&self) -> Seen {
            self.seen.lock().unwrap().last().cloned().unwrap()
        }
    }

    #[async_trait]
    impl HttpClient for MockClient {
        async fn send_request(&self, req: UpstreamRequest) -> HttpClientResult<UpstreamResponse> {
            self.seen.lock().unwrap().push(Seen {
                url: req.url,
                headers: req.headers,
                timeout: req.timeout,
            });
            match &self.reply {
                Reply::Status(status, body) => {
                    let mut headers = HeaderMap::new();
                    headers.insert(header::CONNECTION, HeaderValue::from_static("close"));
                    headers.insert("x-upstream", HeaderValue::from_static("yes"));
                    let chunks: Vec<HttpClientResult<Bytes>> = vec![Ok(Bytes::from(body.to_string()))];
                    Ok(UpstreamResponse {
                        status: *status,
                        headers,
                        body: Some(stream::iter(chunks).boxed()),
                    })
                }
                Reply::NoBody(status) => Ok(UpstreamResponse {
                    status: *status,
                    headers: HeaderMap::new(),
                    body: None,
                }),
                Reply::Fail(make) => Err(make()),
                Reply::Stalled => {
                    let mut headers = HeaderMap::new();
                    headers.insert(
                        header::CONTENT_TYPE,
                        HeaderValue::from_static("text/event-stream"),
                    );
                    let first: HttpClientResult<Bytes> = Ok(Bytes::from_static(b"data: 1\n\n"));
                    Ok(UpstreamResponse {
                        status: 200,
                        headers,
                        body: Some(stream::iter([first]).chain(stream::pending()).boxed()),
                    })
                }
                Reply::Hang => futures_util::future::pending().await,
            }
        }
    }

    fn handler_with(client: Arc<MockClient>, routes: Vec<RouteConfig>) -> GatewayHandler {
        let manager = Arc::new(RoutingManager::new(GatewayComponents::new(client)));
        manager.set_proxies(routes);
        GatewayHandler::new(
            manager,
            Arc::new(BasicRuleEvaluator::new()),
            Arc::new(LiteralHeaderBuilder::new()),
        )
    }

    fn route() -> RouteConfig {
        RouteConfig::new("openai", "/-/openai", "https://api.example.com/")
    }

    fn get(uri: &str) -> Request<AxumBody> {
        Request::builder().uri(uri).body(AxumBody::empty()).unwrap()
    }

    async fn body_string(response: Response<AxumBody>) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[test]
    fn test_upgrade_detection() {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive, Upgrade"));
        headers.insert(header::UPGRADE, HeaderValue::from_static("WebSocket"));
        assert!(is_upgrade_request(&headers));

        headers.insert(header::UPGRADE, HeaderValue::from_static("h2c"));
        assert!(!is_upgrade_request(&headers));

        let mut only_upgrade = HeaderMap::new();
        only_upgrade.insert(header::UPGRADE, HeaderValue::from_static("websocket"));
        assert!(!is_upgrade_request(&only_upgrade));
    }

    #[test]
    fn test_strip_hop_by_hop_includes_connection_tokens() {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONNECTION, HeaderValue::from_static("x-session, close"));
        headers.insert("x-session", HeaderValue::from_static("abc"));
        headers.insert(header::TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
        headers.insert("keep-alive", HeaderValue::from_static("timeout=5"));
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/plain"));

        strip_hop_by_hop(&mut headers);

        assert_eq!(headers.len(), 1);
        assert!(headers.contains_key(header::CONTENT_TYPE));
    }

    #[tokio::test]
    async fn test_outbound_request_rewriting() {
        let client = MockClient::new(Reply::Status(200, "ok"));
        let mut cfg = route();
        cfg.timeout = 12;
        cfg.headers = HashMap::from([
            ("Authorization".to_string(), "Bearer sk-test".to_string()),
            ("X-Empty".to_string(), String::new()),
        ]);
        let handler = handler_with(client.clone(), vec![cfg]);

        let mut req = Request::builder()
            .uri("/-/openai/v1/chat?stream=true")
            .header(header::HOST, "gateway.local:8090")
            .header(header::ACCEPT_ENCODING, "gzip, br")
            .header(header::CONNECTION, "keep-alive")
            .header("keep-alive", "timeout=5")
            .header("proxy-authorization", "secret")
            .header("x-custom", "kept")
            .body(AxumBody::empty())
            .unwrap();
        req.extensions_mut()
            .insert(ConnectInfo(SocketAddr::from(([10, 1, 2, 3], 5555))));

        let response = handler.handle_request(req).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert!(!response.headers().contains_key(header::CONNECTION));
        assert_eq!(response.headers()["x-upstream"], "yes");
        assert_eq!(body_string(response).await, "ok");

        let seen = client.last();
        assert_eq!(seen.url, "https://api.example.com/v1/chat?stream=true");
        assert_eq!(seen.timeout, Duration::from_secs(12));
        assert!(!seen.headers.contains_key(header::HOST));
        assert!(!seen.headers.contains_key(header::CONNECTION));
        assert!(!seen.headers.contains_key("keep-alive"));
        assert!(!seen.headers.contains_key("proxy-authorization"));
        assert!(!seen.headers.contains_key("x-empty"));
        assert_eq!(seen.headers[header::ACCEPT_ENCODING], "identity");
        assert_eq!(seen.headers["x-forwarded-for"], "10.1.2.3");
        assert_eq!(seen.headers["x-forwarded-host"], "gateway.local:8090");
        assert_eq!(seen.headers["x-forwarded-proto"], "http");
        assert_eq!(seen.headers[header::AUTHORIZATION], "Bearer sk-test");
        assert_eq!(seen.headers["x-custom"], "kept");
    }

    #[tokio::test]
    async fn test_existing_forwarded_headers_are_preserved() {
        let client = MockClient::new(Reply::Status(200, "ok"));
        let handler = handler_with(client.clone(), vec![route()]);

        let mut req = Request::builder()
            .uri("/-/openai/models")
            .header("x-forwarded-for", "203.0.113.7")
            .header("x-forwarded-proto", "https")
            .body(AxumBody::empty())
            .unwrap();
        req.extensions_mut()
            .insert(ConnectInfo(SocketAddr::from(([10, 1, 2, 3], 5555))));

        let _ = body_string(handler.handle_request(req).await).await;
        let seen = client.last();
        assert_eq!(seen.headers["x-forwarded-for"], "203.0.113.7");
        assert_eq!(seen.headers["x-forwarded-proto"], "https");
    }

    #[tokio::test]
    async fn test_invalid_upstream_status_becomes_502() {
        let client = MockClient::new(Reply::NoBody(0));
        let handler = handler_with(client, vec![route()]);

        let response = handler.handle_request(get("/-/openai/x")).await;
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(body_string(response).await, "");

        let stats = handler.manager().metrics().stats("/-/openai").unwrap();
        assert_eq!(stats.requests_total, 1);
        assert_eq!(stats.errors_total, 1);
    }

    #[tokio::test]
    async fn test_transport_failures_map_to_status() {
        let refused = MockClient::new(Reply::Fail(|| {
            HttpClientError::ConnectionError("connection refused".into())
        }));
        let handler = handler_with(refused, vec![route()]);
        let response = handler.handle_request(get("/-/openai/x")).await;
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert!(body_string(response).await.contains("\"error\":\"Bad Gateway\""));

        let slow = MockClient::new(Reply::Fail(|| {
            HttpClientError::Timeout(Duration::from_secs(30))
        }));
        let handler = handler_with(slow, vec![route()]);
        let response = handler.handle_request(get("/-/openai/x")).await;
        assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(
            handler.manager().metrics().stats("/-/openai").unwrap().errors_total,
            1
        );
    }

    #[tokio::test]
    async fn test_breaker_opens_on_5xx_and_rejects() {
        let client = MockClient::new(Reply::Status(500, "boom"));
        let mut cfg = route();
        cfg.circuit_breaker = Some(CircuitBreakerConfig {
            enabled: true,
            failure_threshold: 1,
            recovery_timeout: 60,
            half_open_requests: 1,
        });
        let handler = handler_with(client.clone(), vec![cfg]);

        let first = handler.handle_request(get("/-/openai/x")).await;
        assert_eq!(first.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body_string(first).await, "boom");

        let rejected = handler.handle_request(get("/-/openai/x")).await;
        assert_eq!(rejected.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(rejected.headers()["x-circuit-breaker"], "open");
        assert_eq!(client.seen.lock().unwrap().len(), 1);
        assert_eq!(
            handler.manager().metrics().circuit_state("/-/openai"),
            CircuitState::Open
        );
        // Rejections are not attempts.
        assert_eq!(
            handler.manager().metrics().stats("/-/openai").unwrap().requests_total,
            1
        );
    }

    #[tokio::test]
    async fn test_4xx_is_not_a_breaker_failure() {
        let client = MockClient::new(Reply::Status(404, "missing"));
        let mut cfg = route();
        cfg.circuit_breaker = Some(CircuitBreakerConfig {
            enabled: true,
            failure_threshold: 1,
            ..CircuitBreakerConfig::default()
        });
        let handler = handler_with(client, vec![cfg]);

        for _ in 0..3 {
            let response = handler.handle_request(get("/-/openai/x")).await;
            assert_eq!(response.status(), StatusCode::NOT_FOUND);
            let _ = body_string(response).await;
        }
        let breaker = handler.manager().circuit_breaker("openai").unwrap();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.failures(), 0);
    }

    #[tokio::test]
    async fn test_rejections_before_upstream() {
        let client = MockClient::new(Reply::Status(200, "ok"));
        let mut private = RouteConfig::new("private", "/-/private", "http://localhost:1");
        private.access_rule = "@request.auth.id != \"\"".to_string();
        let handler = handler_with(client.clone(), vec![route(), private]);

        let missing = handler.handle_request(get("/-/unknown")).await;
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);

        let anonymous = handler.handle_request(get("/-/private/data")).await;
        assert_eq!(anonymous.status(), StatusCode::UNAUTHORIZED);

        let ws = Request::builder()
            .uri("/-/openai/realtime")
            .header(header::CONNECTION, "Upgrade")
            .header(header::UPGRADE, "websocket")
            .body(AxumBody::empty())
            .unwrap();
        let response = handler.handle_request(ws).await;
        assert_eq!(response.status(), StatusCode::NOT_IMPLEMENTED);
        assert!(body_string(response).await.contains("WebSocket Not Supported"));

        assert!(client.seen.lock().unwrap().is_empty());

        let mut authed = get("/-/private/data");
        authed.extensions_mut().insert(AuthIdentity::new("user-1"));
        let response = handler.handle_request(authed).await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_metrics_endpoint() {
        use tower::ServiceExt;

        let client = MockClient::new(Reply::Status(200, "ok"));
        let handler = handler_with(client, vec![route()]);
        let app = handler.router("/api/gateway/metrics");

        let response = app.clone().oneshot(get("/-/openai/x")).await.unwrap();
        let _ = body_string(response).await;

        let response = app.oneshot(get("/api/gateway/metrics")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(
            response.headers()[header::CONTENT_TYPE]
                .to_str()
                .unwrap()
                .starts_with("text/plain")
        );
        let text = body_string(response).await;
        assert!(text.contains("gateway_requests_total{proxy=\"/-/openai\"} 1"));
    }

    #[tokio::test]
    async fn test_client_disconnect_releases_stalled_stream() {
        let client = MockClient::new(Reply::Stalled);
        let mut cfg = route();
        cfg.max_concurrent = 1;
        let handler = handler_with(client, vec![cfg]);
        let metrics = Arc::clone(handler.manager().metrics());

        let response = handler.handle_request(get("/-/openai/events")).await;
        assert_eq!(response.status(), StatusCode::OK);
        let mut body = response.into_body();
        let frame = body.frame().await.unwrap().unwrap();
        assert_eq!(frame.into_data().unwrap(), "data: 1\n\n");
        assert_eq!(metrics.active("/-/openai"), 1);

        drop(body);
        for _ in 0..100 {
            if metrics.active("/-/openai") == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(metrics.active("/-/openai"), 0);
        assert_eq!(handler.manager().limiter("openai").unwrap().in_use(), 0);

        let next = handler.handle_request(get("/-/openai/events")).await;
        assert_eq!(next.status(), StatusCode::OK);

        let stats = metrics.stats("/-/openai").unwrap();
        assert_eq!(stats.requests_total, 1);
        assert_eq!(stats.errors_total, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_request_does_not_close_half_open_breaker() {
        let client = MockClient::new(Reply::Hang);
        let mut cfg = route();
        cfg.max_concurrent = 1;
        cfg.circuit_breaker = Some(CircuitBreakerConfig {
            enabled: true,
            failure_threshold: 1,
            recovery_timeout: 1,
            half_open_requests: 1,
        });
        let handler = handler_with(client, vec![cfg]);
        let breaker = handler.manager().circuit_breaker("openai").unwrap();

        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
        tokio::time::sleep(Duration::from_millis(1100)).await;

        let cancelled = tokio::time::timeout(
            Duration::from_millis(50),
            handler.handle_request(get("/-/openai/x")),
        )
        .await;
        assert!(cancelled.is_err());

        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        assert_eq!(handler.manager().limiter("openai").unwrap().in_use(), 0);

        let metrics = handler.manager().metrics();
        assert_eq!(metrics.active("/-/openai"), 0);
        let stats = metrics.stats("/-/openai").unwrap();
        assert_eq!(stats.requests_total, 0);
        assert_eq!(stats.errors_total, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_relay_coalesces_small_frames() {
        let pool = Arc::new(BufferPool::new(8, 2));
        let frames: Vec<HttpClientResult<Bytes>> = ["ab", "cd", "efgh", "ijklmnopqrst", "u"]
            .into_iter()
            .map(|s| Ok(Bytes::from_static(s.as_bytes())))
            .collect();
        let (tx, mut rx) = mpsc::channel(16);

        let end = pump(
            stream::iter(frames).boxed(),
            &tx,
            &pool,
            false,
            Instant::now() + Duration::from_secs(5),
        )
        .await;
        assert!(matches!(end, RelayEnd::Complete));
        drop(tx);

        let mut chunks = Vec::new();
        while let Some(chunk) = rx.recv().await {
            chunks.push(String::from_utf8(chunk.unwrap().to_vec()).unwrap());
        }
        assert_eq!(chunks, vec!["abcdefgh", "ijklmnopqrst", "u"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_relay_forwards_event_stream_frames_individually() {
        let pool = Arc::new(BufferPool::new(1024, 2));
        let frames: Vec<HttpClientResult<Bytes>> = vec![
            Ok(Bytes::from_static(b"data: 1\n\n")),
            Ok(Bytes::from_static(b"data: 2\n\n")),
        ];
        let (tx, mut rx) = mpsc::channel(16);

        let end = pump(
            stream::iter(frames).boxed(),
            &tx,
            &pool,
            true,
            Instant::now() + Duration::from_secs(5),
        )
        .await;
        assert!(matches!(end, RelayEnd::Complete));
        drop(tx);

        assert_eq!(rx.recv().await.unwrap().unwrap(), "data: 1\n\n");
        assert_eq!(rx.recv().await.unwrap().unwrap(), "data: 2\n\n");
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_relay_reports_upstream_body_failure() {
        let pool = Arc::new(BufferPool::new(1024, 2));
        let frames: Vec<HttpClientResult<Bytes>> = vec![
            Ok(Bytes::from_static(b"partial")),
            Err(HttpClientError::ConnectionError("reset".into())),
        ];
        let (tx, mut rx) = mpsc::channel(16);

        let end = pump(
            stream::iter(frames).boxed(),
            &tx,
            &pool,
            false,
            Instant::now() + Duration::from_secs(5),
        )
        .await;
        assert!(matches!(end, RelayEnd::Failed));
        assert!(rx.recv().await.unwrap().is_err());
    }
}
