use std::{io, sync::Arc, time::Duration};

use async_trait::async_trait;
use axum::body::{Body as AxumBody, HttpBody};
use bytes::Bytes;
use eyre::{Result, WrapErr};
use futures_util::{StreamExt, TryStreamExt};
use reqwest::{Client, redirect};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::{
    config::models::{TimeoutConfig, TransportConfig, TransportSettings},
    core::routing::GatewayComponents,
    ports::http_client::{
        HttpClient, HttpClientError, HttpClientFactory, HttpClientResult, UpstreamRequest,
        UpstreamResponse,
    },
};

/// Frames of the inbound body buffered ahead of the upstream connection.
const REQUEST_BODY_CHANNEL_CAPACITY: usize = 16;

/// Shared outbound transport built on `reqwest` (HTTP/1.1 + HTTP/2 via ALPN).
///
/// Responsibilities:
/// * Bounded dial timeout and TCP keep-alive
/// * Connection pool tuned for many concurrent requests to few upstream hosts
///   (the per-host idle cap is the knob that matters most)
/// * First-byte timeout, optionally disabled for long-lived streaming upstreams
/// * Never follows redirects; the client sees the upstream's answer verbatim
/// * Honours `HTTP_PROXY` / `HTTPS_PROXY` / `NO_PROXY`
///
/// Content decoding is not enabled, so response bodies are relayed byte-for-byte.
#[derive(Debug, Clone)]
pub struct HardenedTransport {
    client: Client,
    config: TransportConfig,
    settings: TransportSettings,
}

impl HardenedTransport {
    /// Create a transport; non-positive settings fall back to their defaults.
    pub fn new(config: &TransportConfig) -> Result<Self> {
        let settings = config.resolve();

        let client = Client::builder()
            .connect_timeout(settings.dial_timeout)
            .tcp_keepalive(settings.keep_alive)
            .pool_idle_timeout(settings.idle_timeout)
            .pool_max_idle_per_host(settings.max_idle_conns_per_host)
            .redirect(redirect::Policy::none())
            .build()
            .wrap_err("Failed to build upstream HTTP client")?;

        tracing::info!(
            "Created upstream transport: dial={:?}, keepalive={:?}, first_byte={:?}, idle={:?}, max_idle_per_host={}",
            settings.dial_timeout,
            settings.keep_alive,
            settings.response_header_timeout,
            settings.idle_timeout,
            settings.max_idle_conns_per_host,
        );

        Ok(Self {
            client,
            config: *config,
            settings,
        })
    }

    /// Dedicated transport for a route with its own timeout overrides.
    pub fn for_route(base: &TransportConfig, timeouts: &TimeoutConfig) -> Result<Self> {
        Self::new(&timeouts.to_transport_config(base))
    }

    /// Gateway components around a shared transport built from `config`; routes with
    /// timeout overrides get their own transport derived from the same base.
    pub fn components(config: &TransportConfig) -> Result<GatewayComponents> {
        let transport = Arc::new(Self::new(config)?);
        let mut components = GatewayComponents::new(transport.clone());
        components.client_factory = Some(transport);
        Ok(components)
    }

    pub fn settings(&self) -> &TransportSettings {
        &self.settings
    }

    /// Time allowed for the response head: the smaller of the request's overall
    /// budget and the configured first-byte timeout.
    fn head_timeout(&self, request_timeout: Duration) -> Duration {
        match self.settings.response_header_timeout {
            Some(limit) => limit.min(request_timeout),
            None => request_timeout,
        }
    }
}

/// Convert the inbound body into a streaming `reqwest::Body`.
///
/// Bodies that are already complete (typical for GET) are sent without a body.
fn outbound_body(body: AxumBody) -> Option<reqwest::Body> {
    if body.is_end_stream() {
        return None;
    }

    let (tx, rx) = mpsc::channel::<io::Result<Bytes>>(REQUEST_BODY_CHANNEL_CAPACITY);
    tokio::spawn(async move {
        let mut frames = body.into_data_stream();
        while let Some(frame) = frames.next().await {
            let frame = frame.map_err(io::Error::other);
            let failed = frame.is_err();
            if tx.send(frame).await.is_err() || failed {
                break;
            }
        }
    });
    Some(reqwest::Body::wrap_stream(ReceiverStream::new(rx)))
}

fn map_reqwest_error(err: reqwest::Error) -> HttpClientError {
    if err.is_builder() {
        HttpClientError::InvalidRequest(err.to_string())
    } else {
        HttpClientError::Transport(Box::new(err))
    }
}

impl HttpClientFactory for HardenedTransport {
    fn with_timeouts(&self, timeouts: &TimeoutConfig) -> HttpClientResult<Arc<dyn HttpClient>> {
        let transport = Self::for_route(&self.config, timeouts)
            .map_err(|e| HttpClientError::InvalidRequest(format!("{e:#}")))?;
        Ok(Arc::new(transport))
    }
}

#[async_trait]
impl HttpClient for HardenedTransport {
    async fn send_request(&self, req: UpstreamRequest) -> HttpClientResult<UpstreamResponse> {
        let UpstreamRequest {
            method,
            url,
            headers,
            body,
            timeout,
        } = req;

        let mut builder = self.client.request(method.clone(), &url).headers(headers);
        if let Some(body) = outbound_body(body) {
            builder = builder.body(body);
        }
        let request = builder.build().map_err(map_reqwest_error)?;

        let head_timeout = self.head_timeout(timeout);
        tracing::debug!(
            "Sending upstream request: {} {} (head timeout {:?})",
            method,
            url,
            head_timeout
        );

        let sent = tokio::time::timeout(head_timeout, self.client.execute(request)).await;
        let mut response = match sent {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                tracing::debug!("Upstream request {} {} failed: {}", method, url, e);
                return Err(map_reqwest_error(e));
            }
            Err(_) => {
                tracing::debug!(
                    "Upstream request {} {} timed out after {:?}",
                    method,
                    url,
                    head_timeout
                );
                return Err(HttpClientError::Timeout(head_timeout));
            }
        };

        let status = response.status().as_u16();
        let headers = std::mem::take(response.headers_mut());
        let body = response.bytes_stream().map_err(map_reqwest_error).boxed();

        Ok(UpstreamResponse {
            status,
            headers,
            body: Some(body),
        })
    }
}
