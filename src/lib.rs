//! Portcullis - an embeddable API gateway.
//!
//! Portcullis intercepts requests under configured path prefixes, matches them against a
//! hot-reloadable routing table and forwards them to upstream services, while enforcing
//! per-route admission control and normalising the differences between local sidecars
//! and hosted HTTP / SSE APIs.
//!
//! # Features
//! - Longest-prefix, segment-aligned route matching with lock-free hot reload
//! - Per-route concurrency limits (429 + `Retry-After`) and three-state circuit breakers
//!   (503 + `X-Circuit-Breaker: open`)
//! - A shared, tuned outbound transport with optional per-route timeout overrides
//! - Outbound header surgery: hop-by-hop stripping, forced identity encoding,
//!   `X-Forwarded-*`, injected route headers
//! - Streaming relay with immediate flushing for server-sent events
//! - Upstream failure classification (504 timeout vs 502 connection) and status
//!   normalisation
//! - Per-route Prometheus metrics with a latency histogram
//!
//! # Quick Example
//! ```no_run
//! use std::sync::Arc;
//!
//! use portcullis::{
//!     adapters::{BasicRuleEvaluator, GatewayHandler, HardenedTransport, LiteralHeaderBuilder},
//!     config::load_config,
//!     core::RoutingManager,
//! };
//!
//! # #[tokio::main] async fn main() -> eyre::Result<()> {
//! let config = load_config("gateway.yaml").await?;
//! let manager = Arc::new(RoutingManager::new(HardenedTransport::components(
//!     &config.transport,
//! )?));
//! manager.set_proxies(config.proxies);
//!
//! let app = GatewayHandler::new(
//!     manager,
//!     Arc::new(BasicRuleEvaluator::new()),
//!     Arc::new(LiteralHeaderBuilder::new()),
//! )
//! .router(&config.metrics_path);
//! let listener = tokio::net::TcpListener::bind(config.listen_addr.as_str()).await?;
//! axum::serve(listener, app).await?;
//! # Ok(()) }
//! ```
//!
//! # Architecture
//! The crate separates **ports** (traits for the transport, the configuration store, the
//! access-rule evaluator and the header builder) from **adapters** (their bundled
//! implementations and the axum dispatcher) and keeps routing and admission state in
//! `core`.
//!
//! # Error Handling
//! User-visible failures are [`GatewayError`]s rendered as JSON. Glue code returns
//! `eyre::Result<T>` with `WrapErr` context.
pub mod config;
pub mod error;
pub mod metrics;
pub mod ports;
pub mod tracing_setup;

pub mod adapters;
pub mod core;

// Re-export the specific types needed by the binary crate and embedders
pub use crate::{
    adapters::{GatewayHandler, HardenedTransport},
    core::{GatewayComponents, RoutingManager},
    error::GatewayError,
    metrics::MetricsCollector,
    ports::http_client::HttpClient,
};
