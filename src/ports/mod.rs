pub mod access;
pub mod config_provider;
pub mod http_client;

pub use access::{AccessDecision, AccessEvaluator, AuthIdentity, HeaderBuildError, HeaderBuilder};
pub use config_provider::ConfigProvider;
pub use http_client::{
    HttpClient, HttpClientError, HttpClientFactory, UpstreamRequest, UpstreamResponse,
};
