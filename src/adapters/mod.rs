pub mod access;
pub mod config_providers;
pub mod http_client;
pub mod http_handler;

/// Re-export commonly used types from adapters
pub use access::{BasicRuleEvaluator, LiteralHeaderBuilder};
pub use config_providers::FileConfigProvider;
pub use http_client::HardenedTransport;
pub use http_handler::GatewayHandler;
