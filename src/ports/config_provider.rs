use async_trait::async_trait;
use eyre::Result;
use tokio::sync::mpsc;

use crate::config::models::GatewayConfig;

/// Trait for the store that owns proxy definitions and reports changes to them.
#[async_trait]
pub trait ConfigProvider: Send + Sync {
    /// Load the current configuration.
    async fn load_config(&self) -> Result<GatewayConfig>;

    /// Return a channel that signals when the configuration has changed.
    /// The receiver should trigger a reload by calling `load_config`.
    ///
    /// A provider hands out a single receiver; later calls return an error.
    fn watch(&self) -> Result<mpsc::Receiver<()>>;
}
