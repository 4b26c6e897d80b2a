//! Hot reload of the routing table from a [`ConfigProvider`].
//!
//! A single save usually produces a burst of file-system events, so notifications are
//! debounced: after the first signal the worker waits for the debounce window, drops any
//! signals that arrived meanwhile and reloads once. A configuration that fails to load
//! or validate leaves the current routing table in place.
use std::{sync::Arc, time::Duration};

use eyre::{Result, WrapErr};
use tokio::task::JoinHandle;

use crate::{
    config::validation::ConfigValidator, core::routing::RoutingManager,
    ports::config_provider::ConfigProvider,
};

pub const RELOAD_DEBOUNCE: Duration = Duration::from_secs(2);

/// Load, validate and publish the provider's current proxies.
///
/// Returns the number of active routes after the reload.
pub async fn reload_routes(
    provider: &dyn ConfigProvider,
    manager: &RoutingManager,
) -> Result<usize> {
    let config = provider
        .load_config()
        .await
        .wrap_err("Failed to load proxy configuration")?;
    ConfigValidator::validate(&config).wrap_err("Proxy configuration is invalid")?;

    manager.set_proxies(config.proxies);
    Ok(manager.table().len())
}

/// Spawn the task that reloads routes whenever the provider signals a change.
///
/// The task ends when the provider's change channel closes.
pub fn spawn_reload_worker(
    provider: Arc<dyn ConfigProvider>,
    manager: Arc<RoutingManager>,
    debounce: Duration,
) -> Result<JoinHandle<()>> {
    let mut changes = provider.watch()?;

    Ok(tokio::spawn(async move {
        tracing::info!("Proxy config watcher started (debounce {:?})", debounce);

        while changes.recv().await.is_some() {
            tokio::time::sleep(debounce).await;
            while changes.try_recv().is_ok() {}

            match reload_routes(provider.as_ref(), &manager).await {
                Ok(active) => {
                    tracing::info!("Proxy configuration reloaded, {} active route(s)", active);
                }
                Err(e) => {
                    tracing::error!(
                        "Failed to reload proxy configuration: {:?}. Keeping previous routes.",
                        e
                    );
                }
            }
        }

        tracing::info!("Proxy config watcher is shutting down.");
    }))
}
