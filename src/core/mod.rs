pub mod buffer_pool;
pub mod circuit_breaker;
pub mod concurrency;
pub mod failure;
pub mod reload;
pub mod routing;

pub use buffer_pool::{BufferPool, PooledBuffer};
pub use circuit_breaker::{CircuitBreaker, CircuitState};
pub use concurrency::{ConcurrencyLimiter, LimiterPermit};
pub use failure::{FailureKind, classify, normalize_status};
pub use reload::{RELOAD_DEBOUNCE, reload_routes, spawn_reload_worker};
pub use routing::{GatewayComponents, RouteEntry, RoutingManager, RoutingTable};
