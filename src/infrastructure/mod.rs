//! Infrastructure Layer
//!
//! Upstream connections, health checking, metrics and shutdown.

pub mod connection_pool;
pub mod metrics;
pub mod proxy;
pub mod proxy_pool;
pub mod shutdown;
pub mod tls;

pub use connection_pool::{Protocol, Transport, TransportConfig, TransportError, UpstreamConnection};
pub use metrics::{MetricsSnapshot, RouterMetrics};
pub use proxy::{HealthCheckResult, Proxy, ProxyError};
pub use proxy_pool::{ProxyPool, ProxyPoolConfig};
pub use shutdown::{shutdown_signal, QueryGuard, ShutdownController};
pub use tls::UpstreamTls;
