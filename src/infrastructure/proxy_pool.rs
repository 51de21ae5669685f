//! Proxy Pool
//!
//! The configured upstreams, the policy that orders them for each query
//! and the periodic health check that brings down upstreams back.

use crate::domain::services::{SelectionPolicy, Selector};
use crate::infrastructure::connection_pool::TransportConfig;
use crate::infrastructure::metrics::RouterMetrics;
use crate::infrastructure::proxy::Proxy;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

/// Proxy pool configuration.
#[derive(Debug, Clone)]
pub struct ProxyPoolConfig {
    /// Consecutive failures before an upstream counts as down (0 = never)
    pub max_fails: u32,
    /// How often down upstreams are checked
    pub health_check_interval: Duration,
    /// Bound on waiting for one upstream reply
    pub read_timeout: Duration,
    pub policy: SelectionPolicy,
    pub transport: TransportConfig,
}

impl Default for ProxyPoolConfig {
    fn default() -> Self {
        Self {
            max_fails: 2,
            health_check_interval: Duration::from_millis(500),
            read_timeout: Duration::from_secs(2),
            policy: SelectionPolicy::Random,
            transport: TransportConfig::default(),
        }
    }
}

/// All upstreams of this site.
pub struct ProxyPool {
    proxies: Vec<Arc<Proxy>>,
    selector: Selector,
    max_fails: u32,
    health_check_interval: Duration,
    metrics: Arc<RouterMetrics>,
}

impl ProxyPool {
    /// Create one proxy per upstream. Needs a Tokio runtime.
    pub fn new(upstreams: &[SocketAddr], config: ProxyPoolConfig, metrics: Arc<RouterMetrics>) -> Self {
        let proxies = upstreams
            .iter()
            .map(|addr| Arc::new(Proxy::new(*addr, config.transport.clone(), config.read_timeout)))
            .collect();

        Self {
            proxies,
            selector: Selector::new(config.policy),
            max_fails: config.max_fails,
            health_check_interval: config.health_check_interval,
            metrics,
        }
    }

    pub fn len(&self) -> usize {
        self.proxies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.proxies.is_empty()
    }

    pub fn max_fails(&self) -> u32 {
        self.max_fails
    }

    pub fn policy(&self) -> SelectionPolicy {
        self.selector.policy()
    }

    pub fn proxies(&self) -> &[Arc<Proxy>] {
        &self.proxies
    }

    /// Upstreams in the order the active policy wants them tried.
    pub fn list(&self) -> Vec<Arc<Proxy>> {
        self.selector.order(&self.proxies)
    }

    pub fn is_down(&self, proxy: &Proxy) -> bool {
        proxy.down(self.max_fails)
    }

    /// Pick any upstream when every one of them is down.
    ///
    /// Counted, since it means health checking is not helping.
    pub fn fallback(&self) -> Option<Arc<Proxy>> {
        let proxy = Selector::pick_random(&self.proxies)?;
        self.metrics.record_broken_healthcheck();
        tracing::warn!(
            "all {} upstreams are down, trying {} anyway",
            self.proxies.len(),
            proxy.addr()
        );
        Some(proxy)
    }

    /// Start a background health check after a failed exchange. Disabled
    /// with `max_fails` 0.
    pub fn report_failure(&self, proxy: &Arc<Proxy>) {
        if self.max_fails == 0 {
            return;
        }
        if proxy.healthcheck(&self.metrics) {
            tracing::debug!("checking upstream {}", proxy.addr());
        }
    }

    /// Check every down upstream once.
    pub async fn check_down(&self) {
        for proxy in self.proxies.iter().filter(|p| self.is_down(p)) {
            if !proxy.check().await.is_success() {
                self.metrics.record_healthcheck_failure();
            }
        }
    }

    /// Check down upstreams every `health_check_interval` until shutdown.
    #[cfg_attr(coverage_nightly, coverage(off))]
    pub fn start_health_checks(self: &Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        if self.max_fails == 0 || self.proxies.is_empty() {
            return;
        }
        if self.health_check_interval.is_zero() {
            tracing::warn!("health check interval is zero, periodic checks disabled");
            return;
        }
        let pool = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(pool.health_check_interval);
            loop {
                tokio::select! {
                    _ = interval.tick() => pool.check_down().await,
                    _ = shutdown.recv() => break,
                }
            }
            tracing::debug!("health checks stopped");
        });
    }

    /// Stop every transport, closing pooled connections.
    pub async fn stop(&self) {
        for proxy in &self.proxies {
            proxy.stop().await;
        }
    }
}

impl std::fmt::Debug for ProxyPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyPool")
            .field("proxies", &self.proxies)
            .field("policy", &self.selector.policy())
            .field("max_fails", &self.max_fails)
            .finish()
    }
}
