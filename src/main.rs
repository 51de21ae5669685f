//! edge-dns - Geo-aware service discovery over DNS
//!
//! Composition root: reads the configuration and wires the table, the
//! upstream pool, the router and the listeners together.

use edge_dns::adapters::inbound::{ApiServer, DnsServer, PushState};
use edge_dns::adapters::outbound::ServicePublisher;
use edge_dns::infrastructure::{shutdown_signal, ShutdownController, TransportConfig, UpstreamTls};
use edge_dns::{
    load_config, LocalServices, ProxyPool, ProxyPoolConfig, Router, RouterConfig, RouterMetrics,
    ServiceTable,
};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::fmt::format::FmtSpan;

/// How long in-flight queries get to finish on shutdown.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = load_config()?;

    let log_level = if cfg.debug {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_span_events(FmtSpan::CLOSE)
        .init();

    cfg.validate()?;
    let site = cfg.site()?;

    tracing::info!(
        "starting edge-dns site={} dns={} push={} upstreams={}",
        site,
        cfg.dns_listen_addr,
        cfg.push_listen_addr,
        cfg.upstreams.len()
    );

    // ===== COMPOSITION ROOT =====

    let metrics = Arc::new(RouterMetrics::new(site.address.to_string()));
    let table = Arc::new(ServiceTable::new());
    let local = Arc::new(LocalServices::new(cfg.local_services.iter().cloned()));

    // Upstreams
    let tls = match (cfg.tls_enabled, cfg.ca_path(), &cfg.tls_server_name) {
        (true, Some(ca), Some(name)) => Some(UpstreamTls::from_ca_file(&ca, name)?),
        _ => None,
    };
    let pool_config = ProxyPoolConfig {
        max_fails: cfg.max_fails,
        health_check_interval: cfg.health_check_interval(),
        read_timeout: cfg.read_timeout(),
        policy: cfg.selection_policy()?,
        transport: TransportConfig {
            expire: cfg.expire(),
            dial_timeout: cfg.dial_timeout(),
            tls,
        },
    };
    let proxies = Arc::new(ProxyPool::new(&cfg.upstream_addrs()?, pool_config, metrics.clone()));

    // Router
    let router_config = RouterConfig {
        site,
        zone: cfg.zone_name()?,
        except: cfg.except_names()?,
        force_tcp: cfg.force_tcp,
        answer_ttl: cfg.answer_ttl,
    };
    let router = Arc::new(Router::new(
        router_config,
        local.clone(),
        table.clone(),
        proxies.clone(),
        metrics.clone(),
    ));

    let shutdown = ShutdownController::new();
    tokio::spawn(shutdown_signal(shutdown.clone()));

    proxies.start_health_checks(shutdown.subscribe());

    let publisher = Arc::new(ServicePublisher::new(
        site,
        local.clone(),
        cfg.push_targets.clone(),
        cfg.push_interval(),
    )?);
    publisher.start(shutdown.subscribe());

    // Listeners
    let api = ApiServer::new(
        cfg.push_addr()?,
        PushState {
            site,
            table,
            local,
            metrics,
        },
    );
    let api_shutdown = shutdown.subscribe();
    let api_task = tokio::spawn(async move {
        if let Err(e) = api.run(api_shutdown).await {
            tracing::error!("push listener error: {:?}", e);
        }
    });

    let dns = DnsServer::new(cfg.dns_addr()?, router, shutdown.clone());
    let result = dns.run().await;

    // The DNS server only returns on shutdown or a bind error.
    shutdown.shutdown();
    shutdown.wait_for_drain(DRAIN_TIMEOUT).await;
    proxies.stop().await;
    let _ = api_task.await;

    tracing::info!("edge-dns stopped");
    result
}
