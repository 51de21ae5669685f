//! Upstream Proxy
//!
//! One configured upstream site: its connection transport, a
//! consecutive-failure counter and the health check that maintains it.

use crate::infrastructure::connection_pool::{Protocol, Transport, TransportConfig, TransportError};
use crate::infrastructure::metrics::RouterMetrics;
use hickory_proto::op::{Message, MessageType, OpCode, Query};
use hickory_proto::rr::{Name, RecordType};
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Errors from a single exchange with an upstream.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("no reply from {0} in time")]
    Timeout(SocketAddr),
}

impl ProxyError {
    /// The peer closed a stream connection under us.
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Transport(TransportError::Closed))
    }
}

/// Outcome of one health check.
#[derive(Debug, Clone)]
pub enum HealthCheckResult {
    Success { latency_ms: u64 },
    Failure { error: String, latency_ms: u64 },
}

impl HealthCheckResult {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }
}

/// A forwarding target.
pub struct Proxy {
    addr: SocketAddr,
    transport: Transport,
    read_timeout: Duration,
    /// Consecutive failures since the last success
    fails: AtomicU32,
    last_healthcheck: Mutex<Option<Instant>>,
    /// Set while a background check is in flight
    checking: AtomicBool,
}

impl Proxy {
    /// Create the proxy and start its transport. Needs a Tokio runtime.
    pub fn new(addr: SocketAddr, transport: TransportConfig, read_timeout: Duration) -> Self {
        Self {
            addr,
            transport: Transport::new(addr, transport),
            read_timeout,
            fails: AtomicU32::new(0),
            last_healthcheck: Mutex::new(None),
            checking: AtomicBool::new(false),
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    pub fn fails(&self) -> u32 {
        self.fails.load(Ordering::Relaxed)
    }

    /// Whether this proxy has failed at least `max_fails` times in a row.
    /// A threshold of 0 disables the check.
    pub fn down(&self, max_fails: u32) -> bool {
        if max_fails == 0 {
            return false;
        }
        self.fails() >= max_fails
    }

    pub fn record_failure(&self) {
        let fails = self.fails.fetch_add(1, Ordering::Relaxed) + 1;
        tracing::debug!("upstream {} failed {} time(s) in a row", self.addr, fails);
    }

    pub fn record_success(&self) {
        if self.fails.swap(0, Ordering::Relaxed) > 0 {
            tracing::info!("upstream {} is healthy again", self.addr);
        }
    }

    pub fn last_healthcheck(&self) -> Option<Instant> {
        *self.last_healthcheck.lock()
    }

    /// Send `query` and wait for the matching reply.
    ///
    /// A truncated UDP reply is retried once over TCP.
    pub async fn exchange(&self, query: &Message, protocol: Protocol) -> Result<Message, ProxyError> {
        let (reply, used) = self.exchange_once(query, protocol).await?;
        if reply.truncated() && used == Protocol::Udp {
            tracing::debug!("truncated reply from {}, retrying over tcp", self.addr);
            let (reply, _) = self.exchange_once(query, Protocol::Tcp).await?;
            return Ok(reply);
        }
        Ok(reply)
    }

    async fn exchange_once(
        &self,
        query: &Message,
        protocol: Protocol,
    ) -> Result<(Message, Protocol), ProxyError> {
        let mut conn = self.transport.dial(protocol).await?;
        let used = conn.protocol();

        let result = tokio::time::timeout(self.read_timeout, async {
            conn.send(query).await?;
            loop {
                let reply = conn.recv().await?;
                if reply.id() == query.id() {
                    return Ok::<Message, TransportError>(reply);
                }
                // Late answer to an earlier query on a reused connection.
                tracing::debug!(
                    "dropping reply {} from {}, waiting for {}",
                    reply.id(),
                    self.addr,
                    query.id()
                );
            }
        })
        .await;

        match result {
            Ok(Ok(reply)) => {
                self.transport.yield_connection(conn).await;
                Ok((reply, used))
            }
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(ProxyError::Timeout(self.addr)),
        }
    }

    /// Check the upstream with a `. IN NS` query and update the failure
    /// counter. Any reply counts as alive, whatever its response code.
    pub async fn check(&self) -> HealthCheckResult {
        let started = Instant::now();
        let result = self.exchange(&liveness_query(), Protocol::Udp).await;
        let latency_ms = started.elapsed().as_millis() as u64;
        *self.last_healthcheck.lock() = Some(Instant::now());

        match result {
            Ok(_) => {
                self.record_success();
                HealthCheckResult::Success { latency_ms }
            }
            Err(e) => {
                self.record_failure();
                tracing::warn!("health check of {} failed: {}", self.addr, e);
                HealthCheckResult::Failure {
                    error: e.to_string(),
                    latency_ms,
                }
            }
        }
    }

    /// Check in the background, counting a failed check in `metrics`.
    /// Returns `false` if a check is already running for this proxy.
    pub fn healthcheck(self: &Arc<Self>, metrics: &Arc<RouterMetrics>) -> bool {
        if self.checking.swap(true, Ordering::AcqRel) {
            return false;
        }
        let proxy = Arc::clone(self);
        let metrics = Arc::clone(metrics);
        tokio::spawn(async move {
            if !proxy.check().await.is_success() {
                metrics.record_healthcheck_failure();
            }
            proxy.checking.store(false, Ordering::Release);
        });
        true
    }

    /// Close pooled connections and stop the transport.
    pub async fn stop(&self) {
        self.transport.stop().await;
    }
}

impl std::fmt::Debug for Proxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Proxy")
            .field("addr", &self.addr)
            .field("fails", &self.fails())
            .finish()
    }
}

fn liveness_query() -> Message {
    let mut msg = Message::new();
    msg.set_id(rand::random())
        .set_message_type(MessageType::Query)
        .set_op_code(OpCode::Query)
        .set_recursion_desired(false)
        .add_query(Query::query(Name::root(), RecordType::NS));
    msg
}
