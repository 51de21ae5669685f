//! Shared helpers: fake upstream sites on loopback sockets and message
//! builders.

#![allow(dead_code)]

use edge_dns::codec::attach_table;
use edge_dns::domain::services::{LocalServices, SelectionPolicy, ServiceTable};
use edge_dns::infrastructure::{ProxyPool, ProxyPoolConfig, RouterMetrics};
use edge_dns::{EdgeSite, Point, Router, RouterConfig};
use hickory_proto::op::{Message, MessageType, Query};
use hickory_proto::rr::{Name, RData, RecordType};
use hickory_proto::serialize::binary::{BinDecodable, BinEncodable};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, UdpSocket};

pub type Responder = Arc<dyn Fn(&Message) -> Option<Message> + Send + Sync>;

/// A fake upstream site that records every query it receives.
pub struct FakeUpstream {
    pub addr: SocketAddr,
    seen: Arc<Mutex<Vec<Message>>>,
}

impl FakeUpstream {
    pub fn queries(&self) -> Vec<Message> {
        self.seen.lock().unwrap().clone()
    }

    pub fn count(&self) -> usize {
        self.seen.lock().unwrap().len()
    }
}

/// UDP upstream answering with `respond`; `None` means stay silent.
pub async fn udp_upstream<F>(respond: F) -> FakeUpstream
where
    F: Fn(&Message) -> Option<Message> + Send + Sync + 'static,
{
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    let seen = Arc::new(Mutex::new(Vec::new()));
    serve_udp(socket, Arc::new(respond), seen.clone());
    FakeUpstream { addr, seen }
}

/// UDP and TCP upstream on the same port, with separate responders.
pub async fn dual_upstream<U, T>(udp: U, tcp: T) -> FakeUpstream
where
    U: Fn(&Message) -> Option<Message> + Send + Sync + 'static,
    T: Fn(&Message) -> Option<Message> + Send + Sync + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let socket = UdpSocket::bind(addr).await.unwrap();
    let seen = Arc::new(Mutex::new(Vec::new()));
    serve_udp(socket, Arc::new(udp), seen.clone());
    serve_tcp(listener, Arc::new(tcp), seen.clone(), false);
    FakeUpstream { addr, seen }
}

/// TCP upstream. With `one_shot` every connection is closed after its
/// first answer.
pub async fn tcp_upstream<F>(respond: F, one_shot: bool) -> FakeUpstream
where
    F: Fn(&Message) -> Option<Message> + Send + Sync + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let seen = Arc::new(Mutex::new(Vec::new()));
    serve_tcp(listener, Arc::new(respond), seen.clone(), one_shot);
    FakeUpstream { addr, seen }
}

fn serve_udp(socket: UdpSocket, respond: Responder, seen: Arc<Mutex<Vec<Message>>>) {
    tokio::spawn(async move {
        let mut buf = vec![0u8; 65_535];
        while let Ok((len, src)) = socket.recv_from(&mut buf).await {
            let Ok(query) = Message::from_bytes(&buf[..len]) else {
                continue;
            };
            seen.lock().unwrap().push(query.clone());
            if let Some(reply) = respond(&query) {
                let _ = socket.send_to(&reply.to_bytes().unwrap(), src).await;
            }
        }
    });
}

fn serve_tcp(
    listener: TcpListener,
    respond: Responder,
    seen: Arc<Mutex<Vec<Message>>>,
    one_shot: bool,
) {
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            let respond = respond.clone();
            let seen = seen.clone();
            tokio::spawn(async move {
                loop {
                    let Ok(len) = stream.read_u16().await else {
                        return;
                    };
                    let mut data = vec![0u8; usize::from(len)];
                    if stream.read_exact(&mut data).await.is_err() {
                        return;
                    }
                    let query = Message::from_bytes(&data).unwrap();
                    seen.lock().unwrap().push(query.clone());
                    if let Some(reply) = respond(&query) {
                        let bytes = reply.to_bytes().unwrap();
                        let _ = stream.write_u16(bytes.len() as u16).await;
                        let _ = stream.write_all(&bytes).await;
                    }
                    if one_shot {
                        return;
                    }
                }
            });
        }
    });
}

pub fn site(last_octet: u8, lat: f64, lon: f64) -> EdgeSite {
    EdgeSite::new(
        IpAddr::V4(Ipv4Addr::new(192, 0, 2, last_octet)),
        Point::new(lat, lon),
    )
}

pub fn query(name: &str, qtype: RecordType) -> Message {
    let mut msg = Message::new();
    msg.set_id(rand::random())
        .set_message_type(MessageType::Query)
        .set_recursion_desired(true)
        .add_query(Query::query(Name::from_str(name).unwrap(), qtype));
    msg
}

/// Empty response to `query`.
pub fn response(query: &Message) -> Message {
    let mut reply = Message::new();
    reply
        .set_id(query.id())
        .set_message_type(MessageType::Response)
        .add_queries(query.queries().to_vec());
    reply
}

/// Response carrying `sites` as the piggybacked candidate list.
pub fn response_with_sites(query: &Message, sites: &[EdgeSite]) -> Message {
    let mut reply = response(query);
    let owner = query.queries()[0].name().clone();
    attach_table(&mut reply, owner, &sites.to_vec()).unwrap();
    reply
}

pub fn answer_ip(reply: &Message) -> Option<IpAddr> {
    match reply.answers().first()?.data()? {
        RData::A(a) => Some(IpAddr::V4(a.0)),
        RData::AAAA(aaaa) => Some(IpAddr::V6(aaaa.0)),
        _ => None,
    }
}

/// A router wired with everything it needs.
pub struct Harness {
    pub router: Router,
    pub table: Arc<ServiceTable>,
    pub proxies: Arc<ProxyPool>,
    pub metrics: Arc<RouterMetrics>,
}

pub struct HarnessConfig {
    pub site: EdgeSite,
    pub local: Vec<&'static str>,
    pub upstreams: Vec<SocketAddr>,
    pub policy: SelectionPolicy,
    pub max_fails: u32,
    pub force_tcp: bool,
}

impl HarnessConfig {
    pub fn new(site: EdgeSite) -> Self {
        Self {
            site,
            local: Vec::new(),
            upstreams: Vec::new(),
            policy: SelectionPolicy::RoundRobin,
            max_fails: 2,
            force_tcp: false,
        }
    }
}

pub fn harness(config: HarnessConfig) -> Harness {
    let metrics = Arc::new(RouterMetrics::new(config.site.address.to_string()));
    let table = Arc::new(ServiceTable::new());
    let pool_config = ProxyPoolConfig {
        max_fails: config.max_fails,
        read_timeout: Duration::from_millis(300),
        policy: config.policy,
        ..Default::default()
    };
    let proxies = Arc::new(ProxyPool::new(&config.upstreams, pool_config, metrics.clone()));

    let mut router_config = RouterConfig::new(config.site);
    router_config.force_tcp = config.force_tcp;

    let router = Router::new(
        router_config,
        Arc::new(LocalServices::new(config.local)),
        table.clone(),
        proxies.clone(),
        metrics.clone(),
    );

    Harness {
        router,
        table,
        proxies,
        metrics,
    }
}
