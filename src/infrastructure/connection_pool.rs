//! Connection Transport
//!
//! Maintains persistent connections to one upstream, bucketed by protocol.
//!
//! The pool is owned by a single task (the connection manager). Every
//! dial, yield, length query and stop request reaches it over a channel,
//! so the buckets are never touched concurrently. Opening a fresh
//! connection happens in its own task so a slow upstream never blocks
//! the manager.

use crate::infrastructure::tls::UpstreamTls;
use hickory_proto::op::Message;
use hickory_proto::serialize::binary::{BinDecodable, BinEncodable};
use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::{mpsc, oneshot};
use tokio_rustls::client::TlsStream;

/// Largest DNS message we read over UDP.
const MAX_UDP_MESSAGE: usize = 65_535;

/// Transport configuration.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Pooled connections unused for longer than this are closed
    pub expire: Duration,
    /// Bound on opening a new connection
    pub dial_timeout: Duration,
    /// When set, every dial is TLS over TCP
    pub tls: Option<UpstreamTls>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            expire: Duration::from_secs(10),
            dial_timeout: Duration::from_secs(4),
            tls: None,
        }
    }
}

/// Pool bucket key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Udp,
    Tcp,
    TcpTls,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Udp => "udp",
            Self::Tcp => "tcp",
            Self::TcpTls => "tcp+tls",
        }
    }

    /// Whether messages on this protocol are length-framed streams.
    pub fn is_stream(&self) -> bool {
        !matches!(self, Self::Udp)
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("dial {addr} ({protocol}) failed: {source}")]
    Dial {
        addr: SocketAddr,
        protocol: Protocol,
        source: io::Error,
    },
    #[error("dial {0} timed out")]
    DialTimeout(SocketAddr),
    #[error("connection closed by peer")]
    Closed,
    #[error("i/o error: {0}")]
    Io(io::Error),
    #[error("wire error: {0}")]
    Proto(#[from] hickory_proto::error::ProtoError),
    #[error("transport stopped")]
    Stopped,
}

impl From<io::Error> for TransportError {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe => TransportError::Closed,
            _ => TransportError::Io(e),
        }
    }
}

/// An open connection to the upstream.
pub enum UpstreamConnection {
    Udp(UdpSocket),
    Tcp(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl UpstreamConnection {
    /// Bucket this connection belongs to, from its own kind.
    pub fn protocol(&self) -> Protocol {
        match self {
            Self::Udp(_) => Protocol::Udp,
            Self::Tcp(_) => Protocol::Tcp,
            Self::Tls(_) => Protocol::TcpTls,
        }
    }

    /// Write one DNS message.
    pub async fn send(&mut self, message: &Message) -> Result<(), TransportError> {
        let bytes = message.to_bytes()?;
        match self {
            Self::Udp(socket) => {
                socket.send(&bytes).await?;
            }
            Self::Tcp(stream) => write_framed(stream, &bytes).await?,
            Self::Tls(stream) => write_framed(&mut **stream, &bytes).await?,
        }
        Ok(())
    }

    /// Read one DNS message.
    pub async fn recv(&mut self) -> Result<Message, TransportError> {
        let bytes = match self {
            Self::Udp(socket) => {
                let mut buf = vec![0u8; MAX_UDP_MESSAGE];
                let len = socket.recv(&mut buf).await?;
                buf.truncate(len);
                buf
            }
            Self::Tcp(stream) => read_framed(stream).await?,
            Self::Tls(stream) => read_framed(&mut **stream).await?,
        };
        Ok(Message::from_bytes(&bytes)?)
    }
}

impl std::fmt::Debug for UpstreamConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "UpstreamConnection({})", self.protocol())
    }
}

async fn write_framed<S>(stream: &mut S, bytes: &[u8]) -> io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    let len = u16::try_from(bytes.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "message too large"))?;
    let mut framed = Vec::with_capacity(2 + bytes.len());
    framed.extend_from_slice(&len.to_be_bytes());
    framed.extend_from_slice(bytes);
    stream.write_all(&framed).await?;
    stream.flush().await
}

async fn read_framed<S>(stream: &mut S) -> io::Result<Vec<u8>>
where
    S: AsyncRead + Unpin,
{
    let mut len = [0u8; 2];
    stream.read_exact(&mut len).await?;
    let mut buf = vec![0u8; usize::from(u16::from_be_bytes(len))];
    stream.read_exact(&mut buf).await?;
    Ok(buf)
}

async fn open(
    addr: SocketAddr,
    protocol: Protocol,
    tls: Option<UpstreamTls>,
) -> io::Result<UpstreamConnection> {
    match protocol {
        Protocol::Udp => {
            let bind: SocketAddr = if addr.is_ipv4() {
                ([0, 0, 0, 0], 0).into()
            } else {
                ([0u16; 8], 0).into()
            };
            let socket = UdpSocket::bind(bind).await?;
            socket.connect(addr).await?;
            Ok(UpstreamConnection::Udp(socket))
        }
        Protocol::Tcp => Ok(UpstreamConnection::Tcp(TcpStream::connect(addr).await?)),
        Protocol::TcpTls => {
            let tls = tls.ok_or_else(|| {
                io::Error::new(io::ErrorKind::InvalidInput, "TLS is not configured")
            })?;
            let stream = TcpStream::connect(addr).await?;
            let stream = tls.connect(stream).await?;
            Ok(UpstreamConnection::Tls(Box::new(stream)))
        }
    }
}

/// Open a fresh connection, bounded by `dial_timeout`.
async fn connect(
    addr: SocketAddr,
    protocol: Protocol,
    dial_timeout: Duration,
    tls: Option<UpstreamTls>,
) -> Result<UpstreamConnection, TransportError> {
    match tokio::time::timeout(dial_timeout, open(addr, protocol, tls)).await {
        Ok(Ok(conn)) => Ok(conn),
        Ok(Err(source)) => Err(TransportError::Dial {
            addr,
            protocol,
            source,
        }),
        Err(_) => Err(TransportError::DialTimeout(addr)),
    }
}

/// A pooled connection and when it was last handed back.
struct PersistConn {
    conn: UpstreamConnection,
    used: Instant,
}

type DialReply = oneshot::Sender<Result<UpstreamConnection, TransportError>>;

struct DialRequest {
    protocol: Protocol,
    reply: DialReply,
}

/// The single owner of the pool.
struct ConnManager {
    addr: SocketAddr,
    config: TransportConfig,
    conns: HashMap<Protocol, VecDeque<PersistConn>>,
}

impl ConnManager {
    fn len(&self) -> usize {
        self.conns.values().map(VecDeque::len).sum()
    }

    fn dial(&mut self, req: DialRequest) {
        let expire = self.config.expire;
        if let Some(bucket) = self.conns.get_mut(&req.protocol) {
            // O(n) walk; expired connections are dropped (closed) on the way.
            while let Some(pc) = bucket.pop_front() {
                if pc.used.elapsed() < expire {
                    let _ = req.reply.send(Ok(pc.conn));
                    return;
                }
                tracing::debug!("closing expired {} connection to {}", req.protocol, self.addr);
            }
        }

        let addr = self.addr;
        let dial_timeout = self.config.dial_timeout;
        let tls = self.config.tls.clone();
        tokio::spawn(async move {
            let result = connect(addr, req.protocol, dial_timeout, tls).await;
            if let Err(e) = &result {
                tracing::debug!("{}", e);
            }
            let _ = req.reply.send(result);
        });
    }

    fn give_back(&mut self, conn: UpstreamConnection) {
        self.conns
            .entry(conn.protocol())
            .or_default()
            .push_back(PersistConn {
                conn,
                used: Instant::now(),
            });
    }

    async fn run(
        mut self,
        mut dial_rx: mpsc::Receiver<DialRequest>,
        mut yield_rx: mpsc::Receiver<UpstreamConnection>,
        mut len_rx: mpsc::Receiver<oneshot::Sender<usize>>,
        mut stop_rx: mpsc::Receiver<()>,
    ) {
        loop {
            // Yields are drained before dials and length queries so a
            // caller sees its own returned connection.
            tokio::select! {
                biased;
                _ = stop_rx.recv() => break,
                Some(conn) = yield_rx.recv() => self.give_back(conn),
                Some(req) = dial_rx.recv() => self.dial(req),
                Some(reply) = len_rx.recv() => {
                    let _ = reply.send(self.len());
                }
                else => break,
            }
        }

        let closed = self.len();
        self.conns.clear();
        tracing::debug!("transport to {} stopped, closed {} connections", self.addr, closed);
    }
}

/// Handle to the connection manager of one upstream.
pub struct Transport {
    addr: SocketAddr,
    tls: bool,
    dial_tx: mpsc::Sender<DialRequest>,
    yield_tx: mpsc::Sender<UpstreamConnection>,
    len_tx: mpsc::Sender<oneshot::Sender<usize>>,
    stop_tx: mpsc::Sender<()>,
}

impl Transport {
    /// Start the connection manager. Must be called inside a Tokio runtime.
    pub fn new(addr: SocketAddr, config: TransportConfig) -> Self {
        let (dial_tx, dial_rx) = mpsc::channel(16);
        let (yield_tx, yield_rx) = mpsc::channel(16);
        let (len_tx, len_rx) = mpsc::channel(1);
        let (stop_tx, stop_rx) = mpsc::channel(1);

        let tls = config.tls.is_some();
        let manager = ConnManager {
            addr,
            config,
            conns: HashMap::new(),
        };
        tokio::spawn(manager.run(dial_rx, yield_rx, len_rx, stop_rx));

        Self {
            addr,
            tls,
            dial_tx,
            yield_tx,
            len_tx,
            stop_tx,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Get a connection for `protocol`, reusing a pooled one if possible.
    ///
    /// With TLS configured every dial is `tcp+tls`.
    pub async fn dial(&self, protocol: Protocol) -> Result<UpstreamConnection, TransportError> {
        let protocol = if self.tls { Protocol::TcpTls } else { protocol };

        let (reply, rx) = oneshot::channel();
        self.dial_tx
            .send(DialRequest { protocol, reply })
            .await
            .map_err(|_| TransportError::Stopped)?;
        rx.await.map_err(|_| TransportError::Stopped)?
    }

    /// Hand a healthy connection back for reuse.
    pub async fn yield_connection(&self, conn: UpstreamConnection) {
        // A stopped manager just means the connection gets closed here.
        let _ = self.yield_tx.send(conn).await;
    }

    /// Number of pooled connections, as seen by the manager.
    pub async fn len(&self) -> usize {
        let (reply, rx) = oneshot::channel();
        if self.len_tx.send(reply).await.is_err() {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Close every pooled connection and end the manager.
    pub async fn stop(&self) {
        let _ = self.stop_tx.send(()).await;
    }
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("addr", &self.addr)
            .field("tls", &self.tls)
            .finish()
    }
}
