//! DNS Server Adapter
//!
//! UDP and TCP listeners in front of the router, served by hickory-server.
//! The handler rebuilds the client's query as a plain `Message`, piggybacked
//! records included, routes it and sends the router's reply back.

use crate::application::Router;
use crate::infrastructure::shutdown::ShutdownController;
use hickory_proto::op::{Edns, Message};
use hickory_server::authority::{MessageRequest, MessageResponseBuilder};
use hickory_server::server::{Request, RequestHandler, ResponseHandler, ResponseInfo, ServerFuture};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, UdpSocket};

/// Idle TCP connections are closed after this.
const TCP_IDLE_TIMEOUT: Duration = Duration::from_secs(10);
/// Smallest and largest UDP payload we agree to with EDNS clients.
const MIN_UDP_PAYLOAD: u16 = 512;
const MAX_UDP_PAYLOAD: u16 = 4096;

/// Request handler wrapping the router.
pub struct DnsHandler {
    router: Arc<Router>,
    shutdown: ShutdownController,
}

impl DnsHandler {
    pub fn new(router: Arc<Router>, shutdown: ShutdownController) -> Self {
        Self { router, shutdown }
    }
}

#[async_trait::async_trait]
impl RequestHandler for DnsHandler {
    async fn handle_request<R: ResponseHandler>(
        &self,
        request: &Request,
        mut response_handle: R,
    ) -> ResponseInfo {
        let _guard = self.shutdown.query_guard();

        let query = request.query();
        tracing::debug!(
            "query {} {} {} from {}",
            request.id(),
            query.name(),
            query.query_type(),
            request.src()
        );

        let reply = self.router.handle(request_message(request)).await;

        let header = *reply.header();
        let mut builder = MessageResponseBuilder::from_message_request(request);
        if let Some(edns) = response_edns(request) {
            builder.edns(edns);
        }
        let response = builder.build(
            header,
            reply.answers().iter(),
            reply.name_servers().iter(),
            std::iter::empty(),
            reply.additionals().iter(),
        );

        response_handle.send_response(response).await.unwrap_or_else(|e| {
            tracing::error!("DNS response error: {:?}", e);
            header.into()
        })
    }
}

/// The client's query as a `Message`: header, question, additional records
/// and EDNS.
pub fn request_message(request: &MessageRequest) -> Message {
    let mut message = Message::new();
    message
        .set_header(*request.header())
        .add_query(request.query().original().clone())
        .add_additionals(request.additionals().iter().cloned());
    if let Some(edns) = request.edns() {
        message.set_edns(edns.clone());
    }
    message
}

/// EDNS for the reply, echoing the client's payload size within bounds.
/// hickory-server sizes UDP replies by it and truncates past it.
fn response_edns(request: &MessageRequest) -> Option<Edns> {
    let asked = request.edns()?;
    let mut edns = Edns::new();
    edns.set_max_payload(asked.max_payload().clamp(MIN_UDP_PAYLOAD, MAX_UDP_PAYLOAD));
    Some(edns)
}

pub struct DnsServer {
    listen_addr: SocketAddr,
    router: Arc<Router>,
    shutdown: ShutdownController,
}

impl DnsServer {
    pub fn new(listen_addr: SocketAddr, router: Arc<Router>, shutdown: ShutdownController) -> Self {
        Self {
            listen_addr,
            router,
            shutdown,
        }
    }

    /// Bind UDP and TCP on the listen address and serve until shutdown.
    #[cfg_attr(coverage_nightly, coverage(off))]
    pub async fn run(&self) -> anyhow::Result<()> {
        let udp = UdpSocket::bind(self.listen_addr).await?;
        let tcp = TcpListener::bind(self.listen_addr).await?;
        tracing::info!("DNS server listening on {} (udp+tcp)", self.listen_addr);
        self.serve(udp, tcp).await
    }

    /// Serve on already bound sockets until shutdown.
    pub async fn serve(&self, udp: UdpSocket, tcp: TcpListener) -> anyhow::Result<()> {
        let mut shutdown = self.shutdown.subscribe();

        let handler = DnsHandler::new(self.router.clone(), self.shutdown.clone());
        let mut server = ServerFuture::new(handler);
        server.register_socket(udp);
        server.register_listener(tcp, TCP_IDLE_TIMEOUT);

        tokio::select! {
            _ = shutdown.recv() => {
                tracing::info!("DNS server shutdown requested");
            }
            result = server.block_until_done() => {
                if let Err(e) = result {
                    tracing::error!("DNS server error: {}", e);
                    return Err(e.into());
                }
            }
        }

        tracing::info!("DNS server stopped");
        Ok(())
    }
}
