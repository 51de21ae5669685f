mod api_server;
mod dns_server;

pub use api_server::{push_router, ApiServer, HealthResponse, PushState, UpdateResponse};
pub use dns_server::{request_message, DnsHandler, DnsServer};
