//! Adapters
//!
//! Inbound: the DNS listeners and the HTTP push listener.
//! Outbound: the publisher that pushes this site's services upstream.

pub mod inbound;
pub mod outbound;
