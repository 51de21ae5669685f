//! Application Layer
//!
//! The query router: the use case the DNS listeners drive.

pub mod router;

pub use router::{Router, RouterConfig, RouteError, RouteState};
