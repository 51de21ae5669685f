//! Domain Layer
//!
//! Sites, their locations, and the table of who serves what.
//! Nothing here touches the network.

pub mod entities;
pub mod services;
pub mod value_objects;

pub use entities::{closest_site, EdgeSite, EdgeSiteSet, ServiceTableUpdate};
pub use value_objects::Point;
