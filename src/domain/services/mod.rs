//! Domain Services
//!
//! Pure routing logic and the concurrent state it works on.

pub mod geo;
pub mod local_services;
pub mod selection;
pub mod service_table;

pub use geo::distance_km;
pub use local_services::LocalServices;
pub use selection::{SelectionPolicy, Selector};
pub use service_table::{normalize_service, ServiceTable, TableSnapshot};
