//! edge-dns Library
//!
//! Geo-aware service discovery over DNS. Exposes the components for the
//! binary and for integration tests.

#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

pub mod adapters;
pub mod application;
pub mod codec;
pub mod config;
pub mod domain;
pub mod infrastructure;

// Re-export commonly used types
pub use application::{Router, RouterConfig};
pub use config::{load_config, Config, ConfigError};
pub use domain::services::{LocalServices, SelectionPolicy, ServiceTable};
pub use domain::{EdgeSite, EdgeSiteSet, Point, ServiceTableUpdate};
pub use infrastructure::{ProxyPool, ProxyPoolConfig, RouterMetrics};
