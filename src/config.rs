//! Configuration
//!
//! Loaded from `EDGEDNS_*` environment variables. Numbers that do not
//! parse fall back to their default; everything else is checked by
//! [`Config::validate`] before the server starts.

use crate::domain::services::SelectionPolicy;
use crate::domain::{EdgeSite, Point};
use hickory_proto::rr::Name;
use serde::Deserialize;
use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid site address {0:?}")]
    SiteAddress(String),
    #[error("site coordinates out of range: {0}")]
    SiteLocation(Point),
    #[error("invalid listen address {0:?}")]
    ListenAddress(String),
    #[error("cannot resolve upstream {0:?}")]
    Upstream(String),
    #[error("{0}")]
    Policy(String),
    #[error("invalid zone {0:?}")]
    Zone(String),
    #[error("TLS is enabled but {0} is not set")]
    Tls(&'static str),
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
}

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    // Listeners
    pub dns_listen_addr: String,
    pub push_listen_addr: String,

    // This site
    pub site_ip: String,
    pub site_lat: f64,
    pub site_lon: f64,
    pub local_services: Vec<String>,

    // Upstreams
    pub upstreams: Vec<String>,
    pub push_targets: Vec<String>,
    pub push_interval_secs: u64,
    pub policy: String,
    pub max_fails: u32,
    pub health_check_interval_ms: u64,
    pub expire_secs: u64,
    pub dial_timeout_ms: u64,
    pub read_timeout_ms: u64,
    pub force_tcp: bool,

    // Upstream TLS
    pub tls_enabled: bool,
    pub tls_ca_path: Option<String>,
    pub tls_server_name: Option<String>,

    // Routing
    pub zone: String,
    pub except: Vec<String>,
    pub answer_ttl: u32,

    pub debug: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            dns_listen_addr: "0.0.0.0:5353".to_string(),
            push_listen_addr: "0.0.0.0:8053".to_string(),
            site_ip: "127.0.0.1".to_string(),
            site_lat: 0.0,
            site_lon: 0.0,
            local_services: Vec::new(),
            upstreams: Vec::new(),
            push_targets: Vec::new(),
            push_interval_secs: 10,
            policy: "random".to_string(),
            max_fails: 2,
            health_check_interval_ms: 500,
            expire_secs: 10,
            dial_timeout_ms: 4000,
            read_timeout_ms: 2000,
            force_tcp: false,
            tls_enabled: false,
            tls_ca_path: None,
            tls_server_name: None,
            zone: ".".to_string(),
            except: Vec::new(),
            answer_ttl: 30,
            debug: false,
        }
    }
}

impl Config {
    /// Check every setting the server needs to start.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.site()?;
        self.dns_addr()?;
        self.push_addr()?;
        self.selection_policy()?;
        self.zone_name()?;
        self.except_names()?;
        let periods = [
            ("EDGEDNS_PUSH_INTERVAL_SECS", self.push_interval_secs),
            ("EDGEDNS_HEALTH_CHECK_INTERVAL_MS", self.health_check_interval_ms),
            ("EDGEDNS_DIAL_TIMEOUT_MS", self.dial_timeout_ms),
            ("EDGEDNS_READ_TIMEOUT_MS", self.read_timeout_ms),
        ];
        if let Some((name, _)) = periods.iter().find(|(_, value)| *value == 0) {
            return Err(ConfigError::Zero(*name));
        }
        if self.tls_enabled {
            if self.tls_ca_path.is_none() {
                return Err(ConfigError::Tls("EDGEDNS_TLS_CA"));
            }
            if self.tls_server_name.is_none() {
                return Err(ConfigError::Tls("EDGEDNS_TLS_SERVER_NAME"));
            }
        }
        Ok(())
    }

    /// This site as other sites see it.
    pub fn site(&self) -> Result<EdgeSite, ConfigError> {
        let address = IpAddr::from_str(&self.site_ip)
            .map_err(|_| ConfigError::SiteAddress(self.site_ip.clone()))?;
        let location = Point::new(self.site_lat, self.site_lon);
        if !location.is_valid() {
            return Err(ConfigError::SiteLocation(location));
        }
        Ok(EdgeSite::new(address, location))
    }

    pub fn dns_addr(&self) -> Result<SocketAddr, ConfigError> {
        parse_listen(&self.dns_listen_addr)
    }

    pub fn push_addr(&self) -> Result<SocketAddr, ConfigError> {
        parse_listen(&self.push_listen_addr)
    }

    /// Upstreams as socket addresses; a bare host or IP gets port 53.
    pub fn upstream_addrs(&self) -> Result<Vec<SocketAddr>, ConfigError> {
        self.upstreams
            .iter()
            .map(|upstream| {
                if let Ok(addr) = upstream.parse::<SocketAddr>() {
                    return Ok(addr);
                }
                let bare = upstream.trim_start_matches('[').trim_end_matches(']');
                if let Ok(ip) = bare.parse::<IpAddr>() {
                    return Ok(SocketAddr::new(ip, 53));
                }
                let target = if upstream.contains(':') {
                    upstream.clone()
                } else {
                    format!("{}:53", upstream)
                };
                target
                    .to_socket_addrs()
                    .ok()
                    .and_then(|mut addrs| addrs.next())
                    .ok_or_else(|| ConfigError::Upstream(upstream.clone()))
            })
            .collect()
    }

    pub fn selection_policy(&self) -> Result<SelectionPolicy, ConfigError> {
        SelectionPolicy::from_str(&self.policy).map_err(ConfigError::Policy)
    }

    pub fn zone_name(&self) -> Result<Name, ConfigError> {
        parse_zone(&self.zone)
    }

    pub fn except_names(&self) -> Result<Vec<Name>, ConfigError> {
        self.except.iter().map(|zone| parse_zone(zone)).collect()
    }

    pub fn ca_path(&self) -> Option<PathBuf> {
        self.tls_ca_path.as_ref().map(PathBuf::from)
    }

    pub fn push_interval(&self) -> Duration {
        Duration::from_secs(self.push_interval_secs)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }

    pub fn expire(&self) -> Duration {
        Duration::from_secs(self.expire_secs)
    }

    pub fn dial_timeout(&self) -> Duration {
        Duration::from_millis(self.dial_timeout_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
}

fn parse_listen(addr: &str) -> Result<SocketAddr, ConfigError> {
    addr.parse()
        .map_err(|_| ConfigError::ListenAddress(addr.to_string()))
}

fn parse_zone(zone: &str) -> Result<Name, ConfigError> {
    let fqdn = if zone.ends_with('.') {
        zone.to_string()
    } else {
        format!("{}.", zone)
    };
    Name::from_ascii(&fqdn).map_err(|_| ConfigError::Zone(zone.to_string()))
}

/// Load the configuration from the process environment.
pub fn load_config() -> anyhow::Result<Config> {
    Ok(load_config_from(|key| std::env::var(key).ok()))
}

/// Load the configuration from any variable source.
pub fn load_config_from<F>(var: F) -> Config
where
    F: Fn(&str) -> Option<String>,
{
    let defaults = Config::default();

    let string = |key: &str, default: String| var(key).unwrap_or(default);
    let flag = |key: &str| {
        var(key)
            .map(|v| v == "1" || v.to_lowercase() == "true")
            .unwrap_or(false)
    };
    let list = |key: &str| -> Vec<String> {
        var(key)
            .map(|v| {
                v.split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect()
            })
            .unwrap_or_default()
    };

    Config {
        dns_listen_addr: string("EDGEDNS_DNS_LISTEN_ADDR", defaults.dns_listen_addr),
        push_listen_addr: string("EDGEDNS_PUSH_LISTEN_ADDR", defaults.push_listen_addr),
        site_ip: string("EDGEDNS_SITE_IP", defaults.site_ip),
        site_lat: parse_or(var("EDGEDNS_SITE_LAT"), defaults.site_lat),
        site_lon: parse_or(var("EDGEDNS_SITE_LON"), defaults.site_lon),
        local_services: list("EDGEDNS_LOCAL_SERVICES"),
        upstreams: list("EDGEDNS_UPSTREAMS"),
        push_targets: list("EDGEDNS_PUSH_TARGETS"),
        push_interval_secs: parse_or(var("EDGEDNS_PUSH_INTERVAL_SECS"), defaults.push_interval_secs),
        policy: string("EDGEDNS_POLICY", defaults.policy),
        max_fails: parse_or(var("EDGEDNS_MAX_FAILS"), defaults.max_fails),
        health_check_interval_ms: parse_or(
            var("EDGEDNS_HEALTH_CHECK_INTERVAL_MS"),
            defaults.health_check_interval_ms,
        ),
        expire_secs: parse_or(var("EDGEDNS_EXPIRE_SECS"), defaults.expire_secs),
        dial_timeout_ms: parse_or(var("EDGEDNS_DIAL_TIMEOUT_MS"), defaults.dial_timeout_ms),
        read_timeout_ms: parse_or(var("EDGEDNS_READ_TIMEOUT_MS"), defaults.read_timeout_ms),
        force_tcp: flag("EDGEDNS_FORCE_TCP"),
        tls_enabled: flag("EDGEDNS_TLS_ENABLED"),
        tls_ca_path: var("EDGEDNS_TLS_CA"),
        tls_server_name: var("EDGEDNS_TLS_SERVER_NAME"),
        zone: string("EDGEDNS_ZONE", defaults.zone),
        except: list("EDGEDNS_EXCEPT"),
        answer_ttl: parse_or(var("EDGEDNS_ANSWER_TTL"), defaults.answer_ttl),
        debug: var("DEBUG").is_some(),
    }
}

fn parse_or<T: FromStr>(value: Option<String>, default: T) -> T {
    value.and_then(|v| v.trim().parse().ok()).unwrap_or(default)
}
