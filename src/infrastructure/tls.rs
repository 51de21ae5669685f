//! Upstream TLS
//!
//! Client side of DNS-over-TLS to upstream sites. Trust comes from a PEM
//! bundle of CA certificates; there is no implicit system trust store.

use rustls::pki_types::{CertificateDer, ServerName};
use rustls::RootCertStore;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;

/// TLS settings for talking to one upstream.
#[derive(Clone)]
pub struct UpstreamTls {
    connector: TlsConnector,
    server_name: ServerName<'static>,
}

impl UpstreamTls {
    /// Trust the CA certificates found in a PEM file.
    pub fn from_ca_file(ca_path: &Path, server_name: &str) -> anyhow::Result<Self> {
        let file = File::open(ca_path)?;
        let roots: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut BufReader::new(file))
            .collect::<Result<Vec<_>, _>>()?;

        if roots.is_empty() {
            anyhow::bail!("no certificates found in {}", ca_path.display());
        }

        Self::from_roots(roots, server_name)
    }

    /// Trust exactly `roots`.
    pub fn from_roots(
        roots: Vec<CertificateDer<'static>>,
        server_name: &str,
    ) -> anyhow::Result<Self> {
        let mut store = RootCertStore::empty();
        for cert in roots {
            store.add(cert)?;
        }

        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let config = rustls::ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()?
            .with_root_certificates(store)
            .with_no_client_auth();

        let server_name = ServerName::try_from(server_name.to_string())
            .map_err(|e| anyhow::anyhow!("invalid TLS server name {}: {}", server_name, e))?;

        Ok(Self {
            connector: TlsConnector::from(Arc::new(config)),
            server_name,
        })
    }

    pub fn server_name(&self) -> &ServerName<'static> {
        &self.server_name
    }

    /// Run the handshake over an established TCP stream.
    pub async fn connect(&self, stream: TcpStream) -> std::io::Result<TlsStream<TcpStream>> {
        self.connector
            .connect(self.server_name.clone(), stream)
            .await
    }
}

impl std::fmt::Debug for UpstreamTls {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamTls")
            .field("server_name", &self.server_name)
            .finish()
    }
}
