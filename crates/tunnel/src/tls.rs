use std::sync::Arc;

use rustls::{
    ClientConfig, RootCertStore,
    pki_types::{CertificateDer, ServerName},
};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::{TlsConnector, client::TlsStream};
use tracing::debug;

use crate::error::ConnectFailure;

/// DER certificate as produced by `rustls-pemfile`
pub type Certificate = CertificateDer<'static>;

/// TLS settings for talking to the destination through the tunnel
#[derive(Debug, Clone, Default)]
pub struct TlsOptions {
    /// Trust anchors added to the bundled webpki roots
    pub extra_roots: Vec<Certificate>,

    /// Name to verify instead of the target host
    pub server_name: Option<String>,
}

impl TlsOptions {
    pub fn with_root(mut self, cert: Certificate) -> Self {
        self.extra_roots.push(cert);
        self
    }

    pub fn with_server_name(mut self, name: impl Into<String>) -> Self {
        self.server_name = Some(name.into());
        self
    }
}

/// Build a client config trusting the webpki roots plus `extra_roots`
pub fn client_config(options: &TlsOptions) -> Result<Arc<ClientConfig>, ConnectFailure> {
    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    for cert in &options.extra_roots {
        roots
            .add(cert.clone())
            .map_err(|e| ConnectFailure::TlsHandshake(format!("invalid root certificate: {}", e)))?;
    }

    let config = ClientConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .map_err(|e| ConnectFailure::TlsHandshake(e.to_string()))?
    .with_root_certificates(roots)
    .with_no_client_auth();

    Ok(Arc::new(config))
}

/// Name presented for SNI and checked against the certificate
pub fn server_name(
    target_host: &str,
    options: &TlsOptions,
) -> Result<ServerName<'static>, ConnectFailure> {
    let name = options.server_name.as_deref().unwrap_or(target_host);
    ServerName::try_from(name.to_string())
        .map_err(|e| ConnectFailure::TlsHandshake(format!("invalid server name {:?}: {}", name, e)))
}

/// Negotiate TLS with the destination over an established tunnel
pub async fn connect_tls<S>(
    stream: S,
    target_host: &str,
    options: &TlsOptions,
) -> Result<TlsStream<S>, ConnectFailure>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let config = client_config(options)?;
    let name = server_name(target_host, options)?;
    debug!(server_name = ?name, "starting TLS handshake through tunnel");

    TlsConnector::from(config)
        .connect(name, stream)
        .await
        .map_err(|e| ConnectFailure::TlsHandshake(e.to_string()))
}
