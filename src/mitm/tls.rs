//! TLS configuration
//!
//! Two configs, one per side of the interception:
//!
//! - agent-facing: the proxy acts as a server, presenting a CA-signed leaf
//!   certificate for the intercepted host
//! - upstream: the proxy acts as a client with full webpki verification,
//!   HTTP/2 preferred via ALPN
//!
//! Both sides accept TLS 1.2 and 1.3 only. There is no switch to disable
//! upstream verification; that closes the DNS-rebinding class where a
//! malicious resolver points an allowlisted hostname at an attacker.

use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::version::{TLS12, TLS13};
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;
use webpki_roots::TLS_SERVER_ROOTS;

/// TLS configuration errors
#[derive(Debug, Error)]
pub enum TlsError {
    #[error("invalid certificate or key: {0}")]
    InvalidCertificate(String),

    #[error("invalid server name {0:?}")]
    InvalidServerName(String),
}

/// Build the agent-facing server config for a minted leaf certificate.
/// The tunneled protocol is HTTP/1.1.
pub fn terminating_server_config(
    cert: CertificateDer<'static>,
    key: PrivateKeyDer<'static>,
) -> Result<ServerConfig, TlsError> {
    let mut config = ServerConfig::builder_with_protocol_versions(&[&TLS12, &TLS13])
        .with_no_client_auth()
        .with_single_cert(vec![cert], key)
        .map_err(|e| TlsError::InvalidCertificate(e.to_string()))?;
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(config)
}

/// Build the verifying upstream client config: Mozilla root store, TLS 1.2
/// minimum, ALPN preferring h2.
pub fn verifying_client_config() -> Arc<ClientConfig> {
    let mut root_store = RootCertStore::empty();
    root_store.extend(TLS_SERVER_ROOTS.iter().cloned());

    let mut config = ClientConfig::builder_with_protocol_versions(&[&TLS12, &TLS13])
        .with_root_certificates(root_store)
        .with_no_client_auth();
    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];

    debug!(roots = TLS_SERVER_ROOTS.len(), "upstream TLS config built");
    Arc::new(config)
}

/// Parse a hostname into a rustls ServerName for SNI.
pub fn server_name(host: &str) -> Result<ServerName<'static>, TlsError> {
    ServerName::try_from(host.to_owned())
        .map_err(|_| TlsError::InvalidServerName(host.to_string()))
}
