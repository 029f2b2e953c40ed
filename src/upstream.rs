//! Verifying upstream transport
//!
//! HTTP client used for every upstream dial. TLS verification is always on
//! and there is no configuration to turn it off. ALPN prefers HTTP/2; the
//! negotiated protocol picks the hyper connection flavor after the
//! handshake. Plain-HTTP upstreams use an HTTP/1.1 connection.

use bytes::Bytes;
use http::header::HOST;
use http::uri::Uri;
use http::{Request, Response};
use http_body_util::Full;
use hyper::body::Incoming;
use hyper_util::rt::{TokioExecutor, TokioIo};
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tracing::{debug, warn};

use crate::mitm::tls;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Upstream transport errors
#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("connection to {0} timed out")]
    ConnectTimeout(String),

    #[error("connecting to {host}: {source}")]
    Connect {
        host: String,
        source: std::io::Error,
    },

    #[error("TLS handshake with {host} failed: {reason}")]
    Tls { host: String, reason: String },

    #[error("invalid upstream host {0:?}")]
    InvalidHost(String),

    #[error("invalid rewritten request: {0}")]
    InvalidRequest(String),

    #[error("upstream HTTP error: {0}")]
    Http(#[from] hyper::Error),
}

/// Upstream HTTP client with mandatory TLS verification.
pub struct UpstreamClient {
    tls: TlsConnector,
}

impl UpstreamClient {
    pub fn new() -> Self {
        Self {
            tls: TlsConnector::from(tls::verifying_client_config()),
        }
    }

    /// Dial `host:port` and send `req`. The request URI must be origin-form;
    /// this method normalizes it for the negotiated protocol.
    pub async fn send(
        &self,
        scheme: &str,
        host: &str,
        port: u16,
        req: Request<Full<Bytes>>,
    ) -> Result<Response<Incoming>, UpstreamError> {
        let addr = format!("{host}:{port}");

        let stream = timeout(CONNECT_TIMEOUT, TcpStream::connect(&addr))
            .await
            .map_err(|_| UpstreamError::ConnectTimeout(addr.clone()))?
            .map_err(|source| UpstreamError::Connect {
                host: addr.clone(),
                source,
            })?;

        if scheme == "https" {
            let server_name = tls::server_name(host)
                .map_err(|_| UpstreamError::InvalidHost(host.to_string()))?;

            let tls_stream = timeout(CONNECT_TIMEOUT, self.tls.connect(server_name, stream))
                .await
                .map_err(|_| UpstreamError::ConnectTimeout(addr.clone()))?
                .map_err(|e| UpstreamError::Tls {
                    host: host.to_string(),
                    reason: e.to_string(),
                })?;

            let negotiated_h2 = tls_stream.get_ref().1.alpn_protocol() == Some(b"h2".as_ref());
            debug!(host = %host, h2 = negotiated_h2, "upstream TLS established");

            if negotiated_h2 {
                let req = absolute_form(req, "https", host, port)?;
                let (mut sender, conn) =
                    hyper::client::conn::http2::handshake(TokioExecutor::new(), TokioIo::new(tls_stream))
                        .await?;
                tokio::spawn(async move {
                    if let Err(e) = conn.await {
                        warn!(error = %e, "upstream h2 connection error");
                    }
                });
                Ok(sender.send_request(req).await?)
            } else {
                let req = origin_form(req, host, port, 443)?;
                let (mut sender, conn) =
                    hyper::client::conn::http1::handshake(TokioIo::new(tls_stream)).await?;
                tokio::spawn(async move {
                    if let Err(e) = conn.await {
                        warn!(error = %e, "upstream connection error");
                    }
                });
                Ok(sender.send_request(req).await?)
            }
        } else {
            let req = origin_form(req, host, port, 80)?;
            let (mut sender, conn) =
                hyper::client::conn::http1::handshake(TokioIo::new(stream)).await?;
            tokio::spawn(async move {
                if let Err(e) = conn.await {
                    warn!(error = %e, "upstream connection error");
                }
            });
            Ok(sender.send_request(req).await?)
        }
    }
}

impl Default for UpstreamClient {
    fn default() -> Self {
        Self::new()
    }
}

/// Rewrite the request for an HTTP/1.1 connection: origin-form URI plus a
/// Host header (port omitted when it is the scheme default).
fn origin_form(
    req: Request<Full<Bytes>>,
    host: &str,
    port: u16,
    default_port: u16,
) -> Result<Request<Full<Bytes>>, UpstreamError> {
    let (mut parts, body) = req.into_parts();

    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());
    parts.uri = path_and_query
        .parse::<Uri>()
        .map_err(|e| UpstreamError::InvalidRequest(e.to_string()))?;

    let host_value = if port == default_port {
        host.to_string()
    } else {
        format!("{host}:{port}")
    };
    parts.headers.insert(
        HOST,
        host_value
            .parse()
            .map_err(|_| UpstreamError::InvalidHost(host.to_string()))?,
    );

    Ok(Request::from_parts(parts, body))
}

/// Rewrite the request for an HTTP/2 connection: absolute-form URI; the
/// Host header is dropped in favor of the :authority pseudo-header.
fn absolute_form(
    req: Request<Full<Bytes>>,
    scheme: &str,
    host: &str,
    port: u16,
) -> Result<Request<Full<Bytes>>, UpstreamError> {
    let (mut parts, body) = req.into_parts();

    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());

    let authority = if (scheme == "https" && port == 443) || (scheme == "http" && port == 80) {
        host.to_string()
    } else {
        format!("{host}:{port}")
    };

    parts.uri = format!("{scheme}://{authority}{path_and_query}")
        .parse::<Uri>()
        .map_err(|e| UpstreamError::InvalidRequest(e.to_string()))?;
    parts.headers.remove(HOST);

    Ok(Request::from_parts(parts, body))
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::Full;

    fn request(path: &str) -> Request<Full<Bytes>> {
        Request::builder()
            .method("GET")
            .uri(path)
            .body(Full::new(Bytes::new()))
            .unwrap()
    }

    #[test]
    fn test_origin_form_sets_host_header() {
        let req = origin_form(request("/v1?x=1"), "api.example.com", 443, 443).unwrap();
        assert_eq!(req.uri().to_string(), "/v1?x=1");
        assert_eq!(req.headers().get(HOST).unwrap(), "api.example.com");
    }

    #[test]
    fn test_origin_form_keeps_nonstandard_port() {
        let req = origin_form(request("/"), "localhost", 8443, 443).unwrap();
        assert_eq!(req.headers().get(HOST).unwrap(), "localhost:8443");
    }

    #[test]
    fn test_absolute_form_builds_authority() {
        let req = absolute_form(request("/v1"), "https", "api.example.com", 443).unwrap();
        assert_eq!(req.uri().to_string(), "https://api.example.com/v1");
        assert!(req.headers().get(HOST).is_none());

        let req = absolute_form(request("/v1"), "https", "api.example.com", 8443).unwrap();
        assert_eq!(req.uri().to_string(), "https://api.example.com:8443/v1");
    }
}
