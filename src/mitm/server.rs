//! MITM proxy front-end
//!
//! A plain HTTP forward proxy that unconditionally intercepts CONNECT:
//! the tunnel is completed, TLS is terminated with a leaf certificate signed
//! by the ephemeral CA for the requested host, and the tunneled HTTP/1.1
//! traffic is processed as if it had arrived in the clear. Every request,
//! tunneled or plain, flows injector -> verifying upstream client ->
//! response scrubber -> client.

use bytes::Bytes;
use http::{Method, Request, Response, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

use crate::injector::{Handled, Injector};
use crate::mitm::ca::EphemeralCa;
use crate::scrubber;
use crate::upstream::UpstreamClient;

/// Hop-by-hop headers stripped before forwarding, per RFC 7230 section 6.1.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "proxy-connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// The proxy server: accept loop plus per-connection dispatch.
pub struct ProxyServer {
    injector: Arc<Injector>,
    ca: Arc<EphemeralCa>,
    upstream: UpstreamClient,
}

impl ProxyServer {
    pub fn new(injector: Arc<Injector>, ca: Arc<EphemeralCa>) -> Self {
        Self {
            injector,
            ca,
            upstream: UpstreamClient::new(),
        }
    }

    /// Accept connections forever, one task per connection.
    pub async fn run(self: Arc<Self>, listener: TcpListener) -> std::io::Result<()> {
        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    continue;
                }
            };
            debug!(peer = %peer, "client connected");

            let server = Arc::clone(&self);
            tokio::spawn(async move {
                server.serve_client(stream).await;
            });
        }
    }

    async fn serve_client(self: Arc<Self>, stream: TcpStream) {
        let server = Arc::clone(&self);
        let service = service_fn(move |req| {
            let server = Arc::clone(&server);
            async move { server.route(req).await }
        });

        let conn = hyper::server::conn::http1::Builder::new()
            .serve_connection(TokioIo::new(stream), service)
            .with_upgrades();
        if let Err(e) = conn.await {
            debug!(error = %e, "client connection ended");
        }
    }

    async fn route(
        self: Arc<Self>,
        req: Request<Incoming>,
    ) -> Result<Response<Full<Bytes>>, hyper::Error> {
        if req.method() == Method::CONNECT {
            self.handle_connect(req).await
        } else {
            self.handle_plain(req).await
        }
    }

    /// CONNECT is always intercepted. The 200 goes back first; the TLS
    /// handshake happens on the upgraded socket in a spawned task.
    async fn handle_connect(
        self: Arc<Self>,
        mut req: Request<Incoming>,
    ) -> Result<Response<Full<Bytes>>, hyper::Error> {
        let authority = match req.uri().authority() {
            Some(authority) => authority.clone(),
            None => {
                warn!("CONNECT without a host:port authority");
                return Ok(text_response(
                    StatusCode::BAD_REQUEST,
                    "CONNECT requires a host:port authority",
                ));
            }
        };
        let host = authority.host().to_ascii_lowercase();
        let port = authority.port_u16().unwrap_or(443);
        info!(host = %host, port = port, "CONNECT intercepted");

        let server = Arc::clone(&self);
        tokio::spawn(async move {
            match hyper::upgrade::on(&mut req).await {
                Ok(upgraded) => {
                    if let Err(e) = server.terminate_tls(upgraded, host.clone(), port).await {
                        debug!(host = %host, error = %e, "MITM tunnel ended");
                    }
                }
                Err(e) => {
                    error!(host = %host, error = %e, "CONNECT upgrade failed");
                }
            }
        });

        Ok(Response::builder()
            .status(StatusCode::OK)
            .body(Full::new(Bytes::new()))
            .unwrap())
    }

    /// Terminate TLS on the upgraded socket with a minted leaf certificate
    /// and serve the tunneled HTTP/1.1 requests.
    async fn terminate_tls(
        self: Arc<Self>,
        upgraded: hyper::upgrade::Upgraded,
        host: String,
        port: u16,
    ) -> anyhow::Result<()> {
        let tls_config = self.ca.server_config_for(&host).await?;
        let acceptor = TlsAcceptor::from(tls_config);
        let tls_stream = acceptor.accept(TokioIo::new(upgraded)).await?;
        debug!(host = %host, "client TLS terminated");

        let server = Arc::clone(&self);
        let service = service_fn(move |req| {
            let server = Arc::clone(&server);
            let host = host.clone();
            async move { server.process(req, "https", &host, port).await }
        });

        hyper::server::conn::http1::Builder::new()
            .serve_connection(TokioIo::new(tls_stream), service)
            .await?;
        Ok(())
    }

    /// Plain (non-CONNECT) proxy requests must be absolute-form.
    async fn handle_plain(
        self: Arc<Self>,
        req: Request<Incoming>,
    ) -> Result<Response<Full<Bytes>>, hyper::Error> {
        let uri = req.uri();
        let (scheme, authority) = match (uri.scheme_str(), uri.authority()) {
            (Some(scheme), Some(authority)) => (scheme.to_string(), authority.clone()),
            _ => {
                warn!(uri = %uri, "rejecting non-absolute-form proxy request");
                return Ok(text_response(
                    StatusCode::BAD_REQUEST,
                    "proxy requests must use absolute-form URIs",
                ));
            }
        };

        let host = authority.host().to_ascii_lowercase();
        let default_port = if scheme == "https" { 443 } else { 80 };
        let port = authority.port_u16().unwrap_or(default_port);

        self.process(req, &scheme, &host, port).await
    }

    /// The shared request path: buffer, inject, forward, scrub.
    async fn process(
        &self,
        req: Request<Incoming>,
        scheme: &str,
        host: &str,
        port: u16,
    ) -> Result<Response<Full<Bytes>>, hyper::Error> {
        let (mut parts, body) = req.into_parts();
        let body = body.collect().await?.to_bytes();
        strip_hop_by_hop(&mut parts.headers);
        let req = Request::from_parts(parts, Full::new(body));

        // The read guard is held only while the rewritten request is
        // materialized; the upstream dial happens after it is released.
        let req = match self.injector.handle(host, req).await {
            Handled::Forward(req) => req,
            Handled::Blocked(resp) => return Ok(resp),
        };

        let upstream_resp = match self.upstream.send(scheme, host, port, req).await {
            Ok(resp) => resp,
            Err(e) => {
                warn!(host = %host, error = %e, "upstream request failed");
                return Ok(text_response(
                    StatusCode::BAD_GATEWAY,
                    &format!("botlockbox: upstream error: {e}"),
                ));
            }
        };

        let (mut parts, body) = upstream_resp.into_parts();
        let body = match body.collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => {
                // Never fabricate a scrubbed body from a partial read.
                warn!(host = %host, error = %e, "upstream body read failed");
                return Ok(text_response(
                    StatusCode::BAD_GATEWAY,
                    "botlockbox: upstream body read error",
                ));
            }
        };

        strip_hop_by_hop(&mut parts.headers);
        let body = scrubber::scrub_response(&mut parts.headers, body);
        Ok(Response::from_parts(parts, Full::new(body)))
    }
}

fn strip_hop_by_hop(headers: &mut http::HeaderMap) {
    for name in HOP_BY_HOP {
        headers.remove(*name);
    }
}

fn text_response(status: StatusCode, body: &str) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header(http::header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(Full::new(Bytes::from(body.to_string())))
        .unwrap()
}
