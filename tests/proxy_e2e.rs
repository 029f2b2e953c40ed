//! End-to-end proxy flow over real sockets (plain HTTP path)
//!
//! A local upstream records what it receives and returns a body containing
//! a credential shape. The client sends an absolute-form request through
//! the proxy and must observe the injected header upstream and the
//! scrubbed body downstream.

use bytes::Bytes;
use http::{Request, Response, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::net::{TcpListener, TcpStream};

use botlockbox::config::{Inject, Match, Rule};
use botlockbox::secrets::{AllowedHosts, SealedEnvelope, SecretStore};
use botlockbox::{EphemeralCa, Injector, ProxyServer};

/// Upstream that records the Authorization header and answers with a body
/// holding a GitHub-PAT-shaped token.
async fn spawn_upstream(seen_auth: Arc<Mutex<Option<String>>>) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            let (stream, _) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(_) => return,
            };
            let seen_auth = Arc::clone(&seen_auth);
            tokio::spawn(async move {
                let service = service_fn(move |req: Request<hyper::body::Incoming>| {
                    let seen_auth = Arc::clone(&seen_auth);
                    async move {
                        *seen_auth.lock().unwrap() = req
                            .headers()
                            .get("authorization")
                            .map(|v| v.to_str().unwrap().to_string());

                        let body = format!("leaked: ghp_{}", "a".repeat(36));
                        Ok::<_, hyper::Error>(
                            Response::builder()
                                .status(StatusCode::OK)
                                .body(Full::new(Bytes::from(body)))
                                .unwrap(),
                        )
                    }
                });
                let _ = hyper::server::conn::http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await;
            });
        }
    });

    addr
}

async fn spawn_proxy(upstream_host: &str) -> SocketAddr {
    let mut headers = std::collections::BTreeMap::new();
    headers.insert(
        "Authorization".to_string(),
        "Bearer {{secrets.tok}}".to_string(),
    );
    let rules = vec![Rule {
        name: "local-upstream".to_string(),
        match_: Match {
            hosts: vec![upstream_host.to_string()],
            path_prefixes: vec![],
        },
        inject: Inject {
            headers,
            query_params: Default::default(),
        },
    }];

    let mut allowed = AllowedHosts::new();
    allowed.insert("tok".to_string(), vec![upstream_host.to_string()]);
    let envelope = SealedEnvelope::new(allowed, HashMap::new());

    let mut store = SecretStore::new();
    let mut plaintext = b"ABC".to_vec();
    store.put("tok", &mut plaintext);

    let ca = Arc::new(EphemeralCa::generate().unwrap());
    let injector = Arc::new(Injector::new(
        rules,
        envelope,
        store,
        ca.ca_pem().as_bytes().to_vec(),
    ));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = Arc::new(ProxyServer::new(injector, ca));
    tokio::spawn(async move {
        let _ = server.run(listener).await;
    });

    addr
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn plain_http_request_is_injected_and_scrubbed() {
    let seen_auth = Arc::new(Mutex::new(None));
    let upstream_addr = spawn_upstream(Arc::clone(&seen_auth)).await;
    let proxy_addr = spawn_proxy("127.0.0.1").await;

    // Speak HTTP/1.1 to the proxy with an absolute-form URI.
    let stream = TcpStream::connect(proxy_addr).await.unwrap();
    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
        .await
        .unwrap();
    tokio::spawn(conn);

    let req = Request::builder()
        .method("GET")
        .uri(format!("http://{upstream_addr}/v1"))
        .header("host", upstream_addr.to_string())
        .body(Full::new(Bytes::new()))
        .unwrap();
    let resp = sender.send_request(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let declared_len: usize = resp
        .headers()
        .get("content-length")
        .unwrap()
        .to_str()
        .unwrap()
        .parse()
        .unwrap();
    let body = resp.into_body().collect().await.unwrap().to_bytes();

    // The upstream saw the injected credential.
    assert_eq!(
        seen_auth.lock().unwrap().as_deref(),
        Some("Bearer ABC"),
        "upstream did not receive the injected header"
    );

    // The client saw the scrubbed body with a matching Content-Length.
    assert_eq!(body, Bytes::from("leaked: [REDACTED-BY-BOTLOCKBOX]"));
    assert_eq!(declared_len, body.len());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unmatched_host_gets_no_injection() {
    let seen_auth = Arc::new(Mutex::new(None));
    let upstream_addr = spawn_upstream(Arc::clone(&seen_auth)).await;
    // Rule and allowlist name a host that is not the upstream's.
    let proxy_addr = spawn_proxy("api.example.com").await;

    let stream = TcpStream::connect(proxy_addr).await.unwrap();
    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
        .await
        .unwrap();
    tokio::spawn(conn);

    let req = Request::builder()
        .method("GET")
        .uri(format!("http://{upstream_addr}/v1"))
        .header("host", upstream_addr.to_string())
        .body(Full::new(Bytes::new()))
        .unwrap();
    let resp = sender.send_request(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    assert_eq!(*seen_auth.lock().unwrap(), None);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn non_absolute_uri_is_rejected() {
    let proxy_addr = spawn_proxy("127.0.0.1").await;

    let stream = TcpStream::connect(proxy_addr).await.unwrap();
    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
        .await
        .unwrap();
    tokio::spawn(conn);

    let req = Request::builder()
        .method("GET")
        .uri("/v1")
        .header("host", "127.0.0.1")
        .body(Full::new(Bytes::new()))
        .unwrap();
    let resp = sender.send_request(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}
