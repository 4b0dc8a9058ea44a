//! Shared utilities for host integration tests.
#![allow(dead_code)]

use std::any::Any;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use axum::routing::get;
use axum::Router;
use futures_util::future::BoxFuture;
use hyper_util::rt::{TokioExecutor, TokioIo};
use tonic::Code;

use trust_host::config::{HostConfig, TlsConfig};
use trust_host::host::{
    Collaborators, Host, RouteRegistrator, RpcRegistrator, Service, ServiceContext,
    ServiceFactories,
};
use trust_host::net::ListenAddr;
use trust_host::rpc::RpcRegistry;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Host configuration with a one second shutdown deadline.
pub fn config(urls: &[&str]) -> HostConfig {
    let mut cfg = HostConfig {
        name: "test".to_string(),
        listen_urls: urls.iter().map(|u| u.to_string()).collect(),
        services: vec!["test".to_string()],
        ..Default::default()
    };
    cfg.timeout.request_secs = 1;
    cfg
}

/// Write a throwaway self-signed key pair and return its settings.
pub fn self_signed() -> (TlsConfig, PathBuf) {
    let dir = std::env::temp_dir().join(format!("trust-host-it-{}", uuid::Uuid::new_v4()));
    std::fs::create_dir_all(&dir).unwrap();

    let cert_path = dir.join("cert.pem");
    let key_path = dir.join("key.pem");
    write_self_signed(&cert_path, &key_path);

    let settings = TlsConfig {
        cert: cert_path.display().to_string(),
        key: key_path.display().to_string(),
        trusted_ca: None,
        crl: None,
        cipher_suites: Vec::new(),
        client_cert_auth: false,
        reload_interval_secs: 60,
        watch_files: false,
    };
    (settings, dir)
}

/// Write a fresh self-signed key pair over `cert` and `key` and return the
/// certificate in DER form.
pub fn write_self_signed(cert: &Path, key: &Path) -> Vec<u8> {
    let rcgen::CertifiedKey { cert: generated, key_pair } =
        rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    std::fs::write(cert, generated.pem()).unwrap();
    std::fs::write(key, key_pair.serialize_pem()).unwrap();
    generated.der().to_vec()
}

/// Certificate presented by the server on a new connection.
pub async fn served_certificate(addr: SocketAddr) -> Option<Vec<u8>> {
    let client = reqwest::Client::builder()
        .danger_accept_invalid_certs(true)
        .tls_info(true)
        .build()
        .unwrap();
    let res = client.get(format!("https://{addr}/v1/echo")).send().await.ok()?;
    res.extensions()
        .get::<reqwest::tls::TlsInfo>()?
        .peer_certificate()
        .map(<[u8]>::to_vec)
}

/// A port that was free a moment ago.
pub fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

/// True if `port` can be bound again, i.e. no socket is left open on it.
pub fn port_is_free(port: u16) -> bool {
    std::net::TcpListener::bind(("127.0.0.1", port)).is_ok()
}

/// Service exposing a few REST routes and the `test.Echo` RPC service.
pub struct TestService {
    pub ready: AtomicBool,
    pub closed: AtomicUsize,
}

impl TestService {
    pub fn new(ready: bool) -> Arc<Self> {
        Arc::new(Self {
            ready: AtomicBool::new(ready),
            closed: AtomicUsize::new(0),
        })
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }
}

impl Service for TestService {
    fn name(&self) -> &str {
        "test"
    }

    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    fn close(&self) {
        self.closed.fetch_add(1, Ordering::SeqCst);
    }

    fn as_route_registrator(&self) -> Option<&dyn RouteRegistrator> {
        Some(self)
    }

    fn as_rpc_registrator(&self) -> Option<&dyn RpcRegistrator> {
        Some(self)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl RouteRegistrator for TestService {
    fn register_routes(&self, router: Router) -> Router {
        router
            .route("/v1/echo", get(|| async { "ok" }))
            .route("/v1/admin", get(|| async { "secret" }))
            .route(
                "/v1/hang",
                get(|| async {
                    std::future::pending::<()>().await;
                    "never"
                }),
            )
    }
}

impl RpcRegistrator for TestService {
    fn register_rpc(&self, registry: &mut RpcRegistry) {
        registry.add_service(EchoRpc);
    }
}

/// `test.Echo`: `Ping` answers OK, `Hang` never answers.
#[derive(Clone)]
pub struct EchoRpc;

impl tonic::server::NamedService for EchoRpc {
    const NAME: &'static str = "test.Echo";
}

impl tower::Service<http::Request<tonic::body::Body>> for EchoRpc {
    type Response = http::Response<tonic::body::Body>;
    type Error = Infallible;
    type Future = BoxFuture<'static, Result<Self::Response, Infallible>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Infallible>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: http::Request<tonic::body::Body>) -> Self::Future {
        let path = req.uri().path().to_string();
        Box::pin(async move {
            let res = match path.as_str() {
                "/test.Echo/Ping" => tonic::Status::new(Code::Ok, "").into_http(),
                "/test.Echo/Hang" => std::future::pending().await,
                _ => tonic::Status::unimplemented("no such method").into_http(),
            };
            Ok(res)
        })
    }
}

pub fn factories(service: Arc<TestService>) -> ServiceFactories {
    ServiceFactories::new().register("test", move |ctx: &mut ServiceContext<'_>| {
        ctx.add_service(service.clone());
        Ok(())
    })
}

pub async fn start_host(config: HostConfig, service: Arc<TestService>) -> Host {
    Host::start("test", config, Collaborators::new(), &factories(service))
        .await
        .unwrap()
}

/// The host's only bound TCP address.
pub fn tcp_addr(host: &Host) -> SocketAddr {
    match host.local_addrs() {
        [ListenAddr::Tcp(addr)] => *addr,
        other => panic!("expected one TCP address, got {other:?}"),
    }
}

pub fn https_client() -> reqwest::Client {
    reqwest::Client::builder()
        .danger_accept_invalid_certs(true)
        .build()
        .unwrap()
}

/// One plaintext RPC call over HTTP/2 with prior knowledge.
pub async fn rpc_call(
    addr: SocketAddr,
    path: &str,
) -> Result<http::Response<hyper::body::Incoming>, BoxError> {
    let stream = tokio::net::TcpStream::connect(addr).await?;
    let (mut sender, conn) =
        hyper::client::conn::http2::handshake(TokioExecutor::new(), TokioIo::new(stream)).await?;
    tokio::spawn(conn);

    let req = http::Request::post(format!("http://{addr}{path}"))
        .header("content-type", "application/grpc")
        .header("te", "trailers")
        .body(String::new())?;
    Ok(sender.send_request(req).await?)
}

pub fn grpc_status<B>(res: &http::Response<B>) -> Option<&str> {
    res.headers().get("grpc-status").and_then(|v| v.to_str().ok())
}
