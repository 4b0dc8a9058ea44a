//! Protocol servers driven by hyper.
//!
//! # Responsibilities
//! - Serve connections handed over by the accept loop (HTTP/1, HTTP/2 or
//!   ALPN/preface auto-detection)
//! - Track live connections so shutdown can wait for them
//! - Graceful stop: refuse new connections, ask live ones to finish
//! - Hard stop: refuse new connections, drop live ones immediately
//!
//! A server never owns a socket: the listener stays with its serve context
//! and the accept loop decides which server receives each connection.

use std::convert::Infallible;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use axum::body::Body;
use http::{Request, Response};
use hyper::body::Incoming;
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use hyper_util::server::conn::auto;
use hyper_util::service::TowerToHyperService;
use tokio::sync::watch;
use tokio::time::Instant;

use crate::config::KeepAliveConfig;
use crate::net::connection::{ConnInfo, ConnectionTracker};
use crate::net::mux::BoxIo;

/// Wire protocol spoken on a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Http1,
    Http2,
    /// Detect from the connection preface (used behind TLS with ALPN).
    Auto,
}

/// Which half of a server pair this is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerRole {
    Rpc,
    Http,
}

impl ServerRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServerRole::Rpc => "rpc",
            ServerRole::Http => "http",
        }
    }
}

/// HTTP/2 keep-alive settings derived from the host configuration.
#[derive(Debug, Clone, Copy, Default)]
pub struct Http2KeepAlive {
    pub interval: Option<Duration>,
    pub timeout: Option<Duration>,
}

impl From<&KeepAliveConfig> for Http2KeepAlive {
    fn from(cfg: &KeepAliveConfig) -> Self {
        // Pings are only sent when both an interval and a timeout are set.
        match (cfg.interval(), cfg.timeout()) {
            (Some(interval), Some(timeout)) => Self {
                interval: Some(interval),
                timeout: Some(timeout),
            },
            _ => Self::default(),
        }
    }
}

/// A server that drives connections until asked to stop.
#[derive(Debug)]
pub struct ProtocolServer {
    role: ServerRole,
    keep_alive: Http2KeepAlive,
    tracker: ConnectionTracker,
    stopping: AtomicBool,
    drain: watch::Sender<bool>,
    kill: watch::Sender<bool>,
}

impl ProtocolServer {
    pub fn new(role: ServerRole, keep_alive: Http2KeepAlive) -> Self {
        Self {
            role,
            keep_alive,
            tracker: ConnectionTracker::new(),
            stopping: AtomicBool::new(false),
            drain: watch::channel(false).0,
            kill: watch::channel(false).0,
        }
    }

    pub fn role(&self) -> ServerRole {
        self.role
    }

    pub fn active_connections(&self) -> u64 {
        self.tracker.active_count()
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    /// Serve one connection to completion. Every request gets `info` as an
    /// extension.
    pub async fn serve<S>(&self, io: BoxIo, info: ConnInfo, protocol: Protocol, service: S)
    where
        S: tower::Service<Request<Incoming>, Response = Response<Body>, Error = Infallible>
            + Clone
            + Send
            + 'static,
        S::Future: Send + 'static,
    {
        // Track before checking the flag so a stop that raced with us
        // either sees this connection or we see the stop.
        let guard = self.tracker.track();
        if self.is_stopping() {
            tracing::debug!(server = self.role.as_str(), peer = %info.peer, "Refusing connection, server is stopping");
            return;
        }

        tracing::debug!(
            server = self.role.as_str(),
            connection_id = %guard.id(),
            peer = %info.peer,
            secure = info.secure,
            ?protocol,
            "Serving connection"
        );

        let peer = info.peer.clone();
        let service = TowerToHyperService::new(tower_http::add_extension::AddExtension::new(service, info));
        let io = TokioIo::new(io);
        let drain = self.drain.subscribe();
        let kill = self.kill.subscribe();

        let result = match protocol {
            Protocol::Http1 => {
                let conn = hyper::server::conn::http1::Builder::new()
                    .timer(TokioTimer::new())
                    .serve_connection(io, service);
                drive(conn, |c| c.graceful_shutdown(), drain, kill)
                    .await
                    .map_err(|e| e.to_string())
            }
            Protocol::Http2 => {
                let mut builder = hyper::server::conn::http2::Builder::new(TokioExecutor::new());
                builder.timer(TokioTimer::new());
                if let (Some(interval), Some(timeout)) = (self.keep_alive.interval, self.keep_alive.timeout) {
                    builder.keep_alive_interval(interval).keep_alive_timeout(timeout);
                }
                let conn = builder.serve_connection(io, service);
                drive(conn, |c| c.graceful_shutdown(), drain, kill)
                    .await
                    .map_err(|e| e.to_string())
            }
            Protocol::Auto => {
                let mut builder = auto::Builder::new(TokioExecutor::new());
                builder.http1().timer(TokioTimer::new());
                builder.http2().timer(TokioTimer::new());
                if let (Some(interval), Some(timeout)) = (self.keep_alive.interval, self.keep_alive.timeout) {
                    builder.http2().keep_alive_interval(interval).keep_alive_timeout(timeout);
                }
                let conn = builder.serve_connection(io, service);
                drive(conn, |c| c.graceful_shutdown(), drain, kill)
                    .await
                    .map_err(|e| e.to_string())
            }
        };

        match result {
            Ok(Outcome::Completed) => {}
            Ok(Outcome::Aborted) => {
                tracing::debug!(server = self.role.as_str(), connection_id = %guard.id(), "Connection aborted by hard stop");
            }
            Err(e) => {
                // Per-connection I/O errors are routine (resets, bad clients).
                tracing::debug!(server = self.role.as_str(), peer = %peer, error = %e, "Connection error");
            }
        }
    }

    /// Stop taking connections and wait for the live ones to finish.
    pub async fn graceful_stop(&self) {
        self.stopping.store(true, Ordering::SeqCst);
        self.drain.send_replace(true);
        self.tracker.wait_idle().await;
        tracing::debug!(server = self.role.as_str(), "Graceful stop complete");
    }

    /// Stop taking connections and drop the live ones.
    pub async fn stop(&self) {
        self.stopping.store(true, Ordering::SeqCst);
        self.kill.send_replace(true);
        self.tracker.wait_idle().await;
        tracing::debug!(server = self.role.as_str(), "Stopped");
    }

    /// Graceful stop bounded by `deadline`, then hard stop. Returns true if
    /// every connection finished on its own.
    pub async fn shutdown(&self, deadline: Instant) -> bool {
        self.stopping.store(true, Ordering::SeqCst);
        self.drain.send_replace(true);
        if tokio::time::timeout_at(deadline, self.tracker.wait_idle()).await.is_ok() {
            return true;
        }
        tracing::warn!(
            server = self.role.as_str(),
            active = self.tracker.active_count(),
            "Shutdown deadline exceeded, closing connections"
        );
        self.stop().await;
        false
    }
}

/// How a driven connection ended.
enum Outcome {
    Completed,
    Aborted,
}

/// Poll `conn` to completion, asking it to finish gracefully once `drain`
/// fires and dropping it once `kill` fires.
async fn drive<C, E, G>(
    conn: C,
    mut graceful: G,
    mut drain: watch::Receiver<bool>,
    mut kill: watch::Receiver<bool>,
) -> Result<Outcome, E>
where
    C: Future<Output = Result<(), E>>,
    G: FnMut(Pin<&mut C>),
{
    tokio::pin!(conn);
    let mut draining = false;

    loop {
        tokio::select! {
            biased;
            _ = kill.wait_for(|k| *k) => return Ok(Outcome::Aborted),
            _ = drain.wait_for(|d| *d), if !draining => {
                draining = true;
                graceful(conn.as_mut());
            }
            res = conn.as_mut() => return res.map(|_| Outcome::Completed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::connection::PeerAddr;
    use axum::routing::get;
    use axum::Router;
    use std::sync::Arc;

    fn router() -> Router {
        Router::new()
            .route("/fast", get(|| async { "ok" }))
            .route(
                "/hang",
                get(|| async {
                    std::future::pending::<()>().await;
                    "never"
                }),
            )
    }

    /// Open an in-memory HTTP/1 connection to `server` and return a sender.
    async fn connect(
        server: &Arc<ProtocolServer>,
    ) -> hyper::client::conn::http1::SendRequest<String> {
        let (client_io, server_io) = tokio::io::duplex(4096);
        let srv = Arc::clone(server);
        tokio::spawn(async move {
            srv.serve(
                Box::new(server_io),
                ConnInfo::plain(PeerAddr::Unix),
                Protocol::Http1,
                router(),
            )
            .await;
        });

        let (sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(client_io))
            .await
            .unwrap();
        tokio::spawn(conn);
        sender
    }

    fn get_req(path: &str) -> Request<String> {
        Request::builder()
            .uri(path)
            .header("host", "local")
            .body(String::new())
            .unwrap()
    }

    #[tokio::test]
    async fn serves_and_drains_idle_connection() {
        let server = Arc::new(ProtocolServer::new(ServerRole::Http, Http2KeepAlive::default()));
        let mut sender = connect(&server).await;

        let res = sender.send_request(get_req("/fast")).await.unwrap();
        assert_eq!(res.status(), 200);
        assert_eq!(server.active_connections(), 1);

        tokio::time::timeout(Duration::from_secs(1), server.graceful_stop())
            .await
            .expect("idle keep-alive connection should close on drain");
        assert_eq!(server.active_connections(), 0);
    }

    #[tokio::test]
    async fn shutdown_deadline_aborts_hung_request() {
        let server = Arc::new(ProtocolServer::new(ServerRole::Http, Http2KeepAlive::default()));
        let mut sender = connect(&server).await;

        let pending = tokio::spawn(async move { sender.send_request(get_req("/hang")).await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(server.active_connections(), 1);

        let start = std::time::Instant::now();
        let drained = server.shutdown(Instant::now() + Duration::from_millis(200)).await;
        assert!(!drained);
        assert!(start.elapsed() < Duration::from_secs(1));
        assert_eq!(server.active_connections(), 0);
        assert!(pending.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn stopping_server_refuses_new_connections() {
        let server = Arc::new(ProtocolServer::new(ServerRole::Rpc, Http2KeepAlive::default()));
        server.stop().await;
        assert!(server.is_stopping());

        let (_client, server_io) = tokio::io::duplex(64);
        tokio::time::timeout(
            Duration::from_millis(200),
            server.serve(
                Box::new(server_io),
                ConnInfo::plain(PeerAddr::Unix),
                Protocol::Http2,
                router(),
            ),
        )
        .await
        .expect("refused connections return immediately");
        assert_eq!(server.active_connections(), 0);
    }

    #[test]
    fn keep_alive_needs_interval_and_timeout() {
        let ka = Http2KeepAlive::from(&KeepAliveConfig {
            min_time_secs: 0,
            interval_secs: 10,
            timeout_secs: 0,
        });
        assert!(ka.interval.is_none());

        let ka = Http2KeepAlive::from(&KeepAliveConfig {
            min_time_secs: 0,
            interval_secs: 10,
            timeout_secs: 2,
        });
        assert_eq!(ka.interval, Some(Duration::from_secs(10)));
        assert_eq!(ka.timeout, Some(Duration::from_secs(2)));
    }
}
