//! Shutdown coordination.
//!
//! [`StopSignal`] is the single-fire signal shared by everything a host
//! spawns. [`ServerPair::shutdown`] runs the per-pair procedure:
//!
//! ```text
//! secure pair:    HTTP shutdown (deadline) → RPC hard stop
//! insecure pair:  RPC graceful stop (background) ─┬─ wins  → HTTP shutdown (remaining deadline)
//!                 deadline ───────────────────────┴─ wins  → HTTP shutdown → RPC hard stop
//!                                                            → join background task
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;

use crate::http::server::ProtocolServer;

/// Single-fire stop signal.
///
/// Cloned receivers observe the transition to stopped; firing twice is a
/// no-op.
#[derive(Debug)]
pub struct StopSignal {
    fired: AtomicBool,
    tx: watch::Sender<bool>,
}

impl StopSignal {
    pub fn new() -> Self {
        Self {
            fired: AtomicBool::new(false),
            tx: watch::channel(false).0,
        }
    }

    /// Subscribe to the stop signal.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }

    /// Fire the signal. Returns true only for the call that fired it.
    pub fn trigger(&self) -> bool {
        if self.fired.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.tx.send_replace(true);
        true
    }

    pub fn is_stopped(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }
}

impl Default for StopSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// Which strategy a pair shut down with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownPath {
    Graceful,
    Forced,
}

/// The RPC server and HTTP server of one personality of a serve context.
#[derive(Debug, Clone)]
pub struct ServerPair {
    pub secure: bool,
    pub rpc: Arc<ProtocolServer>,
    pub http: Arc<ProtocolServer>,
}

impl ServerPair {
    pub fn new(secure: bool, rpc: Arc<ProtocolServer>, http: Arc<ProtocolServer>) -> Self {
        Self { secure, rpc, http }
    }

    /// Shut both servers down within `timeout`.
    ///
    /// Returns after at most `timeout` plus the cost of a hard stop.
    pub async fn shutdown(&self, timeout: Duration) -> ShutdownPath {
        let deadline = Instant::now() + timeout;

        if self.secure {
            // RPC calls share the TLS connections of the HTTP server.
            self.force(deadline).await;
            return ShutdownPath::Forced;
        }

        let rpc = Arc::clone(&self.rpc);
        let mut graceful = tokio::spawn(async move { rpc.graceful_stop().await });

        tokio::select! {
            res = &mut graceful => {
                if let Err(e) = res {
                    tracing::error!(error = %e, "RPC graceful stop task failed");
                }
                self.http.shutdown(deadline).await;
                ShutdownPath::Graceful
            }
            _ = tokio::time::sleep_until(deadline) => {
                tracing::warn!(
                    active_rpc = self.rpc.active_connections(),
                    "RPC graceful stop exceeded the deadline, forcing"
                );
                self.force(deadline).await;
                // The hard stop closed every RPC connection, so the
                // graceful waiter returns promptly.
                if let Err(e) = graceful.await {
                    tracing::error!(error = %e, "RPC graceful stop task failed");
                }
                ShutdownPath::Forced
            }
        }
    }

    async fn force(&self, deadline: Instant) {
        self.http.shutdown(deadline).await;
        self.rpc.stop().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::server::{Http2KeepAlive, Protocol, ServerRole};
    use crate::net::connection::{ConnInfo, PeerAddr};
    use axum::routing::get;
    use axum::Router;
    use hyper_util::rt::{TokioExecutor, TokioIo};

    fn pair(secure: bool) -> ServerPair {
        ServerPair::new(
            secure,
            Arc::new(ProtocolServer::new(ServerRole::Rpc, Http2KeepAlive::default())),
            Arc::new(ProtocolServer::new(ServerRole::Http, Http2KeepAlive::default())),
        )
    }

    fn hanging_router() -> Router {
        Router::new().route(
            "/hang",
            get(|| async {
                std::future::pending::<()>().await;
                "never"
            }),
        )
    }

    /// Start an HTTP/2 call that never completes on `server`.
    async fn start_hanging_call(server: &Arc<ProtocolServer>) -> tokio::task::JoinHandle<()> {
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        let srv = Arc::clone(server);
        tokio::spawn(async move {
            srv.serve(
                Box::new(server_io),
                ConnInfo::plain(PeerAddr::Unix),
                Protocol::Http2,
                hanging_router(),
            )
            .await;
        });

        let (mut sender, conn) =
            hyper::client::conn::http2::handshake(TokioExecutor::new(), TokioIo::new(client_io))
                .await
                .unwrap();
        tokio::spawn(conn);

        let call = tokio::spawn(async move {
            let req = http::Request::builder()
                .uri("http://local/hang")
                .body(String::new())
                .unwrap();
            let _ = sender.send_request(req).await;
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        call
    }

    #[test]
    fn stop_signal_fires_once() {
        let stop = StopSignal::new();
        let rx = stop.subscribe();
        assert!(!stop.is_stopped());
        assert!(stop.trigger());
        assert!(!stop.trigger());
        assert!(*rx.borrow());
    }

    #[tokio::test]
    async fn idle_insecure_pair_closes_gracefully() {
        let pair = pair(false);
        let start = std::time::Instant::now();
        let path = pair.shutdown(Duration::from_secs(3)).await;
        assert_eq!(path, ShutdownPath::Graceful);
        assert!(start.elapsed() < Duration::from_millis(500));
    }

    #[tokio::test]
    async fn insecure_pair_forces_hung_rpc_call() {
        let pair = pair(false);
        let call = start_hanging_call(&pair.rpc).await;
        assert_eq!(pair.rpc.active_connections(), 1);

        let start = std::time::Instant::now();
        let path = pair.shutdown(Duration::from_millis(300)).await;
        assert_eq!(path, ShutdownPath::Forced);
        assert!(start.elapsed() < Duration::from_millis(1300));
        assert_eq!(pair.rpc.active_connections(), 0);
        call.await.unwrap();
    }

    #[tokio::test]
    async fn secure_pair_is_always_forced() {
        let pair = pair(true);
        let path = pair.shutdown(Duration::from_millis(100)).await;
        assert_eq!(path, ShutdownPath::Forced);
        assert!(pair.rpc.is_stopping());
        assert!(pair.http.is_stopping());
    }

    #[tokio::test]
    async fn secure_pair_with_hung_call_closes_within_deadline() {
        let pair = pair(true);
        let call = start_hanging_call(&pair.http).await;

        let start = std::time::Instant::now();
        pair.shutdown(Duration::from_millis(300)).await;
        assert!(start.elapsed() < Duration::from_millis(1300));
        assert_eq!(pair.http.active_connections(), 0);
        call.await.unwrap();
    }
}
