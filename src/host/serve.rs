//! Serve contexts: one per resolved listen address.
//!
//! # Data Flow
//! ```text
//! accept loop (one per context)
//!     → sniff leading bytes (net::mux)
//!         HTTP/2 preface → insecure RPC server   (interceptor chain)
//!         TLS hello      → secure HTTP server    (per request: RPC or REST)
//!         anything else  → insecure HTTP server  (middleware pipeline)
//! ```
//!
//! Each personality registers its [`ServerPair`] on the context's completion
//! channel before the accept loop starts; the channel closes once every
//! personality is registered, and `Host::close` drains it exactly once.

use std::convert::Infallible;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use http::{Request, Version};
use hyper::body::Incoming;
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tower::ServiceExt;
use tracing::Instrument;

use crate::config::{HostConfig, KeepAliveConfig};
use crate::host::HostError;
use crate::http::server::{Http2KeepAlive, Protocol, ProtocolServer, ServerRole};
use crate::lifecycle::shutdown::ServerPair;
use crate::net::connection::{ConnInfo, PeerAddr};
use crate::net::listener::{BoundListener, ListenAddr, Network};
use crate::net::mux::{self, BoxIo, Rewind, Route};
use crate::net::tls::TlsMaterial;
use crate::observability::metrics;

/// Pause after a failed accept so a persistent error does not spin.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Per-context server options.
#[derive(Debug, Clone, Default)]
pub struct ServeOptions {
    pub keep_alive: KeepAliveConfig,
}

impl From<&HostConfig> for ServeOptions {
    fn from(cfg: &HostConfig) -> Self {
        if cfg.keep_alive.min_time().is_some() {
            // hyper has no ping policy for clients; only server pings apply.
            tracing::debug!("keep_alive.min_time_secs is not enforced");
        }
        Self {
            keep_alive: cfg.keep_alive.clone(),
        }
    }
}

/// The two routers every personality serves.
#[derive(Clone)]
pub struct Apps {
    /// REST router wrapped in the middleware pipeline.
    pub rest: Router,
    /// RPC router wrapped in the interceptor chain.
    pub rpc: Router,
}

/// Forwards post-start errors to the host's bounded error channel until the
/// host stops.
#[derive(Clone)]
pub struct ErrorSink {
    host: Arc<str>,
    tx: mpsc::Sender<HostError>,
    stop: watch::Receiver<bool>,
}

impl ErrorSink {
    pub fn new(host: Arc<str>, tx: mpsc::Sender<HostError>, stop: watch::Receiver<bool>) -> Self {
        Self { host, tx, stop }
    }

    pub fn report(&self, err: HostError) {
        if *self.stop.borrow() {
            return;
        }
        metrics::record_post_start_error(&self.host);
        tracing::debug!(error = %err, "Post-start error");
        if let Err(mpsc::error::TrySendError::Full(err)) = self.tx.try_send(err) {
            tracing::debug!(error = %err, "Error channel full, dropping error");
        }
    }
}

/// One resolved listen address.
pub struct ServeContext {
    addr: String,
    network: Network,
    secure: bool,
    insecure: bool,
    local_addr: Option<ListenAddr>,
    listener: Option<BoundListener>,
    tls: Option<Arc<TlsMaterial>>,
    options: ServeOptions,
    cancel: watch::Sender<bool>,
    pairs_tx: Option<mpsc::Sender<ServerPair>>,
    pairs_rx: Option<mpsc::Receiver<ServerPair>>,
    accept_task: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for ServeContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServeContext")
            .field("addr", &self.addr)
            .field("network", &self.network)
            .field("secure", &self.secure)
            .field("insecure", &self.insecure)
            .field("local_addr", &self.local_addr)
            .finish_non_exhaustive()
    }
}

impl ServeContext {
    pub fn new(
        addr: String,
        listener: BoundListener,
        secure: bool,
        tls: Option<Arc<TlsMaterial>>,
        options: ServeOptions,
    ) -> Self {
        // Room for both personalities.
        let (pairs_tx, pairs_rx) = mpsc::channel(2);
        Self {
            addr,
            network: listener.network(),
            secure,
            insecure: !secure,
            local_addr: listener.local_addr().ok(),
            listener: Some(listener),
            tls,
            options,
            cancel: watch::channel(false).0,
            pairs_tx: Some(pairs_tx),
            pairs_rx: Some(pairs_rx),
            accept_task: None,
        }
    }

    /// Fold another URL for the same address into this context.
    pub fn merge(&mut self, secure: bool) {
        self.secure |= secure;
        self.insecure |= !secure;
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn network(&self) -> Network {
        self.network
    }

    pub fn is_secure(&self) -> bool {
        self.secure
    }

    pub fn is_insecure(&self) -> bool {
        self.insecure
    }

    /// Address actually bound, which differs from `addr` for port 0.
    pub fn local_addr(&self) -> Option<&ListenAddr> {
        self.local_addr.as_ref()
    }

    /// Create the server pairs, register them and start the accept loop.
    pub fn start(&mut self, apps: &Apps, errors: ErrorSink, span: tracing::Span) -> Result<(), HostError> {
        let serve_err = |reason: &str| HostError::Serve {
            addr: self.addr.clone(),
            reason: reason.to_string(),
        };

        let listener = self
            .listener
            .take()
            .ok_or_else(|| serve_err("listener already taken"))?;
        let pairs_tx = self
            .pairs_tx
            .take()
            .ok_or_else(|| serve_err("serve context already started"))?;
        let keep_alive = Http2KeepAlive::from(&self.options.keep_alive);

        let new_pair = |secure| {
            ServerPair::new(
                secure,
                Arc::new(ProtocolServer::new(ServerRole::Rpc, keep_alive)),
                Arc::new(ProtocolServer::new(ServerRole::Http, keep_alive)),
            )
        };

        let insecure = self.insecure.then(|| new_pair(false));
        let secure = if self.secure {
            let tls = self
                .tls
                .clone()
                .ok_or_else(|| serve_err("secure personality without TLS material"))?;
            Some((new_pair(true), tls))
        } else {
            None
        };

        for pair in insecure.iter().chain(secure.iter().map(|(p, _)| p)) {
            pairs_tx
                .try_send(pair.clone())
                .map_err(|_| serve_err("completion channel rejected a server pair"))?;
        }
        drop(pairs_tx);

        if insecure.is_some() {
            tracing::warn!(address = %self.addr, "Serving without TLS");
        }
        tracing::info!(
            network = %self.network,
            address = %self.local_addr.as_ref().map(ToString::to_string).unwrap_or_default(),
            secure = self.secure,
            insecure = self.insecure,
            "Serving"
        );

        let dispatcher = Dispatcher {
            insecure,
            secure,
            apps: apps.clone(),
        };
        let cancel = self.cancel.subscribe();
        let addr = self.addr.clone();
        self.accept_task = Some(tokio::spawn(
            accept_loop(listener, dispatcher, cancel, errors, addr).instrument(span),
        ));
        Ok(())
    }

    /// Shut down every registered pair within `deadline`, then stop the
    /// accept loop and release the socket.
    pub async fn shutdown(&mut self, deadline: Duration) {
        // Unblocks draining when serving never started.
        self.pairs_tx.take();

        if let Some(mut pairs) = self.pairs_rx.take() {
            while let Some(pair) = pairs.recv().await {
                let path = pair.shutdown(deadline).await;
                tracing::info!(address = %self.addr, secure = pair.secure, ?path, "Server pair stopped");
            }
        }

        self.cancel.send_replace(true);
        if let Some(task) = self.accept_task.take() {
            if let Err(e) = task.await {
                tracing::error!(address = %self.addr, error = %e, "Accept loop failed");
            }
        }
        self.listener.take();
    }
}

async fn accept_loop(
    listener: BoundListener,
    dispatcher: Dispatcher,
    mut cancel: watch::Receiver<bool>,
    errors: ErrorSink,
    addr: String,
) {
    // Connections still sniffing or handshaking when the loop stops are
    // aborted with it; the rest were already stopped by their server pair.
    let mut connections = JoinSet::new();

    loop {
        let accepted = tokio::select! {
            _ = cancel.wait_for(|c| *c) => break,
            Some(_) = connections.join_next() => continue,
            res = listener.accept() => res,
        };

        match accepted {
            Ok((io, peer)) => {
                let dispatcher = dispatcher.clone();
                let errors = errors.clone();
                connections.spawn(
                    async move {
                        if let Err(e) = dispatcher.dispatch(io, peer).await {
                            errors.report(e);
                        }
                    }
                    .in_current_span(),
                );
            }
            Err(source) => {
                tracing::warn!(address = %addr, error = %source, "Accept failed");
                errors.report(HostError::Accept {
                    addr: addr.clone(),
                    source,
                });
                tokio::time::sleep(ACCEPT_BACKOFF).await;
            }
        }
    }
    if !connections.is_empty() {
        tracing::debug!(address = %addr, pending = connections.len(), "Aborting undispatched connections");
    }
    connections.shutdown().await;
    tracing::debug!(address = %addr, "Accept loop stopped");
}

/// Routes a new connection to the right server.
#[derive(Clone)]
struct Dispatcher {
    insecure: Option<ServerPair>,
    secure: Option<(ServerPair, Arc<TlsMaterial>)>,
    apps: Apps,
}

impl Dispatcher {
    async fn dispatch(self, mut io: BoxIo, peer: PeerAddr) -> Result<(), HostError> {
        let conn_err = |source: io::Error| HostError::Connection {
            peer: peer.to_string(),
            source,
        };

        let sniffed = tokio::time::timeout(
            mux::SNIFF_TIMEOUT,
            mux::sniff(&mut io, self.secure.is_some(), self.insecure.is_some()),
        )
        .await;
        let (route, prefix) = match sniffed {
            Ok(res) => res.map_err(conn_err)?,
            Err(_) => return Err(conn_err(timed_out("protocol detection timed out"))),
        };
        let io: BoxIo = Box::new(Rewind::new(prefix, io));

        match (route, &self.insecure, &self.secure) {
            (Route::Rpc, Some(pair), _) => {
                pair.rpc
                    .serve(io, ConnInfo::plain(peer), Protocol::Http2, self.apps.rpc)
                    .await;
            }
            (Route::Http, Some(pair), _) => {
                pair.http
                    .serve(io, ConnInfo::plain(peer), Protocol::Http1, self.apps.rest)
                    .await;
            }
            (Route::Tls, _, Some((pair, tls))) => {
                let handshake = tokio::time::timeout(mux::SNIFF_TIMEOUT, tls.acceptor().accept(io)).await;
                let stream = match handshake {
                    Ok(res) => res.map_err(conn_err)?,
                    Err(_) => return Err(conn_err(timed_out("TLS handshake timed out"))),
                };
                let certs = stream
                    .get_ref()
                    .1
                    .peer_certificates()
                    .map(|c| c.to_vec())
                    .unwrap_or_default();
                let service = SecureDispatch {
                    rest: self.apps.rest,
                    rpc: self.apps.rpc,
                };
                pair.http
                    .serve(Box::new(stream), ConnInfo::tls(peer, certs), Protocol::Auto, service)
                    .await;
            }
            _ => {
                tracing::debug!(peer = %peer, ?route, "No personality for connection");
            }
        }
        Ok(())
    }
}

fn timed_out(msg: &str) -> io::Error {
    io::Error::new(io::ErrorKind::TimedOut, msg.to_string())
}

/// Per request dispatch behind TLS: HTTP/2 calls with an RPC content type go
/// to the RPC router, everything else to REST.
#[derive(Clone)]
struct SecureDispatch {
    rest: Router,
    rpc: Router,
}

/// Whether a request is an RPC call.
pub fn is_rpc(req: &Request<Incoming>) -> bool {
    req.version() == Version::HTTP_2
        && req
            .headers()
            .get(http::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.starts_with("application/grpc"))
}

impl tower::Service<Request<Incoming>> for SecureDispatch {
    type Response = axum::response::Response;
    type Error = Infallible;
    type Future = futures_util::future::BoxFuture<'static, Result<Self::Response, Infallible>>;

    fn poll_ready(&mut self, _cx: &mut std::task::Context<'_>) -> std::task::Poll<Result<(), Infallible>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<Incoming>) -> Self::Future {
        let router = if is_rpc(&req) {
            self.rpc.clone()
        } else {
            self.rest.clone()
        };
        Box::pin(router.oneshot(req))
    }
}
