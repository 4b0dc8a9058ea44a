//! Registration of RPC services.

use std::collections::BTreeSet;
use std::convert::Infallible;
use std::sync::Arc;

use axum::Router;
use http::{Request, Uri};
use tonic::body::Body;
use tonic::server::NamedService;
use tonic::service::RoutesBuilder;

/// Whether a call takes the unary or the stream interceptor path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallKind {
    Unary,
    Stream,
}

/// Collects RPC services while the host starts.
pub struct RpcRegistry {
    routes: RoutesBuilder,
    services: Vec<&'static str>,
    streaming: BTreeSet<String>,
}

impl Default for RpcRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for RpcRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcRegistry")
            .field("services", &self.services)
            .field("streaming", &self.streaming)
            .finish()
    }
}

impl RpcRegistry {
    pub fn new() -> Self {
        Self {
            routes: RoutesBuilder::default(),
            services: Vec::new(),
            streaming: BTreeSet::new(),
        }
    }

    /// Add a service; it answers under `/{S::NAME}/`.
    pub fn add_service<S>(&mut self, svc: S) -> &mut Self
    where
        S: tower::Service<Request<Body>, Error = Infallible>
            + NamedService
            + Clone
            + Send
            + Sync
            + 'static,
        S::Response: axum::response::IntoResponse,
        S::Future: Send + 'static,
    {
        tracing::debug!(service = S::NAME, "Registering RPC service");
        self.services.push(S::NAME);
        self.routes.add_service(svc);
        self
    }

    /// Mark `/{service}/{method}` as a server, client or bidi stream.
    pub fn add_streaming_method(&mut self, service: &str, method: &str) -> &mut Self {
        self.streaming.insert(format!("/{service}/{method}"));
        self
    }

    pub fn service_names(&self) -> &[&'static str] {
        &self.services
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    /// The router serving every service (unknown methods answer
    /// `Unimplemented`) and the method table used by the interceptors.
    pub fn into_parts(self) -> (Router, RpcMethods) {
        let router = self.routes.routes().into_axum_router().fallback(unimplemented);
        let methods = RpcMethods {
            streaming: Arc::new(self.streaming),
        };
        (router, methods)
    }
}

async fn unimplemented(uri: Uri) -> axum::response::Response {
    tonic::Status::unimplemented(format!("unknown method {}", uri.path())).into_http()
}

/// Which registered methods are streams.
#[derive(Debug, Clone, Default)]
pub struct RpcMethods {
    streaming: Arc<BTreeSet<String>>,
}

impl RpcMethods {
    pub fn kind(&self, path: &str) -> CallKind {
        if self.streaming.contains(path) {
            CallKind::Stream
        } else {
            CallKind::Unary
        }
    }
}
