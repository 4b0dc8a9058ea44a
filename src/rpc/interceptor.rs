//! RPC interceptor chain.
//!
//! ```text
//! unary:  identity → logging → metrics → authz (optional) → service
//! stream:            logging → metrics                    → service
//! ```
//!
//! Interceptors are axum middleware over the RPC router. The outermost one
//! tags each call with its [`CallKind`]; the identity and authz interceptors
//! pass streams straight through.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::{Request, State};
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::Router;

use crate::http::middleware::authz::denied;
use crate::http::response::ApiError;
use crate::net::connection::ConnInfo;
use crate::observability::metrics;
use crate::rpc::registry::{CallKind, RpcMethods};
use crate::rpc::status::{code_label, response_code};
use crate::security::authz::Authz;
use crate::security::identity::{CallerContext, CallerRequest, Identity, IdentityResolver, GUEST_ROLE};

/// Unary calls slower than this are logged at WARN.
pub const SLOW_CALL: Duration = Duration::from_millis(300);

/// One interceptor.
#[derive(Clone)]
pub enum Interceptor {
    Classify(RpcMethods),
    Identity(IdentityResolver),
    Logging,
    Metrics,
    Authz(Arc<Authz>),
}

impl Interceptor {
    pub fn name(&self) -> &'static str {
        match self {
            Interceptor::Classify(_) => "classify",
            Interceptor::Identity(_) => "identity",
            Interceptor::Logging => "logging",
            Interceptor::Metrics => "metrics",
            Interceptor::Authz(_) => "authz",
        }
    }

    /// Whether this interceptor acts on calls of `kind`.
    pub fn applies_to(&self, kind: CallKind) -> bool {
        match self {
            Interceptor::Identity(_) | Interceptor::Authz(_) => kind == CallKind::Unary,
            _ => true,
        }
    }

    fn apply(self, router: Router) -> Router {
        match self {
            Interceptor::Classify(methods) => router.layer(middleware::from_fn_with_state(methods, classify_call)),
            Interceptor::Identity(resolver) => router.layer(middleware::from_fn_with_state(resolver, identity_interceptor)),
            Interceptor::Logging => router.layer(middleware::from_fn(logging_interceptor)),
            Interceptor::Metrics => router.layer(middleware::from_fn(metrics_interceptor)),
            Interceptor::Authz(authz) => router.layer(middleware::from_fn_with_state(authz, authz_interceptor)),
        }
    }
}

/// The fixed RPC interceptor chain.
#[derive(Clone)]
pub struct InterceptorChain {
    stages: Vec<Interceptor>,
}

impl InterceptorChain {
    pub fn new(methods: RpcMethods, resolver: IdentityResolver, authz: Option<Arc<Authz>>) -> Self {
        let mut stages = vec![
            Interceptor::Classify(methods),
            Interceptor::Identity(resolver),
            Interceptor::Logging,
            Interceptor::Metrics,
        ];
        if let Some(authz) = authz {
            stages.push(Interceptor::Authz(authz));
        }
        Self { stages }
    }

    /// Interceptors a call of `kind` runs through, outermost first.
    pub fn chain_for(&self, kind: CallKind) -> Vec<&'static str> {
        self.stages
            .iter()
            .filter(|i| !matches!(i, Interceptor::Classify(_)) && i.applies_to(kind))
            .map(Interceptor::name)
            .collect()
    }

    pub fn wrap(self, router: Router) -> Router {
        self.stages.into_iter().rev().fold(router, |router, i| i.apply(router))
    }
}

fn kind_of(req: &Request) -> CallKind {
    req.extensions().get::<CallKind>().copied().unwrap_or(CallKind::Unary)
}

async fn classify_call(State(methods): State<RpcMethods>, mut req: Request, next: Next) -> Response {
    let kind = methods.kind(req.uri().path());
    req.extensions_mut().insert(kind);
    next.run(req).await
}

async fn identity_interceptor(State(resolver): State<IdentityResolver>, mut req: Request, next: Next) -> Response {
    if kind_of(&req) == CallKind::Stream {
        return next.run(req).await;
    }

    let resolved = {
        let conn = req.extensions().get::<ConnInfo>();
        resolver.resolve(&CallerRequest::new(req.headers(), conn))
    };
    match resolved {
        Ok(caller) => {
            req.extensions_mut().insert(caller);
            next.run(req).await
        }
        Err(e) => {
            tracing::warn!(method = %req.uri().path(), error = %e, "Failed to identify caller");
            ApiError::unauthorized(e.to_string()).into_rpc_response()
        }
    }
}

async fn logging_interceptor(req: Request, next: Next) -> Response {
    let start = Instant::now();
    let kind = kind_of(&req);
    let method = req.uri().path().to_string();
    let caller = req.extensions().get::<CallerContext>().cloned();
    let peer = match &caller {
        Some(c) => c.peer.clone(),
        None => req
            .extensions()
            .get::<ConnInfo>()
            .map(|c| c.peer.to_string())
            .unwrap_or_default(),
    };

    let res = next.run(req).await;
    let elapsed = start.elapsed();
    let code = code_label(response_code(&res));
    let role = caller.as_ref().map(|c| c.identity.role()).unwrap_or_default();
    let correlation_id = caller.as_ref().map(|c| c.correlation_id.as_str()).unwrap_or_default();
    let duration_ms = elapsed.as_millis() as u64;

    match kind {
        CallKind::Unary => {
            if elapsed > SLOW_CALL {
                tracing::warn!(method = %method, duration_ms, peer = %peer, role, correlation_id, status = %code, "Slow RPC call");
            }
            tracing::debug!(method = %method, duration_ms, peer = %peer, role, correlation_id, status = %code, "RPC call");
        }
        CallKind::Stream => {
            tracing::debug!(method = %method, duration_ms, peer = %peer, status = %code, "RPC stream");
        }
    }
    res
}

async fn metrics_interceptor(req: Request, next: Next) -> Response {
    let start = Instant::now();
    let kind = kind_of(&req);
    let method = req.uri().path().to_string();
    let role = req
        .extensions()
        .get::<CallerContext>()
        .map(|c| c.identity.role().to_string())
        .unwrap_or_else(|| GUEST_ROLE.to_string());

    let res = next.run(req).await;
    let code = code_label(response_code(&res));
    match kind {
        CallKind::Unary => metrics::record_rpc_call(&method, &role, &code, start),
        CallKind::Stream => metrics::record_rpc_stream(&method, &code),
    }
    res
}

async fn authz_interceptor(State(authz): State<Arc<Authz>>, req: Request, next: Next) -> Response {
    if kind_of(&req) == CallKind::Stream {
        return next.run(req).await;
    }

    let guest;
    let identity = match req.extensions().get::<CallerContext>() {
        Some(c) => &c.identity,
        None => {
            guest = Identity::guest("unknown");
            &guest
        }
    };
    match authz.check(req.uri().path(), identity) {
        Ok(()) => next.run(req).await,
        Err(denial) => denied(denial, req.uri().path()).into_rpc_response(),
    }
}
