use std::any::Any;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::SystemTime;

use axum::extract::{Extension, State};
use axum::http::header::CONTENT_TYPE;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Serialize;

use crate::host::metadata;
use crate::host::service::{BoxError, RouteRegistrator, Service, ServiceContext};
use crate::http::response::ApiError;
use crate::security::identity::CallerContext;

pub const SERVICE_NAME: &str = "status";

#[derive(Debug, Serialize)]
pub struct VersionInfo {
    pub name: &'static str,
    pub version: &'static str,
}

#[derive(Debug, Clone, Serialize)]
pub struct ServerInfo {
    pub name: String,
    pub hostname: String,
    pub local_ip: IpAddr,
    pub listen_urls: Vec<String>,
    /// Seconds since the epoch.
    pub started_at: u64,
    pub uptime_secs: u64,
}

#[derive(Debug, Clone)]
struct StatusState {
    host_name: String,
    hostname: String,
    local_ip: IpAddr,
    listen_urls: Vec<String>,
    started_at: SystemTime,
    metrics: Option<PrometheusHandle>,
}

/// Version, server and caller information plus a liveness probe.
#[derive(Debug)]
pub struct StatusService {
    state: Arc<StatusState>,
}

impl StatusService {
    pub fn new(ctx: &ServiceContext<'_>) -> Self {
        Self {
            state: Arc::new(StatusState {
                host_name: ctx.host_name().to_string(),
                hostname: metadata::hostname(),
                local_ip: metadata::local_ip(),
                listen_urls: ctx.listen_urls().to_vec(),
                started_at: ctx.started_at(),
                metrics: ctx.get::<PrometheusHandle>().cloned(),
            }),
        }
    }

    /// Factory for [`crate::host::ServiceFactories::register`].
    pub fn factory(ctx: &mut ServiceContext<'_>) -> Result<(), BoxError> {
        let service = Arc::new(StatusService::new(ctx));
        ctx.add_service(service);
        Ok(())
    }
}

impl Service for StatusService {
    fn name(&self) -> &str {
        SERVICE_NAME
    }

    fn as_route_registrator(&self) -> Option<&dyn RouteRegistrator> {
        Some(self)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl RouteRegistrator for StatusService {
    fn register_routes(&self, router: Router) -> Router {
        let mut routes = Router::new()
            .route("/v1/status/version", get(version))
            .route("/v1/status/server", get(server))
            .route("/v1/status/caller", get(caller))
            .route("/healthz", get(healthz));
        if self.state.metrics.is_some() {
            routes = routes.route("/metrics", get(render_metrics));
        }
        router.merge(routes.with_state(Arc::clone(&self.state)))
    }
}

async fn version() -> Json<VersionInfo> {
    Json(VersionInfo {
        name: env!("CARGO_PKG_NAME"),
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn server(State(state): State<Arc<StatusState>>) -> Json<ServerInfo> {
    let now = SystemTime::now();
    Json(ServerInfo {
        name: state.host_name.clone(),
        hostname: state.hostname.clone(),
        local_ip: state.local_ip,
        listen_urls: state.listen_urls.clone(),
        started_at: state
            .started_at
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default(),
        uptime_secs: now
            .duration_since(state.started_at)
            .map(|d| d.as_secs())
            .unwrap_or_default(),
    })
}

async fn caller(caller: Option<Extension<CallerContext>>) -> Result<Json<CallerContext>, ApiError> {
    caller
        .map(|Extension(c)| Json(c))
        .ok_or_else(|| ApiError::internal("caller identity was not resolved"))
}

async fn healthz() -> &'static str {
    "ALIVE"
}

async fn render_metrics(State(state): State<Arc<StatusState>>) -> Response {
    match &state.metrics {
        Some(handle) => ([(CONTENT_TYPE, "text/plain; version=0.0.4")], handle.render()).into_response(),
        None => ApiError::not_found("metrics are not enabled").into_response(),
    }
}
