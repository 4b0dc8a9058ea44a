//! Structured access log for REST requests.

use std::sync::Arc;
use std::time::Instant;

use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::Response;

use crate::security::identity::CallerContext;

/// Access log settings.
#[derive(Debug, Clone, Default)]
pub struct AccessLog {
    skip_paths: Vec<String>,
}

impl AccessLog {
    pub fn new(skip_paths: Vec<String>) -> Self {
        Self { skip_paths }
    }

    /// True if `path` is under one of the skipped prefixes.
    pub fn skips(&self, path: &str) -> bool {
        self.skip_paths.iter().any(|p| path.starts_with(p.as_str()))
    }
}

pub async fn logging_layer(State(log): State<Arc<AccessLog>>, req: Request, next: Next) -> Response {
    let path = req.uri().path().to_string();
    if log.skips(&path) {
        return next.run(req).await;
    }

    let start = Instant::now();
    let method = req.method().clone();
    let caller = req.extensions().get::<CallerContext>().cloned();

    let res = next.run(req).await;

    let (role, peer, correlation_id) = match &caller {
        Some(c) => (c.identity.role(), c.peer.as_str(), c.correlation_id.as_str()),
        None => ("", "", ""),
    };
    tracing::info!(
        method = %method,
        path = %path,
        status = res.status().as_u16(),
        duration_ms = start.elapsed().as_millis() as u64,
        peer,
        role,
        correlation_id,
        "HTTP request"
    );
    res
}
