//! Request metrics for REST requests.

use std::time::Instant;

use axum::extract::Request;
use axum::middleware::Next;
use axum::response::Response;

use crate::observability::metrics;
use crate::security::identity::{CallerContext, GUEST_ROLE};

pub async fn metrics_layer(req: Request, next: Next) -> Response {
    let start = Instant::now();
    let method = req.method().to_string();
    let role = req
        .extensions()
        .get::<CallerContext>()
        .map(|c| c.identity.role().to_string())
        .unwrap_or_else(|| GUEST_ROLE.to_string());

    let res = next.run(req).await;
    metrics::record_http_request(&method, res.status().as_u16(), &role, start);
    res
}
