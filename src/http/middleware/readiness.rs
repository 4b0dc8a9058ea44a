//! Readiness gate.

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};

use crate::host::service::ServiceRegistry;
use crate::http::response::ApiError;

/// Reject traffic while any registered service is not ready.
pub async fn readiness_layer(
    State(services): State<Arc<ServiceRegistry>>,
    req: Request,
    next: Next,
) -> Response {
    if let Some(service) = services.first_unready() {
        tracing::debug!(service, path = %req.uri().path(), "Rejecting request, service not ready");
        return ApiError::not_ready().into_response();
    }
    next.run(req).await
}
