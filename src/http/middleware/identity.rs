//! Identity extraction for REST requests.

use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};

use crate::http::response::ApiError;
use crate::net::connection::ConnInfo;
use crate::security::identity::{CallerRequest, IdentityResolver};

/// Resolve the caller and store a `CallerContext` in the request extensions.
pub async fn identity_layer(
    State(resolver): State<IdentityResolver>,
    mut req: Request,
    next: Next,
) -> Response {
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
            tracing::warn!(path = %req.uri().path(), error = %e, "Failed to identify caller");
            ApiError::unauthorized(e.to_string()).into_response()
        }
    }
}
