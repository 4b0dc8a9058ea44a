//! Authorization decision for REST requests.

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};

use crate::http::response::ApiError;
use crate::security::authz::{Authz, Denial};
use crate::security::identity::{CallerContext, Identity};

pub async fn authz_layer(State(authz): State<Arc<Authz>>, req: Request, next: Next) -> Response {
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
        Err(denial) => denied(denial, req.uri().path()).into_response(),
    }
}

/// Error for a refused request or call.
pub fn denied(denial: Denial, path: &str) -> ApiError {
    match denial {
        Denial::Unauthenticated => ApiError::unauthorized(format!("the path {path} requires authentication")),
        Denial::Forbidden => ApiError::forbidden(format!("the caller is not permitted to access {path}")),
    }
}
