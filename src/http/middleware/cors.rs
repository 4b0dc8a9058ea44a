//! CORS with preflight pass-through.
//!
//! `CorsLayer` answers preflight requests itself. With pass-through enabled
//! the policy headers are computed by the same layer and merged into the
//! response of the next handler, which sees the `OPTIONS` request.

use std::convert::Infallible;

use axum::body::Body;
use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::Response;
use http::HeaderMap;
use tower::{Layer, ServiceExt};
use tower_http::cors::CorsLayer;

pub async fn cors_pass_through_layer(
    State(cors): State<CorsLayer>,
    req: Request,
    next: Next,
) -> Response {
    let headers = policy_headers(&cors, &req).await;
    let mut res = next.run(req).await;
    res.headers_mut().extend(headers);
    res
}

/// Headers the policy adds for a request with the same head as `req`.
fn policy_headers(cors: &CorsLayer, req: &Request) -> impl std::future::Future<Output = HeaderMap> + Send {
    let mut head = Request::new(Body::empty());
    *head.method_mut() = req.method().clone();
    *head.uri_mut() = req.uri().clone();
    *head.headers_mut() = req.headers().clone();

    let empty = tower::service_fn(|_: Request| async { Ok::<_, Infallible>(Response::new(Body::empty())) });
    let svc = cors.layer(empty);
    async move {
        match svc.oneshot(head).await {
            Ok(res) => res.into_parts().0.headers,
            Err(never) => match never {},
        }
    }
}
