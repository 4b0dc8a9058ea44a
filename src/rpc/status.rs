//! Status classification shared by the RPC interceptors and counters.
//!
//! Three outcome shapes map onto one vocabulary ([`tonic::Code`]):
//! - a typed business error ([`ApiError`]) carries its own code
//! - a generic status ([`tonic::Status`], or a `grpc-status` header)
//! - anything else is `Unknown`

use std::error::Error;

use axum::response::Response;
use tonic::Code;

use crate::http::response::ApiError;

/// Label used in metrics and logs, e.g. `Ok` or `PermissionDenied`.
pub fn code_label(code: Code) -> String {
    format!("{code:?}")
}

/// Code of an error, looking through its source chain.
pub fn code_of(err: &(dyn Error + 'static)) -> Code {
    let mut current = Some(err);
    while let Some(e) = current {
        if let Some(api) = e.downcast_ref::<ApiError>() {
            return api.code.rpc_code();
        }
        if let Some(status) = e.downcast_ref::<tonic::Status>() {
            return status.code();
        }
        current = e.source();
    }
    Code::Unknown
}

/// Convert any handler error into a status for the wire.
pub fn to_status(err: Box<dyn Error + Send + Sync>) -> tonic::Status {
    let err = match err.downcast::<tonic::Status>() {
        Ok(status) => return *status,
        Err(err) => err,
    };
    tonic::Status::new(code_of(err.as_ref()), err.to_string())
}

impl From<ApiError> for tonic::Status {
    fn from(err: ApiError) -> Self {
        tonic::Status::new(err.code.rpc_code(), err.message)
    }
}

/// Code of a response as the interceptors see it.
///
/// Errors produced by this crate carry an [`ApiError`] extension; errors
/// produced by a service travel as trailers-only `grpc-status` headers. A
/// non-200 response without either is a plain failure.
pub fn response_code(res: &Response) -> Code {
    if let Some(err) = res.extensions().get::<ApiError>() {
        return err.code.rpc_code();
    }
    if let Some(value) = res.headers().get("grpc-status") {
        return Code::from_bytes(value.as_bytes());
    }
    if res.status() != http::StatusCode::OK {
        return Code::Unknown;
    }
    Code::Ok
}
