//! REST middleware, one handler transform per file.
//!
//! Composition and order live in `http::pipeline`.

pub mod authz;
pub mod cors;
pub mod identity;
pub mod logging;
pub mod metrics;
pub mod readiness;

pub use authz::authz_layer;
pub use cors::cors_pass_through_layer;
pub use identity::identity_layer;
pub use logging::{logging_layer, AccessLog};
pub use metrics::metrics_layer;
pub use readiness::readiness_layer;
