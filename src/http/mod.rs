//! HTTP protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! connection (from the serve context)
//!     → server.rs (hyper HTTP/1, HTTP/2 or auto-detected)
//!     → pipeline.rs (CORS → identity → metrics → logging → authz → readiness)
//!     → service routes, or the JSON not-found fallback
//!     → response.rs (structured errors)
//! ```

pub mod middleware;
pub mod pipeline;
pub mod response;
pub mod server;

pub use pipeline::{Pipeline, PipelineError};
pub use response::{ApiError, ErrorCode};
pub use server::{Protocol, ProtocolServer, ServerRole};
