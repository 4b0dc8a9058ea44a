//! RPC subsystem.
//!
//! # Data Flow
//! ```text
//! HTTP/2 call (application/grpc)
//!     → interceptor.rs (identity, logging, metrics, authz)
//!     → registry.rs (tonic routes by /package.Service/Method)
//!     → service
//! ```
//!
//! # Design Decisions
//! - Services are tonic services registered at start; the method table
//!   decides the unary or stream interceptor path
//! - status.rs is the single place errors become status codes

pub mod interceptor;
pub mod registry;
pub mod status;

pub use interceptor::{InterceptorChain, SLOW_CALL};
pub use registry::{CallKind, RpcMethods, RpcRegistry};
