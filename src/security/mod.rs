//! Security subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming request or call:
//!     → identity.rs (first applicable provider, else guest)
//!     → CallerContext stored in request extensions
//!     → authz.rs (longest path rule decides)
//!     → handler
//! ```
//!
//! # Design Decisions
//! - Fail closed: a path without a rule is denied
//! - Guests are denied with "unauthenticated", known callers with "forbidden"
//! - Providers are collaborators; this crate ships none

pub mod authz;
pub mod identity;

pub use authz::{Authz, AuthzError, Denial};
pub use identity::{
    CallerContext, CallerRequest, Identity, IdentityError, IdentityProvider, IdentityResolver,
    GUEST_ROLE,
};
