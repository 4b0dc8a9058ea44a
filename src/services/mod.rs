//! Services shipped with the host binary.
//!
//! Business services live outside this crate; the status service is the
//! one every deployment carries.

pub mod status;

pub use status::StatusService;
