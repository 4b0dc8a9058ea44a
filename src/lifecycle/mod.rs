//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Shutdown (shutdown.rs):
//!     Host::close → stop signal → per server pair:
//!         secure   → forced
//!         insecure → graceful, forced after the deadline
//!
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → binary calls Host::close
//! ```
//!
//! # Design Decisions
//! - Ordered shutdown: close services, stop accepting, drain, release sockets
//! - Shutdown has a deadline: connections still open after it are dropped

pub mod shutdown;
pub mod signals;

pub use shutdown::{ServerPair, ShutdownPath, StopSignal};
