//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! listen URLs
//!     → listener.rs (parse, merge per address, bind every socket)
//!     → accepted stream (TCP keepalive, nodelay)
//!     → mux.rs (sniff: HTTP/2 preface, TLS hello or plain HTTP)
//!     → tls.rs (handshake with the live, reloadable configuration)
//!     → connection.rs (peer facts, tracking for shutdown)
//! ```
//!
//! # Design Decisions
//! - Sockets are bound while resolving so configuration errors surface
//!   before anything serves
//! - TLS material reloads in place; existing connections keep the
//!   configuration they handshook with

pub mod connection;
pub mod listener;
pub mod mux;
pub mod tls;
pub mod watcher;

pub use connection::{ConnInfo, PeerAddr};
pub use listener::{resolve_listeners, ListenAddr, ListenUrl, ListenerError, Network, Scheme};
pub use tls::{TlsError, TlsMaterial};
