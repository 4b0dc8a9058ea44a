//! Multiplexed service host.
//!
//! Hosts pluggable services behind one set of listening sockets that speak
//! both REST (HTTP/1.1, HTTP/2) and RPC (gRPC over HTTP/2), with or without
//! TLS.
//!
//! # Architecture Overview
//!
//! ```text
//!                    ┌──────────────────────────────────────────────────────┐
//!                    │                        HOST                          │
//!                    │                                                      │
//!   Client ──────────┼─▶ net::listener ─▶ net::mux ─┬─▶ rpc::interceptor ──┐ │
//!                    │   (one socket per  (sniff)   │   (identity, logging, │ │
//!                    │    address)                  │    metrics, authz)    │ │
//!                    │                   TLS ───────┤                       ▼ │
//!                    │                              └─▶ http::pipeline ─▶ services
//!                    │                                  (CORS … readiness)    │
//!                    │                                                      │
//!                    │  ┌────────────────────────────────────────────────┐  │
//!                    │  │              Cross-Cutting Concerns             │  │
//!                    │  │  config · security · observability · lifecycle  │  │
//!                    │  │  discovery                                      │  │
//!                    │  └────────────────────────────────────────────────┘  │
//!                    └──────────────────────────────────────────────────────┘
//! ```

// Core subsystems
pub mod config;
pub mod host;
pub mod http;
pub mod net;
pub mod rpc;

// Collaborators and shipped services
pub mod discovery;
pub mod services;

// Cross-cutting concerns
pub mod lifecycle;
pub mod observability;
pub mod security;

pub use config::schema::HostConfig;
pub use host::{Collaborators, Host, HostError, Service, ServiceFactories};
