//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → HostConfig (validated, immutable)
//!     → snapshot handed to Host::start
//! ```
//!
//! # Design Decisions
//! - Config is immutable once a host started; only TLS material reloads
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks

pub mod loader;
pub mod schema;
pub mod validation;

pub use loader::{load_config, parse_config, ConfigError};
pub use schema::{
    AuthzConfig, CorsConfig, HostConfig, KeepAliveConfig, ObservabilityConfig, TimeoutConfig,
    TlsConfig,
};
pub use validation::{validate_config, ValidationError};
