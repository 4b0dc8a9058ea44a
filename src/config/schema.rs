//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for a host.
//! All types derive Serde traits for deserialization from config files.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default shutdown drain deadline.
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 3;

/// Root configuration for a service host.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct HostConfig {
    /// Host name, used as the discovery key and in logs.
    pub name: String,

    /// Human readable description.
    pub description: String,

    /// URLs to listen on: `http://`, `https://`, `unix://`, `unixs://`.
    pub listen_urls: Vec<String>,

    /// Names of the services to construct, in order.
    pub services: Vec<String>,

    /// Optional TLS material for secure listeners.
    pub server_tls: Option<TlsConfig>,

    /// Keep-alive policy for stream sockets and HTTP/2 connections.
    pub keep_alive: KeepAliveConfig,

    /// Authorization rules. No rules means no authorization layer.
    pub authz: AuthzConfig,

    /// CORS policy.
    pub cors: CorsConfig,

    /// Timeouts.
    pub timeout: TimeoutConfig,

    /// Path prefixes excluded from the access log.
    pub logger_skip_paths: Vec<String>,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            name: "trust-host".to_string(),
            description: String::new(),
            listen_urls: vec!["http://127.0.0.1:7880".to_string()],
            services: Vec::new(),
            server_tls: None,
            keep_alive: KeepAliveConfig::default(),
            authz: AuthzConfig::default(),
            cors: CorsConfig::default(),
            timeout: TimeoutConfig::default(),
            logger_skip_paths: Vec::new(),
            observability: ObservabilityConfig::default(),
        }
    }
}

/// TLS material for the listeners.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TlsConfig {
    /// Path to certificate chain file (PEM).
    pub cert: String,

    /// Path to private key file (PEM).
    pub key: String,

    /// Path to the bundle of CAs trusted for client certificates (PEM).
    #[serde(default)]
    pub trusted_ca: Option<String>,

    /// Path to certificate revocation lists (PEM).
    #[serde(default)]
    pub crl: Option<String>,

    /// Allowed cipher suites, by IANA name. Empty means the provider defaults.
    #[serde(default)]
    pub cipher_suites: Vec<String>,

    /// Require a verified client certificate on every connection.
    #[serde(default)]
    pub client_cert_auth: bool,

    /// Interval between reloads of the key pair from disk.
    #[serde(default = "default_reload_interval_secs")]
    pub reload_interval_secs: u64,

    /// Also reload as soon as the cert or key file changes on disk.
    #[serde(default)]
    pub watch_files: bool,
}

fn default_reload_interval_secs() -> u64 {
    300
}

impl TlsConfig {
    /// Key pair material is considered absent when either path is empty.
    pub fn is_empty(&self) -> bool {
        self.cert.is_empty() || self.key.is_empty()
    }

    pub fn reload_interval(&self) -> Duration {
        Duration::from_secs(self.reload_interval_secs)
    }
}

impl std::fmt::Display for TlsConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "cert={}, key={}, trusted-ca={}, client-cert-auth={}, crl-file={}",
            self.cert,
            self.key,
            self.trusted_ca.as_deref().unwrap_or_default(),
            self.client_cert_auth,
            self.crl.as_deref().unwrap_or_default(),
        )
    }
}

/// Keep-alive configuration. Zero disables a setting.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct KeepAliveConfig {
    /// Minimum interval a client is expected to wait between pings.
    pub min_time_secs: u64,

    /// Interval between server pings.
    pub interval_secs: u64,

    /// Time to wait for a ping acknowledgement before closing.
    pub timeout_secs: u64,
}

impl KeepAliveConfig {
    pub fn min_time(&self) -> Option<Duration> {
        non_zero(self.min_time_secs)
    }

    pub fn interval(&self) -> Option<Duration> {
        non_zero(self.interval_secs)
    }

    pub fn timeout(&self) -> Option<Duration> {
        non_zero(self.timeout_secs)
    }
}

fn non_zero(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}

/// Authorization rules.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct AuthzConfig {
    /// `path:role,role` entries.
    pub allow: Vec<String>,

    /// Path prefixes open to any caller, including guests.
    pub allow_any: Vec<String>,

    /// Path prefixes open to any authenticated role.
    pub allow_any_role: Vec<String>,

    /// Log requests allowed by an `allow_any` rule.
    pub log_allowed_any: bool,

    /// Log allowed requests.
    pub log_allowed: bool,

    /// Log denied requests.
    pub log_denied: bool,
}

impl AuthzConfig {
    /// Authorization is only enforced when at least one rule is configured.
    pub fn has_rules(&self) -> bool {
        !(self.allow.is_empty() && self.allow_any.is_empty() && self.allow_any_role.is_empty())
    }
}

/// CORS policy.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct CorsConfig {
    pub enabled: bool,
    pub max_age: u64,
    pub allowed_origins: Vec<String>,
    pub allowed_methods: Vec<String>,
    pub allowed_headers: Vec<String>,
    pub exposed_headers: Vec<String>,
    pub allow_credentials: bool,
    /// Let preflight requests reach the handlers instead of answering them
    /// in the CORS stage.
    pub options_pass_through: bool,
    pub debug: bool,
}

/// Timeout configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Deadline for draining in-flight requests when the host closes.
    pub request_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            request_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
        }
    }
}

impl TimeoutConfig {
    /// Shutdown deadline; zero falls back to the default.
    pub fn shutdown_deadline(&self) -> Duration {
        let secs = if self.request_secs == 0 {
            DEFAULT_REQUEST_TIMEOUT_SECS
        } else {
            self.request_secs
        };
        Duration::from_secs(secs)
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Emit JSON lines instead of the human readable format.
    pub json_logs: bool,

    /// Enable the Prometheus endpoint.
    pub metrics_enabled: bool,

    /// Prometheus endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: false,
            metrics_enabled: false,
            metrics_address: "127.0.0.1:9090".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_toml_uses_defaults() {
        let cfg: HostConfig = toml::from_str(
            r#"
            name = "wfe"
            listen_urls = ["https://0.0.0.0:7891"]

            [server_tls]
            cert = "/tmp/cert.pem"
            key = "/tmp/key.pem"
            "#,
        )
        .unwrap();

        assert_eq!(cfg.name, "wfe");
        assert_eq!(cfg.timeout.shutdown_deadline(), Duration::from_secs(3));
        let tls = cfg.server_tls.unwrap();
        assert!(!tls.client_cert_auth);
        assert_eq!(tls.reload_interval_secs, 300);
        assert!(!cfg.authz.has_rules());
    }

    #[test]
    fn zero_request_timeout_falls_back() {
        let t = TimeoutConfig { request_secs: 0 };
        assert_eq!(t.shutdown_deadline(), Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS));
        let t = TimeoutConfig { request_secs: 7 };
        assert_eq!(t.shutdown_deadline(), Duration::from_secs(7));
    }

    #[test]
    fn keep_alive_zero_is_disabled() {
        let ka = KeepAliveConfig {
            min_time_secs: 0,
            interval_secs: 5,
            timeout_secs: 1,
        };
        assert!(ka.min_time().is_none());
        assert_eq!(ka.interval(), Some(Duration::from_secs(5)));
    }
}
