//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Check that every authz and CORS setting can be turned into a policy
//! - Validate value ranges (reload intervals > 0)
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: HostConfig → Result<(), Vec<ValidationError>>
//! - Listen URL schemes are checked again by the listener resolver, which
//!   also knows whether TLS material is present

use crate::config::schema::HostConfig;

/// A single semantic problem in a configuration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("host name must not be empty")]
    EmptyName,

    #[error("at least one listen URL is required")]
    NoListenUrls,

    #[error("listen URL must not be empty")]
    EmptyListenUrl,

    #[error("authz allow rule {0:?} must have the form path:role,role")]
    MalformedAllowRule(String),

    #[error("authz path {0:?} must start with '/'")]
    RelativeAuthzPath(String),

    #[error("CORS credentials cannot be combined with a wildcard origin")]
    CredentialsWithWildcardOrigin,

    #[error("server_tls.reload_interval_secs must be greater than zero")]
    ZeroReloadInterval,

    #[error("server_tls requires both cert and key")]
    IncompleteTls,
}

/// Validate the semantic consistency of a configuration.
pub fn validate_config(config: &HostConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.name.trim().is_empty() {
        errors.push(ValidationError::EmptyName);
    }

    if config.listen_urls.is_empty() {
        errors.push(ValidationError::NoListenUrls);
    }
    if config.listen_urls.iter().any(|u| u.trim().is_empty()) {
        errors.push(ValidationError::EmptyListenUrl);
    }

    for rule in &config.authz.allow {
        match rule.split_once(':') {
            Some((path, roles)) if !path.is_empty() && !roles.trim().is_empty() => {
                if !path.starts_with('/') {
                    errors.push(ValidationError::RelativeAuthzPath(path.to_string()));
                }
            }
            _ => errors.push(ValidationError::MalformedAllowRule(rule.clone())),
        }
    }
    for path in config.authz.allow_any.iter().chain(&config.authz.allow_any_role) {
        if !path.starts_with('/') {
            errors.push(ValidationError::RelativeAuthzPath(path.clone()));
        }
    }

    if config.cors.enabled
        && config.cors.allow_credentials
        && config.cors.allowed_origins.iter().any(|o| o == "*")
    {
        errors.push(ValidationError::CredentialsWithWildcardOrigin);
    }

    if let Some(tls) = &config.server_tls {
        // An entirely empty section means "no TLS"; half of one is a mistake.
        if tls.cert.is_empty() != tls.key.is_empty() {
            errors.push(ValidationError::IncompleteTls);
        }
        if tls.reload_interval_secs == 0 {
            errors.push(ValidationError::ZeroReloadInterval);
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::TlsConfig;

    #[test]
    fn default_config_is_valid() {
        assert!(validate_config(&HostConfig::default()).is_ok());
    }

    #[test]
    fn collects_every_error() {
        let mut cfg = HostConfig::default();
        cfg.name = " ".into();
        cfg.listen_urls.clear();
        cfg.authz.allow = vec!["/v1/a".into(), "v1/b:admin".into()];
        cfg.authz.allow_any = vec!["/v1/status".into()];

        let errors = validate_config(&cfg).unwrap_err();
        assert_eq!(
            errors,
            vec![
                ValidationError::EmptyName,
                ValidationError::NoListenUrls,
                ValidationError::MalformedAllowRule("/v1/a".into()),
                ValidationError::RelativeAuthzPath("v1/b".into()),
            ]
        );
    }

    #[test]
    fn wildcard_origin_with_credentials_is_rejected() {
        let mut cfg = HostConfig::default();
        cfg.cors.enabled = true;
        cfg.cors.allow_credentials = true;
        cfg.cors.allowed_origins = vec!["*".into()];
        assert_eq!(
            validate_config(&cfg).unwrap_err(),
            vec![ValidationError::CredentialsWithWildcardOrigin]
        );
    }

    #[test]
    fn half_configured_tls_is_rejected() {
        let mut cfg = HostConfig::default();
        cfg.server_tls = Some(TlsConfig {
            cert: "/tmp/c.pem".into(),
            key: String::new(),
            trusted_ca: None,
            crl: None,
            cipher_suites: vec![],
            client_cert_auth: false,
            reload_interval_secs: 0,
            watch_files: false,
        });
        let errors = validate_config(&cfg).unwrap_err();
        assert!(errors.contains(&ValidationError::IncompleteTls));
        assert!(errors.contains(&ValidationError::ZeroReloadInterval));
    }
}
