//! Path based authorization.
//!
//! Rules come from three lists:
//! - `allow`: `path:role,role` admits the listed roles
//! - `allow_any`: path open to every caller, guests included
//! - `allow_any_role`: path open to every authenticated (non guest) caller
//!
//! A rule covers its path and everything below it, segment-wise: `/v1/org`
//! covers `/v1/org/123` but not `/v1/organization`. The longest matching
//! rule decides; rules for the same path are merged. No matching rule means
//! deny. RPC calls are checked by their `/package.Service/Method` path.

use std::collections::{BTreeMap, BTreeSet};

use crate::config::AuthzConfig;
use crate::security::identity::Identity;

/// Error type for building authorization rules.
#[derive(Debug, thiserror::Error)]
pub enum AuthzError {
    #[error("allow rule {0:?} must be formatted as path:role,role")]
    MalformedRule(String),

    #[error("authorization path {0:?} must start with '/'")]
    RelativePath(String),
}

/// Why a call was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Denial {
    /// Guest caller on a path that needs a role.
    Unauthenticated,
    /// Authenticated caller without a permitted role.
    Forbidden,
}

#[derive(Debug, Default, Clone)]
struct Access {
    any: bool,
    any_role: bool,
    roles: BTreeSet<String>,
}

impl Access {
    fn allows(&self, identity: &Identity) -> bool {
        self.any
            || (self.any_role && !identity.is_guest())
            || self.roles.contains(identity.role())
    }
}

/// Compiled authorization rules.
#[derive(Debug, Clone)]
pub struct Authz {
    rules: BTreeMap<String, Access>,
    log_allowed: bool,
    log_allowed_any: bool,
    log_denied: bool,
}

impl Authz {
    pub fn new(cfg: &AuthzConfig) -> Result<Self, AuthzError> {
        let mut rules: BTreeMap<String, Access> = BTreeMap::new();

        for path in &cfg.allow_any {
            rules.entry(normalize(path)?).or_default().any = true;
        }
        for path in &cfg.allow_any_role {
            rules.entry(normalize(path)?).or_default().any_role = true;
        }
        for entry in &cfg.allow {
            let (path, roles) = entry
                .split_once(':')
                .ok_or_else(|| AuthzError::MalformedRule(entry.clone()))?;
            let roles: Vec<_> = roles
                .split(',')
                .map(str::trim)
                .filter(|r| !r.is_empty())
                .collect();
            if roles.is_empty() {
                return Err(AuthzError::MalformedRule(entry.clone()));
            }
            rules
                .entry(normalize(path)?)
                .or_default()
                .roles
                .extend(roles.into_iter().map(str::to_string));
        }

        Ok(Self {
            rules,
            log_allowed: cfg.log_allowed,
            log_allowed_any: cfg.log_allowed_any,
            log_denied: cfg.log_denied,
        })
    }

    /// Longest rule covering `path`.
    fn lookup<'a>(&'a self, path: &'a str) -> Option<(&'a str, &'a Access)> {
        let mut candidate = path.trim_end_matches('/');
        loop {
            let key = if candidate.is_empty() { "/" } else { candidate };
            if let Some(access) = self.rules.get(key) {
                return Some((key, access));
            }
            if candidate.is_empty() {
                return None;
            }
            candidate = match candidate.rfind('/') {
                Some(idx) => &candidate[..idx],
                None => "",
            };
        }
    }

    /// Decide whether `identity` may call `path`.
    pub fn check(&self, path: &str, identity: &Identity) -> Result<(), Denial> {
        let rule = self.lookup(path);

        match rule {
            Some((rule_path, access)) if access.allows(identity) => {
                let via_any = access.any && !access.roles.contains(identity.role());
                if (via_any && self.log_allowed_any) || (!via_any && self.log_allowed) {
                    tracing::info!(path, rule = rule_path, role = identity.role(), name = identity.name(), "Authz allowed");
                }
                Ok(())
            }
            _ => {
                if self.log_denied {
                    tracing::info!(
                        path,
                        rule = rule.map(|(p, _)| p).unwrap_or("none"),
                        role = identity.role(),
                        name = identity.name(),
                        "Authz denied"
                    );
                }
                if identity.is_guest() {
                    Err(Denial::Unauthenticated)
                } else {
                    Err(Denial::Forbidden)
                }
            }
        }
    }
}

fn normalize(path: &str) -> Result<String, AuthzError> {
    let path = path.trim();
    if !path.starts_with('/') {
        return Err(AuthzError::RelativePath(path.to_string()));
    }
    let trimmed = path.trim_end_matches('/');
    Ok(if trimmed.is_empty() {
        "/".to_string()
    } else {
        trimmed.to_string()
    })
}
