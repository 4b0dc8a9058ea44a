//! Caller identity.
//!
//! # Responsibilities
//! - Describe who is calling ([`Identity`]) and carry it per request
//!   ([`CallerContext`])
//! - Pick the first applicable [`IdentityProvider`], falling back to a guest
//!   identity named after the peer
//! - Propagate or mint a correlation id
//!
//! Providers see a [`CallerRequest`], a view over the headers (or RPC
//! metadata, which travels as HTTP/2 headers) and the connection facts, so
//! the same provider serves REST and RPC.

use std::fmt;
use std::sync::Arc;

use http::HeaderMap;
use rustls::pki_types::CertificateDer;
use serde::Serialize;

use crate::net::connection::ConnInfo;

/// Role assigned to callers no provider recognised.
pub const GUEST_ROLE: &str = "guest";

/// Headers a correlation id is taken from, in order.
pub const CORRELATION_HEADERS: [&str; 2] = ["x-correlation-id", "x-request-id"];

/// Who is calling.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Identity {
    role: String,
    name: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    user_id: String,
}

impl Identity {
    pub fn new(role: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            name: name.into(),
            user_id: String::new(),
        }
    }

    pub fn with_user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = user_id.into();
        self
    }

    /// Guest identity for an unrecognised caller.
    pub fn guest(peer: impl Into<String>) -> Self {
        Self::new(GUEST_ROLE, peer)
    }

    pub fn role(&self) -> &str {
        &self.role
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn is_guest(&self) -> bool {
        self.role == GUEST_ROLE
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.role, self.name)
    }
}

/// What an identity provider gets to look at.
#[derive(Debug, Clone, Copy)]
pub struct CallerRequest<'a> {
    pub headers: &'a HeaderMap,
    pub conn: Option<&'a ConnInfo>,
}

impl<'a> CallerRequest<'a> {
    pub fn new(headers: &'a HeaderMap, conn: Option<&'a ConnInfo>) -> Self {
        Self { headers, conn }
    }

    /// Token of an `Authorization: Bearer` header.
    pub fn bearer_token(&self) -> Option<&'a str> {
        let value = self.headers.get(http::header::AUTHORIZATION)?.to_str().ok()?;
        let (scheme, token) = value.split_once(' ')?;
        scheme.eq_ignore_ascii_case("bearer").then(|| token.trim())
    }

    /// Client certificate chain, leaf first. Empty for plaintext peers.
    pub fn peer_certificates(&self) -> &'a [CertificateDer<'static>] {
        self.conn.map(|c| c.peer_certificates.as_slice()).unwrap_or_default()
    }

    pub fn peer(&self) -> String {
        self.conn
            .map(|c| c.peer.to_string())
            .unwrap_or_else(|| "unknown".to_string())
    }
}

/// Error returned by an applicable provider that could not map the caller.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct IdentityError(pub String);

/// Maps transport credentials to an identity.
pub trait IdentityProvider: Send + Sync {
    /// True if the request carries credentials this provider understands.
    fn applicable(&self, req: &CallerRequest<'_>) -> bool;

    /// Map the request to an identity.
    fn identity(&self, req: &CallerRequest<'_>) -> Result<Identity, IdentityError>;
}

/// Request-scoped caller facts, stored as a request extension.
#[derive(Debug, Clone, Serialize)]
pub struct CallerContext {
    pub identity: Identity,
    pub correlation_id: String,
    pub peer: String,
}

/// Runs the configured providers in order.
#[derive(Clone, Default)]
pub struct IdentityResolver {
    providers: Arc<Vec<Arc<dyn IdentityProvider>>>,
}

impl fmt::Debug for IdentityResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdentityResolver")
            .field("providers", &self.providers.len())
            .finish()
    }
}

impl IdentityResolver {
    pub fn new(providers: Vec<Arc<dyn IdentityProvider>>) -> Self {
        Self {
            providers: Arc::new(providers),
        }
    }

    /// Resolve the caller. Only an applicable provider that fails yields an
    /// error; no applicable provider means a guest.
    pub fn resolve(&self, req: &CallerRequest<'_>) -> Result<CallerContext, IdentityError> {
        let peer = req.peer();
        let correlation_id = correlation_id(req.headers);

        let identity = match self.providers.iter().find(|p| p.applicable(req)) {
            Some(provider) => provider.identity(req)?,
            None => Identity::guest(peer.clone()),
        };

        Ok(CallerContext {
            identity,
            correlation_id,
            peer,
        })
    }
}

/// The caller supplied correlation id, or a fresh one.
pub fn correlation_id(headers: &HeaderMap) -> String {
    CORRELATION_HEADERS
        .iter()
        .filter_map(|name| headers.get(*name))
        .filter_map(|v| v.to_str().ok())
        .map(str::trim)
        .find(|v| !v.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::connection::PeerAddr;
    use http::HeaderValue;

    struct Tokens;

    impl IdentityProvider for Tokens {
        fn applicable(&self, req: &CallerRequest<'_>) -> bool {
            req.bearer_token().is_some()
        }

        fn identity(&self, req: &CallerRequest<'_>) -> Result<Identity, IdentityError> {
            match req.bearer_token() {
                Some("admin-token") => Ok(Identity::new("admin", "alice").with_user_id("1")),
                _ => Err(IdentityError("unknown token".to_string())),
            }
        }
    }

    fn conn() -> ConnInfo {
        ConnInfo::plain(PeerAddr::Tcp("10.0.0.7:5000".parse().unwrap()))
    }

    #[test]
    fn unknown_caller_is_guest_named_after_peer() {
        let resolver = IdentityResolver::new(vec![Arc::new(Tokens)]);
        let headers = HeaderMap::new();
        let conn = conn();
        let caller = resolver.resolve(&CallerRequest::new(&headers, Some(&conn))).unwrap();
        assert!(caller.identity.is_guest());
        assert_eq!(caller.identity.name(), "10.0.0.7:5000");
        assert!(!caller.correlation_id.is_empty());
    }

    #[test]
    fn applicable_provider_maps_identity() {
        let resolver = IdentityResolver::new(vec![Arc::new(Tokens)]);
        let mut headers = HeaderMap::new();
        headers.insert("authorization", HeaderValue::from_static("Bearer admin-token"));
        headers.insert("x-request-id", HeaderValue::from_static("req-42"));
        let caller = resolver.resolve(&CallerRequest::new(&headers, None)).unwrap();
        assert_eq!(caller.identity.role(), "admin");
        assert_eq!(caller.identity.user_id(), "1");
        assert_eq!(caller.correlation_id, "req-42");
    }

    #[test]
    fn failing_provider_is_an_error() {
        let resolver = IdentityResolver::new(vec![Arc::new(Tokens)]);
        let mut headers = HeaderMap::new();
        headers.insert("authorization", HeaderValue::from_static("bearer nope"));
        assert!(resolver.resolve(&CallerRequest::new(&headers, None)).is_err());
    }

    #[test]
    fn correlation_header_precedence() {
        let mut headers = HeaderMap::new();
        headers.insert("x-request-id", HeaderValue::from_static("second"));
        headers.insert("x-correlation-id", HeaderValue::from_static("first"));
        assert_eq!(correlation_id(&headers), "first");
    }
}
