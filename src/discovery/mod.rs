//! Discovery and audit collaborators.
//!
//! # Responsibilities
//! - [`Discovery`]: hosts publish their services so independently built
//!   services can find one another
//! - [`Registry`]: in-process discovery keyed by `"{host}/{service}"`
//! - [`Auditor`]: sink for audit events raised through `Host::audit`
//!
//! # Design Decisions
//! - Lookups by capability go through `Service::as_any` downcasts
//! - Registering the same host/service pair twice is an error

use std::sync::Arc;

use dashmap::DashMap;

use crate::host::service::Service;

/// Error type for discovery.
#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error("service {0} is already registered")]
    AlreadyRegistered(String),
}

/// Publishes services of a host.
pub trait Discovery: Send + Sync {
    fn register(&self, host: &str, service: Arc<dyn Service>) -> Result<(), DiscoveryError>;
}

/// Receives audit events.
pub trait Auditor: Send + Sync {
    fn audit(
        &self,
        source: &str,
        event_type: &str,
        identity: &str,
        correlation_id: &str,
        sequence: u64,
        message: &str,
    );
}

/// In-process discovery registry.
#[derive(Default)]
pub struct Registry {
    entries: DashMap<String, Arc<dyn Service>>,
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("entries", &self.entries.len())
            .finish()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, host: &str, service: &str) -> Option<Arc<dyn Service>> {
        self.entries
            .get(&key(host, service))
            .map(|entry| Arc::clone(entry.value()))
    }

    /// First service, on any host, registered under `service`.
    pub fn find(&self, service: &str) -> Option<Arc<dyn Service>> {
        self.entries
            .iter()
            .find(|entry| entry.value().name() == service)
            .map(|entry| Arc::clone(entry.value()))
    }

    /// Apply `f` to every service whose concrete type is `T` until it
    /// returns true.
    pub fn find_as<T: Service>(&self, mut f: impl FnMut(&T) -> bool) -> bool {
        self.entries.iter().any(|entry| {
            entry
                .value()
                .as_any()
                .downcast_ref::<T>()
                .is_some_and(&mut f)
        })
    }

    /// Visit every registered `(key, service)` pair.
    pub fn for_each(&self, mut f: impl FnMut(&str, &Arc<dyn Service>)) {
        for entry in self.entries.iter() {
            f(entry.key(), entry.value());
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Discovery for Registry {
    fn register(&self, host: &str, service: Arc<dyn Service>) -> Result<(), DiscoveryError> {
        let key = key(host, service.name());
        match self.entries.entry(key) {
            dashmap::mapref::entry::Entry::Occupied(e) => {
                Err(DiscoveryError::AlreadyRegistered(e.key().clone()))
            }
            dashmap::mapref::entry::Entry::Vacant(e) => {
                tracing::debug!(key = %e.key(), "Service published");
                e.insert(service);
                Ok(())
            }
        }
    }
}

fn key(host: &str, service: &str) -> String {
    format!("{host}/{service}")
}
