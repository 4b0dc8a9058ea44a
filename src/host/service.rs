//! Services, their capabilities and how they are constructed.
//!
//! A [`Service`] declares what it can do through the `as_*` accessors
//! instead of being probed at runtime. Services are built by
//! [`ServiceFactory`] functions that receive a [`ServiceContext`] holding
//! the already resolved collaborators.

use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::SystemTime;

use axum::Router;

use crate::config::HostConfig;
use crate::discovery::{Auditor, Discovery};
use crate::rpc::registry::RpcRegistry;
use crate::security::identity::IdentityProvider;

/// Boxed error returned by factories.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// A pluggable business unit hosted by a [`crate::host::Host`].
pub trait Service: Send + Sync + 'static {
    /// Registry key.
    fn name(&self) -> &str;

    /// Traffic is rejected while any service reports false.
    fn is_ready(&self) -> bool {
        true
    }

    /// Release resources. Called once when the host closes.
    fn close(&self) {}

    fn as_route_registrator(&self) -> Option<&dyn RouteRegistrator> {
        None
    }

    fn as_rpc_registrator(&self) -> Option<&dyn RpcRegistrator> {
        None
    }

    /// Downcast support for discovery lookups.
    fn as_any(&self) -> &dyn Any;
}

/// Capability: serves REST routes.
pub trait RouteRegistrator {
    fn register_routes(&self, router: Router) -> Router;
}

/// Capability: serves RPC services.
pub trait RpcRegistrator {
    fn register_rpc(&self, registry: &mut RpcRegistry);
}

/// Builds a service and adds it through [`ServiceContext::add_service`].
pub type ServiceFactory = Arc<dyn Fn(&mut ServiceContext<'_>) -> Result<(), BoxError> + Send + Sync>;

/// Factories by service name.
#[derive(Clone, Default)]
pub struct ServiceFactories {
    factories: BTreeMap<String, ServiceFactory>,
}

impl fmt::Debug for ServiceFactories {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.factories.keys()).finish()
    }
}

impl ServiceFactories {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(mut self, name: impl Into<String>, factory: F) -> Self
    where
        F: Fn(&mut ServiceContext<'_>) -> Result<(), BoxError> + Send + Sync + 'static,
    {
        self.factories.insert(name.into(), Arc::new(factory));
        self
    }

    pub fn get(&self, name: &str) -> Option<&ServiceFactory> {
        self.factories.get(name)
    }
}

/// Dependencies handed to service factories.
///
/// Identity providers, discovery and the auditor are the host's own
/// collaborators; anything else a service needs goes into the typed
/// extension map.
#[derive(Clone, Default)]
pub struct Collaborators {
    pub identity_providers: Vec<Arc<dyn IdentityProvider>>,
    pub discovery: Option<Arc<dyn Discovery>>,
    pub auditor: Option<Arc<dyn Auditor>>,
    extensions: http::Extensions,
}

impl fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Collaborators")
            .field("identity_providers", &self.identity_providers.len())
            .field("discovery", &self.discovery.is_some())
            .field("auditor", &self.auditor.is_some())
            .finish_non_exhaustive()
    }
}

impl Collaborators {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_identity_provider(mut self, provider: Arc<dyn IdentityProvider>) -> Self {
        self.identity_providers.push(provider);
        self
    }

    pub fn with_discovery(mut self, discovery: Arc<dyn Discovery>) -> Self {
        self.discovery = Some(discovery);
        self
    }

    pub fn with_auditor(mut self, auditor: Arc<dyn Auditor>) -> Self {
        self.auditor = Some(auditor);
        self
    }

    /// Make `value` available to factories by type.
    pub fn provide<T: Clone + Send + Sync + 'static>(mut self, value: T) -> Self {
        self.extensions.insert(value);
        self
    }

    pub fn get<T: Send + Sync + 'static>(&self) -> Option<&T> {
        self.extensions.get::<T>()
    }
}

/// What a factory sees while the host starts.
pub struct ServiceContext<'a> {
    host_name: &'a str,
    config: &'a HostConfig,
    collaborators: &'a Collaborators,
    started_at: SystemTime,
    services: BTreeMap<String, Arc<dyn Service>>,
}

impl<'a> ServiceContext<'a> {
    pub fn new(
        host_name: &'a str,
        config: &'a HostConfig,
        collaborators: &'a Collaborators,
        started_at: SystemTime,
    ) -> Self {
        Self {
            host_name,
            config,
            collaborators,
            started_at,
            services: BTreeMap::new(),
        }
    }

    pub fn host_name(&self) -> &str {
        self.host_name
    }

    pub fn config(&self) -> &HostConfig {
        self.config
    }

    pub fn listen_urls(&self) -> &[String] {
        &self.config.listen_urls
    }

    pub fn started_at(&self) -> SystemTime {
        self.started_at
    }

    pub fn collaborators(&self) -> &Collaborators {
        self.collaborators
    }

    /// Typed dependency from the collaborators' extension map.
    pub fn get<T: Send + Sync + 'static>(&self) -> Option<&T> {
        self.collaborators.get::<T>()
    }

    /// A service added by an earlier factory.
    pub fn service(&self, name: &str) -> Option<Arc<dyn Service>> {
        self.services.get(name).cloned()
    }

    /// Register `service`. A service with the same name is replaced.
    pub fn add_service(&mut self, service: Arc<dyn Service>) {
        let name = service.name().to_string();
        tracing::debug!(service = %name, "Service added");
        self.services.insert(name, service);
    }

    pub fn into_registry(self) -> ServiceRegistry {
        ServiceRegistry {
            services: self.services,
        }
    }
}

/// Services of a started host, keyed by name.
#[derive(Default)]
pub struct ServiceRegistry {
    services: BTreeMap<String, Arc<dyn Service>>,
}

impl fmt::Debug for ServiceRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.services.keys()).finish()
    }
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `service`, replacing one with the same name.
    pub fn insert(&mut self, service: Arc<dyn Service>) -> Option<Arc<dyn Service>> {
        self.services.insert(service.name().to_string(), service)
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Service>> {
        self.services.get(name).cloned()
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn Service>> {
        self.services.values()
    }

    /// Name of the first service that is not ready.
    pub fn first_unready(&self) -> Option<&str> {
        self.services
            .values()
            .find(|s| !s.is_ready())
            .map(|s| s.name())
    }

    pub fn is_ready(&self) -> bool {
        self.first_unready().is_none()
    }

    /// Close every service. A panicking close hook is logged and skipped.
    pub fn close_all(&self) {
        for service in self.services.values() {
            tracing::debug!(service = service.name(), "Closing service");
            if catch_unwind(AssertUnwindSafe(|| service.close())).is_err() {
                tracing::error!(service = service.name(), "Service close panicked");
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// Service with switchable readiness that counts close calls.
    pub(crate) struct Probe {
        pub name: String,
        pub ready: AtomicBool,
        pub closed: AtomicUsize,
    }

    impl Probe {
        pub(crate) fn new(name: &str, ready: bool) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                ready: AtomicBool::new(ready),
                closed: AtomicUsize::new(0),
            })
        }
    }

    impl Service for Probe {
        fn name(&self) -> &str {
            &self.name
        }

        fn is_ready(&self) -> bool {
            self.ready.load(Ordering::SeqCst)
        }

        fn close(&self) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    struct Panicky;

    impl Service for Panicky {
        fn name(&self) -> &str {
            "panicky"
        }

        fn close(&self) {
            panic!("close failed");
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    #[test]
    fn empty_registry_is_ready() {
        assert!(ServiceRegistry::new().is_ready());
    }

    #[test]
    fn one_unready_service_makes_registry_unready() {
        let mut registry = ServiceRegistry::new();
        registry.insert(Probe::new("a", true));
        let b = Probe::new("b", false);
        registry.insert(b.clone());
        assert!(!registry.is_ready());
        assert_eq!(registry.first_unready(), Some("b"));

        b.ready.store(true, Ordering::SeqCst);
        assert!(registry.is_ready());
        assert_eq!(registry.first_unready(), None);
    }

    #[test]
    fn latest_registration_wins() {
        let config = HostConfig::default();
        let collaborators = Collaborators::new();
        let mut ctx = ServiceContext::new("host", &config, &collaborators, SystemTime::now());
        let first = Probe::new("status", true);
        let second = Probe::new("status", false);
        ctx.add_service(first);
        ctx.add_service(second.clone());

        let registry = ctx.into_registry();
        assert_eq!(registry.len(), 1);
        let kept = registry.get("status").unwrap();
        assert!(Arc::ptr_eq(
            &(kept as Arc<dyn Service>),
            &(second as Arc<dyn Service>)
        ));
    }

    #[test]
    fn close_all_survives_panicking_service() {
        let mut registry = ServiceRegistry::new();
        registry.insert(Arc::new(Panicky));
        let probe = Probe::new("probe", true);
        registry.insert(probe.clone());
        registry.close_all();
        assert_eq!(probe.closed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn collaborators_expose_typed_dependencies() {
        #[derive(Clone)]
        struct Dsn(&'static str);
        let collaborators = Collaborators::new().provide(Dsn("postgres://db"));
        assert_eq!(collaborators.get::<Dsn>().unwrap().0, "postgres://db");
        assert!(collaborators.get::<u32>().is_none());
    }
}
