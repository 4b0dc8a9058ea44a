//! Service host subsystem.
//!
//! # Data Flow
//! ```text
//! Host::start
//!     → validate config, load TLS material
//!     → resolve listeners (net::listener, every socket bound)
//!     → run service factories (service.rs)
//!     → build REST pipeline and RPC interceptor chain
//!     → start one accept loop per serve context (serve.rs)
//!     → publish services to discovery
//!
//! Host::close
//!     → close services, fire stop signal
//!     → per context: shut down each server pair, stop accepting, release socket
//! ```
//!
//! # Design Decisions
//! - Start is all-or-nothing: any failure closes whatever was built and
//!   returns the error; no usable host escapes a failed start
//! - Post-start transport failures go to a bounded error channel and never
//!   stop the host
//! - Close is idempotent

pub mod metadata;
pub mod serve;
pub mod service;

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::SystemTime;

use axum::Router;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::Instrument;

use crate::config::{validate_config, HostConfig, ValidationError};
use crate::discovery::{Auditor, DiscoveryError};
use crate::http::middleware::AccessLog;
use crate::http::pipeline::{not_found, Pipeline, PipelineError};
use crate::lifecycle::shutdown::StopSignal;
use crate::net::listener::{resolve_listeners, ListenAddr, ListenerError};
use crate::net::tls::{TlsError, TlsMaterial};
use crate::observability::metrics;
use crate::rpc::{InterceptorChain, RpcRegistry};
use crate::security::authz::{Authz, AuthzError};
use crate::security::identity::IdentityResolver;

pub use serve::{Apps, ErrorSink, ServeContext, ServeOptions};
pub use service::{
    BoxError, Collaborators, RouteRegistrator, RpcRegistrator, Service, ServiceContext,
    ServiceFactories, ServiceFactory, ServiceRegistry,
};

/// Error type for the host.
#[derive(Debug, thiserror::Error)]
pub enum HostError {
    #[error("invalid configuration: {}", join_errors(.0))]
    InvalidConfig(Vec<ValidationError>),

    #[error(transparent)]
    Tls(#[from] TlsError),

    #[error(transparent)]
    Listener(#[from] ListenerError),

    #[error(transparent)]
    Authz(#[from] AuthzError),

    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    #[error("service factory is not registered: {0:?}")]
    UnknownService(String),

    #[error("service factory {service:?} failed: {source}")]
    Factory { service: String, source: BoxError },

    #[error("service {0:?} panicked while registering routes")]
    Registration(String),

    #[error(transparent)]
    Discovery(#[from] DiscoveryError),

    #[error("failed to serve {addr}: {reason}")]
    Serve { addr: String, reason: String },

    #[error("accept failed on {addr}: {source}")]
    Accept { addr: String, source: std::io::Error },

    #[error("connection from {peer} failed: {source}")]
    Connection { peer: String, source: std::io::Error },
}

fn join_errors(errors: &[ValidationError]) -> String {
    errors.iter().map(ToString::to_string).collect::<Vec<_>>().join("; ")
}

/// A running service host.
pub struct Host {
    name: Arc<str>,
    config: HostConfig,
    started_at: SystemTime,
    hostname: String,
    local_ip: IpAddr,
    local_addrs: Vec<ListenAddr>,
    services: Arc<ServiceRegistry>,
    contexts: Mutex<BTreeMap<String, ServeContext>>,
    stop: StopSignal,
    errors: Mutex<Option<mpsc::Receiver<HostError>>>,
    auditor: Option<Arc<dyn Auditor>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    span: tracing::Span,
}

impl std::fmt::Debug for Host {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Host")
            .field("name", &self.name)
            .field("local_addrs", &self.local_addrs)
            .field("services", &self.services)
            .field("stopped", &self.stop.is_stopped())
            .finish_non_exhaustive()
    }
}

impl Host {
    /// Build and start a host. On error every socket opened and every
    /// service built so far is closed again.
    pub async fn start(
        name: impl Into<String>,
        config: HostConfig,
        collaborators: Collaborators,
        factories: &ServiceFactories,
    ) -> Result<Host, HostError> {
        let name: Arc<str> = Arc::from(name.into());
        let span = tracing::info_span!("host", host = %name);
        start(name, config, collaborators, factories, span.clone())
            .instrument(span)
            .await
    }

    /// Stop serving. Only the first call does any work.
    pub async fn close(&self) {
        if !self.stop.trigger() {
            return;
        }
        self.close_inner().instrument(self.span.clone()).await;
    }

    async fn close_inner(&self) {
        tracing::info!("Closing host");
        self.services.close_all();

        let deadline = self.config.timeout.shutdown_deadline();
        let contexts = std::mem::take(&mut *lock(&self.contexts));
        for (_, mut ctx) in contexts {
            ctx.shutdown(deadline).await;
        }

        let tasks = std::mem::take(&mut *lock(&self.tasks));
        for task in tasks {
            if let Err(e) = task.await {
                tracing::error!(error = %e, "Background task failed");
            }
        }
        tracing::info!("Host closed");
    }

    /// True when every service is ready.
    pub fn is_ready(&self) -> bool {
        let unready = self.services.first_unready();
        if let Some(service) = unready {
            tracing::info!(service, "Service is not ready");
        }
        let ready = unready.is_none();
        metrics::record_host_ready(&self.name, ready);
        ready
    }

    pub fn service(&self, name: &str) -> Option<Arc<dyn Service>> {
        self.services.get(name)
    }

    pub fn services(&self) -> &Arc<ServiceRegistry> {
        &self.services
    }

    /// Receiver for post-start transport errors. Available once.
    pub fn take_errors(&self) -> Option<mpsc::Receiver<HostError>> {
        lock(&self.errors).take()
    }

    /// Raise an audit event through the auditor, or log it when none is
    /// configured.
    pub fn audit(
        &self,
        source: &str,
        event_type: &str,
        identity: &str,
        correlation_id: &str,
        sequence: u64,
        message: &str,
    ) {
        match &self.auditor {
            Some(auditor) => auditor.audit(source, event_type, identity, correlation_id, sequence, message),
            None => tracing::info!(
                "audit:{source}:{event_type}:{identity}:{correlation_id}:{sequence}:{message}"
            ),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    pub fn started_at(&self) -> SystemTime {
        self.started_at
    }

    pub fn listen_urls(&self) -> &[String] {
        &self.config.listen_urls
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn local_ip(&self) -> IpAddr {
        self.local_ip
    }

    /// Addresses actually bound, one per serve context.
    pub fn local_addrs(&self) -> &[ListenAddr] {
        &self.local_addrs
    }

    pub fn is_closed(&self) -> bool {
        self.stop.is_stopped()
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

async fn start(
    name: Arc<str>,
    config: HostConfig,
    collaborators: Collaborators,
    factories: &ServiceFactories,
    span: tracing::Span,
) -> Result<Host, HostError> {
    tracing::info!(listen_urls = ?config.listen_urls, services = ?config.services, "Starting host");
    validate_config(&config).map_err(HostError::InvalidConfig)?;
    let started_at = SystemTime::now();

    let tls = match config.server_tls.as_ref().filter(|t| !t.is_empty()) {
        Some(settings) => Some(Arc::new(TlsMaterial::load(settings)?)),
        None => None,
    };

    let options = ServeOptions::from(&config);
    let contexts = resolve_listeners(&config.listen_urls, tls.clone(), &options).await?;

    let services = match build_services(&name, &config, &collaborators, factories, started_at) {
        Ok(services) => Arc::new(services),
        Err(e) => {
            tracing::error!(error = %e, "Failed to build services");
            return Err(e);
        }
    };

    let apps = match build_apps(&config, &collaborators, &services) {
        Ok(apps) => apps,
        Err(e) => {
            tracing::error!(error = %e, "Failed to build request pipelines");
            services.close_all();
            return Err(e);
        }
    };

    let (errors_tx, errors_rx) = mpsc::channel(3 * contexts.len().max(1));
    let local_addrs = contexts.values().filter_map(|c| c.local_addr().cloned()).collect();
    let host = Host {
        name: Arc::clone(&name),
        started_at,
        hostname: metadata::hostname(),
        local_ip: metadata::local_ip(),
        local_addrs,
        services,
        contexts: Mutex::new(contexts),
        stop: StopSignal::new(),
        errors: Mutex::new(Some(errors_rx)),
        auditor: collaborators.auditor.clone(),
        tasks: Mutex::new(Vec::new()),
        span: span.clone(),
        config,
    };

    if let Err(e) = serve_all(&host, &apps, errors_tx) {
        tracing::error!(error = %e, "Failed to start serving");
        host.close().await;
        return Err(e);
    }

    if let Some(discovery) = &collaborators.discovery {
        for service in host.services.iter() {
            if let Err(e) = discovery.register(&name, Arc::clone(service)) {
                tracing::error!(service = service.name(), error = %e, "Failed to publish service");
                host.close().await;
                return Err(e.into());
            }
        }
    }

    if let Some(tls) = tls {
        lock(&host.tasks).push(tls.spawn_reloader(host.stop.subscribe()));
    }

    let ready = host.is_ready();
    tracing::info!(ready, services = host.services.len(), "Host started");
    Ok(host)
}

fn build_services(
    name: &str,
    config: &HostConfig,
    collaborators: &Collaborators,
    factories: &ServiceFactories,
    started_at: SystemTime,
) -> Result<ServiceRegistry, HostError> {
    let mut ctx = ServiceContext::new(name, config, collaborators, started_at);
    for service in &config.services {
        let result = match factories.get(service) {
            Some(factory) => (**factory)(&mut ctx).map_err(|source| HostError::Factory {
                service: service.clone(),
                source,
            }),
            None => Err(HostError::UnknownService(service.clone())),
        };
        if let Err(e) = result {
            ctx.into_registry().close_all();
            return Err(e);
        }
    }
    Ok(ctx.into_registry())
}

fn build_apps(
    config: &HostConfig,
    collaborators: &Collaborators,
    services: &Arc<ServiceRegistry>,
) -> Result<Apps, HostError> {
    let resolver = IdentityResolver::new(collaborators.identity_providers.clone());
    let authz = if config.authz.has_rules() {
        Some(Arc::new(Authz::new(&config.authz)?))
    } else {
        None
    };

    let mut rest = Router::new();
    let mut rpc = RpcRegistry::new();
    for service in services.iter() {
        if let Some(registrator) = service.as_route_registrator() {
            rest = catch_unwind(AssertUnwindSafe(|| registrator.register_routes(rest)))
                .map_err(|_| HostError::Registration(service.name().to_string()))?;
            tracing::debug!(service = service.name(), "REST routes registered");
        }
        if let Some(registrator) = service.as_rpc_registrator() {
            registrator.register_rpc(&mut rpc);
            tracing::debug!(service = service.name(), "RPC services registered");
        }
    }

    let pipeline = Pipeline::new(
        &config.cors,
        resolver.clone(),
        AccessLog::new(config.logger_skip_paths.clone()),
        authz.clone(),
        Arc::clone(services),
    )?;
    tracing::debug!(stages = ?pipeline.stage_names(), "REST pipeline");
    let rest = pipeline.wrap(rest.fallback(not_found));

    let (rpc_router, methods) = rpc.into_parts();
    let rpc = InterceptorChain::new(methods, resolver, authz).wrap(rpc_router);
    Ok(Apps { rest, rpc })
}

fn serve_all(host: &Host, apps: &Apps, errors_tx: mpsc::Sender<HostError>) -> Result<(), HostError> {
    let sink = ErrorSink::new(Arc::clone(&host.name), errors_tx, host.stop.subscribe());
    let mut contexts = lock(&host.contexts);
    for ctx in contexts.values_mut() {
        ctx.start(apps, sink.clone(), host.span.clone())?;
    }
    Ok(())
}
