//! Listen URL resolution and socket binding.
//!
//! # Responsibilities
//! - Parse listen URLs (`http`, `https`, `unix`, `unixs`)
//! - Check scheme and TLS consistency
//! - Merge URLs that name the same address into one serve context
//! - Bind sockets immediately, closing all of them if any step fails
//!
//! # Design Decisions
//! - Listeners are bound through socket2 so the backlog and address reuse
//!   are explicit
//! - Accepted TCP streams get TCP keep-alive
//! - A unix socket file is removed when its listener is dropped

use std::collections::BTreeMap;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use socket2::{Domain, Protocol, SockRef, Socket, TcpKeepalive, Type};
use tokio::net::{TcpListener, UnixListener};

use crate::config::KeepAliveConfig;
use crate::host::serve::{ServeContext, ServeOptions};
use crate::net::connection::PeerAddr;
use crate::net::mux::BoxIo;
use crate::net::tls::TlsMaterial;

/// TCP keep-alive period applied when none is configured.
pub const DEFAULT_TCP_KEEPALIVE: Duration = Duration::from_secs(30);

/// Pending connection queue size.
const BACKLOG: i32 = 1024;

/// Error type for listener resolution.
#[derive(Debug, thiserror::Error)]
pub enum ListenerError {
    #[error("invalid listen URL {url:?}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("unsupported URL scheme {scheme:?} in {url:?}")]
    UnsupportedScheme { url: String, scheme: String },

    #[error("TLS key/cert must be provided for the url {0} with a secure scheme")]
    TlsRequired(String),

    #[error("address {addr} is configured as both {first} and {second}")]
    NetworkConflict {
        addr: String,
        first: Network,
        second: Network,
    },

    #[error("failed to resolve {addr}: {source}")]
    Resolve { addr: String, source: io::Error },

    #[error("failed to listen on {network} {addr}: {source}")]
    Bind {
        network: Network,
        addr: String,
        source: io::Error,
    },
}

/// Socket family of a listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Network {
    Tcp,
    Unix,
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Network::Tcp => f.write_str("tcp"),
            Network::Unix => f.write_str("unix"),
        }
    }
}

/// Scheme of a listen URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Http,
    Https,
    Unix,
    Unixs,
}

impl Scheme {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "http" => Some(Scheme::Http),
            "https" => Some(Scheme::Https),
            "unix" => Some(Scheme::Unix),
            "unixs" => Some(Scheme::Unixs),
            _ => None,
        }
    }

    pub fn is_secure(&self) -> bool {
        matches!(self, Scheme::Https | Scheme::Unixs)
    }

    pub fn network(&self) -> Network {
        match self {
            Scheme::Http | Scheme::Https => Network::Tcp,
            Scheme::Unix | Scheme::Unixs => Network::Unix,
        }
    }
}

/// A parsed listen URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenUrl {
    pub scheme: Scheme,
    /// `host:port` for TCP, a filesystem path for unix sockets.
    pub addr: String,
}

impl ListenUrl {
    /// Parse `raw`. A URL without a scheme is secure when TLS material is
    /// available and plaintext otherwise.
    pub fn parse(raw: &str, tls_present: bool) -> Result<Self, ListenerError> {
        let invalid = |reason: String| ListenerError::InvalidUrl {
            url: raw.to_string(),
            reason,
        };

        let with_scheme = if raw.contains("://") {
            raw.to_string()
        } else if tls_present {
            format!("https://{raw}")
        } else {
            format!("http://{raw}")
        };

        let url = url::Url::parse(&with_scheme).map_err(|e| invalid(e.to_string()))?;
        let scheme = Scheme::parse(url.scheme()).ok_or_else(|| ListenerError::UnsupportedScheme {
            url: raw.to_string(),
            scheme: url.scheme().to_string(),
        })?;

        let addr = match scheme.network() {
            Network::Tcp => {
                let host = url
                    .host_str()
                    .filter(|h| !h.is_empty())
                    .ok_or_else(|| invalid("missing host".to_string()))?;
                let port = url
                    .port()
                    .or_else(|| explicit_port(&with_scheme))
                    .ok_or_else(|| invalid("missing port".to_string()))?;
                format!("{host}:{port}")
            }
            Network::Unix => {
                let path = format!("{}{}", url.host_str().unwrap_or_default(), url.path());
                if path.is_empty() {
                    return Err(invalid("missing socket path".to_string()));
                }
                path
            }
        };

        Ok(Self { scheme, addr })
    }
}

/// Port written in the authority of `url`. `url::Url` hides a port equal to
/// the scheme default, so `http://host:80` needs this.
fn explicit_port(url: &str) -> Option<u16> {
    let rest = url.split_once("://")?.1;
    let authority = rest.split(['/', '?', '#']).next()?;
    authority.rsplit_once(':')?.1.parse().ok()
}

/// Actual local address of a bound listener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenAddr {
    Tcp(SocketAddr),
    Unix(PathBuf),
}

impl fmt::Display for ListenAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ListenAddr::Tcp(addr) => write!(f, "{addr}"),
            ListenAddr::Unix(path) => write!(f, "{}", path.display()),
        }
    }
}

/// A bound listening socket.
#[derive(Debug)]
pub enum BoundListener {
    Tcp {
        listener: TcpListener,
        keepalive: Duration,
    },
    Unix {
        listener: UnixListener,
        path: PathBuf,
    },
}

impl BoundListener {
    /// Bind `addr` right away.
    pub async fn bind(
        network: Network,
        addr: &str,
        keep_alive: &KeepAliveConfig,
    ) -> Result<Self, ListenerError> {
        let bind_err = |source| ListenerError::Bind {
            network,
            addr: addr.to_string(),
            source,
        };

        match network {
            Network::Tcp => {
                let sock_addr = tokio::net::lookup_host(addr)
                    .await
                    .map_err(|source| ListenerError::Resolve {
                        addr: addr.to_string(),
                        source,
                    })?
                    .next()
                    .ok_or_else(|| ListenerError::Resolve {
                        addr: addr.to_string(),
                        source: io::Error::new(io::ErrorKind::NotFound, "no addresses"),
                    })?;

                let listener = bind_tcp(sock_addr).map_err(bind_err)?;
                Ok(BoundListener::Tcp {
                    listener,
                    keepalive: keep_alive.interval().unwrap_or(DEFAULT_TCP_KEEPALIVE),
                })
            }
            Network::Unix => {
                let listener = UnixListener::bind(addr).map_err(bind_err)?;
                Ok(BoundListener::Unix {
                    listener,
                    path: PathBuf::from(addr),
                })
            }
        }
    }

    pub fn network(&self) -> Network {
        match self {
            BoundListener::Tcp { .. } => Network::Tcp,
            BoundListener::Unix { .. } => Network::Unix,
        }
    }

    pub fn local_addr(&self) -> io::Result<ListenAddr> {
        match self {
            BoundListener::Tcp { listener, .. } => listener.local_addr().map(ListenAddr::Tcp),
            BoundListener::Unix { path, .. } => Ok(ListenAddr::Unix(path.clone())),
        }
    }

    /// Accept the next connection.
    pub async fn accept(&self) -> io::Result<(BoxIo, PeerAddr)> {
        match self {
            BoundListener::Tcp {
                listener,
                keepalive,
            } => {
                let (stream, peer) = listener.accept().await?;
                let params = TcpKeepalive::new().with_time(*keepalive);
                if let Err(e) = SockRef::from(&stream).set_tcp_keepalive(&params) {
                    tracing::debug!(peer = %peer, error = %e, "Failed to enable TCP keep-alive");
                }
                // Best effort: Nagle only adds latency to RPC frames.
                let _ = stream.set_nodelay(true);
                Ok((Box::new(stream), PeerAddr::Tcp(peer)))
            }
            BoundListener::Unix { listener, .. } => {
                let (stream, _) = listener.accept().await?;
                Ok((Box::new(stream), PeerAddr::Unix))
            }
        }
    }
}

impl Drop for BoundListener {
    fn drop(&mut self) {
        if let BoundListener::Unix { path, .. } = self {
            if let Err(e) = std::fs::remove_file(&*path) {
                if e.kind() != io::ErrorKind::NotFound {
                    tracing::warn!(path = %path.display(), error = %e, "Failed to remove unix socket file");
                }
            }
        }
    }
}

fn bind_tcp(addr: SocketAddr) -> io::Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(BACKLOG)?;
    TcpListener::from_std(socket.into())
}

/// Resolve `urls` into one serve context per distinct address, with every
/// socket bound. On error, every socket opened so far is closed before
/// returning.
pub async fn resolve_listeners(
    urls: &[String],
    tls: Option<Arc<TlsMaterial>>,
    options: &ServeOptions,
) -> Result<BTreeMap<String, ServeContext>, ListenerError> {
    let mut contexts = BTreeMap::new();
    match resolve_into(&mut contexts, urls, tls, options).await {
        Ok(()) => Ok(contexts),
        Err(e) => {
            for ctx in contexts.values() {
                tracing::info!(
                    network = %ctx.network(),
                    address = %ctx.addr(),
                    error = %e,
                    "Closing listener after resolution error"
                );
            }
            drop(contexts);
            Err(e)
        }
    }
}

async fn resolve_into(
    contexts: &mut BTreeMap<String, ServeContext>,
    urls: &[String],
    tls: Option<Arc<TlsMaterial>>,
    options: &ServeOptions,
) -> Result<(), ListenerError> {
    for raw in urls {
        let url = ListenUrl::parse(raw, tls.is_some())?;
        let secure = url.scheme.is_secure();
        if secure && tls.is_none() {
            return Err(ListenerError::TlsRequired(raw.clone()));
        }
        if !secure && tls.is_some() {
            tracing::warn!(url = %raw, "TLS material is configured but the listen URL is plaintext");
        }

        let network = url.scheme.network();
        if let Some(existing) = contexts.get_mut(&url.addr) {
            if existing.network() != network {
                return Err(ListenerError::NetworkConflict {
                    addr: url.addr,
                    first: existing.network(),
                    second: network,
                });
            }
            existing.merge(secure);
            continue;
        }

        tracing::info!(network = %network, address = %url.addr, "Listening");
        let listener = BoundListener::bind(network, &url.addr, &options.keep_alive).await?;
        let ctx = ServeContext::new(url.addr.clone(), listener, secure, tls.clone(), options.clone());
        contexts.insert(url.addr, ctx);
    }
    Ok(())
}
