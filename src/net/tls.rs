//! TLS configuration, certificate loading and hot reload.
//!
//! The live configuration is an `axum_server` [`RustlsConfig`]: every new
//! handshake takes a snapshot, so a reload never disturbs connections that
//! already negotiated.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use axum_server::tls_rustls::RustlsConfig;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, CertificateRevocationListDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::{RootCertStore, ServerConfig};
use tokio::sync::{mpsc, watch};
use tokio_rustls::TlsAcceptor;

use crate::config::TlsConfig;
use crate::net::watcher::FileWatcher;
use crate::observability::metrics;

/// ALPN protocols offered by secure listeners.
const ALPN: [&[u8]; 2] = [b"h2", b"http/1.1"];

/// Error type for TLS material.
#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("no certificates found in {0}")]
    NoCertificates(String),

    #[error("no private key found in {0}")]
    NoPrivateKey(String),

    #[error("none of the configured cipher suites are supported: {0:?}")]
    NoCipherSuites(Vec<String>),

    #[error("invalid trusted CA bundle {path}: {source}")]
    TrustedCa {
        path: String,
        source: rustls::Error,
    },

    #[error("client verifier: {0}")]
    Verifier(#[from] rustls::server::VerifierBuilderError),

    #[error("TLS configuration: {0}")]
    Rustls(#[from] rustls::Error),
}

/// Certificates, key and trust bundle behind a live TLS configuration.
pub struct TlsMaterial {
    settings: TlsConfig,
    live: RustlsConfig,
}

impl std::fmt::Debug for TlsMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsMaterial")
            .field("settings", &self.settings.to_string())
            .finish_non_exhaustive()
    }
}

impl TlsMaterial {
    /// Load the material once; errors here are fatal configuration errors.
    pub fn load(settings: &TlsConfig) -> Result<Self, TlsError> {
        let config = build_server_config(settings)?;
        tracing::info!(tls = %settings, "TLS material loaded");
        Ok(Self {
            settings: settings.clone(),
            live: RustlsConfig::from_config(Arc::new(config)),
        })
    }

    pub fn settings(&self) -> &TlsConfig {
        &self.settings
    }

    /// Acceptor bound to the configuration current at call time.
    pub fn acceptor(&self) -> TlsAcceptor {
        TlsAcceptor::from(self.live.get_inner())
    }

    pub fn server_config(&self) -> Arc<ServerConfig> {
        self.live.get_inner()
    }

    /// Re-read the files from disk. On failure the previous configuration
    /// stays in place.
    pub async fn reload(&self) -> Result<(), TlsError> {
        let settings = self.settings.clone();
        let built = tokio::task::spawn_blocking(move || build_server_config(&settings))
            .await
            .map_err(|e| TlsError::Read {
                path: self.settings.cert.clone(),
                source: std::io::Error::other(e),
            })?;

        match built {
            Ok(config) => {
                self.live.reload_from_config(Arc::new(config));
                metrics::record_tls_reload("ok");
                tracing::debug!(cert = %self.settings.cert, "TLS material reloaded");
                Ok(())
            }
            Err(e) => {
                metrics::record_tls_reload("error");
                Err(e)
            }
        }
    }

    /// Reload on a timer (and on file changes when enabled) until `stop`
    /// flips to true.
    pub fn spawn_reloader(
        self: &Arc<Self>,
        mut stop: watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        let material = Arc::clone(self);
        let interval = self.settings.reload_interval();

        let (changed_tx, mut changed_rx) = mpsc::unbounded_channel();
        let watcher = if self.settings.watch_files {
            let paths = [self.settings.cert.clone(), self.settings.key.clone()];
            match FileWatcher::new(&paths, changed_tx).run() {
                Ok(w) => Some(w),
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to watch TLS files, relying on timer");
                    None
                }
            }
        } else {
            None
        };

        tokio::spawn(async move {
            // Keep the watcher alive for as long as this task runs.
            let _watcher = watcher;
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    Some(()) = changed_rx.recv() => {
                        // Editors and cert managers write in bursts.
                        tokio::time::sleep(Duration::from_millis(200)).await;
                        while changed_rx.try_recv().is_ok() {}
                    }
                    _ = async { let _ = stop.wait_for(|s| *s).await; } => break,
                }

                if let Err(e) = material.reload().await {
                    tracing::error!(error = %e, "Failed to reload TLS material. Keeping current configuration.");
                }
            }
            tracing::debug!("TLS reloader stopped");
        })
    }
}

/// Build a rustls server configuration from PEM files.
pub fn build_server_config(settings: &TlsConfig) -> Result<ServerConfig, TlsError> {
    let certs = load_certs(&settings.cert)?;
    let key = load_key(&settings.key)?;
    let provider = Arc::new(crypto_provider(&settings.cipher_suites)?);

    let builder = ServerConfig::builder_with_provider(Arc::clone(&provider))
        .with_safe_default_protocol_versions()?;

    let builder = match &settings.trusted_ca {
        Some(ca) if !ca.is_empty() => {
            let mut roots = RootCertStore::empty();
            for cert in load_certs(ca)? {
                roots.add(cert).map_err(|source| TlsError::TrustedCa {
                    path: ca.clone(),
                    source,
                })?;
            }

            let crls = match &settings.crl {
                Some(crl) if !crl.is_empty() => load_crls(crl)?,
                _ => Vec::new(),
            };

            let verifier =
                WebPkiClientVerifier::builder_with_provider(Arc::new(roots), Arc::clone(&provider))
                    .with_crls(crls);
            let verifier = if settings.client_cert_auth {
                verifier.build()?
            } else {
                // Verify a certificate if the client offers one.
                verifier.allow_unauthenticated().build()?
            };
            builder.with_client_cert_verifier(verifier)
        }
        _ => builder.with_no_client_auth(),
    };

    let mut config = builder.with_single_cert(certs, key)?;
    config.alpn_protocols = ALPN.iter().map(|p| p.to_vec()).collect();
    Ok(config)
}

/// The default provider, restricted to the allowed suites when a list is set.
fn crypto_provider(allowed: &[String]) -> Result<CryptoProvider, TlsError> {
    let mut provider = rustls::crypto::aws_lc_rs::default_provider();
    if allowed.is_empty() {
        return Ok(provider);
    }

    provider.cipher_suites.retain(|suite| {
        let name = format!("{:?}", suite.suite());
        allowed.iter().any(|a| a.eq_ignore_ascii_case(&name))
    });
    if provider.cipher_suites.is_empty() {
        return Err(TlsError::NoCipherSuites(allowed.to_vec()));
    }
    Ok(provider)
}

fn open(path: &str) -> Result<BufReader<File>, TlsError> {
    File::open(Path::new(path))
        .map(BufReader::new)
        .map_err(|source| TlsError::Read {
            path: path.to_string(),
            source,
        })
}

fn load_certs(path: &str) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let certs = rustls_pemfile::certs(&mut open(path)?)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|source| TlsError::Read {
            path: path.to_string(),
            source,
        })?;
    if certs.is_empty() {
        return Err(TlsError::NoCertificates(path.to_string()));
    }
    Ok(certs)
}

fn load_key(path: &str) -> Result<PrivateKeyDer<'static>, TlsError> {
    rustls_pemfile::private_key(&mut open(path)?)
        .map_err(|source| TlsError::Read {
            path: path.to_string(),
            source,
        })?
        .ok_or_else(|| TlsError::NoPrivateKey(path.to_string()))
}

fn load_crls(path: &str) -> Result<Vec<CertificateRevocationListDer<'static>>, TlsError> {
    rustls_pemfile::crls(&mut open(path)?)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|source| TlsError::Read {
            path: path.to_string(),
            source,
        })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::path::PathBuf;

    /// Write a throwaway self-signed key pair and return its settings.
    pub(crate) fn self_signed(dir_name: &str) -> (TlsConfig, PathBuf) {
        let dir = std::env::temp_dir().join(format!("{dir_name}-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();

        let rcgen::CertifiedKey { cert, key_pair } =
            rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        let cert_path = dir.join("cert.pem");
        let key_path = dir.join("key.pem");
        std::fs::write(&cert_path, cert.pem()).unwrap();
        std::fs::write(&key_path, key_pair.serialize_pem()).unwrap();

        let settings = TlsConfig {
            cert: cert_path.display().to_string(),
            key: key_path.display().to_string(),
            trusted_ca: None,
            crl: None,
            cipher_suites: Vec::new(),
            client_cert_auth: false,
            reload_interval_secs: 1,
            watch_files: false,
        };
        (settings, dir)
    }

    #[test]
    fn loads_self_signed_material_with_alpn() {
        let (settings, dir) = self_signed("tls-load");
        let material = TlsMaterial::load(&settings).unwrap();
        let config = material.server_config();
        assert_eq!(config.alpn_protocols, vec![b"h2".to_vec(), b"http/1.1".to_vec()]);
        std::fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn trusted_ca_enables_client_verification() {
        let (mut settings, dir) = self_signed("tls-ca");
        settings.trusted_ca = Some(settings.cert.clone());
        settings.client_cert_auth = true;
        assert!(build_server_config(&settings).is_ok());
        std::fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn missing_files_are_reported() {
        let (mut settings, dir) = self_signed("tls-missing");
        settings.key = dir.join("absent.pem").display().to_string();
        assert!(matches!(
            TlsMaterial::load(&settings),
            Err(TlsError::Read { .. })
        ));
        std::fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn unknown_cipher_suites_are_rejected() {
        let err = crypto_provider(&["TLS_NOT_A_SUITE".to_string()]).unwrap_err();
        assert!(matches!(err, TlsError::NoCipherSuites(_)));

        let provider = crypto_provider(&["tls13_aes_128_gcm_sha256".to_string()]).unwrap();
        assert_eq!(provider.cipher_suites.len(), 1);
    }

    #[tokio::test]
    async fn failed_reload_keeps_previous_config() {
        let (settings, dir) = self_signed("tls-reload");
        let material = TlsMaterial::load(&settings).unwrap();
        let before = material.server_config();

        std::fs::write(&settings.cert, "not a certificate").unwrap();
        assert!(material.reload().await.is_err());
        assert!(Arc::ptr_eq(&before, &material.server_config()));

        std::fs::remove_dir_all(dir).ok();
    }

    #[tokio::test]
    async fn reload_swaps_config() {
        let (settings, dir) = self_signed("tls-swap");
        let material = TlsMaterial::load(&settings).unwrap();
        let before = material.server_config();

        material.reload().await.unwrap();
        assert!(!Arc::ptr_eq(&before, &material.server_config()));

        std::fs::remove_dir_all(dir).ok();
    }
}
