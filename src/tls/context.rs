use super::settings::{cipher_names, enabled_versions, TlsSettings};
use super::TlsRuntime;
use crate::error::{ConfigError, TransportError};
use parking_lot::RwLock;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::{RootCertStore, ServerConfig, ServerConnection};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

/// One host's TLS settings plus the context built from them at start.
#[derive(Debug)]
pub struct TlsContext {
    host: String,
    settings: TlsSettings,
    context: RwLock<Option<Arc<ServerConfig>>>,
}

impl TlsContext {
    pub fn new(host: &str) -> Self {
        TlsContext {
            host: host.to_string(),
            settings: TlsSettings::default(),
            context: RwLock::new(None),
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn settings(&self) -> &TlsSettings {
        &self.settings
    }

    pub fn settings_mut(&mut self) -> &mut TlsSettings {
        &mut self.settings
    }

    /// Builds the server context. Provider-global setup runs first.
    pub fn start(&self, runtime: &TlsRuntime) -> Result<(), ConfigError> {
        let crypto = runtime.crypto();
        let config = build_server_config(&self.settings, crypto)?;
        *self.context.write() = Some(Arc::new(config));
        log::info!("TLS context ready for host {}", self.host);
        Ok(())
    }

    /// Releases the context. Later calls and never-started contexts are no-ops.
    pub fn stop(&self) -> bool {
        let released = self.context.write().take().is_some();
        if released {
            log::debug!("TLS context released for host {}", self.host);
        }
        released
    }

    pub fn server_config(&self) -> Option<Arc<ServerConfig>> {
        self.context.read().clone()
    }

    pub fn is_started(&self) -> bool {
        self.context.read().is_some()
    }
}

/// Assemble a rustls server config from host settings, failing closed.
pub fn build_server_config(
    settings: &TlsSettings,
    crypto: Arc<CryptoProvider>,
) -> Result<ServerConfig, ConfigError> {
    let cert_path = settings
        .cert_file()
        .ok_or_else(|| ConfigError::MissingCertificate("server".to_string()))?;
    let key_path = settings.key_file().unwrap_or(cert_path);

    let certs = load_certs(cert_path)?;
    let key = load_key(key_path)?;
    let versions = enabled_versions(settings.protocol_mask())?;
    let crypto = filter_ciphers(crypto, settings.cipher_suite())?;

    let builder = ServerConfig::builder_with_provider(crypto.clone())
        .with_protocol_versions(&versions)
        .map_err(|e| ConfigError::Tls(e.to_string()))?;

    let builder = if settings.verify_client() {
        let roots = load_roots(settings)?;
        let verifier = WebPkiClientVerifier::builder_with_provider(Arc::new(roots), crypto)
            .build()
            .map_err(|e| ConfigError::Tls(e.to_string()))?;
        builder.with_client_cert_verifier(verifier)
    } else {
        builder.with_no_client_auth()
    };

    builder
        .with_single_cert(certs, key)
        .map_err(|e| ConfigError::Tls(e.to_string()))
}

/// Enforce the configured verify depth on the chain a client presented.
pub fn check_peer_depth(conn: &ServerConnection, depth: usize) -> Result<(), TransportError> {
    let chain = conn.peer_certificates().map_or(0, |c| c.len());
    if chain > depth + 1 {
        log::warn!("Client chain of {} certificates exceeds depth {}", chain, depth);
        return Err(TransportError::VerifyDepth { chain, depth });
    }
    Ok(())
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, ConfigError> {
    let file = File::open(path).map_err(|e| ConfigError::io(path, e))?;
    let certs = rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ConfigError::io(path, e))?;
    if certs.is_empty() {
        return Err(ConfigError::EmptyCertificate(path.to_path_buf()));
    }
    Ok(certs)
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>, ConfigError> {
    let file = File::open(path).map_err(|e| ConfigError::io(path, e))?;
    rustls_pemfile::private_key(&mut BufReader::new(file))
        .map_err(|e| ConfigError::io(path, e))?
        .ok_or_else(|| ConfigError::MissingKey(path.to_path_buf()))
}

/// Trust anchors for client verification from the CA file and every
/// PEM file found in the CA directory.
fn load_roots(settings: &TlsSettings) -> Result<RootCertStore, ConfigError> {
    let mut roots = RootCertStore::empty();
    if let Some(ca_file) = settings.ca_file() {
        add_roots(&mut roots, ca_file, load_certs(ca_file)?);
    }
    if let Some(ca_path) = settings.ca_path() {
        let pattern = format!("{}/*.pem", ca_path.display());
        for entry in glob::glob(&pattern)? {
            let path = match entry {
                Ok(p) => p,
                Err(e) => {
                    log::warn!("Skipping CA entry: {}", e);
                    continue;
                }
            };
            // Key files and other non-certificate PEMs share the directory.
            match load_certs(&path) {
                Ok(certs) => add_roots(&mut roots, &path, certs),
                Err(ConfigError::EmptyCertificate(_)) => {}
                Err(e) => log::warn!("Skipping CA file: {}", e),
            }
        }
    }
    if roots.is_empty() {
        return Err(ConfigError::NoClientRoots);
    }
    Ok(roots)
}

fn add_roots(roots: &mut RootCertStore, file: &Path, certs: Vec<CertificateDer<'static>>) {
    for cert in certs {
        if let Err(e) = roots.add(cert) {
            log::warn!("Rejected CA certificate in {}: {}", file.display(), e);
        }
    }
}

/// Restrict the provider's suites to the configured list, if any.
fn filter_ciphers(
    crypto: Arc<CryptoProvider>,
    list: Option<&str>,
) -> Result<Arc<CryptoProvider>, ConfigError> {
    let list = match list {
        Some(l) if !l.trim().is_empty() => l,
        _ => return Ok(crypto),
    };
    let wanted = cipher_names(list);
    let suites: Vec<_> = crypto
        .cipher_suites
        .iter()
        .filter(|cs| wanted.contains(&format!("{:?}", cs.suite())))
        .copied()
        .collect();
    if suites.is_empty() {
        return Err(ConfigError::NoCiphers(list.to_string()));
    }
    Ok(Arc::new(CryptoProvider {
        cipher_suites: suites,
        ..(*crypto).clone()
    }))
}
