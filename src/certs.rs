//! Filesystem certificate source for the receiver listener.
//!
//! The relay's public certificate is loaded from PEM files at startup and
//! refreshed from disk on a timer, so a renewed certificate is picked up
//! without a restart. Handshakes read the current key through a `RwLock`
//! and never wait on a reload.

use anyhow::{Context, Result, anyhow};
use rustls_pemfile::{certs, private_key};
use std::{
    fs::File,
    io::BufReader,
    path::{Path, PathBuf},
    sync::{Arc, RwLock},
    time::Duration,
};
use tokio_rustls::rustls::{
    self,
    server::{ClientHello, ResolvesServerCert},
    sign::CertifiedKey,
};
use tracing::{info, warn};

/// How often the certificate files are re-read from disk.
pub const RELOAD_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

pub struct CertificateSource {
    cert_path: PathBuf,
    key_path: PathBuf,
    current: RwLock<Arc<CertifiedKey>>,
}

impl CertificateSource {
    /// Loads the initial certificate. A failure here is fatal at startup.
    pub fn load(cert_path: impl AsRef<Path>, key_path: impl AsRef<Path>) -> Result<Arc<Self>> {
        let cert_path = cert_path.as_ref().to_path_buf();
        let key_path = key_path.as_ref().to_path_buf();
        let key = load_certified_key(&cert_path, &key_path)?;
        Ok(Arc::new(Self {
            cert_path,
            key_path,
            current: RwLock::new(Arc::new(key)),
        }))
    }

    /// Re-reads the PEM files and swaps in the new key. The previous
    /// certificate stays in service if the reload fails.
    pub fn reload(&self) -> Result<()> {
        let key = load_certified_key(&self.cert_path, &self.key_path)?;
        *self.current.write().expect("certificate lock poisoned") = Arc::new(key);
        Ok(())
    }

    pub fn current(&self) -> Arc<CertifiedKey> {
        self.current.read().expect("certificate lock poisoned").clone()
    }

    /// Builds the rustls server configuration for the receiver listener.
    /// No client certificates are requested.
    pub fn server_config(self: &Arc<Self>) -> rustls::ServerConfig {
        rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_cert_resolver(self.clone())
    }
}

impl ResolvesServerCert for CertificateSource {
    fn resolve(&self, _client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        Some(self.current())
    }
}

impl std::fmt::Debug for CertificateSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateSource")
            .field("cert_path", &self.cert_path)
            .field("key_path", &self.key_path)
            .finish_non_exhaustive()
    }
}

/// Spawns the periodic reload loop. The task runs for the process lifetime.
pub fn spawn_reload_task(
    source: Arc<CertificateSource>,
    domain: String,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut timer = tokio::time::interval(RELOAD_INTERVAL);
        // The first tick fires immediately; the initial load already happened.
        timer.tick().await;
        loop {
            timer.tick().await;
            match source.reload() {
                Ok(()) => info!(domain = %domain, "Server certificate reloaded"),
                Err(e) => {
                    warn!(domain = %domain, error = %e, "Certificate reload failed, keeping previous certificate");
                }
            }
        }
    })
}

fn load_certified_key(cert_path: &Path, key_path: &Path) -> Result<CertifiedKey> {
    let cert_file = File::open(cert_path)
        .with_context(|| format!("Failed to open certificate file: {}", cert_path.display()))?;
    let key_file = File::open(key_path)
        .with_context(|| format!("Failed to open private key file: {}", key_path.display()))?;

    let cert_chain = certs(&mut BufReader::new(cert_file))
        .collect::<Result<Vec<_>, _>>()
        .context("Failed to parse certificate file")?;

    if cert_chain.is_empty() {
        return Err(anyhow!("No certificates found in certificate file"));
    }

    let private_key = private_key(&mut BufReader::new(key_file))
        .context("Failed to parse private key file")?
        .ok_or_else(|| anyhow!("No private key found in key file"))?;

    let signing_key = rustls::crypto::ring::sign::any_supported_type(&private_key)
        .context("Unsupported private key type")?;

    Ok(CertifiedKey::new(cert_chain, signing_key))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn write_self_signed(dir: &Path, host: &str) -> (PathBuf, PathBuf) {
        let generated = rcgen::generate_simple_self_signed(vec![host.to_string()]).unwrap();
        let cert_path = dir.join(format!("{host}.pem"));
        let key_path = dir.join(format!("{host}.key"));
        fs::write(&cert_path, generated.cert.pem()).unwrap();
        fs::write(&key_path, generated.key_pair.serialize_pem()).unwrap();
        (cert_path, key_path)
    }

    #[test]
    fn loads_pem_certificate_and_key() {
        let dir = tempdir().unwrap();
        let (cert_path, key_path) = write_self_signed(dir.path(), "relay.test");

        let source = CertificateSource::load(&cert_path, &key_path).unwrap();
        assert_eq!(source.current().cert.len(), 1);
    }

    #[test]
    fn fails_on_missing_files() {
        let dir = tempdir().unwrap();
        let missing = dir.path().join("nope.pem");
        assert!(CertificateSource::load(&missing, &missing).is_err());
    }

    #[test]
    fn fails_on_garbage_pem() {
        let dir = tempdir().unwrap();
        let cert_path = dir.path().join("garbage.pem");
        let key_path = dir.path().join("garbage.key");
        fs::write(&cert_path, "not a certificate").unwrap();
        fs::write(&key_path, "not a key").unwrap();
        assert!(CertificateSource::load(&cert_path, &key_path).is_err());
    }

    #[test]
    fn reload_swaps_the_certificate() {
        let dir = tempdir().unwrap();
        let (cert_path, key_path) = write_self_signed(dir.path(), "relay.test");

        let source = CertificateSource::load(&cert_path, &key_path).unwrap();
        let before = source.current().cert[0].clone();

        // Overwrite with a fresh certificate for the same paths.
        let renewed = rcgen::generate_simple_self_signed(vec!["relay.test".to_string()]).unwrap();
        fs::write(&cert_path, renewed.cert.pem()).unwrap();
        fs::write(&key_path, renewed.key_pair.serialize_pem()).unwrap();

        source.reload().unwrap();
        assert_ne!(source.current().cert[0], before);
    }

    #[test]
    fn failed_reload_keeps_previous_certificate() {
        let dir = tempdir().unwrap();
        let (cert_path, key_path) = write_self_signed(dir.path(), "relay.test");

        let source = CertificateSource::load(&cert_path, &key_path).unwrap();
        let before = source.current().cert[0].clone();

        fs::write(&cert_path, "broken").unwrap();
        assert!(source.reload().is_err());
        assert_eq!(source.current().cert[0], before);
    }
}
