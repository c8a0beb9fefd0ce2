//! Per-device client certificates
//! Loads certificate material by device serial and turns it into a TLS client context

use rustls::pki_types::CertificateDer;
use rustls::{ClientConfig, RootCertStore};
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

/// Certificate errors
#[derive(Debug, Error)]
pub enum CertificateError {
    #[error("no certificate material for device {0}")]
    NotFound(String),

    #[error("invalid device serial: {0:?}")]
    InvalidSerial(String),

    #[error("failed to read certificate material: {0}")]
    Io(#[from] io::Error),

    #[error("certificate material contains no certificates")]
    NoCertificates,

    #[error("certificate material contains no private key")]
    NoPrivateKey,

    #[error("failed to build TLS context: {0}")]
    Tls(#[from] rustls::Error),
}

/// TLS client context presenting a device's certificate to the upstream
#[derive(Clone)]
pub struct TlsContext(Arc<ClientConfig>);

impl TlsContext {
    pub fn new(config: ClientConfig) -> Self {
        Self(Arc::new(config))
    }

    pub fn config(&self) -> Arc<ClientConfig> {
        self.0.clone()
    }
}

impl fmt::Debug for TlsContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("TlsContext(..)")
    }
}

/// Source of device certificates
pub trait CertificateProvider: Send + Sync {
    /// Load the raw certificate material stored for a device
    fn load_material(&self, serial: &str) -> Result<Vec<u8>, CertificateError>;

    /// Build a TLS client context from certificate material
    fn build_context(&self, serial: &str, material: &[u8]) -> Result<TlsContext, CertificateError>;
}

/// Certificate provider backed by a directory of `<serial>.pem` bundles
pub struct FileCertificateProvider {
    certs_dir: PathBuf,
    roots: RootCertStore,
}

impl FileCertificateProvider {
    /// Create a new provider, trusting the webpki roots for the upstream
    pub fn new<P: AsRef<Path>>(certs_dir: P) -> io::Result<Self> {
        let certs_dir = certs_dir.as_ref().to_path_buf();
        fs::create_dir_all(&certs_dir)?;

        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

        Ok(Self {
            certs_dir,
            roots,
        })
    }

    /// Get certs directory path
    pub fn certs_dir(&self) -> &Path {
        &self.certs_dir
    }

    /// Path of the bundle for a serial
    pub fn material_path(&self, serial: &str) -> Result<PathBuf, CertificateError> {
        if !Self::is_valid_serial(serial) {
            return Err(CertificateError::InvalidSerial(serial.to_string()));
        }
        Ok(self.certs_dir.join(format!("{}.pem", serial)))
    }

    /// Serials end up in file names, so only allow plain tokens
    fn is_valid_serial(serial: &str) -> bool {
        !serial.is_empty()
            && serial
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    }
}

impl CertificateProvider for FileCertificateProvider {
    fn load_material(&self, serial: &str) -> Result<Vec<u8>, CertificateError> {
        let path = self.material_path(serial)?;
        match fs::read(&path) {
            Ok(bytes) => {
                debug!("Loaded certificate material from {}", path.display());
                Ok(bytes)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(CertificateError::NotFound(serial.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn build_context(&self, _serial: &str, material: &[u8]) -> Result<TlsContext, CertificateError> {
        let config = client_config(self.roots.clone(), material)?;
        Ok(TlsContext::new(config))
    }
}

/// Build a client config presenting the chain and key found in a PEM bundle
pub fn client_config(roots: RootCertStore, material: &[u8]) -> Result<ClientConfig, CertificateError> {
    let mut reader = material;
    let chain = rustls_pemfile::certs(&mut reader).collect::<Result<Vec<CertificateDer<'static>>, _>>()?;
    if chain.is_empty() {
        return Err(CertificateError::NoCertificates);
    }

    let mut reader = material;
    let key = rustls_pemfile::private_key(&mut reader)?.ok_or(CertificateError::NoPrivateKey)?;

    let config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_client_auth_cert(chain, key)?;

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rcgen::generate_simple_self_signed;
    use tempfile::tempdir;

    fn device_pem(serial: &str) -> String {
        let cert = generate_simple_self_signed(vec![serial.to_string()]).unwrap();
        format!("{}{}", cert.serialize_pem().unwrap(), cert.serialize_private_key_pem())
    }

    #[test]
    fn test_load_and_build_context() {
        let dir = tempdir().unwrap();
        let provider = FileCertificateProvider::new(dir.path()).unwrap();
        fs::write(dir.path().join("B001.pem"), device_pem("B001")).unwrap();

        let material = provider.load_material("B001").unwrap();
        assert!(provider.build_context("B001", &material).is_ok());
    }

    #[test]
    fn test_missing_material() {
        let dir = tempdir().unwrap();
        let provider = FileCertificateProvider::new(dir.path()).unwrap();

        assert!(matches!(provider.load_material("B002"), Err(CertificateError::NotFound(_))));
    }

    #[test]
    fn test_rejects_path_like_serials() {
        let dir = tempdir().unwrap();
        let provider = FileCertificateProvider::new(dir.path()).unwrap();

        assert!(matches!(
            provider.load_material("../etc/passwd"),
            Err(CertificateError::InvalidSerial(_))
        ));
        assert!(provider.material_path("").is_err());
        assert!(provider.material_path("B0_1-x").is_ok());
    }

    #[test]
    fn test_material_without_key() {
        let dir = tempdir().unwrap();
        let provider = FileCertificateProvider::new(dir.path()).unwrap();
        let cert = generate_simple_self_signed(vec!["B003".to_string()]).unwrap();

        let result = provider.build_context("B003", cert.serialize_pem().unwrap().as_bytes());
        assert!(matches!(result, Err(CertificateError::NoPrivateKey)));

        let result = provider.build_context("B003", b"garbage");
        assert!(matches!(result, Err(CertificateError::NoCertificates)));
    }
}
