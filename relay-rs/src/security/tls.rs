//! TLS material for STARTTLS
//!
//! Certificates are loaded once at startup and shared by every session; the
//! upgrade itself happens inside the session.

use crate::error::{RelayError, Result};
use rustls::ServerConfig;
use rustls_pemfile::{certs, pkcs8_private_keys};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// Server-side TLS configuration for STARTTLS
#[derive(Clone)]
pub struct TlsConfig {
    server_config: Arc<ServerConfig>,
}

impl TlsConfig {
    /// Load a PEM certificate chain and a PKCS#8 private key
    ///
    /// ```no_run
    /// use relay_rs::security::TlsConfig;
    ///
    /// # fn example() -> Result<(), Box<dyn std::error::Error>> {
    /// let tls = TlsConfig::from_pem_files("/etc/relay/cert.pem", "/etc/relay/key.pem")?;
    /// # Ok(())
    /// # }
    /// ```
    pub fn from_pem_files<P: AsRef<Path>>(cert_path: P, key_path: P) -> Result<Self> {
        info!("Loading TLS certificate from {:?}", cert_path.as_ref());

        let cert_file = File::open(cert_path.as_ref())
            .map_err(|e| RelayError::Tls(format!("Failed to open certificate file: {}", e)))?;
        let certs = certs(&mut BufReader::new(cert_file))
            .map_err(|e| RelayError::Tls(format!("Failed to read certificates: {}", e)))?;

        if certs.is_empty() {
            return Err(RelayError::Tls("No certificates found in file".to_string()));
        }
        debug!("Loaded {} certificate(s)", certs.len());

        let key_file = File::open(key_path.as_ref())
            .map_err(|e| RelayError::Tls(format!("Failed to open key file: {}", e)))?;
        let mut keys = pkcs8_private_keys(&mut BufReader::new(key_file))
            .map_err(|e| RelayError::Tls(format!("Failed to read private keys: {}", e)))?;

        if keys.is_empty() {
            return Err(RelayError::Tls("No private key found in file".to_string()));
        }

        Self::from_der(certs, keys.remove(0))
    }

    /// Throwaway certificate for `domain`, never written to disk
    pub fn self_signed(domain: &str) -> Result<Self> {
        let cert = rcgen::generate_simple_self_signed(vec![domain.to_string()])
            .map_err(|e| RelayError::Tls(format!("Failed to generate certificate: {}", e)))?;
        let der = cert
            .serialize_der()
            .map_err(|e| RelayError::Tls(format!("Failed to serialize certificate: {}", e)))?;

        Self::from_der(vec![der], cert.serialize_private_key_der())
    }

    fn from_der(certs: Vec<Vec<u8>>, key: Vec<u8>) -> Result<Self> {
        let config = ServerConfig::builder()
            .with_safe_defaults()
            .with_no_client_auth()
            .with_single_cert(
                certs.into_iter().map(rustls::Certificate).collect(),
                rustls::PrivateKey(key),
            )
            .map_err(|e| RelayError::Tls(format!("Failed to create TLS config: {}", e)))?;

        Ok(Self {
            server_config: Arc::new(config),
        })
    }

    pub fn acceptor(&self) -> tokio_rustls::TlsAcceptor {
        tokio_rustls::TlsAcceptor::from(self.server_config.clone())
    }
}

/// Write a self-signed certificate and key as PEM files
///
/// For development only.
pub fn generate_self_signed_cert(
    domain: &str,
    cert_output: &Path,
    key_output: &Path,
) -> Result<()> {
    use rcgen::{CertificateParams, DistinguishedName};

    info!("Generating self-signed certificate for {}", domain);

    let mut params = CertificateParams::default();
    params.distinguished_name = DistinguishedName::new();
    params.subject_alt_names = vec![
        rcgen::SanType::DnsName(domain.to_string()),
        rcgen::SanType::DnsName(format!("*.{}", domain)),
    ];

    let cert = rcgen::Certificate::from_params(params)
        .map_err(|e| RelayError::Tls(format!("Failed to generate certificate: {}", e)))?;

    let pem = cert
        .serialize_pem()
        .map_err(|e| RelayError::Tls(format!("Failed to serialize certificate: {}", e)))?;
    std::fs::write(cert_output, pem)
        .map_err(|e| RelayError::Tls(format!("Failed to write certificate: {}", e)))?;
    std::fs::write(key_output, cert.serialize_private_key_pem())
        .map_err(|e| RelayError::Tls(format!("Failed to write private key: {}", e)))?;

    info!(
        "Self-signed certificate written to {:?} and {:?}",
        cert_output, key_output
    );
    Ok(())
}
