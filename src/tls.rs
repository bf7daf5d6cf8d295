//! TLS material for the gRPC servers, the gateway's client connection and the
//! HTTP listener.

use std::sync::Arc;

use rustls::crypto::aws_lc_rs;
use rustls_pki_types::pem::PemObject;
use rustls_pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::TlsAcceptor;
use tonic::transport::{Certificate, ClientTlsConfig, Identity, ServerTlsConfig};

use crate::config::TlsSettings;
use crate::error::{Error, Result};

/// Makes aws-lc the process-wide rustls provider.
///
/// tonic builds its server and client configs from the process default, so this must
/// run before the first TLS handshake. Calls after the first are no-ops.
pub fn install_crypto_provider() {
    // Err only means a provider is already installed.
    let _ = aws_lc_rs::default_provider().install_default();
}

/// PEM certificate chain and private key, read and parsed once at startup.
#[derive(Clone)]
pub struct TlsCredentials {
    cert_pem: Vec<u8>,
    key_pem: Vec<u8>,
    server_name: String,
}

impl TlsCredentials {
    /// Reads and checks the files named by `settings`, or `None` when TLS is disabled.
    ///
    /// # Errors
    /// Fails when a file cannot be read or does not hold a usable certificate and key.
    pub async fn load(settings: &TlsSettings) -> Result<Option<Self>> {
        if !settings.enabled {
            return Ok(None);
        }

        let cert_pem = tokio::fs::read(&settings.cert_path)
            .await
            .map_err(|e| Error::Tls(format!("cannot read {}: {e}", settings.cert_path)))?;
        let key_pem = tokio::fs::read(&settings.key_path)
            .await
            .map_err(|e| Error::Tls(format!("cannot read {}: {e}", settings.key_path)))?;

        let credentials = Self::from_pem(cert_pem, key_pem, &settings.server_name)?;
        Ok(Some(credentials))
    }

    /// Builds credentials from PEM bytes. `server_name` is what clients dialing with
    /// these credentials expect the certificate to name.
    ///
    /// # Errors
    /// Fails when the bytes do not hold a usable certificate and key.
    pub fn from_pem(cert_pem: Vec<u8>, key_pem: Vec<u8>, server_name: &str) -> Result<Self> {
        install_crypto_provider();
        let credentials = Self {
            cert_pem,
            key_pem,
            server_name: server_name.to_string(),
        };
        // Parse eagerly so bad material fails before any listener is bound.
        credentials.rustls_config(Vec::new())?;
        Ok(credentials)
    }

    fn rustls_config(&self, alpn: Vec<Vec<u8>>) -> Result<rustls::ServerConfig> {
        let certs = CertificateDer::pem_slice_iter(&self.cert_pem)
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| Error::Tls(format!("invalid certificate: {e}")))?;
        if certs.is_empty() {
            return Err(Error::Tls("no certificate found".to_string()));
        }
        let key = PrivateKeyDer::from_pem_slice(&self.key_pem)
            .map_err(|e| Error::Tls(format!("invalid private key: {e}")))?;

        let mut config = rustls::ServerConfig::builder_with_provider(Arc::new(
            aws_lc_rs::default_provider(),
        ))
        .with_safe_default_protocol_versions()
        .map_err(|e| Error::Tls(e.to_string()))?
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| Error::Tls(e.to_string()))?;
        config.alpn_protocols = alpn;
        Ok(config)
    }

    /// Server-side config for a tonic server.
    pub fn server_tls_config(&self) -> ServerTlsConfig {
        ServerTlsConfig::new().identity(Identity::from_pem(&self.cert_pem, &self.key_pem))
    }

    /// Client-side config trusting this certificate, used by the gateway to dial the
    /// primary server. The certificate is checked against the configured server name,
    /// not the loopback address that is dialed.
    pub fn client_tls_config(&self) -> ClientTlsConfig {
        ClientTlsConfig::new()
            .ca_certificate(Certificate::from_pem(&self.cert_pem))
            .domain_name(self.server_name.clone())
    }

    /// Name the certificate is expected to carry.
    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    /// Acceptor for the HTTP gateway listener, offering HTTP/2 and HTTP/1.1.
    ///
    /// # Errors
    /// Fails when the material cannot be turned into a server config.
    pub fn acceptor(&self) -> Result<TlsAcceptor> {
        let config = self.rustls_config(vec![b"h2".to_vec(), b"http/1.1".to_vec()])?;
        Ok(TlsAcceptor::from(Arc::new(config)))
    }
}
