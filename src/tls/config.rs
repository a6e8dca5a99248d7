//! rustls server configuration.
//!
//! Devices present identity certificates minted by whatever SCEP/ACME CA the
//! deployment uses, and trust in them is decided per request by the
//! certificate verifier. The handshake therefore *requests* a client
//! certificate but never requires one, and by default accepts any chain.
//! Configuring `tls.client_ca` narrows that to chains under the given CA.
//!
//! All certificate and key files are PEM.

use std::fs;
use std::sync::Arc;

use rustls::client::danger::HandshakeSignatureValid;
use rustls::crypto::{CryptoProvider, WebPkiSupportedAlgorithms};
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, UnixTime};
use rustls::server::WebPkiClientVerifier;
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::{DigitallySignedStruct, DistinguishedName, ServerConfig, SignatureScheme};
use tracing::debug;

use crate::config::TlsConfig;
use crate::{Error, Result};

/// Build the listener's `rustls::ServerConfig`.
pub fn build_tls_config(config: &TlsConfig) -> Result<ServerConfig> {
    let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());
    let server_certs = load_certs(&config.server_cert)?;
    let server_key = load_private_key(&config.server_key)?;

    let client_verifier: Arc<dyn ClientCertVerifier> = match &config.client_ca {
        Some(ca_path) => {
            let mut roots = rustls::RootCertStore::empty();
            for cert in load_certs(ca_path)? {
                roots
                    .add(cert)
                    .map_err(|e| Error::Tls(format!("Failed to add CA cert to trust store: {e}")))?;
            }
            WebPkiClientVerifier::builder_with_provider(Arc::new(roots), provider.clone())
                .allow_unauthenticated()
                .build()
                .map_err(|e| Error::Tls(format!("Failed to build client verifier: {e}")))?
        }
        None => Arc::new(AcceptAnyClientCert::new(&provider)),
    };

    let mut tls_cfg = ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| Error::Tls(format!("Unsupported protocol versions: {e}")))?
        .with_client_cert_verifier(client_verifier)
        .with_single_cert(server_certs, server_key)
        .map_err(|e| Error::Tls(format!("TLS config error (cert/key mismatch?): {e}")))?;

    // Prefer HTTP/2, fall back to HTTP/1.1
    tls_cfg.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];

    debug!(
        server_cert = %config.server_cert,
        client_ca = ?config.client_ca,
        "TLS config built"
    );

    Ok(tls_cfg)
}

/// Load all certificates from a PEM file.
pub fn load_certs(path: &str) -> Result<Vec<CertificateDer<'static>>> {
    let pem_data = read_file(path)?;
    let certs = CertificateDer::pem_slice_iter(&pem_data)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::Tls(format!("Failed to parse certs from '{path}': {e}")))?;

    if certs.is_empty() {
        return Err(Error::Tls(format!("No certificates found in '{path}'")));
    }
    Ok(certs)
}

/// Load the first private key (PKCS#8, PKCS#1 or SEC1) from a PEM file.
pub fn load_private_key(path: &str) -> Result<PrivateKeyDer<'static>> {
    let pem_data = read_file(path)?;
    PrivateKeyDer::from_pem_slice(&pem_data)
        .map_err(|e| Error::Tls(format!("Failed to parse private key from '{path}': {e}")))
}

fn read_file(path: &str) -> Result<Vec<u8>> {
    fs::read(path).map_err(|e| Error::Tls(format!("Cannot read '{path}': {e}")))
}

/// Requests a client certificate, accepts any, and still checks the
/// handshake signature so the client proves possession of the key.
#[derive(Debug)]
pub struct AcceptAnyClientCert {
    algorithms: WebPkiSupportedAlgorithms,
}

impl AcceptAnyClientCert {
    /// Verifier using `provider`'s signature algorithms.
    pub fn new(provider: &CryptoProvider) -> Self {
        Self {
            algorithms: provider.signature_verification_algorithms,
        }
    }
}

impl ClientCertVerifier for AcceptAnyClientCert {
    fn offer_client_auth(&self) -> bool {
        true
    }

    fn client_auth_mandatory(&self) -> bool {
        false
    }

    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _now: UnixTime,
    ) -> std::result::Result<ClientCertVerified, rustls::Error> {
        Ok(ClientCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use rcgen::{CertificateParams, KeyPair};

    use super::*;

    fn write_temp(dir: &tempfile::TempDir, name: &str, contents: &str) -> String {
        let path = dir.path().join(name);
        let mut f = fs::File::create(&path).unwrap();
        f.write_all(contents.as_bytes()).unwrap();
        path.to_string_lossy().into_owned()
    }

    fn server_files(dir: &tempfile::TempDir) -> (String, String) {
        let key = KeyPair::generate().unwrap();
        let cert = CertificateParams::new(vec!["mdm.example".to_string()])
            .unwrap()
            .self_signed(&key)
            .unwrap();
        (
            write_temp(dir, "server.crt", &cert.pem()),
            write_temp(dir, "server.key", &key.serialize_pem()),
        )
    }

    #[test]
    fn builds_config_accepting_any_client_cert() {
        let dir = tempfile::tempdir().unwrap();
        let (cert, key) = server_files(&dir);
        let config = TlsConfig {
            enabled: true,
            server_cert: cert,
            server_key: key,
            client_ca: None,
        };

        let tls = build_tls_config(&config).unwrap();
        assert_eq!(tls.alpn_protocols, vec![b"h2".to_vec(), b"http/1.1".to_vec()]);
    }

    #[test]
    fn builds_config_with_client_ca() {
        let dir = tempfile::tempdir().unwrap();
        let (cert, key) = server_files(&dir);
        let config = TlsConfig {
            enabled: true,
            server_cert: cert.clone(),
            server_key: key,
            client_ca: Some(cert),
        };
        assert!(build_tls_config(&config).is_ok());
    }

    #[test]
    fn missing_files_are_tls_errors() {
        let err = load_certs("/nonexistent/server.crt").unwrap_err();
        assert!(matches!(err, Error::Tls(_)));
        assert!(load_private_key("/nonexistent/server.key").is_err());
    }

    #[test]
    fn file_without_certificates_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_temp(&dir, "empty.pem", "nothing here\n");
        let err = load_certs(&path).unwrap_err();
        assert!(err.to_string().contains("No certificates"));
    }

    #[test]
    fn any_client_cert_verifier_is_optional() {
        let provider = rustls::crypto::aws_lc_rs::default_provider();
        let verifier = AcceptAnyClientCert::new(&provider);
        assert!(verifier.offer_client_auth());
        assert!(!verifier.client_auth_mandatory());
        assert!(!verifier.supported_verify_schemes().is_empty());
    }
}
