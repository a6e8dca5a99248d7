//! Configuration management

use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Environment variable prefix; nested keys are separated by `__`
/// (`MDM_CERTAUTH_SERVER__PORT=9000`).
pub const ENV_PREFIX: &str = "MDM_CERTAUTH_";

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// HTTP server settings
    pub server: ServerConfig,
    /// TLS listener settings
    pub tls: TlsConfig,
    /// Certificate extraction and verification
    pub certauth: CertAuthConfig,
    /// Association store
    pub storage: StorageConfig,
    /// Event webhook
    pub webhook: WebhookConfig,
}

impl Config {
    /// Load configuration from file and environment
    ///
    /// # Errors
    ///
    /// Returns an error if the config file does not exist, cannot be parsed,
    /// or describes an unusable combination of settings.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        figment = figment.merge(Env::prefixed(ENV_PREFIX).split("__"));

        let config: Self = figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject combinations that cannot work at runtime.
    pub fn validate(&self) -> Result<()> {
        let extractors = &self.certauth.extractors;

        if extractors.contains(&ExtractorKind::Header)
            && self.certauth.header_name.trim().is_empty()
        {
            return Err(Error::Config(
                "certauth.header_name must be set when the header extractor is enabled".into(),
            ));
        }

        if extractors.contains(&ExtractorKind::Tls) && !self.tls.enabled {
            tracing::warn!("TLS extractor configured but tls.enabled is false; it will never find a certificate");
        }

        if extractors.len() > 1 {
            tracing::warn!(
                ?extractors,
                composition = ?self.certauth.composition,
                "Multiple certificate extractors configured"
            );
        }

        if self.tls.enabled && (self.tls.server_cert.is_empty() || self.tls.server_key.is_empty()) {
            return Err(Error::Config(
                "tls.server_cert and tls.server_key are required when tls.enabled is true".into(),
            ));
        }

        if let Some(url) = &self.webhook.url {
            url::Url::parse(url)
                .map_err(|e| Error::Config(format!("Invalid webhook.url '{url}': {e}")))?;
        }

        Ok(())
    }
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,
    /// Port to listen on
    pub port: u16,
    /// Per-request deadline; expiring cancels any pending store call
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
    /// Maximum request body size buffered for signature checks (bytes)
    pub max_body_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 9000,
            request_timeout: Duration::from_secs(30),
            max_body_size: 10 * 1024 * 1024, // 10MB
        }
    }
}

/// TLS listener configuration.
///
/// When `enabled` is `false` the server speaks plain HTTP and expects a
/// reverse proxy to forward the client certificate in a header.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct TlsConfig {
    /// Terminate TLS in-process.
    pub enabled: bool,

    /// Path to the PEM-encoded server certificate chain.
    pub server_cert: String,

    /// Path to the PEM-encoded server private key.
    pub server_key: String,

    /// Optional PEM CA bundle. When set, presented client certificates must
    /// chain to it at the handshake. When unset, any client certificate is
    /// accepted and trust is left to the certificate verifier.
    pub client_ca: Option<String>,
}

/// Where a candidate identity certificate is looked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractorKind {
    /// URL-escaped PEM in a proxy-set header
    Header,
    /// TLS peer certificate
    Tls,
    /// `Mdm-Signature` detached signature
    MdmSignature,
}

/// What happens when a second extractor finds a certificate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompositionPolicy {
    /// Keep the first certificate found; later ones are ignored.
    #[default]
    FirstMatch,
    /// A different certificate from a later extractor rejects the request.
    RejectOnConflict,
}

/// Verifier policy applied after extraction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerifierKind {
    /// Accept every request, with or without a certificate.
    AllowAll,
    /// Accept any certificate, reject requests without one. Association is
    /// then enforced by the protocol handlers, so new devices can enroll.
    #[default]
    RequireCertificate,
    /// Accept only certificates whose hash is already associated with an
    /// enrollment. Enrollment must bind certificates out of band.
    Store,
}

/// Certificate extraction and verification configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CertAuthConfig {
    /// Extractors, run in order.
    pub extractors: Vec<ExtractorKind>,
    /// Header read by the `header` extractor (nginx: `$ssl_client_escaped_cert`).
    pub header_name: String,
    /// Multi-extractor conflict handling.
    pub composition: CompositionPolicy,
    /// Verifier policy.
    pub verifier: VerifierKind,
    /// Associate a certificate with an existing enrollment that has none yet,
    /// provided no other enrollment uses it.
    pub allow_retroactive: bool,
    /// Allow one certificate to be associated with several enrollments.
    pub allow_duplicates: bool,
}

impl Default for CertAuthConfig {
    fn default() -> Self {
        Self {
            extractors: vec![ExtractorKind::Tls],
            header_name: "X-Ssl-Client-Cert".to_string(),
            composition: CompositionPolicy::default(),
            verifier: VerifierKind::default(),
            allow_retroactive: false,
            allow_duplicates: false,
        }
    }
}

/// Association store backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackend {
    /// Process memory
    Memory,
    /// SQLite file
    #[default]
    Sqlite,
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Backend selection
    pub backend: StorageBackend,
    /// SQLite database file
    pub sqlite_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::default(),
            sqlite_path: PathBuf::from("db/certauth.db"),
        }
    }
}

/// Event webhook configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct WebhookConfig {
    /// Receiver URL; events are not sent when unset.
    pub url: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_extract_tls_and_require_certificate() {
        let config = Config::default();
        assert_eq!(config.certauth.extractors, vec![ExtractorKind::Tls]);
        assert_eq!(config.certauth.verifier, VerifierKind::RequireCertificate);
        assert_eq!(config.certauth.composition, CompositionPolicy::FirstMatch);
        assert_eq!(config.storage.backend, StorageBackend::Sqlite);
        assert!(!config.tls.enabled);
    }

    #[test]
    fn certauth_section_deserializes_from_yaml() {
        let yaml = r#"
certauth:
  extractors: [header, mdm_signature]
  header_name: X-Client-Cert
  composition: reject_on_conflict
  verifier: store
server:
  request_timeout: 5s
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(
            config.certauth.extractors,
            vec![ExtractorKind::Header, ExtractorKind::MdmSignature]
        );
        assert_eq!(config.certauth.header_name, "X-Client-Cert");
        assert_eq!(config.certauth.composition, CompositionPolicy::RejectOnConflict);
        assert_eq!(config.certauth.verifier, VerifierKind::Store);
        assert_eq!(config.server.request_timeout, Duration::from_secs(5));
    }

    #[test]
    fn header_extractor_requires_header_name() {
        let mut config = Config::default();
        config.certauth.extractors = vec![ExtractorKind::Header];
        config.certauth.header_name = "  ".to_string();
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn tls_requires_cert_and_key_paths() {
        let mut config = Config::default();
        config.tls.enabled = true;
        assert!(config.validate().is_err());

        config.tls.server_cert = "server.crt".into();
        config.tls.server_key = "server.key".into();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn invalid_webhook_url_is_rejected() {
        let mut config = Config::default();
        config.webhook.url = Some("not a url".into());
        assert!(config.validate().is_err());
    }

    #[test]
    fn load_reads_yaml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("certauth.yaml");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "storage:\n  backend: memory\ncertauth:\n  verifier: allow_all").unwrap();
        drop(f);

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.storage.backend, StorageBackend::Memory);
        assert_eq!(config.certauth.verifier, VerifierKind::AllowAll);
    }

    #[test]
    fn load_missing_file_is_config_error() {
        let err = Config::load(Some(Path::new("/nonexistent/certauth.yaml"))).unwrap_err();
        assert!(err.to_string().contains("Config file not found"));
    }
}
