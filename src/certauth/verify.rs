//! Certificate verification policies and the final pipeline stage.

use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info, warn};

use super::{CertAuthContext, Flow, Stage, bad_request};
use crate::cert::IdentityCertificate;
use crate::storage::{CertAuthStore, StoreError};

/// Why a verifier refused a request.
#[derive(Debug, Error)]
pub enum VerifyError {
    /// The policy needs a certificate and none was extracted.
    #[error("no identity certificate presented")]
    NoCertificate,

    /// The certificate hash is not bound to any enrollment.
    #[error("certificate {hash} is not associated with any enrollment")]
    NotAssociated {
        /// Certificate hash.
        hash: String,
    },

    /// Store lookup failed.
    #[error(transparent)]
    Storage(#[from] StoreError),
}

/// Decides whether the extracted certificate (or its absence) is acceptable.
#[async_trait::async_trait]
pub trait CertVerifier: Send + Sync {
    /// Accept or reject. Called exactly once per request, even when no
    /// extractor found a certificate.
    async fn verify(&self, certificate: Option<&IdentityCertificate>) -> Result<(), VerifyError>;
}

/// Accepts everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

#[async_trait::async_trait]
impl CertVerifier for AllowAll {
    async fn verify(&self, _certificate: Option<&IdentityCertificate>) -> Result<(), VerifyError> {
        Ok(())
    }
}

/// Accepts any certificate; rejects requests without one.
#[derive(Debug, Clone, Copy, Default)]
pub struct RequireCertificate;

#[async_trait::async_trait]
impl CertVerifier for RequireCertificate {
    async fn verify(&self, certificate: Option<&IdentityCertificate>) -> Result<(), VerifyError> {
        certificate.map(|_| ()).ok_or(VerifyError::NoCertificate)
    }
}

/// Accepts certificates whose hash is associated with some enrollment.
pub struct StoreVerifier {
    store: Arc<dyn CertAuthStore>,
}

impl StoreVerifier {
    /// Verifier backed by `store`.
    pub fn new(store: Arc<dyn CertAuthStore>) -> Self {
        Self { store }
    }
}

#[async_trait::async_trait]
impl CertVerifier for StoreVerifier {
    async fn verify(&self, certificate: Option<&IdentityCertificate>) -> Result<(), VerifyError> {
        let certificate = certificate.ok_or(VerifyError::NoCertificate)?;
        let hash = certificate.hash();
        if self.store.has_cert_hash(&hash).await? {
            Ok(())
        } else {
            Err(VerifyError::NotAssociated { hash })
        }
    }
}

/// Runs the configured [`CertVerifier`] on the slot contents.
pub struct VerifyStage {
    verifier: Arc<dyn CertVerifier>,
}

impl VerifyStage {
    /// Stage delegating to `verifier`.
    pub fn new(verifier: Arc<dyn CertVerifier>) -> Self {
        Self { verifier }
    }
}

#[async_trait::async_trait]
impl Stage for VerifyStage {
    fn name(&self) -> &'static str {
        "verify"
    }

    async fn process(&self, ctx: &mut CertAuthContext) -> Flow {
        match self.verifier.verify(ctx.certificate()).await {
            Ok(()) => {
                if let Some(extracted) = ctx.extracted() {
                    debug!(
                        source = extracted.source,
                        identity = %extracted.certificate.identity().display_name,
                        "Certificate verified"
                    );
                }
                Flow::Continue
            }
            Err(VerifyError::Storage(e)) => {
                warn!(error = %e, "Association store unavailable, rejecting request");
                Flow::Terminate(bad_request())
            }
            Err(e) => {
                info!(error = %e, "Certificate verification failed");
                Flow::Terminate(bad_request())
            }
        }
    }
}
