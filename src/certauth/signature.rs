//! Certificate from the `Mdm-Signature` header.

use std::sync::Arc;

use tracing::{debug, info};

use super::{CertAuthContext, Flow, Stage, bad_request};
use crate::cert::MdmSignatureVerifier;
use crate::cert::signature::MDM_SIGNATURE_HEADER;

/// Recovers the signer certificate of a detached signature over the body.
///
/// The body is buffered once; the handler sees the same bytes.
pub struct MdmSignatureStage {
    verifier: Arc<dyn MdmSignatureVerifier>,
    max_body_size: usize,
}

impl MdmSignatureStage {
    /// Stage checking signatures with `verifier`, buffering at most
    /// `max_body_size` bytes.
    pub fn new(verifier: Arc<dyn MdmSignatureVerifier>, max_body_size: usize) -> Self {
        Self {
            verifier,
            max_body_size,
        }
    }
}

#[async_trait::async_trait]
impl Stage for MdmSignatureStage {
    fn name(&self) -> &'static str {
        "mdm_signature"
    }

    async fn process(&self, ctx: &mut CertAuthContext) -> Flow {
        let signature = match ctx.headers().get(MDM_SIGNATURE_HEADER) {
            Some(v) if !v.is_empty() => v.to_str().map(str::to_owned),
            _ => {
                debug!("No Mdm-Signature header");
                return Flow::Continue;
            }
        };

        // Base64 is always visible ASCII; anything else is a bad signature.
        let Ok(signature) = signature else {
            info!("Mdm-Signature header is not ASCII");
            return Flow::Terminate(bad_request());
        };

        let body = match ctx.body_bytes(self.max_body_size).await {
            Ok(body) => body,
            Err(e) => {
                info!(error = %e, limit = self.max_body_size, "Could not read signed body");
                return Flow::Terminate(bad_request());
            }
        };

        let certificate = match self.verifier.verify(&signature, &body) {
            Ok(cert) => cert,
            Err(e) => {
                info!(error = %e, "Invalid Mdm-Signature");
                return Flow::Terminate(bad_request());
            }
        };

        if let Err(conflict) = ctx.offer_certificate(certificate, self.name()) {
            info!(error = %conflict, "Rejecting request");
            return Flow::Terminate(bad_request());
        }
        Flow::Continue
    }
}
