//! Certificate from the TLS handshake.

use std::sync::Arc;

use rustls::pki_types::CertificateDer;
use tracing::{debug, info, warn};

use super::{CertAuthContext, Flow, Stage, bad_request};
use crate::cert::IdentityCertificate;

/// Client certificate chain captured by the TLS listener for one connection,
/// leaf first. Inserted into every request served on that connection.
#[derive(Debug, Clone, Default)]
pub struct PeerCertificates(pub Arc<Vec<CertificateDer<'static>>>);

impl PeerCertificates {
    /// Wrap a chain as returned by `rustls::ServerConnection::peer_certificates`.
    pub fn new(chain: Vec<CertificateDer<'static>>) -> Self {
        Self(Arc::new(chain))
    }

    /// The leaf certificate, if the client sent any.
    pub fn leaf(&self) -> Option<&CertificateDer<'static>> {
        self.0.first()
    }
}

/// Uses the first certificate of the TLS peer chain. The chain is not
/// validated here; trust is the verifier's job.
#[derive(Debug, Clone, Copy, Default)]
pub struct TlsCertStage;

#[async_trait::async_trait]
impl Stage for TlsCertStage {
    fn name(&self) -> &'static str {
        "tls"
    }

    async fn process(&self, ctx: &mut CertAuthContext) -> Flow {
        let Some(leaf) = ctx
            .extensions()
            .get::<PeerCertificates>()
            .and_then(PeerCertificates::leaf)
        else {
            debug!("No TLS peer certificate");
            return Flow::Continue;
        };

        let certificate = match IdentityCertificate::from_der(leaf.to_vec()) {
            Ok(cert) => cert,
            Err(e) => {
                warn!(error = %e, "Ignoring unparseable TLS peer certificate");
                return Flow::Continue;
            }
        };

        if let Err(conflict) = ctx.offer_certificate(certificate, self.name()) {
            info!(error = %conflict, "Rejecting request");
            return Flow::Terminate(bad_request());
        }
        Flow::Continue
    }
}
