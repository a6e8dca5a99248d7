//! Certificate extraction and verification middleware.
//!
//! # Architecture
//!
//! ```text
//! request
//!   → CertAuthContext { headers, extensions, body, certificate: None }
//!   → extraction stages, in configured order
//!       HeaderCertStage | TlsCertStage | MdmSignatureStage
//!   → VerifyStage (CertVerifier policy, always last)
//!   → request rebuilt, VerifiedCertificate in extensions
//!   → protocol handler
//! ```
//!
//! Every stage has the same shape: it mutates the per-request context and
//! returns [`Flow::Continue`] or [`Flow::Terminate`] with the response to
//! send. A terminated pipeline never reaches the handler.
//!
//! The only error response produced here is `400 Bad Request`. A 401 would
//! make devices unenroll, so a misbehaving verifier must never cause one.

pub mod association;
pub mod header;
pub mod signature;
pub mod tls;
pub mod verify;

use std::sync::Arc;

use axum::{
    body::{Body, Bytes},
    extract::{Request, State},
    http::{HeaderMap, Extensions, StatusCode, request::Parts},
    middleware::Next,
    response::{IntoResponse, Response},
};
use thiserror::Error;
use tracing::{debug, info};

use crate::cert::{CmsSignatureVerifier, IdentityCertificate};
use crate::config::{CertAuthConfig, CompositionPolicy, ExtractorKind, VerifierKind};
use crate::storage::CertAuthStore;

pub use association::{CertAuth, CertAuthError};
pub use header::HeaderCertStage;
pub use signature::MdmSignatureStage;
pub use tls::{PeerCertificates, TlsCertStage};
pub use verify::{AllowAll, CertVerifier, RequireCertificate, StoreVerifier, VerifyError, VerifyStage};

// ─────────────────────────────────────────────────────────────────────────────
// Stage contract
// ─────────────────────────────────────────────────────────────────────────────

/// Outcome of one stage.
#[derive(Debug)]
pub enum Flow {
    /// Run the next stage.
    Continue,
    /// Stop and send this response.
    Terminate(Response),
}

/// One step of the certificate pipeline.
#[async_trait::async_trait]
pub trait Stage: Send + Sync {
    /// Short name used in logs and as the certificate source label.
    fn name(&self) -> &'static str;

    /// Inspect or update the request state.
    async fn process(&self, ctx: &mut CertAuthContext) -> Flow;
}

/// The single error response of this module.
pub fn bad_request() -> Response {
    (
        StatusCode::BAD_REQUEST,
        StatusCode::BAD_REQUEST
            .canonical_reason()
            .unwrap_or("Bad Request"),
    )
        .into_response()
}

// ─────────────────────────────────────────────────────────────────────────────
// Per-request state
// ─────────────────────────────────────────────────────────────────────────────

/// Certificate placed in the slot, with the stage that found it.
#[derive(Debug, Clone)]
pub struct ExtractedCertificate {
    /// The certificate.
    pub certificate: IdentityCertificate,
    /// Name of the stage that extracted it.
    pub source: &'static str,
}

/// Certificate that passed verification, inserted into the request
/// extensions for downstream handlers.
#[derive(Debug, Clone)]
pub struct VerifiedCertificate(pub IdentityCertificate);

/// A second extractor found a different certificate under
/// [`CompositionPolicy::RejectOnConflict`].
#[derive(Debug, Error)]
#[error("certificate from {second} conflicts with certificate from {first}")]
pub struct CertificateConflict {
    /// Stage that filled the slot.
    pub first: &'static str,
    /// Stage whose certificate was refused.
    pub second: &'static str,
}

enum RequestBody {
    Streaming(Body),
    Buffered(Bytes),
}

/// Request state threaded through the stages.
pub struct CertAuthContext {
    parts: Parts,
    body: RequestBody,
    certificate: Option<ExtractedCertificate>,
    composition: CompositionPolicy,
}

impl CertAuthContext {
    /// Split `request` into pipeline state.
    pub fn new(request: Request, composition: CompositionPolicy) -> Self {
        let (parts, body) = request.into_parts();
        Self {
            parts,
            body: RequestBody::Streaming(body),
            certificate: None,
            composition,
        }
    }

    /// Request headers.
    pub fn headers(&self) -> &HeaderMap {
        &self.parts.headers
    }

    /// Request extensions (TLS peer certificates live here).
    pub fn extensions(&self) -> &Extensions {
        &self.parts.extensions
    }

    /// The whole body, read at most once.
    ///
    /// The first call drains the body stream (up to `limit` bytes) and keeps
    /// the bytes; later calls and the rebuilt request reuse them.
    pub async fn body_bytes(&mut self, limit: usize) -> Result<Bytes, axum::Error> {
        let bytes = match std::mem::replace(&mut self.body, RequestBody::Buffered(Bytes::new())) {
            RequestBody::Buffered(bytes) => bytes,
            RequestBody::Streaming(body) => axum::body::to_bytes(body, limit).await?,
        };
        self.body = RequestBody::Buffered(bytes.clone());
        Ok(bytes)
    }

    /// Current slot contents.
    pub fn certificate(&self) -> Option<&IdentityCertificate> {
        self.certificate.as_ref().map(|c| &c.certificate)
    }

    /// Current slot contents with their source.
    pub fn extracted(&self) -> Option<&ExtractedCertificate> {
        self.certificate.as_ref()
    }

    /// Offer a certificate to the slot, applying the composition policy.
    pub fn offer_certificate(
        &mut self,
        certificate: IdentityCertificate,
        source: &'static str,
    ) -> Result<(), CertificateConflict> {
        let Some(existing) = &self.certificate else {
            self.certificate = Some(ExtractedCertificate {
                certificate,
                source,
            });
            return Ok(());
        };

        match self.composition {
            CompositionPolicy::FirstMatch => {
                debug!(kept = existing.source, ignored = source, "Certificate slot already filled");
                Ok(())
            }
            CompositionPolicy::RejectOnConflict if existing.certificate == certificate => Ok(()),
            CompositionPolicy::RejectOnConflict => Err(CertificateConflict {
                first: existing.source,
                second: source,
            }),
        }
    }

    /// Reassemble the request for the downstream handler.
    pub fn into_request(self) -> (Request, Option<IdentityCertificate>) {
        let body = match self.body {
            RequestBody::Streaming(body) => body,
            RequestBody::Buffered(bytes) => Body::from(bytes),
        };
        let request = Request::from_parts(self.parts, body);
        (request, self.certificate.map(|c| c.certificate))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Pipeline
// ─────────────────────────────────────────────────────────────────────────────

/// Ordered extraction stages followed by the verification stage.
pub struct CertAuthPipeline {
    stages: Vec<Arc<dyn Stage>>,
    composition: CompositionPolicy,
}

impl CertAuthPipeline {
    /// Build a pipeline; `verifier` always runs last.
    pub fn new(
        extractors: Vec<Arc<dyn Stage>>,
        verifier: Arc<dyn CertVerifier>,
        composition: CompositionPolicy,
    ) -> Self {
        let mut stages = extractors;
        stages.push(Arc::new(VerifyStage::new(verifier)));
        Self {
            stages,
            composition,
        }
    }

    /// Build the pipeline described by `config`.
    pub fn from_config(
        config: &CertAuthConfig,
        max_body_size: usize,
        store: Arc<dyn CertAuthStore>,
    ) -> Self {
        let extractors = config
            .extractors
            .iter()
            .map(|kind| -> Arc<dyn Stage> {
                match kind {
                    ExtractorKind::Header => Arc::new(HeaderCertStage::new(&config.header_name)),
                    ExtractorKind::Tls => Arc::new(TlsCertStage),
                    ExtractorKind::MdmSignature => Arc::new(MdmSignatureStage::new(
                        Arc::new(CmsSignatureVerifier),
                        max_body_size,
                    )),
                }
            })
            .collect();

        let verifier: Arc<dyn CertVerifier> = match config.verifier {
            VerifierKind::AllowAll => Arc::new(AllowAll),
            VerifierKind::RequireCertificate => Arc::new(RequireCertificate),
            VerifierKind::Store => Arc::new(StoreVerifier::new(store)),
        };

        Self::new(extractors, verifier, config.composition)
    }

    /// Stage names in execution order.
    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    /// Run every stage. `Ok` carries the request to forward, `Err` the
    /// response that ends it.
    pub async fn run(&self, request: Request) -> Result<Request, Response> {
        let mut ctx = CertAuthContext::new(request, self.composition);

        for stage in &self.stages {
            if let Flow::Terminate(response) = stage.process(&mut ctx).await {
                info!(stage = stage.name(), "Certificate pipeline terminated request");
                return Err(response);
            }
        }

        let (mut request, certificate) = ctx.into_request();
        if let Some(certificate) = certificate {
            request
                .extensions_mut()
                .insert(VerifiedCertificate(certificate));
        }
        Ok(request)
    }
}

/// Axum middleware running the pipeline in front of the protocol handlers.
pub async fn certauth_middleware(
    State(pipeline): State<Arc<CertAuthPipeline>>,
    request: Request,
    next: Next,
) -> Response {
    match pipeline.run(request).await {
        Ok(request) => next.run(request).await,
        Err(response) => response,
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
