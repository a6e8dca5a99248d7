//! Device identity certificates.
//!
//! An [`IdentityCertificate`] is the X.509 credential a device presents on a
//! single request. It is never persisted; the association store only ever
//! sees its [`hash`](IdentityCertificate::hash).
//!
//! # Modules
//!
//! - [`identity`]: subject field extraction for logs (`CertIdentity`)
//! - [`signature`]: `Mdm-Signature` detached CMS signature verification

pub mod identity;
pub mod signature;

use std::fmt;

use bytes::Bytes;
use sha2::{Digest, Sha256};
use thiserror::Error;
use x509_parser::certificate::X509Certificate;
use x509_parser::pem::parse_x509_pem;
use x509_parser::prelude::FromDer;

pub use identity::CertIdentity;
pub use signature::{CmsSignatureVerifier, MdmSignatureVerifier, SignatureError};

/// PEM label accepted by [`decode_pem_certificate`].
const PEM_CERTIFICATE_LABEL: &str = "CERTIFICATE";

/// Errors produced while decoding a certificate.
#[derive(Debug, Error)]
pub enum CertificateError {
    /// Input did not contain a PEM block.
    #[error("no PEM block found: {0}")]
    Pem(String),

    /// PEM block had a label other than `CERTIFICATE`.
    #[error("unexpected PEM block type {0:?}")]
    UnexpectedLabel(String),

    /// DER contents were not a parseable X.509 certificate.
    #[error("invalid X.509 certificate: {0}")]
    Der(String),
}

/// An X.509 identity certificate held for the duration of one request.
///
/// Equality compares the DER encoding.
#[derive(Clone, PartialEq, Eq)]
pub struct IdentityCertificate {
    der: Bytes,
}

impl IdentityCertificate {
    /// Wrap DER bytes after checking they parse as an X.509 certificate.
    pub fn from_der(der: impl Into<Bytes>) -> Result<Self, CertificateError> {
        let der = der.into();
        X509Certificate::from_der(&der).map_err(|e| CertificateError::Der(e.to_string()))?;
        Ok(Self { der })
    }

    /// The DER encoding.
    pub fn der(&self) -> &[u8] {
        &self.der
    }

    /// SHA-256 of the DER encoding as lowercase hex.
    pub fn hash(&self) -> String {
        hex::encode(Sha256::digest(&self.der))
    }

    /// Subject fields for logging. Falls back to an empty identity if the
    /// certificate cannot be re-parsed.
    pub fn identity(&self) -> CertIdentity {
        CertIdentity::from_der(&self.der).unwrap_or_default()
    }
}

impl fmt::Debug for IdentityCertificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdentityCertificate")
            .field("sha256", &self.hash())
            .finish()
    }
}

/// Decode the first PEM `CERTIFICATE` block in `data`.
pub fn decode_pem_certificate(data: &[u8]) -> Result<IdentityCertificate, CertificateError> {
    let (_, pem) = parse_x509_pem(data).map_err(|e| CertificateError::Pem(e.to_string()))?;
    if pem.label != PEM_CERTIFICATE_LABEL {
        return Err(CertificateError::UnexpectedLabel(pem.label));
    }
    IdentityCertificate::from_der(pem.contents)
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
