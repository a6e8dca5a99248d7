//! `Mdm-Signature` verification.
//!
//! Devices that cannot present a TLS client certificate (for example when a
//! load balancer terminates TLS) sign every request body instead. The
//! `Mdm-Signature` header carries a base64 CMS `SignedData` structure with
//! the body detached; the signer's certificate is embedded in it.
//!
//! [`CmsSignatureVerifier`] checks that the signature covers the exact body
//! bytes and returns the signer certificate. It does not build or validate a
//! chain: whether that certificate is trusted is the verifier policy's call.

use aws_lc_rs::digest::{self, SHA1_FOR_LEGACY_USE_ONLY, SHA256};
use aws_lc_rs::signature::{
    ECDSA_P256_SHA256_ASN1, RSA_PKCS1_2048_8192_SHA1_FOR_LEGACY_USE_ONLY,
    RSA_PKCS1_2048_8192_SHA256, UnparsedPublicKey, VerificationAlgorithm,
};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use cms::cert::CertificateChoices;
use cms::content_info::ContentInfo;
use cms::signed_data::{SignedData, SignerIdentifier, SignerInfo};
use der::asn1::OctetString;
use der::oid::ObjectIdentifier;
use der::{Decode, Encode};
use thiserror::Error;
use x509_cert::Certificate;

use super::IdentityCertificate;

/// Header carrying the detached signature.
pub const MDM_SIGNATURE_HEADER: &str = "Mdm-Signature";

const ID_SIGNED_DATA: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.113549.1.7.2");
const ID_MESSAGE_DIGEST: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.113549.1.9.4");
const ID_SUBJECT_KEY_IDENTIFIER: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.29.14");

const ID_SHA1: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.3.14.3.2.26");
const ID_SHA256: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.16.840.1.101.3.4.2.1");

const ID_RSA_ENCRYPTION: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.113549.1.1.1");
const ID_SHA1_WITH_RSA: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.113549.1.1.5");
const ID_SHA256_WITH_RSA: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.113549.1.1.11");
const ID_EC_PUBLIC_KEY: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.10045.2.1");
const ID_ECDSA_WITH_SHA256: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.10045.4.3.2");

/// Reasons a detached signature is rejected.
#[derive(Debug, Error)]
pub enum SignatureError {
    /// Header value is not valid base64.
    #[error("signature is not base64: {0}")]
    Base64(#[from] base64::DecodeError),

    /// Decoded bytes are not a CMS `SignedData` structure.
    #[error("malformed CMS structure: {0}")]
    Malformed(String),

    /// No signer, or the signer's certificate is not embedded.
    #[error("signer certificate not found")]
    SignerNotFound,

    /// Digest or signature algorithm outside the supported set.
    #[error("unsupported algorithm {0}")]
    UnsupportedAlgorithm(ObjectIdentifier),

    /// `messageDigest` attribute does not match the body.
    #[error("message digest mismatch")]
    DigestMismatch,

    /// Cryptographic signature check failed.
    #[error("signature verification failed")]
    BadSignature,

    /// Signer certificate could not be re-parsed.
    #[error("invalid signer certificate: {0}")]
    Certificate(#[from] super::CertificateError),
}

impl From<der::Error> for SignatureError {
    fn from(e: der::Error) -> Self {
        Self::Malformed(e.to_string())
    }
}

/// Verifies a detached signature over a request body and recovers the
/// signer certificate.
pub trait MdmSignatureVerifier: Send + Sync {
    /// Check `signature` (the raw header value) against `body`.
    fn verify(&self, signature: &str, body: &[u8]) -> Result<IdentityCertificate, SignatureError>;
}

/// CMS/PKCS#7 implementation of [`MdmSignatureVerifier`].
///
/// Supports SHA-1 and SHA-256 digests with RSA PKCS#1 v1.5, and ECDSA P-256
/// with SHA-256.
#[derive(Debug, Clone, Copy, Default)]
pub struct CmsSignatureVerifier;

impl MdmSignatureVerifier for CmsSignatureVerifier {
    fn verify(&self, signature: &str, body: &[u8]) -> Result<IdentityCertificate, SignatureError> {
        let raw = STANDARD.decode(signature.trim())?;
        let content_info = ContentInfo::from_der(&raw)?;
        if content_info.content_type != ID_SIGNED_DATA {
            return Err(SignatureError::Malformed(format!(
                "content type {} is not signedData",
                content_info.content_type
            )));
        }
        let signed_data = SignedData::from_der(&content_info.content.to_der()?)?;

        let signer = signed_data
            .signer_infos
            .0
            .iter()
            .next()
            .ok_or(SignatureError::SignerNotFound)?;
        let cert = find_signer_certificate(&signed_data, signer)?;

        verify_signer(signer, &cert, body)?;

        Ok(IdentityCertificate::from_der(cert.to_der()?)?)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Helpers
// ─────────────────────────────────────────────────────────────────────────────

fn find_signer_certificate(
    signed_data: &SignedData,
    signer: &SignerInfo,
) -> Result<Certificate, SignatureError> {
    let certs = signed_data
        .certificates
        .as_ref()
        .ok_or(SignatureError::SignerNotFound)?;

    certs
        .0
        .iter()
        .filter_map(|choice| match choice {
            CertificateChoices::Certificate(cert) => Some(cert),
            _ => None,
        })
        .find(|cert| matches_signer(cert, &signer.sid))
        .cloned()
        .ok_or(SignatureError::SignerNotFound)
}

fn matches_signer(cert: &Certificate, sid: &SignerIdentifier) -> bool {
    let tbs = &cert.tbs_certificate;
    match sid {
        SignerIdentifier::IssuerAndSerialNumber(ias) => {
            tbs.issuer == ias.issuer && tbs.serial_number == ias.serial_number
        }
        SignerIdentifier::SubjectKeyIdentifier(ski) => tbs
            .extensions
            .iter()
            .flatten()
            .filter(|ext| ext.extn_id == ID_SUBJECT_KEY_IDENTIFIER)
            .filter_map(|ext| OctetString::from_der(ext.extn_value.as_bytes()).ok())
            .any(|key_id| key_id == ski.0),
    }
}

fn verify_signer(
    signer: &SignerInfo,
    cert: &Certificate,
    body: &[u8],
) -> Result<(), SignatureError> {
    let digest_oid = signer.digest_alg.oid;
    let digest_alg = if digest_oid == ID_SHA256 {
        &SHA256
    } else if digest_oid == ID_SHA1 {
        &SHA1_FOR_LEGACY_USE_ONLY
    } else {
        return Err(SignatureError::UnsupportedAlgorithm(digest_oid));
    };

    // With signed attributes the signature covers their DER SET encoding and
    // the body is bound through the messageDigest attribute.
    let signed_content = match &signer.signed_attrs {
        Some(attrs) => {
            let body_digest = digest::digest(digest_alg, body);
            let message_digest = attrs
                .iter()
                .find(|attr| attr.oid == ID_MESSAGE_DIGEST)
                .and_then(|attr| attr.values.iter().next())
                .ok_or(SignatureError::DigestMismatch)?;
            let message_digest = OctetString::from_der(&message_digest.to_der()?)?;
            if message_digest.as_bytes() != body_digest.as_ref() {
                return Err(SignatureError::DigestMismatch);
            }
            attrs.to_der()?
        }
        None => body.to_vec(),
    };

    let spki = &cert.tbs_certificate.subject_public_key_info;
    let algorithm = verification_algorithm(
        spki.algorithm.oid,
        signer.signature_algorithm.oid,
        digest_oid,
    )?;

    UnparsedPublicKey::new(algorithm, spki.subject_public_key.raw_bytes())
        .verify(&signed_content, signer.signature.as_bytes())
        .map_err(|_| SignatureError::BadSignature)
}

fn verification_algorithm(
    key_oid: ObjectIdentifier,
    signature_oid: ObjectIdentifier,
    digest_oid: ObjectIdentifier,
) -> Result<&'static dyn VerificationAlgorithm, SignatureError> {
    // CMS signers commonly put plain rsaEncryption in signatureAlgorithm and
    // leave the hash to digestAlgorithm.
    let rsa_with = |specific: ObjectIdentifier| {
        signature_oid == ID_RSA_ENCRYPTION || signature_oid == specific
    };

    if key_oid == ID_RSA_ENCRYPTION && digest_oid == ID_SHA256 && rsa_with(ID_SHA256_WITH_RSA) {
        Ok(&RSA_PKCS1_2048_8192_SHA256)
    } else if key_oid == ID_RSA_ENCRYPTION && digest_oid == ID_SHA1 && rsa_with(ID_SHA1_WITH_RSA) {
        Ok(&RSA_PKCS1_2048_8192_SHA1_FOR_LEGACY_USE_ONLY)
    } else if key_oid == ID_EC_PUBLIC_KEY
        && digest_oid == ID_SHA256
        && signature_oid == ID_ECDSA_WITH_SHA256
    {
        Ok(&ECDSA_P256_SHA256_ASN1)
    } else {
        Err(SignatureError::UnsupportedAlgorithm(signature_oid))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
