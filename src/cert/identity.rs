//! Certificate identity extraction.
//!
//! Parses a DER certificate and pulls out the subject fields worth putting in
//! a log line: Common Name, issuer Common Name, serial number. None of these
//! take part in trust decisions; those key on the certificate hash alone.

use x509_parser::certificate::X509Certificate;
use x509_parser::prelude::FromDer;
use x509_parser::x509::X509Name;

use super::CertificateError;

// ─────────────────────────────────────────────────────────────────────────────
// Certificate identity
// ─────────────────────────────────────────────────────────────────────────────

/// Descriptive fields of a device identity certificate.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CertIdentity {
    /// Subject Common Name. Apple devices put the UDID or a profile-defined
    /// name here.
    pub common_name: Option<String>,

    /// Issuer Common Name (the SCEP/ACME CA that minted the identity).
    pub issuer_common_name: Option<String>,

    /// Serial number, lowercase hex.
    pub serial: String,

    /// Pre-computed label for logs.
    pub display_name: String,
}

impl CertIdentity {
    /// Parse a DER-encoded certificate and extract its descriptive fields.
    pub fn from_der(der: &[u8]) -> Result<Self, CertificateError> {
        let (_, cert) =
            X509Certificate::from_der(der).map_err(|e| CertificateError::Der(e.to_string()))?;

        let common_name = first_common_name(cert.subject());
        let issuer_common_name = first_common_name(cert.issuer());
        let serial = cert.tbs_certificate.raw_serial_as_string().replace(':', "");
        let display_name = build_display_name(common_name.as_deref(), &serial);

        Ok(Self {
            common_name,
            issuer_common_name,
            serial,
            display_name,
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Extraction helpers
// ─────────────────────────────────────────────────────────────────────────────

fn first_common_name(name: &X509Name<'_>) -> Option<String> {
    name.iter_common_name()
        .next()
        .and_then(|attr| attr.as_str().ok())
        .map(str::to_owned)
}

/// Prefers the CN, then `serial:<hex>`, then `"<unknown>"`.
fn build_display_name(cn: Option<&str>, serial: &str) -> String {
    match (cn, serial) {
        (Some(cn), _) => cn.to_owned(),
        (None, "") => "<unknown>".to_owned(),
        (None, serial) => format!("serial:{serial}"),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
