//! Certificate from a reverse-proxy header.
//!
//! nginx forwards the client certificate as `$ssl_client_escaped_cert`: the
//! PEM text percent-encoded with query-string rules.

use percent_encoding::percent_decode_str;
use thiserror::Error;
use tracing::{debug, info};

use super::{CertAuthContext, Flow, Stage, bad_request};
use crate::cert::decode_pem_certificate;

/// Query-string unescaping failure.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum UnescapeError {
    /// `%` not followed by two hex digits.
    #[error("invalid escape {0:?}")]
    InvalidEscape(String),
}

/// Decode query-string escaping: `%XX` becomes the byte `0xXX` and `+`
/// becomes a space. Any `%` without two following hex digits is an error.
pub fn query_unescape(input: &str) -> Result<Vec<u8>, UnescapeError> {
    let bytes = input.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let escape = bytes.get(i + 1..i + 3);
            if !escape.is_some_and(|e| e.iter().all(u8::is_ascii_hexdigit)) {
                let end = (i + 3).min(bytes.len());
                return Err(UnescapeError::InvalidEscape(
                    String::from_utf8_lossy(&bytes[i..end]).into_owned(),
                ));
            }
            i += 3;
        } else {
            i += 1;
        }
    }

    let spaced = input.replace('+', " ");
    Ok(percent_decode_str(&spaced).collect())
}

/// Reads a percent-encoded PEM certificate from a configured header.
#[derive(Debug, Clone)]
pub struct HeaderCertStage {
    header_name: String,
}

impl HeaderCertStage {
    /// Stage reading `header_name`.
    pub fn new(header_name: impl Into<String>) -> Self {
        Self {
            header_name: header_name.into(),
        }
    }
}

#[async_trait::async_trait]
impl Stage for HeaderCertStage {
    fn name(&self) -> &'static str {
        "header"
    }

    async fn process(&self, ctx: &mut CertAuthContext) -> Flow {
        let raw = match ctx.headers().get(self.header_name.as_str()) {
            Some(v) if !v.is_empty() => v,
            _ => {
                debug!(header = %self.header_name, "No certificate header");
                return Flow::Continue;
            }
        };

        // An escaped PEM is always visible ASCII.
        let Ok(value) = raw.to_str() else {
            info!(header = %self.header_name, "Certificate header is not ASCII");
            return Flow::Terminate(bad_request());
        };

        let pem = match query_unescape(value) {
            Ok(pem) => pem,
            Err(e) => {
                info!(header = %self.header_name, error = %e, "Could not unescape certificate header");
                return Flow::Terminate(bad_request());
            }
        };

        let certificate = match decode_pem_certificate(&pem) {
            Ok(cert) => cert,
            Err(e) => {
                info!(header = %self.header_name, error = %e, "Could not decode certificate header");
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
