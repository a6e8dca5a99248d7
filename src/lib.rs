//! MDM Certificate Authentication Library
//!
//! Device identity certificate extraction, verification and enrollment
//! association for MDM check-in and command endpoints.
//!
//! # Features
//!
//! - **Extraction**: certificate from a reverse-proxy header, the TLS
//!   handshake, or an `Mdm-Signature` detached CMS signature
//! - **Verification**: pluggable policy run on every request; rejections are
//!   always `400 Bad Request`, never `401`
//! - **Association**: enrollment ↔ certificate-hash store (memory or SQLite)
//!   with re-enrollment, duplicate and retroactive rules
//! - **Events**: MicroMDM-compatible webhook

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod cert;
pub mod certauth;
pub mod cli;
pub mod config;
pub mod error;
pub mod server;
pub mod storage;
pub mod tls;
pub mod webhook;

pub use error::{Error, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    match format {
        Some("json") => subscriber
            .with(fmt::layer().json())
            .try_init()
            .map_err(|e| Error::Internal(format!("Failed to install subscriber: {e}")))?,
        _ => subscriber
            .with(fmt::layer())
            .try_init()
            .map_err(|e| Error::Internal(format!("Failed to install subscriber: {e}")))?,
    }

    Ok(())
}
