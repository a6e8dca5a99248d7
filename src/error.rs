//! Error types for mdm-certauth

use std::io;

use thiserror::Error;

use crate::storage::StoreError;

/// Result type alias for mdm-certauth
pub type Result<T> = std::result::Result<T, Error>;

/// Crate-level errors
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// TLS setup error
    #[error("TLS error: {0}")]
    Tls(String),

    /// Certificate could not be loaded or parsed
    #[error("Certificate error: {0}")]
    Certificate(#[from] crate::cert::CertificateError),

    /// Association store failure
    #[error("Storage error: {0}")]
    Storage(#[from] StoreError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}
