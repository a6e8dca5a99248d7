//! Certificate-hash association store.
//!
//! The only persistent state in the crate: one row per enrollment binding its
//! identifier to the SHA-256 hash of the certificate currently trusted for it.
//!
//! The [`CertAuthStore`] trait abstracts over backends:
//!
//! - [`MemoryCertAuthStore`]: `DashMap`, for tests and single-node setups
//!   that re-enroll on restart
//! - [`SqliteCertAuthStore`]: `sqlx` SQLite pool
//!
//! # Invariants
//!
//! - Hashes are lowercased before they are written or compared.
//! - An enrollment has at most one hash; [`CertAuthStore::associate_cert_hash`]
//!   replaces any previous one in a single atomic write.
//! - [`CertAuthStore::associate_unique_cert_hash`] checks that no other
//!   enrollment holds the hash and writes in the same atomic step, so two
//!   concurrent enrollments cannot both claim one certificate.
//!
//! Every method is `async`. Dropping the returned future (request cancelled,
//! client gone) abandons the operation.

pub mod memory;
pub mod sqlite;

use std::sync::Arc;

use thiserror::Error;

use crate::config::{StorageBackend, StorageConfig};

pub use memory::MemoryCertAuthStore;
pub use sqlite::SqliteCertAuthStore;

/// Association store failures.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Database query or connection failure.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Could not prepare the database location.
    #[error("cannot open store at {path}: {source}")]
    Open {
        /// Database path.
        path: String,
        /// Underlying IO error.
        source: std::io::Error,
    },
}

/// Storage backend for enrollment ↔ certificate-hash associations.
///
/// Implementations must be `Send + Sync` because the store is shared across
/// request tasks.
#[async_trait::async_trait]
pub trait CertAuthStore: Send + Sync + 'static {
    /// `true` if `enrollment_id` has any associated hash.
    async fn enrollment_has_cert_hash(&self, enrollment_id: &str) -> Result<bool, StoreError>;

    /// `true` if `hash` is associated with any enrollment.
    async fn has_cert_hash(&self, hash: &str) -> Result<bool, StoreError>;

    /// `true` if exactly this `(enrollment_id, hash)` pair is stored.
    async fn is_cert_hash_associated(
        &self,
        enrollment_id: &str,
        hash: &str,
    ) -> Result<bool, StoreError>;

    /// Bind `hash` to `enrollment_id`, replacing any previous hash.
    async fn associate_cert_hash(&self, enrollment_id: &str, hash: &str) -> Result<(), StoreError>;

    /// Bind `hash` to `enrollment_id` unless another enrollment holds it.
    ///
    /// The ownership check and the write are one atomic step. Returns
    /// `false`, leaving the store unchanged, when the hash is taken.
    async fn associate_unique_cert_hash(
        &self,
        enrollment_id: &str,
        hash: &str,
    ) -> Result<bool, StoreError>;
}

/// Lowercase a hex hash for storage or comparison.
pub fn normalize_hash(hash: &str) -> String {
    hash.trim().to_ascii_lowercase()
}

/// Open the backend selected in `config`.
pub async fn open_store(config: &StorageConfig) -> Result<Arc<dyn CertAuthStore>, StoreError> {
    match config.backend {
        StorageBackend::Memory => {
            tracing::warn!("Using in-memory association store; associations are lost on restart");
            Ok(Arc::new(MemoryCertAuthStore::new()))
        }
        StorageBackend::Sqlite => {
            let store = SqliteCertAuthStore::open(&config.sqlite_path).await?;
            tracing::info!(path = %config.sqlite_path.display(), "Opened SQLite association store");
            Ok(Arc::new(store))
        }
    }
}
