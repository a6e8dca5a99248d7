//! In-memory association store.

use std::sync::{Mutex, PoisonError};

use dashmap::DashMap;
use tracing::debug;

use super::{CertAuthStore, StoreError, normalize_hash};

/// `DashMap`-backed store: enrollment id → normalized hash.
///
/// Writes to one enrollment take that key's shard lock, so a concurrent
/// reader sees either the old or the new hash. Writes are also serialized on
/// `writes`, which makes the scan in `associate_unique_cert_hash` and its
/// insert one step.
#[derive(Debug, Default)]
pub struct MemoryCertAuthStore {
    associations: DashMap<String, String>,
    writes: Mutex<()>,
}

impl MemoryCertAuthStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored associations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.associations.len()
    }

    /// `true` when nothing is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.associations.is_empty()
    }

    fn insert(&self, enrollment_id: &str, hash: String) {
        if let Some(previous) = self.associations.insert(enrollment_id.to_owned(), hash) {
            debug!(enrollment_id, previous = %previous, "Replaced certificate association");
        }
    }
}

#[async_trait::async_trait]
impl CertAuthStore for MemoryCertAuthStore {
    async fn enrollment_has_cert_hash(&self, enrollment_id: &str) -> Result<bool, StoreError> {
        Ok(self.associations.contains_key(enrollment_id))
    }

    async fn has_cert_hash(&self, hash: &str) -> Result<bool, StoreError> {
        let hash = normalize_hash(hash);
        Ok(self.associations.iter().any(|entry| *entry.value() == hash))
    }

    async fn is_cert_hash_associated(
        &self,
        enrollment_id: &str,
        hash: &str,
    ) -> Result<bool, StoreError> {
        let hash = normalize_hash(hash);
        Ok(self
            .associations
            .get(enrollment_id)
            .is_some_and(|stored| *stored == hash))
    }

    async fn associate_cert_hash(&self, enrollment_id: &str, hash: &str) -> Result<(), StoreError> {
        let _writes = self.writes.lock().unwrap_or_else(PoisonError::into_inner);
        self.insert(enrollment_id, normalize_hash(hash));
        Ok(())
    }

    async fn associate_unique_cert_hash(
        &self,
        enrollment_id: &str,
        hash: &str,
    ) -> Result<bool, StoreError> {
        let hash = normalize_hash(hash);
        let _writes = self.writes.lock().unwrap_or_else(PoisonError::into_inner);
        let taken = self
            .associations
            .iter()
            .any(|entry| entry.key() != enrollment_id && *entry.value() == hash);
        if taken {
            return Ok(false);
        }
        self.insert(enrollment_id, hash);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn empty_store_has_nothing() {
        let store = MemoryCertAuthStore::new();
        assert!(store.is_empty());
        assert!(!store.enrollment_has_cert_hash("enr").await.unwrap());
        assert!(!store.has_cert_hash("aa").await.unwrap());
        assert!(!store.is_cert_hash_associated("enr", "aa").await.unwrap());
    }

    #[tokio::test]
    async fn associate_is_idempotent() {
        let store = MemoryCertAuthStore::new();
        store.associate_cert_hash("enr", "aa").await.unwrap();
        store.associate_cert_hash("enr", "AA").await.unwrap();
        assert_eq!(store.len(), 1);
        assert!(store.is_cert_hash_associated("enr", "aa").await.unwrap());
    }

    #[tokio::test]
    async fn unique_association_refuses_hash_held_elsewhere() {
        let store = MemoryCertAuthStore::new();
        assert!(store.associate_unique_cert_hash("a", "ff").await.unwrap());
        // Same enrollment again is not a conflict.
        assert!(store.associate_unique_cert_hash("a", "FF").await.unwrap());
        assert!(!store.associate_unique_cert_hash("b", "ff").await.unwrap());
        assert!(!store.enrollment_has_cert_hash("b").await.unwrap());
    }

    #[tokio::test]
    async fn same_hash_may_belong_to_several_enrollments() {
        // The store itself does not forbid sharing; callers decide.
        let store = MemoryCertAuthStore::new();
        store.associate_cert_hash("a", "ff").await.unwrap();
        store.associate_cert_hash("b", "ff").await.unwrap();
        assert!(store.is_cert_hash_associated("a", "ff").await.unwrap());
        assert!(store.is_cert_hash_associated("b", "ff").await.unwrap());
    }
}
