//! Enrollment ↔ certificate association rules.
//!
//! A device binds its identity certificate when it enrolls (`authenticate`).
//! Every later protocol message must present the same certificate (`check`).
//! Re-enrolling with a new certificate replaces the binding.

use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info};

use crate::cert::IdentityCertificate;
use crate::config::CertAuthConfig;
use crate::storage::{CertAuthStore, StoreError};

/// Association refused.
#[derive(Debug, Error)]
pub enum CertAuthError {
    /// Another enrollment already uses this certificate.
    #[error("certificate {hash} already belongs to another enrollment")]
    DuplicateCertificate {
        /// Certificate hash.
        hash: String,
    },

    /// The certificate is not the one bound to this enrollment.
    #[error("certificate {hash} is not associated with enrollment {enrollment_id}")]
    NotAssociated {
        /// Enrollment.
        enrollment_id: String,
        /// Certificate hash.
        hash: String,
    },

    /// Store failure.
    #[error(transparent)]
    Storage(#[from] StoreError),
}

/// Applies association rules against a [`CertAuthStore`].
pub struct CertAuth {
    store: Arc<dyn CertAuthStore>,
    allow_retroactive: bool,
    allow_duplicates: bool,
}

impl CertAuth {
    /// Rules with both relaxations off.
    pub fn new(store: Arc<dyn CertAuthStore>) -> Self {
        Self {
            store,
            allow_retroactive: false,
            allow_duplicates: false,
        }
    }

    /// Rules configured from `config`.
    pub fn from_config(store: Arc<dyn CertAuthStore>, config: &CertAuthConfig) -> Self {
        Self::new(store)
            .with_retroactive(config.allow_retroactive)
            .with_duplicates(config.allow_duplicates)
    }

    /// Let `check` bind a certificate to an enrollment that has none.
    #[must_use]
    pub fn with_retroactive(mut self, allow: bool) -> Self {
        self.allow_retroactive = allow;
        self
    }

    /// Let one certificate be bound to several enrollments.
    #[must_use]
    pub fn with_duplicates(mut self, allow: bool) -> Self {
        self.allow_duplicates = allow;
        self
    }

    /// The underlying store.
    pub fn store(&self) -> &Arc<dyn CertAuthStore> {
        &self.store
    }

    /// Enrollment: bind `certificate` to `enrollment_id`, replacing any
    /// previous binding.
    pub async fn authenticate(
        &self,
        enrollment_id: &str,
        certificate: &IdentityCertificate,
    ) -> Result<(), CertAuthError> {
        let hash = certificate.hash();

        if self.store.is_cert_hash_associated(enrollment_id, &hash).await? {
            debug!(enrollment_id, %hash, "Certificate already associated");
            return Ok(());
        }

        self.bind(enrollment_id, &hash).await?;
        info!(enrollment_id, %hash, "Associated certificate with enrollment");
        Ok(())
    }

    /// Any later message: the certificate must be the bound one.
    pub async fn check(
        &self,
        enrollment_id: &str,
        certificate: &IdentityCertificate,
    ) -> Result<(), CertAuthError> {
        let hash = certificate.hash();

        if self.store.is_cert_hash_associated(enrollment_id, &hash).await? {
            return Ok(());
        }

        let not_associated = || CertAuthError::NotAssociated {
            enrollment_id: enrollment_id.to_owned(),
            hash: hash.clone(),
        };

        if !self.allow_retroactive {
            return Err(not_associated());
        }
        // Retroactive binding only for enrollments that predate association.
        if self.store.enrollment_has_cert_hash(enrollment_id).await? {
            return Err(not_associated());
        }
        self.bind(enrollment_id, &hash).await?;
        info!(enrollment_id, %hash, "Retroactively associated certificate");
        Ok(())
    }

    /// Write the binding; without duplicates the store refuses a hash that
    /// another enrollment holds, atomically with the write.
    async fn bind(&self, enrollment_id: &str, hash: &str) -> Result<(), CertAuthError> {
        if self.allow_duplicates {
            self.store.associate_cert_hash(enrollment_id, hash).await?;
        } else if !self.store.associate_unique_cert_hash(enrollment_id, hash).await? {
            return Err(CertAuthError::DuplicateCertificate {
                hash: hash.to_owned(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::certauth::test_support::device_cert;
    use crate::storage::MemoryCertAuthStore;

    fn certauth() -> (CertAuth, Arc<MemoryCertAuthStore>) {
        let store = Arc::new(MemoryCertAuthStore::new());
        (CertAuth::new(store.clone()), store)
    }

    #[tokio::test]
    async fn authenticate_binds_and_check_passes() {
        let (ca, _) = certauth();
        let (cert, _) = device_cert("d");

        ca.authenticate("enr", &cert).await.unwrap();
        ca.check("enr", &cert).await.unwrap();
    }

    #[tokio::test]
    async fn check_rejects_different_certificate() {
        let (ca, _) = certauth();
        let (cert, _) = device_cert("d");
        let (other, _) = device_cert("other");

        ca.authenticate("enr", &cert).await.unwrap();
        assert!(matches!(
            ca.check("enr", &other).await,
            Err(CertAuthError::NotAssociated { .. })
        ));
    }

    #[tokio::test]
    async fn reenrollment_replaces_certificate() {
        let (ca, _) = certauth();
        let (old, _) = device_cert("old");
        let (new, _) = device_cert("new");

        ca.authenticate("enr", &old).await.unwrap();
        ca.authenticate("enr", &new).await.unwrap();

        assert!(ca.check("enr", &new).await.is_ok());
        assert!(ca.check("enr", &old).await.is_err());
    }

    #[tokio::test]
    async fn duplicate_certificate_is_refused_unless_allowed() {
        let (ca, store) = certauth();
        let (cert, _) = device_cert("shared");
        ca.authenticate("a", &cert).await.unwrap();

        assert!(matches!(
            ca.authenticate("b", &cert).await,
            Err(CertAuthError::DuplicateCertificate { .. })
        ));

        let relaxed = CertAuth::new(store).with_duplicates(true);
        relaxed.authenticate("b", &cert).await.unwrap();
        relaxed.check("b", &cert).await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_enrollments_cannot_share_a_certificate() {
        // GIVEN: one certificate racing to enroll under many ids
        let (ca, store) = certauth();
        let ca = Arc::new(ca);
        let (cert, _) = device_cert("contested");

        // WHEN: all enrollments run at once
        let mut tasks = Vec::new();
        for i in 0..16 {
            let ca = Arc::clone(&ca);
            let cert = cert.clone();
            tasks.push(tokio::spawn(async move {
                ca.authenticate(&format!("enr-{i}"), &cert).await
            }));
        }
        let mut won = 0;
        for task in tasks {
            match task.await.unwrap() {
                Ok(()) => won += 1,
                Err(CertAuthError::DuplicateCertificate { .. }) => {}
                Err(e) => panic!("unexpected error {e}"),
            }
        }

        // THEN: exactly one enrollment holds it
        assert_eq!(won, 1);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn retroactive_binding_only_when_enabled() {
        let (ca, store) = certauth();
        let (cert, _) = device_cert("legacy");

        assert!(ca.check("legacy", &cert).await.is_err());
        assert!(store.is_empty());

        let retro = CertAuth::new(store.clone()).with_retroactive(true);
        retro.check("legacy", &cert).await.unwrap();
        assert!(store.is_cert_hash_associated("legacy", &cert.hash()).await.unwrap());
    }

    #[tokio::test]
    async fn retroactive_binding_never_replaces_existing_one() {
        let (_, store) = certauth();
        let retro = CertAuth::new(store).with_retroactive(true);
        let (bound, _) = device_cert("bound");
        let (intruder, _) = device_cert("intruder");

        retro.authenticate("enr", &bound).await.unwrap();
        assert!(retro.check("enr", &intruder).await.is_err());
    }
}
