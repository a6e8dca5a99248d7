//! Association store contract tests
//!
//! Every backend must behave identically:
//! - Re-association replaces the previous hash
//! - Hash comparison is case-insensitive
//! - Concurrent upserts to one enrollment leave exactly one winner
//! - A unique binding claims a hash for exactly one enrollment

use std::sync::Arc;

use mdm_certauth::config::{StorageBackend, StorageConfig};
use mdm_certauth::storage::{
    CertAuthStore, MemoryCertAuthStore, SqliteCertAuthStore, open_store,
};

async fn backends() -> Vec<(&'static str, Arc<dyn CertAuthStore>)> {
    vec![
        ("memory", Arc::new(MemoryCertAuthStore::new())),
        ("sqlite", Arc::new(SqliteCertAuthStore::in_memory().await.unwrap())),
    ]
}

#[tokio::test]
async fn reassociation_replaces_previous_hash() {
    for (name, store) in backends().await {
        // GIVEN: an enrollment bound to AA
        store.associate_cert_hash("enr", "AA").await.unwrap();

        // WHEN: it is re-bound to BB
        store.associate_cert_hash("enr", "BB").await.unwrap();

        // THEN: only BB is trusted
        assert!(!store.is_cert_hash_associated("enr", "AA").await.unwrap(), "{name}");
        assert!(store.is_cert_hash_associated("enr", "BB").await.unwrap(), "{name}");
        assert!(!store.has_cert_hash("aa").await.unwrap(), "{name}");
        assert!(store.enrollment_has_cert_hash("enr").await.unwrap(), "{name}");
    }
}

#[tokio::test]
async fn hashes_are_case_normalized() {
    for (name, store) in backends().await {
        store.associate_cert_hash("enr", "AB12").await.unwrap();

        assert!(store.has_cert_hash("ab12").await.unwrap(), "{name}");
        assert!(store.has_cert_hash("AB12").await.unwrap(), "{name}");
        assert!(store.is_cert_hash_associated("enr", "aB12").await.unwrap(), "{name}");
    }
}

#[tokio::test]
async fn queries_on_empty_store_are_false() {
    for (name, store) in backends().await {
        assert!(!store.enrollment_has_cert_hash("enr").await.unwrap(), "{name}");
        assert!(!store.has_cert_hash("ab12").await.unwrap(), "{name}");
        assert!(!store.is_cert_hash_associated("enr", "ab12").await.unwrap(), "{name}");
    }
}

#[tokio::test]
async fn enrollments_are_independent() {
    for (name, store) in backends().await {
        store.associate_cert_hash("a", "11").await.unwrap();
        store.associate_cert_hash("b", "22").await.unwrap();

        assert!(store.is_cert_hash_associated("a", "11").await.unwrap(), "{name}");
        assert!(!store.is_cert_hash_associated("a", "22").await.unwrap(), "{name}");
        assert!(store.is_cert_hash_associated("b", "22").await.unwrap(), "{name}");
    }
}

#[tokio::test]
async fn concurrent_upserts_leave_one_hash() {
    for (name, store) in backends().await {
        // GIVEN: many writers racing on one enrollment
        let hashes: Vec<String> = (0..16).map(|i| format!("{i:02x}")).collect();
        let mut tasks = Vec::new();
        for hash in hashes.clone() {
            let store = Arc::clone(&store);
            tasks.push(tokio::spawn(async move {
                store.associate_cert_hash("enr", &hash).await.unwrap();
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        // THEN: exactly one of the written hashes is associated
        let mut winners = 0;
        for hash in &hashes {
            if store.is_cert_hash_associated("enr", hash).await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1, "{name}");
    }
}

#[tokio::test]
async fn unique_association_respects_other_owners() {
    for (name, store) in backends().await {
        // GIVEN: "a" holds the hash
        assert!(store.associate_unique_cert_hash("a", "CAFE").await.unwrap(), "{name}");

        // THEN: "a" may rebind it, "b" may not, and a refusal writes nothing
        assert!(store.associate_unique_cert_hash("a", "cafe").await.unwrap(), "{name}");
        assert!(!store.associate_unique_cert_hash("b", "cafe").await.unwrap(), "{name}");
        assert!(!store.enrollment_has_cert_hash("b").await.unwrap(), "{name}");

        // AND: a unique binding replaces the enrollment's previous hash
        assert!(store.associate_unique_cert_hash("a", "beef").await.unwrap(), "{name}");
        assert!(!store.has_cert_hash("cafe").await.unwrap(), "{name}");
        assert!(store.associate_unique_cert_hash("b", "cafe").await.unwrap(), "{name}");
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_unique_associations_have_one_winner() {
    for (name, store) in backends().await {
        // GIVEN: many enrollments racing for one hash
        let mut tasks = Vec::new();
        for i in 0..16 {
            let store = Arc::clone(&store);
            tasks.push(tokio::spawn(async move {
                store
                    .associate_unique_cert_hash(&format!("enr-{i}"), "contested")
                    .await
                    .unwrap()
            }));
        }

        let mut winners = 0;
        for task in tasks {
            if task.await.unwrap() {
                winners += 1;
            }
        }

        // THEN: exactly one claimed it
        assert_eq!(winners, 1, "{name}");
    }
}

#[tokio::test]
async fn open_store_selects_backend() {
    let dir = tempfile::tempdir().unwrap();
    let config = StorageConfig {
        backend: StorageBackend::Sqlite,
        sqlite_path: dir.path().join("certauth.db"),
    };

    let store = open_store(&config).await.unwrap();
    store.associate_cert_hash("enr", "cafe").await.unwrap();
    assert!(config.sqlite_path.exists());

    let memory = open_store(&StorageConfig {
        backend: StorageBackend::Memory,
        ..StorageConfig::default()
    })
    .await
    .unwrap();
    assert!(!memory.has_cert_hash("cafe").await.unwrap());
}
