//! SQLite association store.
//!
//! Schema:
//!
//! ```sql
//! CREATE TABLE cert_auth_associations (
//!     id         TEXT PRIMARY KEY,   -- enrollment identifier
//!     sha256     TEXT NOT NULL,      -- lowercase hex
//!     created_at INTEGER NOT NULL,
//!     updated_at INTEGER NOT NULL
//! );
//! ```
//!
//! Re-association is one `INSERT … ON CONFLICT(id) DO UPDATE` statement, so
//! readers never observe a half-applied write. The unique variant folds the
//! "no other enrollment has this hash" check into the same statement. SQLite serializes all writers
//! on the database lock; the pool keeps readers concurrent via WAL.

use std::path::Path;

use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};

use super::{CertAuthStore, StoreError, normalize_hash};

const MAX_CONNECTIONS: u32 = 4;

/// `sqlx` SQLite-backed association store.
#[derive(Debug, Clone)]
pub struct SqliteCertAuthStore {
    pool: SqlitePool,
}

impl SqliteCertAuthStore {
    /// Open or create the database at `path` and ensure the schema exists.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| StoreError::Open {
                    path: path.display().to_string(),
                    source,
                })?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal);

        let pool = SqlitePoolOptions::new()
            .max_connections(MAX_CONNECTIONS)
            .connect_with(options)
            .await?;

        Self::with_pool(pool).await
    }

    /// Private in-memory database. A single connection, because every SQLite
    /// memory connection is its own database.
    pub async fn in_memory() -> Result<Self, StoreError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        Self::with_pool(pool).await
    }

    /// Wrap an existing pool, creating the table if needed.
    pub async fn with_pool(pool: SqlitePool) -> Result<Self, StoreError> {
        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS cert_auth_associations (
                id TEXT PRIMARY KEY,
                sha256 TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )
            ",
        )
        .execute(&pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_cert_auth_associations_sha256 \
             ON cert_auth_associations (sha256)",
        )
        .execute(&pool)
        .await?;

        Ok(Self { pool })
    }

    async fn row_exists(&self, query: &str, binds: &[&str]) -> Result<bool, StoreError> {
        let mut q = sqlx::query_scalar::<_, i64>(query);
        for value in binds {
            q = q.bind(*value);
        }
        let count = q.fetch_one(&self.pool).await?;
        Ok(count > 0)
    }
}

#[async_trait::async_trait]
impl CertAuthStore for SqliteCertAuthStore {
    async fn enrollment_has_cert_hash(&self, enrollment_id: &str) -> Result<bool, StoreError> {
        self.row_exists(
            "SELECT COUNT(*) FROM cert_auth_associations WHERE id = ?",
            &[enrollment_id],
        )
        .await
    }

    async fn has_cert_hash(&self, hash: &str) -> Result<bool, StoreError> {
        self.row_exists(
            "SELECT COUNT(*) FROM cert_auth_associations WHERE sha256 = ?",
            &[&normalize_hash(hash)],
        )
        .await
    }

    async fn is_cert_hash_associated(
        &self,
        enrollment_id: &str,
        hash: &str,
    ) -> Result<bool, StoreError> {
        self.row_exists(
            "SELECT COUNT(*) FROM cert_auth_associations WHERE id = ? AND sha256 = ?",
            &[enrollment_id, &normalize_hash(hash)],
        )
        .await
    }

    async fn associate_cert_hash(&self, enrollment_id: &str, hash: &str) -> Result<(), StoreError> {
        let now = chrono::Utc::now().timestamp();
        sqlx::query(
            r"
            INSERT INTO cert_auth_associations (id, sha256, created_at, updated_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                sha256 = excluded.sha256,
                updated_at = excluded.updated_at
            ",
        )
        .bind(enrollment_id)
        .bind(normalize_hash(hash))
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn associate_unique_cert_hash(
        &self,
        enrollment_id: &str,
        hash: &str,
    ) -> Result<bool, StoreError> {
        let hash = normalize_hash(hash);
        let now = chrono::Utc::now().timestamp();
        // The WHERE clause also keeps SQLite from parsing ON CONFLICT as a
        // join constraint.
        let result = sqlx::query(
            r"
            INSERT INTO cert_auth_associations (id, sha256, created_at, updated_at)
            SELECT ?, ?, ?, ?
            WHERE NOT EXISTS (
                SELECT 1 FROM cert_auth_associations WHERE sha256 = ? AND id <> ?
            )
            ON CONFLICT(id) DO UPDATE SET
                sha256 = excluded.sha256,
                updated_at = excluded.updated_at
            ",
        )
        .bind(enrollment_id)
        .bind(hash.as_str())
        .bind(now)
        .bind(now)
        .bind(hash.as_str())
        .bind(enrollment_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }
}
