//! Lazily-opened SQLite pool shared by every clone of the store.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::config::Config;
use crate::store::custody::{custody_for, CustodyKind, KeyCustody};
use crate::store::error::StoreError;

pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_CONNECTIONS: u32 = 4;

/// Per-user identity storage. Cheap to clone (Arc internally).
///
/// Nothing touches the disk until the first operation. Concurrent first
/// callers all await the same open; a failed open is not cached, so the next
/// call retries. After [`IdentityStore::close`] the next operation opens a
/// fresh pool.
#[derive(Clone)]
pub struct IdentityStore {
    inner: Arc<StoreInner>,
}

struct StoreInner {
    path: PathBuf,
    busy_timeout: Duration,
    pool: Mutex<Option<SqlitePool>>,
    custody: Arc<dyn KeyCustody>,
    opens: AtomicUsize,
}

impl IdentityStore {
    /// Store at `db_path` with storage keys in the OS keyring.
    pub fn new(db_path: impl Into<PathBuf>) -> Self {
        let path = db_path.into();
        let custody = custody_for(CustodyKind::OsKeyring, &path);
        Self::with_options(path, DEFAULT_BUSY_TIMEOUT, custody)
    }

    pub fn with_options(
        db_path: impl Into<PathBuf>,
        busy_timeout: Duration,
        custody: Arc<dyn KeyCustody>,
    ) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                path: db_path.into(),
                busy_timeout,
                pool: Mutex::new(None),
                custody,
                opens: AtomicUsize::new(0),
            }),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::with_options(
            config.database_path.clone(),
            Duration::from_millis(config.busy_timeout_ms),
            custody_for(config.key_custody, &config.database_path),
        )
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// Force the lazy open. Every other operation does this implicitly.
    pub async fn open(&self) -> Result<(), StoreError> {
        self.pool().await.map(|_| ())
    }

    /// Close the pool if it is open. The store stays usable: the next
    /// operation reopens it.
    pub async fn close(&self) {
        let pool = self.inner.pool.lock().await.take();
        if let Some(pool) = pool {
            pool.close().await;
            debug!(path = %self.inner.path.display(), "identity store closed");
        }
    }

    pub(crate) async fn pool(&self) -> Result<SqlitePool, StoreError> {
        let mut slot = self.inner.pool.lock().await;
        if let Some(pool) = slot.as_ref().filter(|p| !p.is_closed()) {
            return Ok(pool.clone());
        }
        let pool = connect(&self.inner.path, self.inner.busy_timeout).await?;
        self.inner.opens.fetch_add(1, Ordering::Relaxed);
        info!(
            path = %self.inner.path.display(),
            custody = self.inner.custody.name(),
            "identity store ready"
        );
        *slot = Some(pool.clone());
        Ok(pool)
    }

    /// Run a custody call on the blocking pool.
    pub(crate) async fn custody<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&dyn KeyCustody) -> Result<T, StoreError> + Send + 'static,
    {
        let custody = Arc::clone(&self.inner.custody);
        tokio::task::spawn_blocking(move || f(custody.as_ref()))
            .await
            .map_err(|e| StoreError::Custody(format!("custody task failed: {e}")))?
    }

    #[cfg(test)]
    pub(crate) fn opens(&self) -> usize {
        self.inner.opens.load(Ordering::Relaxed)
    }
}

/// Open (or create) the database and run pending migrations.
///
/// WAL journal mode is set on the connection, not in a migration: SQLite
/// refuses to change `journal_mode` inside the transaction sqlx wraps each
/// migration in.
async fn connect(path: &Path, busy_timeout: Duration) -> Result<SqlitePool, StoreError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }

    let opts = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(busy_timeout)
        .foreign_keys(true);

    debug!(path = %path.display(), "opening identity store");
    let pool = SqlitePoolOptions::new()
        .max_connections(MAX_CONNECTIONS)
        .connect_with(opts)
        .await?;

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .map_err(|e| StoreError::Migration(e.to_string()))?;
    Ok(pool)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::test_store;

    #[tokio::test]
    async fn nothing_is_created_before_first_use() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("identity.db");
        let store = test_store(&path);
        assert!(!path.exists());

        store.open().await.unwrap();
        assert!(path.exists());
    }

    #[tokio::test]
    async fn concurrent_first_use_shares_one_pool() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(dir.path().join("identity.db"));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move { store.open().await })
            })
            .collect();
        for h in handles {
            h.await.unwrap().unwrap();
        }
        store.clone().open().await.unwrap();
        assert_eq!(store.opens(), 1);
    }

    #[tokio::test]
    async fn closed_store_reopens_on_next_use() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(dir.path().join("identity.db"));
        let uuid = store.device_uuid("u1").await;

        store.close().await;
        store.close().await;
        assert_eq!(store.device_uuid("u1").await, uuid);
        assert!(store.get_wrapped_bundles("u1").await.unwrap().is_none());
        assert_eq!(store.opens(), 2);
    }

    #[tokio::test]
    async fn reopening_reruns_migrations_idempotently() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("identity.db");

        let first = test_store(&path);
        first.open().await.unwrap();
        first.close().await;

        let second = test_store(&path);
        let tables: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' \
             AND name IN ('devices', 'bundles', 'wrapped_bundles', 'device_uuids')",
        )
        .fetch_one(&second.pool().await.unwrap())
        .await
        .unwrap();
        assert_eq!(tables, 4);
    }
}
