// db/pool.rs
// Async connection pool using deadpool-sqlite
//
// Database access goes through `pool.interact()` (anyhow::Result, background
// tasks and internal helpers) or `pool.run()` (MemError, request handlers).
// Closures run on a blocking thread, so they never stall the async runtime.
// For in-memory databases a shared-cache URI makes every pooled connection see
// the same state, which the tests rely on.

use crate::error::MemError;
use crate::utils::path_to_string;
use anyhow::{Context, Result};
use deadpool_sqlite::{Config, Hook, Pool, Runtime};
use rusqlite::Connection;
use std::path::{Path, PathBuf};

#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;

/// Check if a rusqlite error is SQLITE_BUSY or SQLITE_LOCKED.
///
/// SQLITE_BUSY ("database is locked") occurs with file-based databases under
/// write contention. SQLITE_LOCKED occurs with shared-cache in-memory
/// databases when another connection holds a table lock.
fn is_rusqlite_contention(err: &rusqlite::Error) -> bool {
    use rusqlite::ffi;
    matches!(
        err,
        rusqlite::Error::SqliteFailure(
            ffi::Error {
                code: ffi::ErrorCode::DatabaseBusy | ffi::ErrorCode::DatabaseLocked,
                ..
            },
            _,
        )
    )
}

/// Check if an anyhow::Error chain contains a SQLite contention error.
fn is_sqlite_contention(err: &anyhow::Error) -> bool {
    if let Some(rusqlite_err) = err.downcast_ref::<rusqlite::Error>() {
        return is_rusqlite_contention(rusqlite_err);
    }
    if let Some(mem_err) = err.downcast_ref::<MemError>() {
        if let MemError::Db(rusqlite_err) = mem_err {
            return is_rusqlite_contention(rusqlite_err);
        }
    }
    false
}

/// Contention retry budget: up to 8 attempts with 20 ms waits.
const BUSY_RETRIES: usize = 8;
const BUSY_WAIT: std::time::Duration = std::time::Duration::from_millis(20);

/// Retry an async operation on SQLite contention, bounded by BUSY_RETRIES.
async fn retry_on_contention<F, Fut, R>(mut op: F) -> Result<R>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<R>>,
{
    let mut last = None;
    for attempt in 0..BUSY_RETRIES {
        match op().await {
            Ok(result) => return Ok(result),
            Err(e) if is_sqlite_contention(&e) => {
                tracing::warn!(
                    "SQLite contention on attempt {}/{}, retrying",
                    attempt + 1,
                    BUSY_RETRIES
                );
                last = Some(e);
                tokio::time::sleep(BUSY_WAIT).await;
            }
            Err(e) => return Err(e),
        }
    }
    Err(last.unwrap_or_else(|| anyhow::anyhow!("contention retries exhausted")))
}

/// Database pool wrapper with per-connection PRAGMA setup.
pub struct DatabasePool {
    pool: Pool,
    path: Option<PathBuf>,
    /// URI for in-memory databases (used to share state in tests)
    memory_uri: Option<String>,
}

/// Whether to use a file path or a shared in-memory URI.
enum DbStorage {
    File(PathBuf),
    InMemory,
}

impl DatabasePool {
    /// Open a pooled database at the given path, running migrations.
    pub async fn open(path: &Path) -> Result<Self> {
        Self::open_internal(DbStorage::File(path.to_path_buf())).await
    }

    /// Open a pooled in-memory database (for tests).
    ///
    /// Uses a shared-cache URI so all pooled connections access the same
    /// in-memory database.
    pub async fn open_in_memory() -> Result<Self> {
        Self::open_internal(DbStorage::InMemory).await
    }

    async fn open_internal(storage: DbStorage) -> Result<Self> {
        let (conn_str, path, memory_uri, hook) = match storage {
            DbStorage::File(p) => {
                ensure_parent_directory(&p)?;
                let s = path_to_string(&p);
                let hook = make_file_post_create_hook(p.clone());
                (s, Some(p), None, hook)
            }
            DbStorage::InMemory => {
                let uri = format!(
                    "file:memdb_{:?}?mode=memory&cache=shared",
                    uuid::Uuid::new_v4()
                );
                let hook = make_memory_post_create_hook();
                (uri.clone(), None, Some(uri), hook)
            }
        };

        let cfg = Config::new(&conn_str);
        let pool = cfg
            .builder(Runtime::Tokio1)
            .context("Failed to create pool builder")?
            .max_size(8)
            .post_create(hook)
            .build()
            .context("Failed to build connection pool")?;

        let db_pool = Self {
            pool,
            path,
            memory_uri,
        };

        // Migration failures are fatal: callers propagate and exit non-zero.
        db_pool
            .interact(|conn| super::schema::run_migrations(conn))
            .await?;

        Ok(db_pool)
    }

    /// Get the memory URI (for sharing state in tests)
    pub fn memory_uri(&self) -> Option<&str> {
        self.memory_uri.as_deref()
    }

    /// Get the database file path (None for in-memory).
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Run a closure with a connection from the pool.
    pub async fn interact<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&Connection) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let conn = self
            .pool
            .get()
            .await
            .context("Failed to get connection from pool")?;

        conn.interact(move |conn| f(conn))
            .await
            .map_err(|e| anyhow::anyhow!("interact failed: {e}"))?
    }

    /// Run a closure on a pooled connection, logging errors at debug but not
    /// propagating. For low-priority best-effort operations (heartbeats,
    /// diagnostics snapshots).
    pub async fn try_interact<F, R>(&self, label: &str, f: F) -> Option<R>
    where
        F: FnOnce(&Connection) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let label = label.to_string();
        match self.interact(move |conn| f(conn)).await {
            Ok(v) => Some(v),
            Err(e) => {
                tracing::debug!("{}: {}", label, e);
                None
            }
        }
    }

    /// Run a closure that may return a rusqlite::Error.
    pub async fn interact_raw<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&Connection) -> rusqlite::Result<R> + Send + 'static,
        R: Send + 'static,
    {
        self.interact(move |conn| f(conn).map_err(Into::into)).await
    }

    /// Run a closure and return Result<T, MemError> for API handlers.
    pub async fn run<F, R, E>(&self, f: F) -> Result<R, MemError>
    where
        F: FnOnce(&Connection) -> Result<R, E> + Send + 'static,
        R: Send + 'static,
        E: Into<MemError> + Send + 'static,
    {
        self.pool
            .get()
            .await
            .map_err(|e| MemError::Other(format!("Failed to get connection: {}", e)))?
            .interact(move |conn| f(conn).map_err(Into::into))
            .await
            .map_err(|e| MemError::Other(format!("Database error: {}", e)))?
    }

    /// Run a closure with retry on SQLite contention (≤8 tries, 20 ms waits).
    ///
    /// Use for writes that must not be lost (ingest, session lifecycle).
    /// The closure must be `Clone` to support retries.
    pub async fn interact_with_retry<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&Connection) -> Result<R> + Send + Clone + 'static,
        R: Send + 'static,
    {
        retry_on_contention(|| {
            let f_clone = f.clone();
            self.interact(f_clone)
        })
        .await
    }

    /// Pool status for monitoring.
    pub fn status(&self) -> PoolStatus {
        let status = self.pool.status();
        PoolStatus {
            size: status.size,
            available: status.available,
            waiting: status.waiting,
        }
    }
}

/// Pool status for monitoring.
#[derive(Debug, Clone, serde::Serialize)]
pub struct PoolStatus {
    pub size: usize,
    pub available: usize,
    pub waiting: usize,
}

/// Ensure parent directory exists with secure permissions (0o700 on Unix).
fn ensure_parent_directory(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
        #[cfg(unix)]
        {
            let mut perms = std::fs::metadata(parent)?.permissions();
            perms.set_mode(0o700); // rwx------
            std::fs::set_permissions(parent, perms)?;
        }
    }
    Ok(())
}

/// Create a post_create hook for file-based databases.
///
/// Applies the connection PRAGMAs and restricts file permissions to 0o600.
fn make_file_post_create_hook(path: PathBuf) -> Hook {
    Hook::async_fn(move |conn, _metrics| {
        let path_for_perms = path.clone();
        Box::pin(async move {
            conn.interact(move |conn| {
                setup_connection(conn)?;

                #[cfg(unix)]
                if let Ok(metadata) = std::fs::metadata(&path_for_perms) {
                    let mut perms = metadata.permissions();
                    perms.set_mode(0o600); // rw-------
                    if let Err(e) = std::fs::set_permissions(&path_for_perms, perms) {
                        tracing::warn!("Failed to set database file permissions to 0600: {}", e);
                    }
                }

                Ok::<_, rusqlite::Error>(())
            })
            .await
            .map_err(|e| {
                deadpool_sqlite::HookError::Message(format!("interact failed: {e}").into())
            })?
            .map_err(|e| {
                deadpool_sqlite::HookError::Message(format!("connection setup failed: {e}").into())
            })
        })
    })
}

/// Create a post_create hook for in-memory databases.
///
/// WAL mode does not apply to in-memory DBs; foreign keys and busy_timeout do.
fn make_memory_post_create_hook() -> Hook {
    Hook::async_fn(|conn, _metrics| {
        Box::pin(async move {
            conn.interact(|conn| {
                conn.execute_batch(
                    "PRAGMA foreign_keys=ON; \
                     PRAGMA busy_timeout=5000;",
                )?;
                Ok::<_, rusqlite::Error>(())
            })
            .await
            .map_err(|e| {
                deadpool_sqlite::HookError::Message(format!("interact failed: {e}").into())
            })?
            .map_err(|e| {
                deadpool_sqlite::HookError::Message(format!("connection setup failed: {e}").into())
            })
        })
    })
}

/// Configure a connection after it's created (called from post_create hooks).
fn setup_connection(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "PRAGMA journal_mode=WAL; \
         PRAGMA foreign_keys=ON; \
         PRAGMA busy_timeout=5000; \
         PRAGMA synchronous=NORMAL; \
         PRAGMA journal_size_limit=32768;",
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn pool_in_memory_shares_state() {
        let pool = DatabasePool::open_in_memory()
            .await
            .expect("Failed to open in-memory pool");

        let id = pool
            .interact(|conn| {
                conn.execute(
                    "INSERT INTO sessions (id, project, status, started_at_ms)
                     VALUES ('s-1', 'proj', 'active', 1000)",
                    [],
                )?;
                Ok(conn.last_insert_rowid())
            })
            .await
            .expect("Failed to insert");
        assert!(id > 0);

        // Verify from another connection in the pool (tests shared cache)
        let project: String = pool
            .interact(|conn| {
                conn.query_row("SELECT project FROM sessions WHERE id = 's-1'", [], |row| {
                    row.get(0)
                })
                .map_err(Into::into)
            })
            .await
            .expect("Failed to query");
        assert_eq!(project, "proj");
    }

    #[tokio::test]
    async fn concurrent_writes_succeed() {
        let pool = std::sync::Arc::new(
            DatabasePool::open_in_memory()
                .await
                .expect("Failed to open pool"),
        );

        let mut handles = Vec::new();
        for i in 0..10 {
            let pool = pool.clone();
            handles.push(tokio::spawn(async move {
                pool.interact_with_retry(move |conn| {
                    conn.execute(
                        "INSERT INTO sessions (id, project, status, started_at_ms)
                         VALUES (?1, ?2, 'active', 1000)",
                        rusqlite::params![format!("s-{i}"), format!("project-{i}")],
                    )?;
                    Ok(())
                })
                .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().expect("Insert failed");
        }

        let count: i64 = pool
            .interact(|conn| {
                conn.query_row("SELECT COUNT(*) FROM sessions", [], |row| row.get(0))
                    .map_err(Into::into)
            })
            .await
            .expect("Count failed");
        assert_eq!(count, 10);
    }

    #[tokio::test]
    async fn non_busy_error_fails_fast() {
        let pool = DatabasePool::open_in_memory()
            .await
            .expect("Failed to open pool");

        let result = pool
            .interact_with_retry(|conn| {
                conn.execute("INSERT INTO no_such_table VALUES (1)", [])?;
                Ok(())
            })
            .await;
        assert!(result.is_err());
    }

    #[test]
    fn contention_detection() {
        let busy = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error {
                code: rusqlite::ffi::ErrorCode::DatabaseBusy,
                extended_code: 5,
            },
            Some("database is locked".to_string()),
        );
        assert!(is_rusqlite_contention(&busy));

        let constraint = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error {
                code: rusqlite::ffi::ErrorCode::ConstraintViolation,
                extended_code: 19,
            },
            Some("UNIQUE constraint failed".to_string()),
        );
        assert!(!is_rusqlite_contention(&constraint));

        // String-only errors must not trigger contention retries
        let stringy = anyhow::anyhow!("database is locked");
        assert!(!is_sqlite_contention(&stringy));
    }
}
