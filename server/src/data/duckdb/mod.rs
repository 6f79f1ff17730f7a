//! DuckDB analytics service
//!
//! Embedded analytics backend holding raw events, the numeric table and the query cache.
//! All schema definitions and migrations are managed here.

pub mod error;
mod migrations;
pub mod schema;
pub mod sql_types;
mod store;

pub use error::DuckdbError;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use duckdb::Connection;
use parking_lot::{MappedMutexGuard, Mutex, MutexGuard};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::core::constants::{DUCKDB_CHECKPOINT_INTERVAL_SECS, DUCKDB_QUERY_TIMEOUT_SECS};

const SESSION_SETTINGS: &str = "SET autoinstall_known_extensions = false;
     SET autoload_known_extensions = false;
     SET extension_directory = '';
     LOAD json;";

/// DuckDB analytics service
///
/// Handles database initialization and background tasks.
/// Uses a single shared connection protected by a mutex.
pub struct DuckdbService {
    conn: Mutex<Option<Connection>>,
}

impl Drop for DuckdbService {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.get_mut().take()
            && let Err((_, e)) = conn.close()
        {
            tracing::warn!("DuckDB connection close failed during drop: {}", e);
        }
    }
}

impl DuckdbService {
    /// Open (or create) the database file and apply pending migrations
    pub async fn init(path: &Path) -> Result<Self, DuckdbError> {
        let db_path = path.to_path_buf();
        let conn = tokio::task::spawn_blocking(move || {
            if let Some(parent) = db_path.parent()
                && !parent.as_os_str().is_empty()
            {
                std::fs::create_dir_all(parent)?;
            }
            let conn = Connection::open(&db_path)?;
            conn.execute_batch(SESSION_SETTINGS)?;
            conn.execute_batch("PRAGMA enable_checkpoint_on_shutdown;")?;
            migrations::run_migrations(&conn)?;
            Ok::<_, DuckdbError>(conn)
        })
        .await
        .map_err(|e| DuckdbError::Io(std::io::Error::other(e)))??;

        tracing::debug!(path = %path.display(), "DuckdbService initialized");
        Ok(Self {
            conn: Mutex::new(Some(conn)),
        })
    }

    /// Open a private in-memory database
    pub fn open_in_memory() -> Result<Self, DuckdbError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SESSION_SETTINGS)?;
        migrations::run_migrations(&conn)?;
        Ok(Self {
            conn: Mutex::new(Some(conn)),
        })
    }

    /// Get exclusive access to the connection
    pub fn conn(&self) -> Result<MappedMutexGuard<'_, Connection>, DuckdbError> {
        MutexGuard::try_map(self.conn.lock(), |opt| opt.as_mut()).map_err(|_| DuckdbError::Closed)
    }

    /// Run a blocking DuckDB query with timeout
    pub async fn run_query<T, F>(f: F) -> Result<T, DuckdbError>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let timeout = Duration::from_secs(DUCKDB_QUERY_TIMEOUT_SECS);
        tokio::time::timeout(timeout, tokio::task::spawn_blocking(f))
            .await
            .map_err(|_| {
                tracing::warn!(
                    "DuckDB query timed out after {}s",
                    DUCKDB_QUERY_TIMEOUT_SECS
                );
                DuckdbError::Timeout {
                    timeout_secs: DUCKDB_QUERY_TIMEOUT_SECS,
                }
            })?
            .map_err(|e| {
                tracing::error!(error = %e, "DuckDB query task failed");
                DuckdbError::Io(std::io::Error::other(format!(
                    "Query execution failed: {}",
                    e
                )))
            })
    }

    /// Run `f` against the connection on the blocking pool
    pub(crate) async fn with_conn<T, F>(self: &Arc<Self>, f: F) -> Result<T, DuckdbError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, DuckdbError> + Send + 'static,
    {
        let db = Arc::clone(self);
        Self::run_query(move || {
            let conn = db.conn()?;
            f(&conn)
        })
        .await?
    }

    /// Run a checkpoint to flush WAL to the main database file.
    ///
    /// Returns `Ok(())` if the connection is already closed (no-op).
    pub async fn checkpoint(self: &Arc<Self>) -> Result<(), DuckdbError> {
        let db = Arc::clone(self);
        tokio::task::spawn_blocking(move || {
            let conn_guard = db.conn.lock();
            if let Some(ref conn) = *conn_guard {
                conn.execute("CHECKPOINT", [])?;
                tracing::debug!("DuckDB checkpoint completed");
            }
            Ok(())
        })
        .await
        .map_err(|e| DuckdbError::Io(std::io::Error::other(e)))?
    }

    /// Close the DuckDB connection gracefully with explicit error handling
    pub async fn close(self: Arc<Self>) -> Result<(), DuckdbError> {
        tokio::task::spawn_blocking(move || {
            let mut conn_guard = self.conn.lock();
            if let Some(conn) = conn_guard.take() {
                if let Err(e) = conn.execute("CHECKPOINT", []) {
                    tracing::warn!("CHECKPOINT failed during close: {}", e);
                }
                conn.close().map_err(|(_, e)| DuckdbError::Database(e))?;
                tracing::debug!("DuckDB connection closed");
            }
            Ok(())
        })
        .await
        .map_err(|e| DuckdbError::Io(std::io::Error::other(e)))?
    }

    pub fn start_checkpoint_task(
        self: &Arc<Self>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let db = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(Duration::from_secs(DUCKDB_CHECKPOINT_INTERVAL_SECS));
            loop {
                tokio::select! {
                    biased;
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            tracing::debug!("DuckDB checkpoint task shutting down");
                            break;
                        }
                    }
                    _ = interval.tick() => {
                        if let Err(e) = db.checkpoint().await {
                            tracing::warn!("DuckDB checkpoint failed: {}", e);
                        }
                    }
                }
            }
        })
    }
}

/// Execute a function within a transaction, automatically rolling back on error.
pub(crate) fn in_transaction<F, T>(conn: &Connection, f: F) -> Result<T, DuckdbError>
where
    F: FnOnce(&Connection) -> Result<T, DuckdbError>,
{
    conn.execute_batch("BEGIN TRANSACTION")?;
    match f(conn) {
        Ok(val) => {
            conn.execute_batch("COMMIT")?;
            Ok(val)
        }
        Err(e) => {
            if let Err(rollback_err) = conn.execute_batch("ROLLBACK") {
                tracing::warn!("ROLLBACK failed after transaction error: {}", rollback_err);
            }
            Err(e)
        }
    }
}
