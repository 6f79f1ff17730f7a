//! Unified error type for data layer
//!
//! This module provides a unified error type that can represent errors from
//! all database backends (DuckDB, ClickHouse, SQLite).

use thiserror::Error;

use crate::data::types::EngineStateError;

/// Unified error type for data layer operations
///
/// This error type wraps backend-specific errors while preserving context
/// about which backend generated the error.
#[derive(Error, Debug)]
pub enum DataError {
    /// SQLite database error (meter registry)
    #[error("SQLite error: {0}")]
    Sqlite(sqlx::Error),

    /// DuckDB database error (analytics backend)
    #[error("DuckDB error: {0}")]
    Duckdb(#[from] duckdb::Error),

    /// ClickHouse database error (analytics backend)
    #[error("ClickHouse error: {0}")]
    Clickhouse(#[from] clickhouse::error::Error),

    /// Migration failed
    #[error("Migration {version} ({name}) failed on {backend}: {error}")]
    MigrationFailed {
        backend: &'static str,
        version: i32,
        name: String,
        error: String,
    },

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Query timeout
    #[error("Query timeout after {timeout_secs}s on {backend}")]
    Timeout {
        backend: &'static str,
        timeout_secs: u64,
    },

    /// Entity lookup came back empty
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    /// Stored data could not be decoded
    #[error("Invalid stored data: {0}")]
    InvalidData(String),
}

impl DataError {
    /// Create a migration failed error
    pub fn migration_failed(backend: &'static str, version: i32, name: &str, error: &str) -> Self {
        Self::MigrationFailed {
            backend,
            version,
            name: name.to_string(),
            error: error.to_string(),
        }
    }

    /// Create a timeout error
    pub fn timeout(backend: &'static str, timeout_secs: u64) -> Self {
        Self::Timeout {
            backend,
            timeout_secs,
        }
    }

    /// Create a not found error
    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity,
            id: id.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Check if this is a connection-related error that might be transient
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Timeout { .. } => true,
            Self::Sqlite(e) => {
                matches!(
                    e,
                    sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_)
                )
            }
            Self::Duckdb(_) => false, // DuckDB errors are typically not transient
            Self::Clickhouse(e) => {
                // Check if it's a network/connection error
                let msg = e.to_string();
                msg.contains("connection") || msg.contains("timeout") || msg.contains("network")
            }
            _ => false,
        }
    }

    /// Get the backend name that generated this error
    pub fn backend(&self) -> &'static str {
        match self {
            Self::Sqlite(_) => "sqlite",
            Self::Duckdb(_) => "duckdb",
            Self::Clickhouse(_) => "clickhouse",
            Self::MigrationFailed { backend, .. } => backend,
            Self::Timeout { backend, .. } => backend,
            Self::Config(_) | Self::Io(_) | Self::NotFound { .. } | Self::InvalidData(_) => {
                "unknown"
            }
        }
    }
}

impl From<EngineStateError> for DataError {
    fn from(e: EngineStateError) -> Self {
        Self::InvalidData(e.to_string())
    }
}

impl From<crate::data::duckdb::DuckdbError> for DataError {
    fn from(e: crate::data::duckdb::DuckdbError) -> Self {
        match e {
            crate::data::duckdb::DuckdbError::Database(e) => Self::Duckdb(e),
            crate::data::duckdb::DuckdbError::MigrationFailed {
                version,
                name,
                error,
            } => Self::MigrationFailed {
                backend: "duckdb",
                version,
                name,
                error,
            },
            crate::data::duckdb::DuckdbError::Io(e) => Self::Io(e),
            crate::data::duckdb::DuckdbError::Timeout { timeout_secs } => Self::Timeout {
                backend: "duckdb",
                timeout_secs,
            },
            crate::data::duckdb::DuckdbError::Closed => {
                Self::Config("DuckDB connection already closed".to_string())
            }
        }
    }
}

impl From<crate::data::sqlite::SqliteError> for DataError {
    fn from(e: crate::data::sqlite::SqliteError) -> Self {
        match e {
            crate::data::sqlite::SqliteError::Database(e) => Self::Sqlite(e),
            crate::data::sqlite::SqliteError::MigrationFailed {
                version,
                name,
                error,
            } => Self::MigrationFailed {
                backend: "sqlite",
                version,
                name,
                error,
            },
            crate::data::sqlite::SqliteError::Io(e) => Self::Io(e),
            crate::data::sqlite::SqliteError::EngineState(e) => Self::InvalidData(e.to_string()),
            crate::data::sqlite::SqliteError::InvalidRow(msg) => Self::InvalidData(msg),
        }
    }
}

impl From<crate::data::clickhouse::ClickhouseError> for DataError {
    fn from(e: crate::data::clickhouse::ClickhouseError) -> Self {
        match e {
            crate::data::clickhouse::ClickhouseError::Database(e) => Self::Clickhouse(e),
            crate::data::clickhouse::ClickhouseError::MigrationFailed {
                version,
                name,
                error,
            } => Self::MigrationFailed {
                backend: "clickhouse",
                version,
                name,
                error,
            },
            crate::data::clickhouse::ClickhouseError::Unreachable(msg) => Self::Config(msg),
            crate::data::clickhouse::ClickhouseError::InvalidRow(msg) => Self::InvalidData(msg),
        }
    }
}
