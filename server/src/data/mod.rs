//! Data storage layer
//!
//! Provides database services for the application:
//! - `duckdb` - Embedded analytics database (events, numeric table, query cache)
//! - `clickhouse` - Production analytics database with the same tables
//! - `sqlite` - Meter registry
//! - `memory` - In-process meter registry
//! - `filters` - Filter predicate compiler
//! - `sql` - Per-backend SQL dialects
//! - `types` - Shared data types across all backends
//! - `traits` - Store traits implemented by each backend
//! - `error` - Unified error type for all backends

pub mod clickhouse;
pub mod duckdb;
pub mod error;
pub mod filters;
pub mod memory;
pub mod sql;
pub mod sqlite;
pub mod traits;
pub mod types;

pub use clickhouse::ClickhouseService;
pub use duckdb::DuckdbService;
pub use sqlite::SqliteService;

pub use error::DataError;
pub use memory::InMemoryMeterRegistry;
pub use sql::Backend;
pub use traits::{EventStore, MeterQueryStore, MeterRegistry, MeterTableStore, QueryCacheStore};

use std::path::Path;
use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::core::config::{AnalyticsBackend, ClickhouseConfig};

/// Analytics database service enum
///
/// Wraps the underlying backend-specific service (DuckDB or ClickHouse).
/// Services are stored as Arc so the store trait objects can share them.
pub enum AnalyticsService {
    /// DuckDB backend (default, embedded)
    Duckdb(Arc<DuckdbService>),
    /// ClickHouse backend
    Clickhouse(Arc<ClickhouseService>),
}

impl AnalyticsService {
    /// Initialize the analytics service based on configuration
    pub async fn init(
        backend: AnalyticsBackend,
        duckdb_path: &Path,
        clickhouse_config: Option<&ClickhouseConfig>,
    ) -> Result<Self, DataError> {
        match backend {
            AnalyticsBackend::Duckdb => {
                let service = DuckdbService::init(duckdb_path).await?;
                Ok(Self::Duckdb(Arc::new(service)))
            }
            AnalyticsBackend::Clickhouse => {
                let config = clickhouse_config.ok_or_else(|| {
                    DataError::Config("ClickHouse configuration required".to_string())
                })?;
                let service = ClickhouseService::init(config).await?;
                Ok(Self::Clickhouse(Arc::new(service)))
            }
        }
    }

    pub fn query_store(&self) -> Arc<dyn MeterQueryStore> {
        match self {
            Self::Duckdb(d) => Arc::new(Arc::clone(d)),
            Self::Clickhouse(c) => Arc::new(Arc::clone(c)),
        }
    }

    pub fn cache_store(&self) -> Arc<dyn QueryCacheStore> {
        match self {
            Self::Duckdb(d) => Arc::new(Arc::clone(d)),
            Self::Clickhouse(c) => Arc::new(Arc::clone(c)),
        }
    }

    pub fn table_store(&self) -> Arc<dyn MeterTableStore> {
        match self {
            Self::Duckdb(d) => Arc::new(Arc::clone(d)),
            Self::Clickhouse(c) => Arc::new(Arc::clone(c)),
        }
    }

    pub fn event_store(&self) -> Arc<dyn EventStore> {
        match self {
            Self::Duckdb(d) => Arc::new(Arc::clone(d)),
            Self::Clickhouse(c) => Arc::new(Arc::clone(c)),
        }
    }

    /// SQL dialect family of the underlying store
    pub fn backend(&self) -> Backend {
        match self {
            Self::Duckdb(_) => Backend::Duckdb,
            Self::Clickhouse(_) => Backend::Clickhouse,
        }
    }

    /// Run a checkpoint operation
    pub async fn checkpoint(&self) -> Result<(), DataError> {
        match self {
            Self::Duckdb(d) => d.checkpoint().await.map_err(Into::into),
            // ClickHouse doesn't need explicit checkpoints
            Self::Clickhouse(_) => Ok(()),
        }
    }

    /// Close the database connection gracefully
    pub async fn close(&self) -> Result<(), DataError> {
        match self {
            Self::Duckdb(d) => Arc::clone(d).close().await.map_err(Into::into),
            Self::Clickhouse(c) => {
                c.close().await;
                Ok(())
            }
        }
    }

    /// Start the background checkpoint task (health check for ClickHouse)
    pub fn start_checkpoint_task(&self, shutdown_rx: watch::Receiver<bool>) -> JoinHandle<()> {
        match self {
            Self::Duckdb(d) => d.start_checkpoint_task(shutdown_rx),
            Self::Clickhouse(c) => c.start_health_check_task(shutdown_rx),
        }
    }
}
