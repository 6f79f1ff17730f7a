//! Repository traits for database backends
//!
//! This module defines traits that provide a unified interface for database operations
//! across multiple backends. The analytics backends (DuckDB, ClickHouse) execute
//! compiled meter SQL and own the numeric table and the query cache; the metadata
//! backends (SQLite, in-memory) own meter definitions and their engine state.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::data::error::DataError;
use crate::data::types::{
    ChunkImport, CompiledQuery, EngineState, EventRow, MeterDefinition, MeterEventRow,
    MeterQueryRow, RawMeterRow,
};

// ============================================================================
// Analytics Traits
// ============================================================================

/// Executes compiled meter queries
#[async_trait]
pub trait MeterQueryStore: Send + Sync {
    /// Run a meter query, returning rows in compiled column order
    async fn query_meter_rows(
        &self,
        query: &CompiledQuery,
        group_columns: usize,
    ) -> Result<Vec<RawMeterRow>, DataError>;

    /// Run a query selecting a single string column
    async fn query_strings(&self, query: &CompiledQuery) -> Result<Vec<String>, DataError>;
}

/// Persisted per-window results of cacheable meter queries.
///
/// Append-only: a stored window is never overwritten with a different value.
#[async_trait]
pub trait QueryCacheStore: Send + Sync {
    /// Cached rows with `from <= window_start` and `window_end <= to`, ordered by window start
    async fn lookup_cached_rows(
        &self,
        namespace: &str,
        hash: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<MeterQueryRow>, DataError>;

    async fn store_cached_rows(
        &self,
        namespace: &str,
        hash: &str,
        rows: &[MeterQueryRow],
    ) -> Result<(), DataError>;
}

/// The per-meter numeric table
#[async_trait]
pub trait MeterTableStore: Send + Sync {
    /// Earliest `stored_at` selected by a compiled min-stored-at query. None when no events.
    async fn min_stored_at(
        &self,
        query: &CompiledQuery,
    ) -> Result<Option<DateTime<Utc>>, DataError>;

    /// Delete then re-import one chunk; rerunning it yields the same rows
    async fn replace_chunk(&self, import: &ChunkImport) -> Result<(), DataError>;

    /// Append rows produced by live ingestion
    async fn insert_meter_events(&self, rows: &[MeterEventRow]) -> Result<(), DataError>;
}

/// Raw event storage
#[async_trait]
pub trait EventStore: Send + Sync {
    async fn insert_events(&self, rows: &[EventRow]) -> Result<(), DataError>;
}

// ============================================================================
// Metadata Traits
// ============================================================================

/// Meter definitions and their engine state
#[async_trait]
pub trait MeterRegistry: Send + Sync {
    /// All meters, or only those of `namespace`
    async fn list_meters(&self, namespace: Option<&str>) -> Result<Vec<MeterDefinition>, DataError>;

    /// Look a meter up by id first, then by slug
    async fn get_meter_by_id_or_slug(
        &self,
        namespace: &str,
        id_or_slug: &str,
    ) -> Result<MeterDefinition, DataError>;

    /// Replace the engine state of one meter atomically
    async fn update_table_engine(
        &self,
        namespace: &str,
        meter_id: &str,
        state: &EngineState,
    ) -> Result<(), DataError>;

    /// Create or update a definition, keeping any stored engine state
    async fn upsert_meter(&self, meter: &MeterDefinition) -> Result<(), DataError>;
}
