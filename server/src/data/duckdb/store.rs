//! Analytics trait implementations for DuckDB
//!
//! The traits are implemented for `Arc<DuckdbService>` rather than `DuckdbService`
//! directly because the mutex guard protecting the connection is not Send, so the Arc
//! is cloned into the blocking closure and the connection acquired there.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use duckdb::types::Type;
use duckdb::{Connection, ToSql, params};

use super::sql_types::{SqlJsonMap, SqlTimestamp, bind_params};
use super::{DuckdbError, DuckdbService, in_transaction};
use crate::data::error::DataError;
use crate::data::traits::{EventStore, MeterQueryStore, MeterTableStore, QueryCacheStore};
use crate::data::types::{
    ChunkImport, CompiledQuery, EventRow, MeterEventRow, MeterQueryRow, RawMeterRow,
};
use crate::domain::cache::group_key;
use crate::utils::time::micros_to_datetime;

// ============================================================================
// Statement helpers
// ============================================================================

fn execute(conn: &Connection, query: &CompiledQuery) -> Result<usize, DuckdbError> {
    let params = bind_params(&query.params);
    let refs: Vec<&dyn ToSql> = params.iter().map(|p| p as &dyn ToSql).collect();
    Ok(conn.execute(&query.sql, &*refs)?)
}

fn query_meter_rows(
    conn: &Connection,
    query: &CompiledQuery,
    group_columns: usize,
) -> Result<Vec<RawMeterRow>, DuckdbError> {
    let mut stmt = conn.prepare(&query.sql)?;
    let params = bind_params(&query.params);
    let refs: Vec<&dyn ToSql> = params.iter().map(|p| p as &dyn ToSql).collect();
    let rows = stmt.query_map(&*refs, |row| {
        let mut group_values = Vec::with_capacity(group_columns);
        for i in 0..group_columns {
            group_values.push(row.get::<_, Option<String>>(3 + i)?);
        }
        Ok(RawMeterRow {
            window_start: row.get(0)?,
            window_end: row.get(1)?,
            value: row.get(2)?,
            group_values,
        })
    })?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

fn query_strings(conn: &Connection, query: &CompiledQuery) -> Result<Vec<String>, DuckdbError> {
    let mut stmt = conn.prepare(&query.sql)?;
    let params = bind_params(&query.params);
    let refs: Vec<&dyn ToSql> = params.iter().map(|p| p as &dyn ToSql).collect();
    let rows = stmt.query_map(&*refs, |row| row.get::<_, String>(0))?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

// ============================================================================
// Query cache
// ============================================================================

fn lookup_cached_rows(
    conn: &Connection,
    namespace: &str,
    hash: &str,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
) -> Result<Vec<MeterQueryRow>, DuckdbError> {
    let mut stmt = conn.prepare(
        "SELECT epoch_us(window_start), epoch_us(window_end), value, subject, customer_id, group_by
         FROM meter_query_cache
         WHERE namespace = ? AND hash = ?
           AND window_start >= make_timestamp(?) AND window_end <= make_timestamp(?)
         ORDER BY window_start, group_key",
    )?;
    let rows = stmt.query_map(
        params![
            namespace,
            hash,
            from.timestamp_micros(),
            to.timestamp_micros()
        ],
        |row| {
            let group_by: String = row.get(5)?;
            let group_by: BTreeMap<String, Option<String>> = serde_json::from_str(&group_by)
                .map_err(|e| duckdb::Error::FromSqlConversionFailure(5, Type::Text, Box::new(e)))?;
            Ok(MeterQueryRow {
                window_start: micros_to_datetime(row.get(0)?),
                window_end: micros_to_datetime(row.get(1)?),
                value: row.get(2)?,
                subject: row.get(3)?,
                customer_id: row.get(4)?,
                group_by,
            })
        },
    )?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

fn store_cached_rows(
    conn: &Connection,
    namespace: &str,
    hash: &str,
    rows: &[MeterQueryRow],
) -> Result<(), DuckdbError> {
    if rows.is_empty() {
        return Ok(());
    }
    let created_at = Utc::now().timestamp_micros();
    in_transaction(conn, |conn| {
        let mut stmt = conn.prepare(
            "INSERT OR IGNORE INTO meter_query_cache
             (namespace, hash, window_start, window_end, group_key, value, subject, customer_id, group_by, created_at)
             VALUES (?, ?, make_timestamp(?), make_timestamp(?), ?, ?, ?, ?, ?, make_timestamp(?))",
        )?;
        for row in rows {
            stmt.execute(params![
                namespace,
                hash,
                row.window_start.timestamp_micros(),
                row.window_end.timestamp_micros(),
                group_key(row),
                row.value,
                row.subject.as_deref(),
                row.customer_id.as_deref(),
                SqlJsonMap(&row.group_by),
                created_at,
            ])?;
        }
        Ok(())
    })
}

// ============================================================================
// Numeric table and events
// ============================================================================

fn min_stored_at(
    conn: &Connection,
    query: &CompiledQuery,
) -> Result<Option<DateTime<Utc>>, DuckdbError> {
    let params = bind_params(&query.params);
    let refs: Vec<&dyn ToSql> = params.iter().map(|p| p as &dyn ToSql).collect();
    let (count, min): (i64, Option<i64>) =
        conn.query_row(&query.sql, &*refs, |row| Ok((row.get(0)?, row.get(1)?)))?;
    Ok(min.filter(|_| count > 0).map(micros_to_datetime))
}

fn replace_chunk(conn: &Connection, import: &ChunkImport) -> Result<(), DuckdbError> {
    in_transaction(conn, |conn| {
        let deleted = execute(conn, &import.delete)?;
        let inserted = execute(conn, &import.insert)?;
        tracing::debug!(deleted, inserted, "Replaced numeric table chunk");
        Ok(())
    })
}

fn insert_meter_events(conn: &Connection, rows: &[MeterEventRow]) -> Result<(), DuckdbError> {
    if rows.is_empty() {
        return Ok(());
    }
    in_transaction(conn, |conn| {
        let mut appender = conn.appender("meter_events")?;
        for r in rows {
            // Column order must match schema.rs CREATE TABLE definition
            appender.append_row(params![
                r.namespace.as_str(),
                r.meter_id.as_str(),
                r.subject.as_str(),
                SqlTimestamp(r.time),
                SqlTimestamp(r.stored_at),
                r.value,
                SqlJsonMap(&r.group_by),
            ])?;
        }
        appender.flush()?;
        Ok(())
    })
}

fn insert_events(conn: &Connection, rows: &[EventRow]) -> Result<(), DuckdbError> {
    if rows.is_empty() {
        return Ok(());
    }
    in_transaction(conn, |conn| {
        let mut appender = conn.appender("events")?;
        for e in rows {
            appender.append_row(params![
                e.namespace.as_str(),
                e.id.as_str(),
                e.event_type.as_str(),
                e.source.as_str(),
                e.subject.as_str(),
                SqlTimestamp(e.time),
                e.data.as_str(),
                SqlTimestamp(e.ingested_at),
                SqlTimestamp(e.stored_at),
            ])?;
        }
        appender.flush()?;
        Ok(())
    })
}

// ============================================================================
// Trait implementations
// ============================================================================

#[async_trait]
impl MeterQueryStore for Arc<DuckdbService> {
    async fn query_meter_rows(
        &self,
        query: &CompiledQuery,
        group_columns: usize,
    ) -> Result<Vec<RawMeterRow>, DataError> {
        let query = query.clone();
        Ok(self
            .with_conn(move |conn| query_meter_rows(conn, &query, group_columns))
            .await?)
    }

    async fn query_strings(&self, query: &CompiledQuery) -> Result<Vec<String>, DataError> {
        let query = query.clone();
        Ok(self
            .with_conn(move |conn| query_strings(conn, &query))
            .await?)
    }
}

#[async_trait]
impl QueryCacheStore for Arc<DuckdbService> {
    async fn lookup_cached_rows(
        &self,
        namespace: &str,
        hash: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<MeterQueryRow>, DataError> {
        let ns = namespace.to_string();
        let hash = hash.to_string();
        Ok(self
            .with_conn(move |conn| lookup_cached_rows(conn, &ns, &hash, from, to))
            .await?)
    }

    async fn store_cached_rows(
        &self,
        namespace: &str,
        hash: &str,
        rows: &[MeterQueryRow],
    ) -> Result<(), DataError> {
        let ns = namespace.to_string();
        let hash = hash.to_string();
        let rows = rows.to_vec();
        Ok(self
            .with_conn(move |conn| store_cached_rows(conn, &ns, &hash, &rows))
            .await?)
    }
}

#[async_trait]
impl MeterTableStore for Arc<DuckdbService> {
    async fn min_stored_at(
        &self,
        query: &CompiledQuery,
    ) -> Result<Option<DateTime<Utc>>, DataError> {
        let query = query.clone();
        Ok(self
            .with_conn(move |conn| min_stored_at(conn, &query))
            .await?)
    }

    async fn replace_chunk(&self, import: &ChunkImport) -> Result<(), DataError> {
        let import = import.clone();
        Ok(self
            .with_conn(move |conn| replace_chunk(conn, &import))
            .await?)
    }

    async fn insert_meter_events(&self, rows: &[MeterEventRow]) -> Result<(), DataError> {
        let rows = rows.to_vec();
        Ok(self
            .with_conn(move |conn| insert_meter_events(conn, &rows))
            .await?)
    }
}

#[async_trait]
impl EventStore for Arc<DuckdbService> {
    async fn insert_events(&self, rows: &[EventRow]) -> Result<(), DataError> {
        let rows = rows.to_vec();
        Ok(self
            .with_conn(move |conn| insert_events(conn, &rows))
            .await?)
    }
}

#[cfg(test)]
#[path = "store_tests.rs"]
mod tests;
