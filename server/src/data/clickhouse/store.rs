//! Analytics trait implementations for ClickHouse
//!
//! ClickHouse operations are natively async so no spawn_blocking is needed.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use clickhouse::query::Query;
use clickhouse::{Client, Row};
use serde::{Deserialize, Serialize};

use super::{ClickhouseError, ClickhouseService};
use crate::data::error::DataError;
use crate::data::traits::{EventStore, MeterQueryStore, MeterTableStore, QueryCacheStore};
use crate::data::types::{
    ChunkImport, CompiledQuery, EventRow, MeterEventRow, MeterQueryRow, QueryParam, RawMeterRow,
};
use crate::domain::cache::group_key;
use crate::utils::time::{chrono_to_time, micros_to_datetime};

// ============================================================================
// Row types
// ============================================================================

/// Output of a wrapped meter query
#[derive(Row, Deserialize)]
struct MeterValueRow {
    start_micros: Option<i64>,
    end_micros: Option<i64>,
    meter_value: Option<f64>,
    group_values: Vec<Option<String>>,
}

impl From<MeterValueRow> for RawMeterRow {
    fn from(row: MeterValueRow) -> Self {
        Self {
            window_start: row.start_micros,
            window_end: row.end_micros,
            value: row.meter_value,
            group_values: row.group_values,
        }
    }
}

#[derive(Row, Deserialize)]
struct MinStoredAtRow {
    cnt: u64,
    min_stored_at: i64,
}

#[derive(Row, Deserialize)]
struct CachedRow {
    start_micros: i64,
    end_micros: i64,
    value: f64,
    subject: Option<String>,
    customer_id: Option<String>,
    group_by: String,
}

#[derive(Row, Serialize)]
struct CacheInsertRow {
    namespace: String,
    hash: String,
    #[serde(with = "clickhouse::serde::time::datetime64::micros")]
    window_start: time::OffsetDateTime,
    #[serde(with = "clickhouse::serde::time::datetime64::micros")]
    window_end: time::OffsetDateTime,
    group_key: String,
    value: f64,
    subject: Option<String>,
    customer_id: Option<String>,
    group_by: String,
    #[serde(with = "clickhouse::serde::time::datetime64::micros")]
    created_at: time::OffsetDateTime,
}

/// Column order must match schema.rs CREATE TABLE definition
#[derive(Row, Serialize)]
struct MeterEventInsertRow {
    namespace: String,
    meter_id: String,
    subject: String,
    #[serde(with = "clickhouse::serde::time::datetime64::micros")]
    time: time::OffsetDateTime,
    #[serde(with = "clickhouse::serde::time::datetime64::micros")]
    stored_at: time::OffsetDateTime,
    value: f64,
    group_by: Vec<(String, String)>,
}

impl From<&MeterEventRow> for MeterEventInsertRow {
    fn from(r: &MeterEventRow) -> Self {
        Self {
            namespace: r.namespace.clone(),
            meter_id: r.meter_id.clone(),
            subject: r.subject.clone(),
            time: chrono_to_time(r.time),
            stored_at: chrono_to_time(r.stored_at),
            value: r.value,
            group_by: r
                .group_by
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        }
    }
}

#[derive(Row, Serialize)]
struct EventInsertRow {
    namespace: String,
    id: String,
    #[serde(rename = "type")]
    event_type: String,
    source: String,
    subject: String,
    #[serde(with = "clickhouse::serde::time::datetime64::micros")]
    time: time::OffsetDateTime,
    data: String,
    #[serde(with = "clickhouse::serde::time::datetime64::micros")]
    ingested_at: time::OffsetDateTime,
    #[serde(with = "clickhouse::serde::time::datetime64::micros")]
    stored_at: time::OffsetDateTime,
}

impl From<&EventRow> for EventInsertRow {
    fn from(e: &EventRow) -> Self {
        Self {
            namespace: e.namespace.clone(),
            id: e.id.clone(),
            event_type: e.event_type.clone(),
            source: e.source.clone(),
            subject: e.subject.clone(),
            time: chrono_to_time(e.time),
            data: e.data.clone(),
            ingested_at: chrono_to_time(e.ingested_at),
            stored_at: chrono_to_time(e.stored_at),
        }
    }
}

// ============================================================================
// Statement helpers
// ============================================================================

fn bind_query(client: &Client, query: &CompiledQuery) -> Query {
    let mut q = client.query(&query.sql);
    for param in &query.params {
        q = match param {
            QueryParam::String(s) => q.bind(s.as_str()),
            QueryParam::Int64(i) => q.bind(*i),
            QueryParam::Float64(f) => q.bind(*f),
        };
    }
    q
}

async fn query_meter_rows(
    client: &Client,
    query: &CompiledQuery,
) -> Result<Vec<RawMeterRow>, ClickhouseError> {
    let rows: Vec<MeterValueRow> = bind_query(client, query).fetch_all().await?;
    Ok(rows.into_iter().map(RawMeterRow::from).collect())
}

async fn min_stored_at(
    client: &Client,
    query: &CompiledQuery,
) -> Result<Option<DateTime<Utc>>, ClickhouseError> {
    let row: MinStoredAtRow = bind_query(client, query).fetch_one().await?;
    // min() over no rows yields the epoch rather than NULL
    Ok((row.cnt > 0).then(|| micros_to_datetime(row.min_stored_at)))
}

async fn replace_chunk(client: &Client, import: &ChunkImport) -> Result<(), ClickhouseError> {
    bind_query(client, &import.delete).execute().await?;
    bind_query(client, &import.insert).execute().await?;
    tracing::debug!("Replaced numeric table chunk");
    Ok(())
}

async fn insert_meter_events(
    client: &Client,
    rows: &[MeterEventRow],
) -> Result<(), ClickhouseError> {
    if rows.is_empty() {
        return Ok(());
    }
    let mut insert = client.insert::<MeterEventInsertRow>("meter_events").await?;
    for r in rows {
        insert.write(&MeterEventInsertRow::from(r)).await?;
    }
    insert.end().await?;
    Ok(())
}

async fn insert_events(client: &Client, rows: &[EventRow]) -> Result<(), ClickhouseError> {
    if rows.is_empty() {
        return Ok(());
    }
    let mut insert = client.insert::<EventInsertRow>("events").await?;
    for e in rows {
        insert.write(&EventInsertRow::from(e)).await?;
    }
    insert.end().await?;
    Ok(())
}

// ============================================================================
// Query cache
// ============================================================================

async fn lookup_cached_rows(
    client: &Client,
    namespace: &str,
    hash: &str,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
) -> Result<Vec<MeterQueryRow>, ClickhouseError> {
    let rows: Vec<CachedRow> = client
        .query(
            "SELECT toInt64(toUnixTimestamp64Micro(window_start)) AS start_micros,
                    toInt64(toUnixTimestamp64Micro(window_end)) AS end_micros,
                    value, subject, customer_id, group_by
             FROM meter_query_cache FINAL
             WHERE namespace = ? AND hash = ?
               AND window_start >= fromUnixTimestamp64Micro(?)
               AND window_end <= fromUnixTimestamp64Micro(?)
             ORDER BY window_start, group_key",
        )
        .bind(namespace)
        .bind(hash)
        .bind(from.timestamp_micros())
        .bind(to.timestamp_micros())
        .fetch_all()
        .await?;

    rows.into_iter()
        .map(|row| {
            let group_by: BTreeMap<String, Option<String>> = serde_json::from_str(&row.group_by)
                .map_err(|e| ClickhouseError::InvalidRow(format!("cached group_by: {}", e)))?;
            Ok(MeterQueryRow {
                window_start: micros_to_datetime(row.start_micros),
                window_end: micros_to_datetime(row.end_micros),
                value: row.value,
                subject: row.subject,
                customer_id: row.customer_id,
                group_by,
            })
        })
        .collect()
}

async fn store_cached_rows(
    client: &Client,
    namespace: &str,
    hash: &str,
    rows: &[MeterQueryRow],
) -> Result<(), ClickhouseError> {
    if rows.is_empty() {
        return Ok(());
    }
    let created_at = chrono_to_time(Utc::now());
    let mut insert = client
        .insert::<CacheInsertRow>("meter_query_cache")
        .await?;
    for row in rows {
        let group_by = serde_json::to_string(&row.group_by)
            .map_err(|e| ClickhouseError::InvalidRow(format!("group_by: {}", e)))?;
        insert
            .write(&CacheInsertRow {
                namespace: namespace.to_string(),
                hash: hash.to_string(),
                window_start: chrono_to_time(row.window_start),
                window_end: chrono_to_time(row.window_end),
                group_key: group_key(row),
                value: row.value,
                subject: row.subject.clone(),
                customer_id: row.customer_id.clone(),
                group_by,
                created_at,
            })
            .await?;
    }
    insert.end().await?;
    Ok(())
}

// ============================================================================
// Trait implementations
// ============================================================================

#[async_trait]
impl MeterQueryStore for Arc<ClickhouseService> {
    async fn query_meter_rows(
        &self,
        query: &CompiledQuery,
        _group_columns: usize,
    ) -> Result<Vec<RawMeterRow>, DataError> {
        Ok(query_meter_rows(self.client(), query).await?)
    }

    async fn query_strings(&self, query: &CompiledQuery) -> Result<Vec<String>, DataError> {
        Ok(bind_query(self.client(), query)
            .fetch_all::<String>()
            .await
            .map_err(ClickhouseError::from)?)
    }
}

#[async_trait]
impl QueryCacheStore for Arc<ClickhouseService> {
    async fn lookup_cached_rows(
        &self,
        namespace: &str,
        hash: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<MeterQueryRow>, DataError> {
        Ok(lookup_cached_rows(self.client(), namespace, hash, from, to).await?)
    }

    async fn store_cached_rows(
        &self,
        namespace: &str,
        hash: &str,
        rows: &[MeterQueryRow],
    ) -> Result<(), DataError> {
        Ok(store_cached_rows(self.client(), namespace, hash, rows).await?)
    }
}

#[async_trait]
impl MeterTableStore for Arc<ClickhouseService> {
    async fn min_stored_at(
        &self,
        query: &CompiledQuery,
    ) -> Result<Option<DateTime<Utc>>, DataError> {
        Ok(min_stored_at(self.client(), query).await?)
    }

    async fn replace_chunk(&self, import: &ChunkImport) -> Result<(), DataError> {
        Ok(replace_chunk(self.client(), import).await?)
    }

    async fn insert_meter_events(&self, rows: &[MeterEventRow]) -> Result<(), DataError> {
        Ok(insert_meter_events(self.client(), rows).await?)
    }
}

#[async_trait]
impl EventStore for Arc<ClickhouseService> {
    async fn insert_events(&self, rows: &[EventRow]) -> Result<(), DataError> {
        Ok(insert_events(self.client(), rows).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_meter_value_row_conversion() {
        let row = MeterValueRow {
            start_micros: Some(1),
            end_micros: Some(2),
            meter_value: Some(3.5),
            group_values: vec![Some("a".to_string()), None],
        };
        let raw = RawMeterRow::from(row);
        assert_eq!(raw.window_start, Some(1));
        assert_eq!(raw.window_end, Some(2));
        assert_eq!(raw.value, Some(3.5));
        assert_eq!(raw.group_values, vec![Some("a".to_string()), None]);
    }

    #[test]
    fn test_meter_event_insert_row_flattens_map() {
        let t = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let row = MeterEventRow {
            namespace: "default".to_string(),
            meter_id: "m1".to_string(),
            subject: "s1".to_string(),
            time: t,
            stored_at: t,
            value: 2.0,
            group_by: BTreeMap::from([
                ("region".to_string(), "eu".to_string()),
                ("model".to_string(), "x".to_string()),
            ]),
        };
        let insert = MeterEventInsertRow::from(&row);
        assert_eq!(
            insert.group_by,
            vec![
                ("model".to_string(), "x".to_string()),
                ("region".to_string(), "eu".to_string())
            ]
        );
        assert_eq!(insert.time.unix_timestamp(), t.timestamp());
    }
}
