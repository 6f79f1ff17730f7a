//! Meter repository for SQLite operations

use std::collections::BTreeMap;

use sqlx::SqlitePool;

use crate::data::sqlite::SqliteError;
use crate::data::types::{Aggregation, EngineState, MeterDefinition};
use crate::utils::time::micros_to_datetime;

const METER_COLUMNS: &str = "namespace, id, slug, aggregation, event_type, value_property, \
                             group_by, event_from, table_engine";

type MeterTuple = (
    String,
    String,
    String,
    String,
    String,
    Option<String>,
    String,
    Option<i64>,
    Option<String>,
);

fn decode_meter(row: MeterTuple) -> Result<MeterDefinition, SqliteError> {
    let (
        namespace,
        id,
        slug,
        aggregation,
        event_type,
        value_property,
        group_by,
        event_from,
        table_engine,
    ) = row;

    let aggregation: Aggregation = aggregation
        .parse()
        .map_err(|_| SqliteError::InvalidRow(format!("meter {}: aggregation {}", id, aggregation)))?;
    let group_by: BTreeMap<String, String> = serde_json::from_str(&group_by)
        .map_err(|e| SqliteError::InvalidRow(format!("meter {}: group_by: {}", id, e)))?;
    let table_engine = table_engine
        .as_deref()
        .map(EngineState::decode)
        .transpose()?;

    Ok(MeterDefinition {
        namespace,
        id,
        slug,
        aggregation,
        event_type,
        value_property,
        group_by,
        event_from: event_from.map(micros_to_datetime),
        table_engine,
    })
}

/// All meters, or those of one namespace, ordered by namespace and slug
pub async fn list_meters(
    pool: &SqlitePool,
    namespace: Option<&str>,
) -> Result<Vec<MeterDefinition>, SqliteError> {
    let rows = match namespace {
        Some(ns) => {
            sqlx::query_as::<_, MeterTuple>(&format!(
                "SELECT {} FROM meters WHERE namespace = ? ORDER BY namespace, slug",
                METER_COLUMNS
            ))
            .bind(ns)
            .fetch_all(pool)
            .await?
        }
        None => {
            sqlx::query_as::<_, MeterTuple>(&format!(
                "SELECT {} FROM meters ORDER BY namespace, slug",
                METER_COLUMNS
            ))
            .fetch_all(pool)
            .await?
        }
    };
    rows.into_iter().map(decode_meter).collect()
}

/// Look a meter up by id, then by slug
pub async fn get_meter(
    pool: &SqlitePool,
    namespace: &str,
    id_or_slug: &str,
) -> Result<Option<MeterDefinition>, SqliteError> {
    let row = sqlx::query_as::<_, MeterTuple>(&format!(
        "SELECT {} FROM meters WHERE namespace = ? AND (id = ? OR slug = ?) \
         ORDER BY CASE WHEN id = ? THEN 0 ELSE 1 END LIMIT 1",
        METER_COLUMNS
    ))
    .bind(namespace)
    .bind(id_or_slug)
    .bind(id_or_slug)
    .bind(id_or_slug)
    .fetch_optional(pool)
    .await?;

    row.map(decode_meter).transpose()
}

/// Replace the engine state document. Returns false if the meter does not exist.
pub async fn update_table_engine(
    pool: &SqlitePool,
    namespace: &str,
    meter_id: &str,
    state: &EngineState,
) -> Result<bool, SqliteError> {
    let encoded = state.encode()?;
    let now = chrono::Utc::now().timestamp();

    let result = sqlx::query(
        "UPDATE meters SET table_engine = ?, updated_at = ? WHERE namespace = ? AND id = ?",
    )
    .bind(encoded)
    .bind(now)
    .bind(namespace)
    .bind(meter_id)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// Insert or update a definition. A stored engine state is kept unless the new definition
/// carries one.
pub async fn upsert_meter(pool: &SqlitePool, meter: &MeterDefinition) -> Result<(), SqliteError> {
    let group_by = serde_json::to_string(&meter.group_by)
        .map_err(|e| SqliteError::InvalidRow(format!("meter {}: group_by: {}", meter.id, e)))?;
    let table_engine = meter
        .table_engine
        .as_ref()
        .map(EngineState::encode)
        .transpose()?;
    let now = chrono::Utc::now().timestamp();

    sqlx::query(
        r#"
        INSERT INTO meters (namespace, id, slug, aggregation, event_type, value_property,
                            group_by, event_from, table_engine, created_at, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT (namespace, id) DO UPDATE SET
            slug = excluded.slug,
            aggregation = excluded.aggregation,
            event_type = excluded.event_type,
            value_property = excluded.value_property,
            group_by = excluded.group_by,
            event_from = excluded.event_from,
            table_engine = COALESCE(excluded.table_engine, meters.table_engine),
            updated_at = excluded.updated_at
        "#,
    )
    .bind(&meter.namespace)
    .bind(&meter.id)
    .bind(&meter.slug)
    .bind(meter.aggregation.as_str())
    .bind(&meter.event_type)
    .bind(meter.value_property.as_deref())
    .bind(group_by)
    .bind(meter.event_from.map(|t| t.timestamp_micros()))
    .bind(table_engine)
    .bind(now)
    .bind(now)
    .execute(pool)
    .await?;

    Ok(())
}
