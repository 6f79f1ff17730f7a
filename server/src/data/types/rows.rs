//! Storage row types shared by the analytics backends

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Backend-neutral result row of a compiled meter query.
///
/// Column order: window start, window end, value, then one value per group column.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawMeterRow {
    pub window_start: Option<i64>,
    pub window_end: Option<i64>,
    pub value: Option<f64>,
    pub group_values: Vec<Option<String>>,
}

/// Raw usage event as stored in the `events` table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRow {
    pub namespace: String,
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub source: String,
    pub subject: String,
    pub time: DateTime<Utc>,
    /// JSON payload
    pub data: String,
    #[serde(default = "Utc::now")]
    pub ingested_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub stored_at: DateTime<Utc>,
}

/// One extracted value in the per-meter numeric table
#[derive(Debug, Clone, PartialEq)]
pub struct MeterEventRow {
    pub namespace: String,
    pub meter_id: String,
    pub subject: String,
    pub time: DateTime<Utc>,
    pub stored_at: DateTime<Utc>,
    pub value: f64,
    /// Dimensions whose path resolved to a non-empty value
    pub group_by: BTreeMap<String, String>,
}
