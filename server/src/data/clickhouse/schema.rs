//! ClickHouse schema definitions
//!
//! - `events`: raw usage events, sorted for per-type time-range scans
//! - `meter_events`: numeric table, one row per usable event value and meter
//! - `meter_query_cache`: per-window cached results. ReplacingMergeTree collapses
//!   duplicate writes of the same window; reads use FINAL.

/// Current schema version
pub const SCHEMA_VERSION: i32 = 1;

pub const SCHEMA_VERSION_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS schema_version (
    id UInt8,
    version Int32,
    applied_at Int64,
    description Nullable(String)
) ENGINE = ReplacingMergeTree()
ORDER BY id
"#;

pub const EVENTS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS events (
    namespace               LowCardinality(String),
    id                      String,
    type                    LowCardinality(String),
    source                  String,
    subject                 String,
    time                    DateTime64(6, 'UTC'),
    data                    String,
    ingested_at             DateTime64(6, 'UTC'),
    stored_at               DateTime64(6, 'UTC'),

    INDEX idx_stored_at stored_at TYPE minmax GRANULARITY 1
) ENGINE = MergeTree()
PARTITION BY toYYYYMM(time)
ORDER BY (namespace, type, subject, time)
"#;

pub const METER_EVENTS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS meter_events (
    namespace               LowCardinality(String),
    meter_id                LowCardinality(String),
    subject                 String,
    time                    DateTime64(6, 'UTC'),
    stored_at               DateTime64(6, 'UTC'),
    value                   Float64,
    group_by                Map(String, String),

    INDEX idx_stored_at stored_at TYPE minmax GRANULARITY 1
) ENGINE = MergeTree()
PARTITION BY toYYYYMM(time)
ORDER BY (namespace, meter_id, subject, time)
"#;

pub const METER_QUERY_CACHE_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS meter_query_cache (
    namespace               LowCardinality(String),
    hash                    String,
    window_start            DateTime64(6, 'UTC'),
    window_end              DateTime64(6, 'UTC'),
    group_key               String,
    value                   Float64,
    subject                 Nullable(String),
    customer_id             Nullable(String),
    group_by                String,
    created_at              DateTime64(6, 'UTC')
) ENGINE = ReplacingMergeTree(created_at)
ORDER BY (namespace, hash, window_start, window_end, group_key)
"#;

/// Statements creating the full schema, in order
pub fn schema_statements() -> [&'static str; 4] {
    [
        SCHEMA_VERSION_TABLE,
        EVENTS_TABLE,
        METER_EVENTS_TABLE,
        METER_QUERY_CACHE_TABLE,
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_statements_are_idempotent() {
        for sql in schema_statements() {
            assert!(sql.trim_start().starts_with("CREATE TABLE IF NOT EXISTS"), "{}", sql);
        }
    }

    #[test]
    fn test_cache_table_collapses_duplicates() {
        assert!(METER_QUERY_CACHE_TABLE.contains("ReplacingMergeTree"));
        assert!(
            METER_QUERY_CACHE_TABLE
                .contains("ORDER BY (namespace, hash, window_start, window_end, group_key)")
        );
    }

    #[test]
    fn test_numeric_table_uses_map() {
        assert!(METER_EVENTS_TABLE.contains("group_by                Map(String, String)"));
    }
}
