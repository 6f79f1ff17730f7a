//! DuckDB schema definitions
//!
//! `events` and `meter_events` are append-only with no PRIMARY KEY. The query cache keys
//! rows by window and group so repeated stores of the same window are ignored.

/// Current schema version
pub const SCHEMA_VERSION: i32 = 1;

/// Complete schema SQL
pub const SCHEMA: &str = r#"
-- Infrastructure: Schema version tracking
CREATE TABLE IF NOT EXISTS schema_version (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    version INTEGER NOT NULL,
    applied_at BIGINT NOT NULL,
    description VARCHAR
);

-- Raw usage events; data holds the JSON payload
CREATE TABLE IF NOT EXISTS events (
    namespace           VARCHAR NOT NULL,
    id                  VARCHAR NOT NULL,
    type                VARCHAR NOT NULL,
    source              VARCHAR NOT NULL,
    subject             VARCHAR NOT NULL,
    time                TIMESTAMP NOT NULL,
    data                VARCHAR NOT NULL,
    ingested_at         TIMESTAMP NOT NULL,
    stored_at           TIMESTAMP NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_events_namespace_type ON events(namespace, type);

-- Numeric table: one extracted value per event and meter
-- group_by holds a JSON object of dimension -> value
CREATE TABLE IF NOT EXISTS meter_events (
    namespace           VARCHAR NOT NULL,
    meter_id            VARCHAR NOT NULL,
    subject             VARCHAR NOT NULL,
    time                TIMESTAMP NOT NULL,
    stored_at           TIMESTAMP NOT NULL,
    value               DOUBLE NOT NULL,
    group_by            VARCHAR NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_meter_events_meter ON meter_events(namespace, meter_id);

-- Per-window results of cacheable meter queries
-- value is NaN for windows known to be empty
CREATE TABLE IF NOT EXISTS meter_query_cache (
    namespace           VARCHAR NOT NULL,
    hash                VARCHAR NOT NULL,
    window_start        TIMESTAMP NOT NULL,
    window_end          TIMESTAMP NOT NULL,
    group_key           VARCHAR NOT NULL,
    value               DOUBLE NOT NULL,
    subject             VARCHAR,
    customer_id         VARCHAR,
    group_by            VARCHAR NOT NULL,
    created_at          TIMESTAMP NOT NULL,
    PRIMARY KEY (namespace, hash, window_start, window_end, group_key)
);
"#;
