//! SQLite schema definitions
//!
//! The metadata database holds meter definitions and their engine state.

/// Current schema version
pub const SCHEMA_VERSION: i32 = 1;

/// Complete schema SQL
pub const SCHEMA: &str = r#"
-- =============================================================================
-- Infrastructure: Schema version tracking
-- =============================================================================
CREATE TABLE IF NOT EXISTS schema_version (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    version INTEGER NOT NULL,
    applied_at INTEGER NOT NULL,
    description TEXT
);

CREATE TABLE IF NOT EXISTS schema_migrations (
    version INTEGER PRIMARY KEY,
    name TEXT NOT NULL,
    applied_at INTEGER NOT NULL,
    checksum TEXT NOT NULL,
    execution_time_ms INTEGER,
    success INTEGER NOT NULL DEFAULT 1
);

-- =============================================================================
-- Meters
-- =============================================================================
-- group_by: JSON object of dimension -> JSON path
-- event_from: microseconds since epoch
-- table_engine: versioned engine state document, NULL until the backfill starts
CREATE TABLE IF NOT EXISTS meters (
    namespace TEXT NOT NULL,
    id TEXT NOT NULL,
    slug TEXT NOT NULL CHECK(length(slug) >= 1),
    aggregation TEXT NOT NULL,
    event_type TEXT NOT NULL,
    value_property TEXT,
    group_by TEXT NOT NULL DEFAULT '{}',
    event_from INTEGER,
    table_engine TEXT,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    PRIMARY KEY (namespace, id),
    UNIQUE (namespace, slug)
);

CREATE INDEX IF NOT EXISTS idx_meters_event_type ON meters(namespace, event_type);
"#;
