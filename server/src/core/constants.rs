// =============================================================================
// Application Identity
// =============================================================================

/// Application name in title case (for display)
pub const APP_NAME: &str = "Meterhouse";

// =============================================================================
// Configuration Files
// =============================================================================

/// Config file name, looked up in the working directory
pub const CONFIG_FILE_NAME: &str = "meterhouse.json";

/// Environment variable for config file path
pub const ENV_CONFIG: &str = "METERHOUSE_CONFIG";

// =============================================================================
// Environment Variables - Logging
// =============================================================================

/// Environment variable for log level/filter
pub const ENV_LOG: &str = "METERHOUSE_LOG";

/// Default log filter when neither METERHOUSE_LOG nor RUST_LOG is set
pub const DEFAULT_LOG_FILTER: &str = "info,meterhouse=info";

// =============================================================================
// Environment Variables - Database
// =============================================================================

/// Environment variable for analytics database backend (duckdb or clickhouse)
pub const ENV_ANALYTICS_BACKEND: &str = "METERHOUSE_ANALYTICS_BACKEND";

/// Environment variable for the DuckDB database file
pub const ENV_DUCKDB_PATH: &str = "METERHOUSE_DUCKDB_PATH";

/// Environment variable for the SQLite meter registry file
pub const ENV_METADATA_PATH: &str = "METERHOUSE_METADATA_PATH";

/// Environment variable for ClickHouse connection URL
pub const ENV_CLICKHOUSE_URL: &str = "METERHOUSE_CLICKHOUSE_URL";

/// Environment variable for ClickHouse database name
pub const ENV_CLICKHOUSE_DATABASE: &str = "METERHOUSE_CLICKHOUSE_DATABASE";

/// Environment variable for ClickHouse user
pub const ENV_CLICKHOUSE_USER: &str = "METERHOUSE_CLICKHOUSE_USER";

/// Environment variable for ClickHouse password
pub const ENV_CLICKHOUSE_PASSWORD: &str = "METERHOUSE_CLICKHOUSE_PASSWORD";

// =============================================================================
// SQLite Database (meter registry)
// =============================================================================

/// Default SQLite database file
pub const DEFAULT_METADATA_PATH: &str = "meterhouse.db";

/// SQLite connection pool max connections
pub const SQLITE_MAX_CONNECTIONS: u32 = 5;

/// SQLite busy timeout in seconds
pub const SQLITE_BUSY_TIMEOUT_SECS: u64 = 30;

/// SQLite cache size (negative = KB, so -16000 = 16MB)
pub const SQLITE_CACHE_SIZE: &str = "-16000";

/// WAL checkpoint interval in seconds
pub const SQLITE_CHECKPOINT_INTERVAL_SECS: u64 = 300;

// =============================================================================
// DuckDB Database
// =============================================================================

/// Default DuckDB database file
pub const DEFAULT_DUCKDB_PATH: &str = "meterhouse.duckdb";

/// DuckDB checkpoint interval in seconds (5 minutes)
pub const DUCKDB_CHECKPOINT_INTERVAL_SECS: u64 = 300;

/// DuckDB query timeout in seconds
pub const DUCKDB_QUERY_TIMEOUT_SECS: u64 = 30;

// =============================================================================
// ClickHouse Database
// =============================================================================

/// ClickHouse default database name
pub const CLICKHOUSE_DEFAULT_DATABASE: &str = "meterhouse";

/// ClickHouse default query timeout in seconds
pub const CLICKHOUSE_DEFAULT_TIMEOUT_SECS: u64 = 30;

/// ClickHouse health check interval in seconds
pub const CLICKHOUSE_HEALTH_CHECK_INTERVAL_SECS: u64 = 60;

// =============================================================================
// Query Cache
// =============================================================================

/// Queries must reach at least this far into the past to be cached
pub const DEFAULT_MINIMUM_CACHEABLE_QUERY_PERIOD_HOURS: i64 = 72;

/// Usage younger than this is always computed fresh
pub const DEFAULT_MINIMUM_CACHEABLE_USAGE_AGE_HOURS: i64 = 24;

// =============================================================================
// Backfill
// =============================================================================

/// Delay between enabling a meter and the stream cutover
pub const DEFAULT_STREAM_START_OFFSET_SECS: u64 = 60;

/// Time after the cutover before the numeric table serves queries
pub const DEFAULT_CUTOVER_SETTLE_DELAY_SECS: u64 = 600;

/// Lower bound fallback when a meter has no stored events
pub const BACKFILL_FALLBACK_WINDOW_HOURS: i64 = 24;

/// Maintenance loop interval in seconds
pub const DEFAULT_BACKFILL_INTERVAL_SECS: u64 = 10;

/// Backfill steps granted to each meter per maintenance tick
pub const DEFAULT_BACKFILL_STEPS_PER_TICK: u32 = 4;

// =============================================================================
// Meter Cache
// =============================================================================

/// Meter snapshot refresh interval in seconds
pub const DEFAULT_METER_CACHE_REFRESH_SECS: u64 = 30;

// =============================================================================
// Filters
// =============================================================================

/// Maximum nesting depth of a filter predicate
pub const DEFAULT_FILTER_MAX_DEPTH: usize = 8;

// =============================================================================
// Ingestion
// =============================================================================

/// Attempts for numeric table writes from live ingestion
pub const INGEST_WRITE_MAX_ATTEMPTS: u32 = 3;

/// Initial backoff between ingestion write attempts in milliseconds
pub const INGEST_WRITE_BACKOFF_MS: u64 = 100;

// =============================================================================
// Shutdown
// =============================================================================

/// Time to wait for background tasks on shutdown
pub const SHUTDOWN_TIMEOUT_SECS: u64 = 10;
