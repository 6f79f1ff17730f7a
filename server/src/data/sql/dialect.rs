//! SQL dialect trait for multi-database support
//!
//! This trait defines the interface for generating backend-specific SQL for meter
//! queries: windowing, JSON extraction, numeric safety, aggregates and maps.

use crate::data::types::{Aggregation, WindowSize};

/// SQL dialect trait for generating database-specific SQL
///
/// All timestamps leave the database as microseconds since epoch (Int64) and enter
/// it through [`SqlDialect::timestamp_param`], so row decoding never depends on the
/// backend's timestamp types.
pub trait SqlDialect: Send + Sync {
    /// Get the dialect name
    fn name(&self) -> &'static str;

    /// Quote a string literal
    ///
    /// - DuckDB: `'it''s'`
    /// - ClickHouse: `'it\'s'`
    fn string_literal(&self, value: &str) -> String;

    /// Placeholder accepting microseconds since epoch
    ///
    /// - DuckDB: `make_timestamp(?)`
    /// - ClickHouse: `fromUnixTimestamp64Micro(?)`
    fn timestamp_param(&self) -> &'static str;

    /// Convert a high-precision timestamp column to microseconds since epoch
    ///
    /// - DuckDB: `epoch_us(col)`
    /// - ClickHouse: `toInt64(toUnixTimestamp64Micro(col))`
    fn timestamp_to_micros(&self, col: &str) -> String;

    /// Extract a scalar at `path` from a JSON string column as text
    fn json_extract_string(&self, col: &str, path: &str) -> String;

    /// Parse a text expression as a finite float, NULL otherwise
    ///
    /// Missing, non-numeric, NaN and infinite inputs all map to NULL.
    fn safe_number(&self, expr: &str) -> String;

    /// Map the empty string to NULL
    fn nullif_empty(&self, expr: &str) -> String;

    /// A NULL typed as a nullable string
    fn null_string(&self) -> &'static str;

    /// Tumbling window start of `time_col` in `tz`, as microseconds
    fn window_start(&self, time_col: &str, window: WindowSize, tz: &str) -> String;

    /// Tumbling window end of `time_col` in `tz`, as microseconds
    fn window_end(&self, time_col: &str, window: WindowSize, tz: &str) -> String;

    /// `min(time_col)` floored to the minute, as microseconds (pseudo window start)
    fn first_minute(&self, time_col: &str) -> String;

    /// `max(time_col)` floored to the minute plus one minute, as microseconds
    fn last_minute_end(&self, time_col: &str) -> String;

    /// Aggregate `value_expr` into a nullable float. NULL when nothing contributed.
    fn aggregate(&self, aggregation: Aggregation, value_expr: &str, time_col: &str) -> String;

    /// Value for `key` in a string map column
    fn map_value(&self, col: &str, key: &str) -> String;

    /// Build a string map from `(key, value expression)` pairs
    fn build_map(&self, entries: &[(String, String)]) -> String;

    /// The float constant 1, stored for COUNT meters
    fn constant_one(&self) -> &'static str;

    /// Strip nullability from an expression known to be non-NULL
    fn assume_not_null(&self, expr: &str) -> String {
        expr.to_string()
    }

    /// Final shape of a meter query with `group_columns` group aliases `g0..gN`
    fn wrap_meter_query(&self, inner: String, _group_columns: usize) -> String {
        inner
    }

    /// Statement deleting the rows of `table` matching `predicate`
    fn delete_rows(&self, table: &str, predicate: &str) -> String {
        format!("DELETE FROM {} WHERE {}", table, predicate)
    }

    /// Whether [`window_start`](Self::window_start) and [`window_end`](Self::window_end)
    /// align windows to `tz` in SQL. Otherwise windows are precomputed and joined with
    /// [`window_join`](Self::window_join).
    fn native_time_zone(&self, _tz: &str) -> bool {
        true
    }

    /// Join clause attaching precomputed windows `w(ws, we)` in microseconds to the rows
    /// whose `time_col` falls inside them
    fn window_join(&self, time_col: &str, windows: &[(i64, i64)]) -> String {
        let values: Vec<String> = windows
            .iter()
            .map(|(start, end)| format!("({}, {})", start, end))
            .collect();
        let micros = self.timestamp_to_micros(time_col);
        format!(
            "JOIN (VALUES {}) AS w(ws, we) ON {m} >= w.ws AND {m} < w.we",
            values.join(", "),
            m = micros
        )
    }
}
