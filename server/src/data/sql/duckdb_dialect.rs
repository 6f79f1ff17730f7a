//! DuckDB SQL dialect implementation

use super::dialect::SqlDialect;
use crate::data::types::{Aggregation, WindowSize};

/// DuckDB SQL dialect
pub struct DuckdbDialect;

/// Zones that never leave UTC. Other zones get precomputed windows.
const UTC_ALIASES: &[&str] = &[
    "UTC",
    "Etc/UTC",
    "Etc/UCT",
    "UCT",
    "Etc/Universal",
    "Universal",
    "Etc/Zulu",
    "Zulu",
    "GMT",
    "Etc/GMT",
    "Etc/GMT0",
    "Etc/GMT+0",
    "Etc/GMT-0",
    "Etc/Greenwich",
    "Greenwich",
];

fn trunc_unit(window: WindowSize) -> &'static str {
    match window {
        WindowSize::Minute => "minute",
        WindowSize::Hour => "hour",
        WindowSize::Day => "day",
        WindowSize::Month => "month",
    }
}

fn interval(window: WindowSize) -> &'static str {
    match window {
        WindowSize::Minute => "INTERVAL 1 MINUTE",
        WindowSize::Hour => "INTERVAL 1 HOUR",
        WindowSize::Day => "INTERVAL 1 DAY",
        WindowSize::Month => "INTERVAL 1 MONTH",
    }
}

impl SqlDialect for DuckdbDialect {
    fn name(&self) -> &'static str {
        "duckdb"
    }

    fn string_literal(&self, value: &str) -> String {
        format!("'{}'", value.replace('\'', "''"))
    }

    fn timestamp_param(&self) -> &'static str {
        "make_timestamp(?)"
    }

    fn timestamp_to_micros(&self, col: &str) -> String {
        format!("epoch_us({})", col)
    }

    fn json_extract_string(&self, col: &str, path: &str) -> String {
        format!("json_extract_string({}, {})", col, self.string_literal(path))
    }

    fn safe_number(&self, expr: &str) -> String {
        let parsed = format!("TRY_CAST({} AS DOUBLE)", expr);
        format!("CASE WHEN isfinite({p}) THEN {p} END", p = parsed)
    }

    fn nullif_empty(&self, expr: &str) -> String {
        format!("NULLIF({}, '')", expr)
    }

    fn null_string(&self) -> &'static str {
        "CAST(NULL AS VARCHAR)"
    }

    fn window_start(&self, time_col: &str, window: WindowSize, _tz: &str) -> String {
        format!("epoch_us(date_trunc('{}', {}))", trunc_unit(window), time_col)
    }

    fn window_end(&self, time_col: &str, window: WindowSize, _tz: &str) -> String {
        format!(
            "epoch_us(date_trunc('{}', {}) + {})",
            trunc_unit(window),
            time_col,
            interval(window)
        )
    }

    fn first_minute(&self, time_col: &str) -> String {
        format!("epoch_us(date_trunc('minute', min({})))", time_col)
    }

    fn last_minute_end(&self, time_col: &str) -> String {
        format!(
            "epoch_us(date_trunc('minute', max({})) + INTERVAL 1 MINUTE)",
            time_col
        )
    }

    fn aggregate(&self, aggregation: Aggregation, value_expr: &str, time_col: &str) -> String {
        let expr = match aggregation {
            Aggregation::Sum => format!("sum({})", value_expr),
            Aggregation::Avg => format!("avg({})", value_expr),
            Aggregation::Min => format!("min({})", value_expr),
            Aggregation::Max => format!("max({})", value_expr),
            Aggregation::Count => "NULLIF(count(*), 0)".to_string(),
            Aggregation::UniqueCount => {
                format!("NULLIF(approx_count_distinct({}), 0)", value_expr)
            }
            Aggregation::Latest => format!(
                "arg_max({v}, {t}) FILTER (WHERE {v} IS NOT NULL)",
                v = value_expr,
                t = time_col
            ),
        };
        format!("CAST({} AS DOUBLE)", expr)
    }

    fn map_value(&self, col: &str, key: &str) -> String {
        // Maps are stored as JSON objects; keys are plain identifiers
        self.json_extract_string(col, &format!("$.{}", key))
    }

    fn build_map(&self, entries: &[(String, String)]) -> String {
        if entries.is_empty() {
            return "'{}'".to_string();
        }
        let args: Vec<String> = entries
            .iter()
            .map(|(key, expr)| format!("{}, {}", self.string_literal(key), expr))
            .collect();
        format!("CAST(json_object({}) AS VARCHAR)", args.join(", "))
    }

    fn constant_one(&self) -> &'static str {
        "CAST(1 AS DOUBLE)"
    }

    fn native_time_zone(&self, tz: &str) -> bool {
        UTC_ALIASES.contains(&tz)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name() {
        assert_eq!(DuckdbDialect.name(), "duckdb");
    }

    #[test]
    fn test_string_literal_escapes() {
        assert_eq!(DuckdbDialect.string_literal("it's"), "'it''s'");
    }

    #[test]
    fn test_window_expressions() {
        assert_eq!(
            DuckdbDialect.window_start("time", WindowSize::Day, "UTC"),
            "epoch_us(date_trunc('day', time))"
        );
        assert_eq!(
            DuckdbDialect.window_end("time", WindowSize::Month, "UTC"),
            "epoch_us(date_trunc('month', time) + INTERVAL 1 MONTH)"
        );
    }

    #[test]
    fn test_safe_number() {
        assert_eq!(
            DuckdbDialect.safe_number("x"),
            "CASE WHEN isfinite(TRY_CAST(x AS DOUBLE)) THEN TRY_CAST(x AS DOUBLE) END"
        );
    }

    #[test]
    fn test_map_value() {
        assert_eq!(
            DuckdbDialect.map_value("group_by", "model"),
            "json_extract_string(group_by, '$.model')"
        );
    }

    #[test]
    fn test_native_time_zone() {
        assert!(DuckdbDialect.native_time_zone("UTC"));
        assert!(DuckdbDialect.native_time_zone("Etc/UTC"));
        assert!(!DuckdbDialect.native_time_zone("Europe/Berlin"));
    }

    #[test]
    fn test_window_join() {
        assert_eq!(
            DuckdbDialect.window_join("time", &[(0, 10), (10, 20)]),
            "JOIN (VALUES (0, 10), (10, 20)) AS w(ws, we) \
             ON epoch_us(time) >= w.ws AND epoch_us(time) < w.we"
        );
    }

    #[test]
    fn test_wrap_is_identity() {
        assert_eq!(
            DuckdbDialect.wrap_meter_query("SELECT 1".to_string(), 3),
            "SELECT 1"
        );
    }
}
