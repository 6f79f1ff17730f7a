//! ClickHouse SQL dialect implementation

use super::dialect::SqlDialect;
use crate::data::types::{Aggregation, WindowSize};

/// ClickHouse SQL dialect
pub struct ClickhouseDialect;

fn interval(window: WindowSize) -> &'static str {
    match window {
        WindowSize::Minute => "toIntervalMinute(1)",
        WindowSize::Hour => "toIntervalHour(1)",
        WindowSize::Day => "toIntervalDay(1)",
        WindowSize::Month => "toIntervalMonth(1)",
    }
}

fn datetime_to_micros(expr: &str) -> String {
    format!("toInt64(toUnixTimestamp({})) * 1000000", expr)
}

impl SqlDialect for ClickhouseDialect {
    fn name(&self) -> &'static str {
        "clickhouse"
    }

    fn string_literal(&self, value: &str) -> String {
        // `?` is the client-side bind marker, `??` binds a literal question mark
        let escaped = value
            .replace('\\', "\\\\")
            .replace('\'', "\\'")
            .replace('?', "??");
        format!("'{}'", escaped)
    }

    fn timestamp_param(&self) -> &'static str {
        "fromUnixTimestamp64Micro(?)"
    }

    fn timestamp_to_micros(&self, col: &str) -> String {
        format!("toInt64(toUnixTimestamp64Micro({}))", col)
    }

    fn json_extract_string(&self, col: &str, path: &str) -> String {
        format!("JSON_VALUE({}, {})", col, self.string_literal(path))
    }

    fn safe_number(&self, expr: &str) -> String {
        let parsed = format!("toFloat64OrNull({})", expr);
        format!("if(isFinite(ifNull({p}, nan)), {p}, NULL)", p = parsed)
    }

    fn nullif_empty(&self, expr: &str) -> String {
        format!("nullIf({}, '')", expr)
    }

    fn null_string(&self) -> &'static str {
        "CAST(NULL AS Nullable(String))"
    }

    fn window_start(&self, time_col: &str, window: WindowSize, tz: &str) -> String {
        datetime_to_micros(&format!(
            "toStartOfInterval({}, {}, {})",
            time_col,
            interval(window),
            self.string_literal(tz)
        ))
    }

    fn window_end(&self, time_col: &str, window: WindowSize, tz: &str) -> String {
        datetime_to_micros(&format!(
            "toStartOfInterval({t}, {i}, {tz}) + {i}",
            t = time_col,
            i = interval(window),
            tz = self.string_literal(tz)
        ))
    }

    fn first_minute(&self, time_col: &str) -> String {
        datetime_to_micros(&format!("toStartOfMinute(min({}))", time_col))
    }

    fn last_minute_end(&self, time_col: &str) -> String {
        datetime_to_micros(&format!(
            "toStartOfMinute(max({})) + toIntervalMinute(1)",
            time_col
        ))
    }

    fn aggregate(&self, aggregation: Aggregation, value_expr: &str, time_col: &str) -> String {
        let expr = match aggregation {
            Aggregation::Sum => format!("sum({})", value_expr),
            Aggregation::Avg => format!("avg({})", value_expr),
            Aggregation::Min => format!("min({})", value_expr),
            Aggregation::Max => format!("max({})", value_expr),
            Aggregation::Count => "nullIf(toFloat64(count()), 0)".to_string(),
            Aggregation::UniqueCount => format!("nullIf(toFloat64(uniq({})), 0)", value_expr),
            Aggregation::Latest => format!(
                "argMaxIf({v}, {t}, isNotNull({v}))",
                v = value_expr,
                t = time_col
            ),
        };
        format!("CAST({} AS Nullable(Float64))", expr)
    }

    fn map_value(&self, col: &str, key: &str) -> String {
        format!("{}[{}]", col, self.string_literal(key))
    }

    fn build_map(&self, entries: &[(String, String)]) -> String {
        if entries.is_empty() {
            return "CAST(map(), 'Map(String, String)')".to_string();
        }
        let args: Vec<String> = entries
            .iter()
            .map(|(key, expr)| format!("{}, {}", self.string_literal(key), expr))
            .collect();
        format!("map({})", args.join(", "))
    }

    fn constant_one(&self) -> &'static str {
        "toFloat64(1)"
    }

    fn assume_not_null(&self, expr: &str) -> String {
        format!("assumeNotNull({})", expr)
    }

    fn delete_rows(&self, table: &str, predicate: &str) -> String {
        // Wait for the mutation so a following insert never races it
        format!(
            "ALTER TABLE {} DELETE WHERE {} SETTINGS mutations_sync = 2",
            table, predicate
        )
    }

    fn wrap_meter_query(&self, inner: String, group_columns: usize) -> String {
        // RowBinary decoding needs exact column types; output names must differ from the
        // inner columns or they are substituted into their own expressions
        let aliases: Vec<String> = (0..group_columns).map(|i| format!("g{}", i)).collect();
        format!(
            "SELECT CAST(window_start AS Nullable(Int64)) AS start_micros, \
             CAST(window_end AS Nullable(Int64)) AS end_micros, meter_value, \
             CAST([{}] AS Array(Nullable(String))) AS group_values FROM ({})",
            aliases.join(", "),
            inner
        )
    }
}
