use std::collections::BTreeMap;

use chrono::{Duration, TimeZone};

use super::*;
use crate::data::filters::FilterString;
use crate::data::sql::{Backend, ClickhouseDialect};
use crate::data::types::{CustomerFilter, EngineState, MeterQueryRow, RawMeterRow, WindowSize};

fn utc(d: u32, h: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, d, h, 0, 0).unwrap()
}

fn duckdb() -> MeterQueryCompiler {
    MeterQueryCompiler::new(Backend::Duckdb.dialect(), 8)
}

fn clickhouse() -> MeterQueryCompiler {
    static DIALECT: ClickhouseDialect = ClickhouseDialect;
    MeterQueryCompiler::new(&DIALECT, 8)
}

fn sum_meter() -> MeterDefinition {
    MeterDefinition {
        namespace: "default".to_string(),
        id: "m1".to_string(),
        slug: "tokens".to_string(),
        aggregation: Aggregation::Sum,
        event_type: "prompt".to_string(),
        value_property: Some("$.tokens".to_string()),
        group_by: BTreeMap::from([("model".to_string(), "$.model".to_string())]),
        event_from: None,
        table_engine: None,
    }
}

fn count_meter() -> MeterDefinition {
    MeterDefinition {
        aggregation: Aggregation::Count,
        value_property: None,
        ..sum_meter()
    }
}

fn ready(mut meter: MeterDefinition) -> MeterDefinition {
    meter.table_engine = Some(EngineState {
        ready: true,
        ..Default::default()
    });
    meter
}

fn assert_balanced(query: &CompiledQuery) {
    assert_eq!(
        query.placeholder_count(),
        query.params.len(),
        "placeholders do not match params in: {}",
        query.sql
    );
}

fn s(v: &str) -> QueryParam {
    QueryParam::String(v.to_string())
}

fn scan_one(scanner: &RowScanner, groups: &[&str]) -> MeterQueryRow {
    let rows = scanner.scan(vec![RawMeterRow {
        window_start: Some(0),
        window_end: Some(60_000_000),
        value: Some(1.0),
        group_values: groups.iter().map(|g| Some(g.to_string())).collect(),
    }]);
    assert_eq!(rows.len(), 1);
    rows.into_iter().next().unwrap()
}

// ============================================================================
// Raw events source
// ============================================================================

#[test]
fn test_sum_over_raw_events() {
    let (query, scanner) = duckdb()
        .compile(&sum_meter(), &QueryParams::default())
        .unwrap();

    assert!(query.sql.contains("FROM events WHERE namespace = ? AND type = ?"));
    assert!(query.sql.contains(
        "CAST(sum(CASE WHEN isfinite(TRY_CAST(json_extract_string(data, '$.tokens') AS DOUBLE))"
    ));
    assert!(query.sql.contains("AS meter_value"));
    assert!(!query.sql.contains("GROUP BY"));
    assert_eq!(query.params, vec![s("default"), s("prompt")]);
    assert_eq!(scanner.group_column_count(), 0);
    assert_balanced(&query);
}

#[test]
fn test_count_ignores_value_path() {
    let (query, _) = duckdb()
        .compile(&count_meter(), &QueryParams::default())
        .unwrap();
    assert!(query.sql.contains("NULLIF(count(*), 0)"));
    assert!(!query.sql.contains("json_extract_string"));
    assert_balanced(&query);
}

#[test]
fn test_windowed_query_groups_by_window() {
    let params = QueryParams {
        from: Some(utc(1, 0)),
        to: Some(utc(2, 0)),
        window_size: Some(WindowSize::Hour),
        ..Default::default()
    };
    let (query, _) = duckdb().compile(&sum_meter(), &params).unwrap();

    assert!(
        query
            .sql
            .contains("epoch_us(date_trunc('hour', time)) AS window_start")
    );
    assert!(query.sql.ends_with("GROUP BY window_start, window_end"));
    assert!(query.sql.contains("time >= make_timestamp(?)"));
    assert!(query.sql.contains("time < make_timestamp(?)"));
    assert_eq!(
        &query.params[2..],
        &[
            QueryParam::Int64(utc(1, 0).timestamp_micros()),
            QueryParam::Int64(utc(2, 0).timestamp_micros()),
        ]
    );
    assert_balanced(&query);
}

#[test]
fn test_unwindowed_query_uses_minute_bounds() {
    let (query, _) = duckdb()
        .compile(&sum_meter(), &QueryParams::default())
        .unwrap();
    assert!(
        query
            .sql
            .contains("epoch_us(date_trunc('minute', min(time))) AS window_start")
    );
    assert!(query.sql.contains(
        "epoch_us(date_trunc('minute', max(time)) + INTERVAL 1 MINUTE) AS window_end"
    ));
}

#[test]
fn test_group_by_columns_follow_query_order() {
    let params = QueryParams {
        window_size: Some(WindowSize::Day),
        group_by: vec![
            "model".to_string(),
            "subject".to_string(),
            "model".to_string(),
        ],
        ..Default::default()
    };
    let (query, scanner) = duckdb().compile(&sum_meter(), &params).unwrap();

    assert!(
        query
            .sql
            .contains("NULLIF(json_extract_string(data, '$.model'), '') AS g0")
    );
    assert!(query.sql.contains("NULLIF(subject, '') AS g1"));
    assert!(
        query
            .sql
            .ends_with("GROUP BY window_start, window_end, g0, g1")
    );
    let row = scan_one(&scanner, &["gpt-4", "s1"]);
    assert_eq!(row.group_by.get("model"), Some(&Some("gpt-4".to_string())));
    assert_eq!(row.subject.as_deref(), Some("s1"));
}

#[test]
fn test_unknown_group_by_dimension() {
    let params = QueryParams {
        group_by: vec!["region".to_string()],
        ..Default::default()
    };
    let err = duckdb().compile(&sum_meter(), &params).unwrap_err();
    assert!(matches!(err, MeterError::UnknownGroupByDimension(d) if d == "region"));
}

#[test]
fn test_unknown_filter_dimension() {
    let params = QueryParams {
        filter_group_by: BTreeMap::from([(
            "region".to_string(),
            FilterString {
                eq: Some("eu".to_string()),
                ..Default::default()
            },
        )]),
        ..Default::default()
    };
    let err = duckdb().compile(&sum_meter(), &params).unwrap_err();
    assert!(matches!(err, MeterError::UnknownGroupByDimension(_)));
}

#[test]
fn test_group_by_customer_requires_customer_filter() {
    let params = QueryParams {
        group_by: vec!["customer_id".to_string()],
        ..Default::default()
    };
    let err = duckdb().compile(&sum_meter(), &params).unwrap_err();
    assert!(matches!(err, MeterError::InvalidQuery(_)));
}

#[test]
fn test_customer_filter_and_grouping() {
    let params = QueryParams {
        filter_subject: vec!["s9".to_string()],
        filter_customer: vec![
            CustomerFilter {
                id: "c1".to_string(),
                subject_keys: vec!["s1".to_string(), "s2".to_string()],
            },
            CustomerFilter {
                id: "c2".to_string(),
                subject_keys: vec!["s3".to_string()],
            },
        ],
        group_by: vec!["customer_id".to_string()],
        ..Default::default()
    };
    let (query, scanner) = duckdb().compile(&sum_meter(), &params).unwrap();

    assert!(query.sql.contains(
        "CASE WHEN subject IN (?, ?) THEN CAST(? AS VARCHAR) \
         WHEN subject IN (?) THEN CAST(? AS VARCHAR) ELSE CAST(NULL AS VARCHAR) END AS g0"
    ));
    assert!(query.sql.contains("subject IN (?, ?, ?, ?)"));
    assert_eq!(
        query.params,
        vec![
            s("s1"),
            s("s2"),
            s("c1"),
            s("s3"),
            s("c2"),
            s("default"),
            s("prompt"),
            s("s1"),
            s("s2"),
            s("s3"),
            s("s9"),
        ]
    );
    assert_eq!(scanner.group_column_count(), 1);
    assert_eq!(scan_one(&scanner, &["c1"]).customer_id.as_deref(), Some("c1"));
    assert_balanced(&query);
}

#[test]
fn test_customer_without_subjects_matches_nothing() {
    let params = QueryParams {
        filter_customer: vec![CustomerFilter {
            id: "c1".to_string(),
            subject_keys: vec![],
        }],
        ..Default::default()
    };
    let (query, _) = duckdb().compile(&sum_meter(), &params).unwrap();
    assert!(query.sql.contains("AND 1 = 0"));
    assert_balanced(&query);
}

#[test]
fn test_event_from_is_the_later_bound() {
    let mut meter = sum_meter();
    meter.event_from = Some(utc(5, 0));

    let params = QueryParams {
        from: Some(utc(1, 0)),
        ..Default::default()
    };
    let (query, _) = duckdb().compile(&meter, &params).unwrap();
    assert!(
        query
            .params
            .contains(&QueryParam::Int64(utc(5, 0).timestamp_micros()))
    );
    assert!(
        !query
            .params
            .contains(&QueryParam::Int64(utc(1, 0).timestamp_micros()))
    );

    // event_from alone still bounds the query
    let (query, _) = duckdb().compile(&meter, &QueryParams::default()).unwrap();
    assert!(query.sql.contains("time >= make_timestamp(?)"));
    assert!(!query.sql.contains("time < "));
}

#[test]
fn test_group_filter_applies_to_extraction() {
    let params = QueryParams {
        filter_group_by: BTreeMap::from([(
            "model".to_string(),
            FilterString {
                or: Some(vec![
                    FilterString {
                        eq: Some("gpt-4".to_string()),
                        ..Default::default()
                    },
                    FilterString {
                        like: Some("claude%".to_string()),
                        ..Default::default()
                    },
                ]),
                ..Default::default()
            },
        )]),
        ..Default::default()
    };
    let (query, _) = duckdb().compile(&sum_meter(), &params).unwrap();
    assert!(query.sql.contains(
        "(NULLIF(json_extract_string(data, '$.model'), '') = ? \
         OR NULLIF(json_extract_string(data, '$.model'), '') LIKE ?)"
    ));
    assert_eq!(query.params[2..], [s("gpt-4"), s("claude%")]);
    assert_balanced(&query);
}

#[test]
fn test_filter_exclusivity() {
    let params = QueryParams {
        filter_group_by: BTreeMap::from([(
            "model".to_string(),
            FilterString {
                eq: Some("a".to_string()),
                ne: Some("b".to_string()),
                ..Default::default()
            },
        )]),
        ..Default::default()
    };
    let err = duckdb().compile(&sum_meter(), &params).unwrap_err();
    assert!(matches!(err, MeterError::InvalidFilter(_)));
}

#[test]
fn test_filter_depth_limit() {
    let mut filter = FilterString {
        eq: Some("x".to_string()),
        ..Default::default()
    };
    for _ in 0..3 {
        filter = FilterString {
            and: Some(vec![filter]),
            ..Default::default()
        };
    }
    let params = QueryParams {
        filter_group_by: BTreeMap::from([("model".to_string(), filter)]),
        ..Default::default()
    };
    let err = MeterQueryCompiler::new(Backend::Duckdb.dialect(), 2)
        .compile(&sum_meter(), &params)
        .unwrap_err();
    assert!(matches!(err, MeterError::FilterTooComplex { max_depth: 2 }));
}

#[test]
fn test_time_zone_support_per_backend() {
    let params = QueryParams {
        window_size: Some(WindowSize::Day),
        window_time_zone: Some("Europe/Berlin".to_string()),
        ..Default::default()
    };
    // DuckDB needs bounds to precompute windows
    assert!(duckdb().missing_window_bounds(&sum_meter(), &params).unwrap());
    assert!(matches!(
        duckdb().compile(&sum_meter(), &params),
        Err(MeterError::InvalidQuery(_))
    ));
    assert!(!clickhouse().missing_window_bounds(&sum_meter(), &params).unwrap());

    let bounded = QueryParams {
        from: Some(utc(1, 0)),
        to: Some(utc(3, 0)),
        ..params.clone()
    };
    let (query, _) = duckdb().compile(&sum_meter(), &bounded).unwrap();
    assert_balanced(&query);
    // Berlin days of January start at 23:00 UTC the day before
    let day = |d: u32| (utc(d, 0) - Duration::hours(1)).timestamp_micros();
    assert!(query.sql.contains(&format!(
        "JOIN (VALUES ({}, {}), ({}, {}), ({}, {})) AS w(ws, we)",
        day(1),
        day(2),
        day(2),
        day(3),
        day(3),
        day(4)
    )));
    assert!(query.sql.contains("w.ws AS window_start, w.we AS window_end"));
    assert!(!query.sql.contains("date_trunc"));

    let (query, _) = clickhouse().compile(&sum_meter(), &params).unwrap();
    assert!(
        query
            .sql
            .contains("toStartOfInterval(time, toIntervalDay(1), 'Europe/Berlin')")
    );

    // Without windows the zone does not matter
    let params = QueryParams {
        window_time_zone: Some("Europe/Berlin".to_string()),
        ..Default::default()
    };
    assert!(duckdb().compile(&sum_meter(), &params).is_ok());
    assert!(!duckdb().missing_window_bounds(&sum_meter(), &params).unwrap());
}

#[test]
fn test_time_bounds_query() {
    let params = QueryParams {
        from: Some(utc(1, 0)),
        filter_subject: vec!["s1".to_string()],
        ..Default::default()
    };
    let query = duckdb().compile_time_bounds(&sum_meter(), &params).unwrap();
    assert_balanced(&query);
    assert!(query.sql.starts_with(
        "SELECT epoch_us(min(time)) AS window_start, epoch_us(max(time)) AS window_end"
    ));
    assert!(query.sql.contains("FROM events WHERE"));
    assert!(query.sql.contains("subject IN (?)"));
}

#[test]
fn test_precomputed_window_limit() {
    let params = QueryParams {
        from: Some(utc(1, 0)),
        to: Some(Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap()),
        window_size: Some(WindowSize::Minute),
        window_time_zone: Some("Europe/Berlin".to_string()),
        ..Default::default()
    };
    assert!(matches!(
        duckdb().compile(&sum_meter(), &params),
        Err(MeterError::InvalidQuery(_))
    ));
}

#[test]
fn test_unknown_time_zone() {
    let params = QueryParams {
        window_time_zone: Some("Mars/Olympus".to_string()),
        ..Default::default()
    };
    let err = clickhouse().compile(&sum_meter(), &params).unwrap_err();
    assert!(matches!(err, MeterError::InvalidTimezone(_)));
}

#[test]
fn test_inverted_range_rejected() {
    let params = QueryParams {
        from: Some(utc(2, 0)),
        to: Some(utc(1, 0)),
        ..Default::default()
    };
    let err = duckdb().compile(&sum_meter(), &params).unwrap_err();
    assert!(matches!(err, MeterError::InvalidQuery(_)));
}

#[test]
fn test_invalid_meter_definition() {
    let mut meter = sum_meter();
    meter.value_property = None;
    let err = duckdb().compile(&meter, &QueryParams::default()).unwrap_err();
    assert!(matches!(err, MeterError::InvalidMeterDefinition { .. }));
}

// ============================================================================
// Numeric table source
// ============================================================================

#[test]
fn test_ready_meter_reads_numeric_table() {
    let params = QueryParams {
        group_by: vec!["model".to_string()],
        ..Default::default()
    };
    let (query, _) = duckdb().compile(&ready(sum_meter()), &params).unwrap();
    assert!(
        query
            .sql
            .contains("FROM meter_events WHERE namespace = ? AND meter_id = ?")
    );
    assert!(query.sql.contains("CAST(sum(value) AS DOUBLE)"));
    assert!(
        query
            .sql
            .contains("NULLIF(json_extract_string(group_by, '$.model'), '') AS g0")
    );
    assert_eq!(query.params, vec![s("default"), s("m1")]);
}

#[test]
fn test_numeric_table_map_access_on_clickhouse() {
    let params = QueryParams {
        group_by: vec!["model".to_string()],
        ..Default::default()
    };
    let (query, _) = clickhouse().compile(&ready(sum_meter()), &params).unwrap();
    assert!(query.sql.contains("nullIf(group_by['model'], '') AS g0"));
    assert!(query.sql.starts_with("SELECT CAST(window_start AS Nullable(Int64)) AS start_micros"));
    assert!(
        query
            .sql
            .contains("CAST([g0] AS Array(Nullable(String))) AS group_values FROM (SELECT ")
    );
}

#[test]
fn test_unique_count_stays_on_raw_events() {
    let mut meter = ready(sum_meter());
    meter.aggregation = Aggregation::UniqueCount;
    assert_eq!(QuerySource::for_meter(&meter), QuerySource::RawEvents);

    let (query, _) = duckdb().compile(&meter, &QueryParams::default()).unwrap();
    assert!(query.sql.contains("approx_count_distinct(NULLIF(json_extract_string(data, '$.tokens'), ''))"));

    let err = duckdb()
        .compile_from(QuerySource::NumericTable, &meter, &QueryParams::default())
        .unwrap_err();
    assert!(matches!(err, MeterError::InvalidQuery(_)));
}

#[test]
fn test_both_sources_share_column_layout() {
    let params = QueryParams {
        window_size: Some(WindowSize::Hour),
        group_by: vec!["subject".to_string(), "model".to_string()],
        ..Default::default()
    };
    for source in [QuerySource::RawEvents, QuerySource::NumericTable] {
        let (query, scanner) = clickhouse()
            .compile_from(source, &sum_meter(), &params)
            .unwrap();
        assert!(query.sql.contains("CAST([g0, g1] AS Array(Nullable(String)))"));
        assert_eq!(scanner.group_column_count(), 2);
        assert_balanced(&query);
    }
}

// ============================================================================
// Auxiliary queries
// ============================================================================

#[test]
fn test_subjects_query() {
    let query = duckdb()
        .compile_subjects(&sum_meter(), Some(utc(1, 0)), None)
        .unwrap();
    assert_eq!(
        query.sql,
        "SELECT DISTINCT subject FROM events WHERE namespace = ? AND type = ? \
         AND time >= make_timestamp(?) ORDER BY subject"
    );
    assert_balanced(&query);
}

#[test]
fn test_min_stored_at_query() {
    let query = clickhouse().compile_min_stored_at(&sum_meter());
    assert!(
        query
            .sql
            .contains("toInt64(toUnixTimestamp64Micro(min(stored_at))) AS min_stored_at")
    );
    assert_eq!(query.params, vec![s("default"), s("prompt")]);
}

#[test]
fn test_chunk_import_statements() {
    let chunk = Period::new(utc(1, 0), utc(2, 0));
    let cutover = utc(1, 12);
    let import = duckdb()
        .compile_chunk_import(&sum_meter(), &chunk, cutover)
        .unwrap();

    assert!(import.delete.sql.starts_with("DELETE FROM meter_events WHERE"));
    assert_balanced(&import.delete);

    let sql = &import.insert.sql;
    assert!(sql.starts_with("INSERT INTO meter_events"));
    assert!(sql.contains("CAST(json_object('model', json_extract_string(data, '$.model')) AS VARCHAR) AS g"));
    assert!(sql.ends_with("WHERE v IS NOT NULL"));
    assert_eq!(
        import.insert.params.last(),
        Some(&QueryParam::Int64(cutover.timestamp_micros()))
    );
    assert_balanced(&import.insert);
}

#[test]
fn test_chunk_import_count_stores_one() {
    let chunk = Period::new(utc(1, 0), utc(1, 0) + Duration::days(1));
    let import = clickhouse()
        .compile_chunk_import(&count_meter(), &chunk, utc(3, 0))
        .unwrap();
    assert!(import.insert.sql.contains("toFloat64(1) AS v"));
    assert!(import.insert.sql.contains("assumeNotNull(v)"));
    assert!(import.delete.sql.starts_with("ALTER TABLE meter_events DELETE WHERE"));
}

#[test]
fn test_chunk_import_rejects_unique_count() {
    let mut meter = sum_meter();
    meter.aggregation = Aggregation::UniqueCount;
    let chunk = Period::new(utc(1, 0), utc(2, 0));
    let err = duckdb()
        .compile_chunk_import(&meter, &chunk, utc(3, 0))
        .unwrap_err();
    assert!(matches!(err, MeterError::InvalidQuery(_)));
}
