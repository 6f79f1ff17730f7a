use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::TimeZone;
use parking_lot::Mutex;

use super::*;
use crate::data::error::DataError;
use crate::data::types::Aggregation;

fn utc(m: u32, d: u32, h: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, m, d, h, 0, 0).unwrap()
}

fn meter(aggregation: Aggregation) -> MeterDefinition {
    MeterDefinition {
        namespace: "default".to_string(),
        id: "m1".to_string(),
        slug: "tokens".to_string(),
        aggregation,
        event_type: "prompt".to_string(),
        value_property: Some("$.tokens".to_string()),
        group_by: BTreeMap::new(),
        event_from: None,
        table_engine: None,
    }
}

/// Evaluates queries over an in-memory event list
struct FakeRunner {
    events: Vec<(DateTime<Utc>, &'static str, f64)>,
    calls: Mutex<Vec<QueryParams>>,
}

impl FakeRunner {
    fn new() -> Self {
        Self {
            events: vec![
                (utc(3, 1, 5), "a", 100.0),
                (utc(3, 1, 8), "a", 1.0),
                (utc(3, 5, 10), "a", 2.0),
                (utc(3, 5, 11), "b", 3.0),
                (utc(3, 10, 0), "a", 4.0),
                (utc(3, 18, 9), "a", 7.0),
                (utc(3, 19, 1), "b", 5.0),
                (utc(3, 20, 10), "a", 6.0),
            ],
            calls: Mutex::new(Vec::new()),
        }
    }

    fn calls(&self) -> Vec<QueryParams> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl MeterQueryRunner for FakeRunner {
    async fn run(
        &self,
        meter: &MeterDefinition,
        params: &QueryParams,
    ) -> Result<Vec<MeterQueryRow>, MeterError> {
        self.calls.lock().push(params.clone());
        let tz = params.time_zone()?;
        let by_subject = params.group_by.iter().any(|g| g == "subject");

        let mut groups: BTreeMap<(DateTime<Utc>, Option<String>), MeterQueryRow> =
            BTreeMap::new();
        for &(time, subject, value) in &self.events {
            if params.from.is_some_and(|f| time < f) || params.to.is_some_and(|t| time >= t) {
                continue;
            }
            let (start, end) = match params.window_size {
                Some(w) => {
                    let start = w.truncate(time, tz);
                    (start, w.next(start, tz))
                }
                None => (params.from.unwrap_or(time), params.to.unwrap_or(time)),
            };
            let subject = by_subject.then(|| subject.to_string());
            groups
                .entry((start, subject.clone()))
                .and_modify(|row| {
                    row.value = meter.aggregation.combine(row.value, value).unwrap_or(value)
                })
                .or_insert(MeterQueryRow {
                    value,
                    window_start: start,
                    window_end: end,
                    subject,
                    customer_id: None,
                    group_by: BTreeMap::new(),
                });
        }
        Ok(groups.into_values().collect())
    }
}

#[derive(Default)]
struct FakeStore {
    rows: Mutex<Vec<(String, String, MeterQueryRow)>>,
    fail: bool,
}

#[async_trait]
impl QueryCacheStore for FakeStore {
    async fn lookup_cached_rows(
        &self,
        namespace: &str,
        hash: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<MeterQueryRow>, DataError> {
        if self.fail {
            return Err(DataError::InvalidData("lookup unavailable".to_string()));
        }
        let mut rows: Vec<MeterQueryRow> = self
            .rows
            .lock()
            .iter()
            .filter(|(ns, h, r)| {
                ns == namespace && h == hash && r.window_start >= from && r.window_end <= to
            })
            .map(|(_, _, r)| r.clone())
            .collect();
        rows.sort_by_key(|r| r.window_start);
        Ok(rows)
    }

    async fn store_cached_rows(
        &self,
        namespace: &str,
        hash: &str,
        rows: &[MeterQueryRow],
    ) -> Result<(), DataError> {
        if self.fail {
            return Err(DataError::InvalidData("store unavailable".to_string()));
        }
        self.rows.lock().extend(
            rows.iter()
                .map(|r| (namespace.to_string(), hash.to_string(), r.clone())),
        );
        Ok(())
    }
}

fn cache(runner: Arc<FakeRunner>, store: Arc<FakeStore>) -> QueryCache {
    QueryCache::new(runner, store, QueryCacheConfig::default())
}

fn sorted(mut rows: Vec<MeterQueryRow>) -> Vec<MeterQueryRow> {
    rows.sort_by(|a, b| {
        (a.window_start, a.subject.clone()).cmp(&(b.window_start, b.subject.clone()))
    });
    rows
}

fn month_query(window_size: Option<WindowSize>) -> QueryParams {
    QueryParams {
        from: Some(utc(3, 1, 6)),
        to: Some(utc(3, 20, 12)),
        window_size,
        group_by: vec!["subject".to_string()],
        cachable: true,
        ..Default::default()
    }
}

#[tokio::test]
async fn test_windowed_sum_matches_fresh_query() {
    let now = utc(3, 20, 12);
    let runner = Arc::new(FakeRunner::new());
    let store = Arc::new(FakeStore::default());
    let params = month_query(Some(WindowSize::Day));
    let m = meter(Aggregation::Sum);

    let cached = cache(runner.clone(), store.clone())
        .query(&m, &params, now)
        .await
        .unwrap();
    let fresh = runner.run(&m, &params).await.unwrap();

    assert_eq!(sorted(cached), sorted(fresh));
    assert!(!store.rows.lock().is_empty());
}

#[tokio::test]
async fn test_unwindowed_sum_matches_fresh_query() {
    let now = utc(3, 20, 12);
    let runner = Arc::new(FakeRunner::new());
    let store = Arc::new(FakeStore::default());
    let params = month_query(None);
    let m = meter(Aggregation::Sum);

    let cached = cache(runner.clone(), store)
        .query(&m, &params, now)
        .await
        .unwrap();
    let fresh = runner.run(&m, &params).await.unwrap();

    let cached = sorted(cached);
    assert_eq!(cached, sorted(fresh));
    // a: 1 + 2 + 4 + 7 + 6, the event before `from` is excluded
    let a = cached
        .iter()
        .find(|r| r.subject.as_deref() == Some("a"))
        .unwrap();
    assert_eq!(a.value, 20.0);
    assert_eq!(a.window_start, utc(3, 1, 6));
    assert_eq!(a.window_end, utc(3, 20, 12));
}

#[tokio::test]
async fn test_max_matches_fresh_query() {
    let now = utc(3, 20, 12);
    let runner = Arc::new(FakeRunner::new());
    let params = month_query(None);
    let m = meter(Aggregation::Max);

    let cached = cache(runner.clone(), Arc::new(FakeStore::default()))
        .query(&m, &params, now)
        .await
        .unwrap();
    let fresh = runner.run(&m, &params).await.unwrap();
    assert_eq!(sorted(cached), sorted(fresh));
}

#[tokio::test]
async fn test_splits_into_head_cached_range_and_tail() {
    let now = utc(3, 20, 12);
    let runner = Arc::new(FakeRunner::new());
    cache(runner.clone(), Arc::new(FakeStore::default()))
        .query(&meter(Aggregation::Sum), &month_query(None), now)
        .await
        .unwrap();

    let calls = runner.calls();
    assert_eq!(calls.len(), 3);
    // Cacheable range ends at the day boundary before now - 24h
    assert_eq!(calls[0].from, Some(utc(3, 2, 0)));
    assert_eq!(calls[0].to, Some(utc(3, 19, 0)));
    assert_eq!(calls[0].window_size, Some(WindowSize::Day));
    assert_eq!(calls[1].from, Some(utc(3, 1, 6)));
    assert_eq!(calls[1].to, Some(utc(3, 2, 0)));
    assert_eq!(calls[2].from, Some(utc(3, 19, 0)));
    assert_eq!(calls[2].to, Some(utc(3, 20, 12)));
    assert!(calls.iter().all(|c| !c.cachable));
}

#[tokio::test]
async fn test_second_query_is_served_from_cache() {
    let now = utc(3, 20, 12);
    let runner = Arc::new(FakeRunner::new());
    let cache = cache(runner.clone(), Arc::new(FakeStore::default()));
    let m = meter(Aggregation::Sum);
    let params = month_query(Some(WindowSize::Day));

    let first = cache.query(&m, &params, now).await.unwrap();
    let second = cache.query(&m, &params, now).await.unwrap();
    assert_eq!(first, second);

    let calls = runner.calls();
    assert_eq!(calls.len(), 6);
    // The empty first window has no placeholder, so it is the only cached window rerun
    assert_eq!(calls[3].from, Some(utc(3, 2, 0)));
    assert_eq!(calls[3].to, Some(utc(3, 3, 0)));
    assert_eq!(calls[4].from, Some(utc(3, 1, 6)));
    assert_eq!(calls[5].from, Some(utc(3, 19, 0)));
}

#[tokio::test]
async fn test_partial_coverage_queries_only_the_remainder() {
    let runner = Arc::new(FakeRunner::new());
    let cache = cache(runner.clone(), Arc::new(FakeStore::default()));
    let m = meter(Aggregation::Sum);
    let params = QueryParams {
        to: None,
        ..month_query(Some(WindowSize::Day))
    };

    cache.query(&m, &params, utc(3, 20, 12)).await.unwrap();
    let later = cache.query(&m, &params, utc(3, 21, 12)).await.unwrap();

    let calls = runner.calls();
    assert_eq!(calls.len(), 7);
    assert_eq!(calls[3].from, Some(utc(3, 2, 0)));
    assert_eq!(calls[3].to, Some(utc(3, 3, 0)));
    assert_eq!(calls[4].from, Some(utc(3, 19, 0)));
    assert_eq!(calls[4].to, Some(utc(3, 20, 0)));

    let fresh = runner.run(&m, &params).await.unwrap();
    assert_eq!(sorted(later), sorted(fresh));
}

#[tokio::test]
async fn test_wider_query_after_narrow_one_fills_the_prefix() {
    let now = utc(3, 20, 12);
    let runner = Arc::new(FakeRunner::new());
    let cache = cache(runner.clone(), Arc::new(FakeStore::default()));
    let m = meter(Aggregation::Sum);

    let narrow = QueryParams {
        from: Some(utc(3, 9, 0)),
        ..month_query(None)
    };
    cache.query(&m, &narrow, now).await.unwrap();

    let wide = month_query(None);
    let cached = sorted(cache.query(&m, &wide, now).await.unwrap());
    let fresh = sorted(runner.run(&m, &wide).await.unwrap());
    assert_eq!(cached, fresh);

    let values: Vec<(Option<String>, f64)> =
        cached.iter().map(|r| (r.subject.clone(), r.value)).collect();
    assert_eq!(
        values,
        vec![(Some("a".to_string()), 20.0), (Some("b".to_string()), 8.0)]
    );
}

#[tokio::test]
async fn test_interior_holes_between_cached_ranges_are_queried() {
    let now = utc(3, 20, 12);
    let runner = Arc::new(FakeRunner::new());
    let cache = cache(runner.clone(), Arc::new(FakeStore::default()));
    let m = meter(Aggregation::Sum);
    let windowed = month_query(Some(WindowSize::Day));

    for (from, to) in [(utc(3, 2, 0), utc(3, 8, 0)), (utc(3, 12, 0), utc(3, 19, 0))] {
        let params = QueryParams {
            from: Some(from),
            to: Some(to),
            ..windowed.clone()
        };
        cache.query(&m, &params, now).await.unwrap();
    }
    assert_eq!(runner.calls().len(), 2);

    let cached = cache.query(&m, &windowed, now).await.unwrap();
    let calls = runner.calls();
    let ranges: Vec<_> = calls[2..].iter().map(|c| (c.from, c.to)).collect();
    assert_eq!(
        ranges,
        vec![
            (Some(utc(3, 2, 0)), Some(utc(3, 3, 0))),
            (Some(utc(3, 7, 0)), Some(utc(3, 13, 0))),
            (Some(utc(3, 1, 6)), Some(utc(3, 2, 0))),
            (Some(utc(3, 19, 0)), Some(utc(3, 20, 12))),
        ]
    );

    let fresh = runner.run(&m, &windowed).await.unwrap();
    assert_eq!(sorted(cached), sorted(fresh));
}

#[test]
fn test_uncovered_periods_collapses_runs() {
    let range = Period::new(utc(3, 1, 0), utc(3, 8, 0));
    let covered: BTreeSet<DateTime<Utc>> = [utc(3, 3, 0), utc(3, 4, 0), utc(3, 7, 0)]
        .into_iter()
        .collect();
    assert_eq!(
        uncovered_periods(range, WindowSize::Day, chrono_tz::UTC, &covered),
        vec![
            Period::new(utc(3, 1, 0), utc(3, 3, 0)),
            Period::new(utc(3, 5, 0), utc(3, 7, 0)),
        ]
    );

    let all: BTreeSet<DateTime<Utc>> = (1..8).map(|d| utc(3, d, 0)).collect();
    assert!(uncovered_periods(range, WindowSize::Day, chrono_tz::UTC, &all).is_empty());
}

#[tokio::test]
async fn test_placeholders_are_stored_but_not_returned() {
    let now = utc(3, 20, 12);
    let store = Arc::new(FakeStore::default());
    let rows = cache(Arc::new(FakeRunner::new()), store.clone())
        .query(&meter(Aggregation::Sum), &month_query(Some(WindowSize::Day)), now)
        .await
        .unwrap();

    assert!(rows.iter().all(|r| !r.is_placeholder()));
    assert!(store.rows.lock().iter().any(|(_, _, r)| r.is_placeholder()));
}

#[tokio::test]
async fn test_store_failures_do_not_fail_the_query() {
    let now = utc(3, 20, 12);
    let runner = Arc::new(FakeRunner::new());
    let store = Arc::new(FakeStore {
        fail: true,
        ..Default::default()
    });
    let params = month_query(Some(WindowSize::Day));
    let m = meter(Aggregation::Sum);

    let cached = cache(runner.clone(), store).query(&m, &params, now).await.unwrap();
    let fresh = runner.run(&m, &params).await.unwrap();
    assert_eq!(sorted(cached), sorted(fresh));
}

#[tokio::test]
async fn test_uncacheable_queries_run_directly() {
    let now = utc(3, 20, 12);
    let runner = Arc::new(FakeRunner::new());
    let store = Arc::new(FakeStore::default());
    let cache = cache(runner.clone(), store.clone());

    let avg = meter(Aggregation::Avg);
    cache.query(&avg, &month_query(None), now).await.unwrap();

    let not_requested = QueryParams {
        cachable: false,
        ..month_query(None)
    };
    cache
        .query(&meter(Aggregation::Sum), &not_requested, now)
        .await
        .unwrap();

    let recent = QueryParams {
        from: Some(utc(3, 19, 0)),
        ..month_query(None)
    };
    cache
        .query(&meter(Aggregation::Sum), &recent, now)
        .await
        .unwrap();

    assert_eq!(runner.calls().len(), 3);
    assert!(store.rows.lock().is_empty());
}

#[test]
fn test_cacheable_range_month_window() {
    let cache = cache(Arc::new(FakeRunner::new()), Arc::new(FakeStore::default()));
    let range = cache
        .cacheable_range(
            utc(1, 15, 0),
            utc(4, 10, 0),
            WindowSize::Month,
            chrono_tz::UTC,
            utc(4, 10, 0),
        )
        .unwrap();
    assert_eq!(range, Period::new(utc(2, 1, 0), utc(4, 1, 0)));

    assert!(
        cache
            .cacheable_range(
                utc(3, 15, 0),
                utc(3, 20, 0),
                WindowSize::Month,
                chrono_tz::UTC,
                utc(3, 20, 0),
            )
            .is_none()
    );
}
