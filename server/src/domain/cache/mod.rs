//! Meter query result cache
//!
//! Historical usage does not change once it is old enough, so per-window results of
//! cacheable queries are stored and reused. A query is split into:
//!
//! - a fresh head `[from, start)` when `from` is not window aligned
//! - the cacheable range `[start, end)`, served from stored windows plus one query per run
//!   of windows not stored yet
//! - a fresh tail `[end, to)` covering recent usage
//!
//! The parts are merged according to the meter's aggregation.

mod gaps;
mod key;
mod merge;

pub use gaps::materialize_gaps;
pub use key::{group_key, query_hash};
pub use merge::merge_rows;

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use chrono_tz::Tz;

use crate::core::constants::{
    DEFAULT_MINIMUM_CACHEABLE_QUERY_PERIOD_HOURS, DEFAULT_MINIMUM_CACHEABLE_USAGE_AGE_HOURS,
};
use crate::data::traits::QueryCacheStore;
use crate::data::types::{MeterDefinition, MeterQueryRow, Period, QueryParams, WindowSize};
use crate::domain::meter::{MeterError, MeterQueryRunner};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryCacheConfig {
    pub enabled: bool,
    /// Queries must reach at least this far back to use the cache
    pub minimum_cacheable_query_period: Duration,
    /// Usage younger than this is never cached
    pub minimum_cacheable_usage_age: Duration,
}

impl Default for QueryCacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            minimum_cacheable_query_period: Duration::hours(
                DEFAULT_MINIMUM_CACHEABLE_QUERY_PERIOD_HOURS,
            ),
            minimum_cacheable_usage_age: Duration::hours(DEFAULT_MINIMUM_CACHEABLE_USAGE_AGE_HOURS),
        }
    }
}

pub struct QueryCache {
    runner: Arc<dyn MeterQueryRunner>,
    store: Arc<dyn QueryCacheStore>,
    config: QueryCacheConfig,
}

impl QueryCache {
    pub fn new(
        runner: Arc<dyn MeterQueryRunner>,
        store: Arc<dyn QueryCacheStore>,
        config: QueryCacheConfig,
    ) -> Self {
        Self {
            runner,
            store,
            config,
        }
    }

    pub fn config(&self) -> &QueryCacheConfig {
        &self.config
    }

    pub fn is_cacheable(
        &self,
        meter: &MeterDefinition,
        params: &QueryParams,
        now: DateTime<Utc>,
    ) -> bool {
        self.config.enabled
            && params.cachable
            && meter.aggregation.is_cacheable()
            && params
                .from
                .is_some_and(|from| now - from >= self.config.minimum_cacheable_query_period)
    }

    /// Window-aligned part of `[from, to)` old enough to cache. None when empty.
    pub fn cacheable_range(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        cache_window: WindowSize,
        tz: Tz,
        now: DateTime<Utc>,
    ) -> Option<Period> {
        let start = cache_window.ceil(from, tz);
        let limit = to.min(now - self.config.minimum_cacheable_usage_age);
        let mut end = WindowSize::Day.truncate(limit, tz);
        if cache_window == WindowSize::Month {
            end = WindowSize::Month.truncate(end, tz);
        }
        (start < end).then(|| Period::new(start, end))
    }

    /// Run a meter query, serving old windows from the cache where possible
    pub async fn query(
        &self,
        meter: &MeterDefinition,
        params: &QueryParams,
        now: DateTime<Utc>,
    ) -> Result<Vec<MeterQueryRow>, MeterError> {
        if !self.is_cacheable(meter, params, now) {
            return self.runner.run(meter, params).await;
        }
        let tz = params.time_zone()?;
        let Some(from) = params.from else {
            return self.runner.run(meter, params).await;
        };
        let to = params.to.unwrap_or(now);
        let cache_window = params.window_size.unwrap_or(WindowSize::Day);

        let Some(range) = self.cacheable_range(from, to, cache_window, tz, now) else {
            return self.runner.run(meter, params).await;
        };
        let hash = query_hash(meter, params, cache_window)?;

        let mut parts = self
            .cached_range(meter, params, &hash, range, cache_window, tz)
            .await?;

        if from < range.from {
            let head = QueryParams {
                from: Some(from),
                to: Some(range.from),
                cachable: false,
                ..params.clone()
            };
            parts.extend(self.runner.run(meter, &head).await?);
        }
        if range.to < to {
            let tail = QueryParams {
                from: Some(range.to),
                to: params.to,
                cachable: false,
                ..params.clone()
            };
            parts.extend(self.runner.run(meter, &tail).await?);
        }

        Ok(merge_rows(
            meter.aggregation,
            params.window_size,
            params.from,
            params.to,
            parts,
        ))
    }

    async fn cached_range(
        &self,
        meter: &MeterDefinition,
        params: &QueryParams,
        hash: &str,
        range: Period,
        cache_window: WindowSize,
        tz: Tz,
    ) -> Result<Vec<MeterQueryRow>, MeterError> {
        let namespace = &meter.namespace;
        let mut cached = match self
            .store
            .lookup_cached_rows(namespace, hash, range.from, range.to)
            .await
        {
            Ok(rows) => rows,
            Err(e) => {
                tracing::warn!(meter = %meter.slug, error = %e, "Query cache lookup failed");
                Vec::new()
            }
        };

        let covered: BTreeSet<DateTime<Utc>> = cached.iter().map(|r| r.window_start).collect();
        let missing = uncovered_periods(range, cache_window, tz, &covered);
        if missing.is_empty() {
            tracing::debug!(meter = %meter.slug, rows = cached.len(), "Query cache hit");
            return Ok(cached);
        }

        let mut fresh = Vec::new();
        for period in &missing {
            let remainder = QueryParams {
                from: Some(period.from),
                to: Some(period.to),
                window_size: Some(cache_window),
                cachable: false,
                ..params.clone()
            };
            let rows = self.runner.run(meter, &remainder).await?;
            fresh.extend(materialize_gaps(
                period.from,
                period.to,
                cache_window,
                tz,
                &rows,
            ));
            fresh.extend(rows);
        }

        if let Err(e) = self.store.store_cached_rows(namespace, hash, &fresh).await {
            tracing::warn!(meter = %meter.slug, error = %e, "Failed to store query cache rows");
        } else {
            tracing::debug!(
                meter = %meter.slug,
                cached = cached.len(),
                stored = fresh.len(),
                gaps = missing.len(),
                "Query cache filled"
            );
        }

        cached.extend(fresh);
        Ok(cached)
    }
}

/// Runs of consecutive windows in `range` with no cached row.
///
/// A window is covered once any row (placeholders included) starts at it, since each fill
/// computes whole windows for every group.
fn uncovered_periods(
    range: Period,
    window: WindowSize,
    tz: Tz,
    covered: &BTreeSet<DateTime<Utc>>,
) -> Vec<Period> {
    let mut missing: Vec<Period> = Vec::new();
    for (start, end) in window.windows(range.from, range.to, tz) {
        if !range.contains(start) || covered.contains(&start) {
            continue;
        }
        let end = end.min(range.to);
        match missing.last_mut() {
            Some(last) if last.to == start => last.to = end,
            _ => missing.push(Period::new(start, end)),
        }
    }
    missing
}

#[cfg(test)]
#[path = "cache_tests.rs"]
mod tests;
