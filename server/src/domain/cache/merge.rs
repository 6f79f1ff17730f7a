//! Aggregation-aware merge of cached and fresh rows

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use super::key::group_key;
use crate::data::types::{Aggregation, MeterQueryRow, WindowSize};

/// Merge partial results of one query.
///
/// With a window size the parts cover disjoint windows and are concatenated. Without one,
/// rows of the same group are combined into a single row spanning the query range.
/// Placeholder rows are dropped.
pub fn merge_rows(
    aggregation: Aggregation,
    window_size: Option<WindowSize>,
    from: Option<DateTime<Utc>>,
    to: Option<DateTime<Utc>>,
    parts: Vec<MeterQueryRow>,
) -> Vec<MeterQueryRow> {
    let rows = parts.into_iter().filter(|r| !r.is_placeholder());

    if window_size.is_some() {
        let mut rows: Vec<_> = rows.collect();
        rows.sort_by(|a, b| a.window_start.cmp(&b.window_start));
        return rows;
    }

    let mut groups: BTreeMap<String, MeterQueryRow> = BTreeMap::new();
    for row in rows {
        match groups.get_mut(&group_key(&row)) {
            Some(merged) => {
                merged.value = aggregation
                    .combine(merged.value, row.value)
                    .unwrap_or(row.value);
                merged.window_start = merged.window_start.min(row.window_start);
                merged.window_end = merged.window_end.max(row.window_end);
                for (dimension, value) in row.group_by {
                    merged.group_by.entry(dimension).or_insert(value);
                }
            }
            None => {
                groups.insert(group_key(&row), row);
            }
        }
    }

    let mut merged: Vec<MeterQueryRow> = groups
        .into_values()
        .map(|mut row| {
            if let Some(from) = from {
                row.window_start = from;
            }
            if let Some(to) = to {
                row.window_end = to;
            }
            row
        })
        .collect();
    merged.sort_by(|a, b| a.window_start.cmp(&b.window_start));
    merged
}
