//! Placeholder rows for windows without usage
//!
//! A window that produced no row is indistinguishable from a window that was never
//! computed. Storing NaN placeholders for empty interior windows lets the cache tell them
//! apart on the next lookup.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use chrono_tz::Tz;

use super::key::group_key;
use crate::data::types::{MeterQueryRow, WindowSize};

/// NaN rows for every missing interior window of every group seen in `rows`.
///
/// The first and last windows of the range are never materialized: they may be partial.
/// With no rows at all, one group without subject or dimensions is assumed.
pub fn materialize_gaps(
    from: DateTime<Utc>,
    to: DateTime<Utc>,
    window_size: WindowSize,
    tz: Tz,
    rows: &[MeterQueryRow],
) -> Vec<MeterQueryRow> {
    let windows = window_size.windows(from, to, tz);
    if windows.len() <= 2 {
        return Vec::new();
    }

    let mut buckets: BTreeMap<String, (&MeterQueryRow, BTreeSet<DateTime<Utc>>)> =
        BTreeMap::new();
    for row in rows {
        buckets
            .entry(group_key(row))
            .or_insert_with(|| (row, BTreeSet::new()))
            .1
            .insert(row.window_start);
    }

    let mut gaps = Vec::new();
    let interior = &windows[1..windows.len() - 1];

    if buckets.is_empty() {
        gaps.extend(interior.iter().map(|&(start, end)| MeterQueryRow {
            value: f64::NAN,
            window_start: start,
            window_end: end,
            subject: None,
            customer_id: None,
            group_by: BTreeMap::new(),
        }));
        return gaps;
    }

    for (template, seen) in buckets.values() {
        for &(start, end) in interior {
            if seen.contains(&start) {
                continue;
            }
            gaps.push(MeterQueryRow {
                value: f64::NAN,
                window_start: start,
                window_end: end,
                subject: template.subject.clone(),
                customer_id: template.customer_id.clone(),
                group_by: template.group_by.clone(),
            });
        }
    }

    gaps
}
