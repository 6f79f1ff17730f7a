//! Cache identity of a query and of a result group

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::data::filters::FilterString;
use crate::data::types::{Aggregation, MeterDefinition, MeterQueryRow, QueryParams, WindowSize};
use crate::domain::meter::MeterError;
use crate::utils::hash::json_sha256_hex;

#[derive(Serialize)]
struct QueryIdentity<'a> {
    meter_id: &'a str,
    aggregation: Aggregation,
    event_type: &'a str,
    value_property: Option<&'a str>,
    event_from: Option<DateTime<Utc>>,
    /// Requested dimension -> extraction path (None for subject/customer_id)
    group_by: BTreeMap<&'a str, Option<&'a str>>,
    filter_subject: BTreeSet<&'a str>,
    filter_customer: BTreeMap<&'a str, BTreeSet<&'a str>>,
    filter_group_by: &'a BTreeMap<String, FilterString>,
    time_zone: &'a str,
    cache_window: WindowSize,
}

/// Stable hash of everything that affects a cached number.
///
/// `from`/`to` are excluded. Rows are stored at the granularity of `cache_window`, which
/// is part of the identity so hourly and daily rows never mix.
pub fn query_hash(
    meter: &MeterDefinition,
    params: &QueryParams,
    cache_window: WindowSize,
) -> Result<String, MeterError> {
    let tz = params.time_zone()?;
    let identity = QueryIdentity {
        meter_id: &meter.id,
        aggregation: meter.aggregation,
        event_type: &meter.event_type,
        value_property: meter.value_property.as_deref(),
        event_from: meter.event_from,
        group_by: params
            .group_by
            .iter()
            .map(|d| (d.as_str(), meter.group_by.get(d).map(String::as_str)))
            .collect(),
        filter_subject: params.filter_subject.iter().map(String::as_str).collect(),
        filter_customer: params
            .filter_customer
            .iter()
            .map(|c| {
                (
                    c.id.as_str(),
                    c.subject_keys.iter().map(String::as_str).collect(),
                )
            })
            .collect(),
        filter_group_by: &params.filter_group_by,
        time_zone: tz.name(),
        cache_window,
    };
    json_sha256_hex(&identity).map_err(|e| MeterError::InvalidQuery(e.to_string()))
}

/// Identity of a row's group, independent of dimension order
pub fn group_key(row: &MeterQueryRow) -> String {
    let mut key = String::new();
    if let Some(subject) = &row.subject {
        key.push_str("subject=");
        key.push_str(subject);
        key.push(';');
    }
    if let Some(customer) = &row.customer_id {
        key.push_str("customer=");
        key.push_str(customer);
        key.push(';');
    }
    for (dimension, value) in &row.group_by {
        key.push_str("group=");
        key.push_str(dimension);
        key.push('=');
        key.push_str(value.as_deref().unwrap_or("nil"));
        key.push(';');
    }
    key
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::types::CustomerFilter;
    use chrono::TimeZone;

    fn meter() -> MeterDefinition {
        MeterDefinition {
            namespace: "default".to_string(),
            id: "m1".to_string(),
            slug: "tokens".to_string(),
            aggregation: Aggregation::Sum,
            event_type: "prompt".to_string(),
            value_property: Some("$.tokens".to_string()),
            group_by: BTreeMap::from([
                ("model".to_string(), "$.model".to_string()),
                ("region".to_string(), "$.region".to_string()),
            ]),
            event_from: None,
            table_engine: None,
        }
    }

    #[test]
    fn test_query_hash_ignores_range_and_order() {
        let a = QueryParams {
            from: Some(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()),
            group_by: vec!["model".to_string(), "region".to_string()],
            filter_subject: vec!["s1".to_string(), "s2".to_string()],
            ..Default::default()
        };
        let b = QueryParams {
            from: Some(Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap()),
            to: Some(Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap()),
            group_by: vec!["region".to_string(), "model".to_string()],
            filter_subject: vec!["s2".to_string(), "s1".to_string()],
            ..Default::default()
        };
        assert_eq!(
            query_hash(&meter(), &a, WindowSize::Day).unwrap(),
            query_hash(&meter(), &b, WindowSize::Day).unwrap()
        );
    }

    #[test]
    fn test_query_hash_changes_with_inputs() {
        let base = QueryParams::default();
        let h = query_hash(&meter(), &base, WindowSize::Day).unwrap();

        assert_ne!(h, query_hash(&meter(), &base, WindowSize::Hour).unwrap());

        let mut other_meter = meter();
        other_meter.value_property = Some("$.cost".to_string());
        assert_ne!(h, query_hash(&other_meter, &base, WindowSize::Day).unwrap());

        let tz = QueryParams {
            window_time_zone: Some("Europe/Paris".to_string()),
            ..Default::default()
        };
        assert_ne!(h, query_hash(&meter(), &tz, WindowSize::Day).unwrap());

        let customers = QueryParams {
            filter_customer: vec![CustomerFilter {
                id: "c1".to_string(),
                subject_keys: vec!["s1".to_string()],
            }],
            ..Default::default()
        };
        assert_ne!(h, query_hash(&meter(), &customers, WindowSize::Day).unwrap());
    }

    #[test]
    fn test_group_key_stable_under_permutation() {
        let t = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let mut a = MeterQueryRow {
            value: 1.0,
            window_start: t,
            window_end: t,
            subject: Some("s1".to_string()),
            customer_id: None,
            group_by: BTreeMap::new(),
        };
        let mut b = a.clone();
        a.group_by.insert("region".to_string(), None);
        a.group_by.insert("model".to_string(), Some("gpt-4".to_string()));
        b.group_by.insert("model".to_string(), Some("gpt-4".to_string()));
        b.group_by.insert("region".to_string(), None);

        assert_eq!(group_key(&a), group_key(&b));
        assert_eq!(
            group_key(&a),
            "subject=s1;group=model=gpt-4;group=region=nil;"
        );
    }

    #[test]
    fn test_group_key_ignores_insertion_order() {
        use rand::seq::SliceRandom;

        let t = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let mut pairs: Vec<(String, Option<String>)> = (0..12)
            .map(|i| {
                let value = (i % 3 != 0).then(|| format!("v{}", i));
                (format!("dim{:02}", i), value)
            })
            .collect();
        let build = |pairs: &[(String, Option<String>)]| {
            let mut row = MeterQueryRow {
                value: 1.0,
                window_start: t,
                window_end: t,
                subject: Some("s1".to_string()),
                customer_id: Some("c1".to_string()),
                group_by: BTreeMap::new(),
            };
            for (dimension, value) in pairs {
                row.group_by.insert(dimension.clone(), value.clone());
            }
            row
        };
        let expected = group_key(&build(&pairs));
        assert!(expected.starts_with("subject=s1;customer=c1;group=dim00=nil;group=dim01=v1;"));

        let mut rng = rand::thread_rng();
        for _ in 0..10 {
            pairs.shuffle(&mut rng);
            assert_eq!(group_key(&build(&pairs)), expected);
        }
    }
}
