//! Per-event value extraction for the numeric table
//!
//! Mirrors what the compiled SQL extracts from raw events, so rows written by live
//! ingestion aggregate exactly like rows imported by backfill.

use std::collections::BTreeMap;

use serde_json::Value;

use crate::data::types::{Aggregation, EventRow, MeterDefinition, MeterEventRow};

/// Extracts the numeric table row of one event for one meter
pub struct NumericExtractor;

impl NumericExtractor {
    /// None when the event does not belong to the meter or its value is unusable
    pub fn extract(meter: &MeterDefinition, event: &EventRow) -> Option<MeterEventRow> {
        if event.namespace != meter.namespace || event.event_type != meter.event_type {
            return None;
        }
        if !meter.aggregation.supports_numeric_table() {
            return None;
        }

        let payload: Value = serde_json::from_str(&event.data).unwrap_or(Value::Null);

        let value = match (meter.aggregation, meter.value_property.as_deref()) {
            (Aggregation::Count, _) => 1.0,
            (_, Some(path)) => numeric_value(lookup_path(&payload, path)?)?,
            (_, None) => return None,
        };

        let group_by = meter
            .group_by
            .iter()
            .filter_map(|(dimension, path)| {
                let value = lookup_path(&payload, path).and_then(scalar_string)?;
                Some((dimension.clone(), value))
            })
            .collect::<BTreeMap<_, _>>();

        Some(MeterEventRow {
            namespace: event.namespace.clone(),
            meter_id: meter.id.clone(),
            subject: event.subject.clone(),
            time: event.time,
            stored_at: event.stored_at,
            value,
            group_by,
        })
    }
}

/// Resolve a JSON path of the form `$.a.b[0].c`
pub fn lookup_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    let rest = path.strip_prefix('$')?;
    let mut current = value;
    let mut chars = rest.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '.' => {
                let mut key = String::new();
                while let Some(&next) = chars.peek() {
                    if next == '.' || next == '[' {
                        break;
                    }
                    key.push(next);
                    chars.next();
                }
                if key.is_empty() {
                    return None;
                }
                current = current.get(&key)?;
            }
            '[' => {
                let mut index = String::new();
                for next in chars.by_ref() {
                    if next == ']' {
                        break;
                    }
                    index.push(next);
                }
                current = match index.trim_matches('"') {
                    quoted if index.starts_with('"') => current.get(quoted)?,
                    raw => current.get(raw.parse::<usize>().ok()?)?,
                };
            }
            _ => return None,
        }
    }

    Some(current)
}

/// Finite numbers and numeric strings. Everything else is skipped.
fn numeric_value(value: &Value) -> Option<f64> {
    let n = match value {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.trim().parse::<f64>().ok()?,
        _ => return None,
    };
    n.is_finite().then_some(n)
}

/// Scalar as text; empty strings count as missing
fn scalar_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if s.is_empty() => None,
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Null | Value::Array(_) | Value::Object(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    fn meter(aggregation: Aggregation) -> MeterDefinition {
        MeterDefinition {
            namespace: "default".to_string(),
            id: "m1".to_string(),
            slug: "tokens".to_string(),
            aggregation,
            event_type: "prompt".to_string(),
            value_property: (aggregation != Aggregation::Count).then(|| "$.tokens".to_string()),
            group_by: BTreeMap::from([
                ("model".to_string(), "$.model".to_string()),
                ("region".to_string(), "$.meta.region".to_string()),
            ]),
            event_from: None,
            table_engine: None,
        }
    }

    fn event(data: Value) -> EventRow {
        let t = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        EventRow {
            namespace: "default".to_string(),
            id: "e1".to_string(),
            event_type: "prompt".to_string(),
            source: "test".to_string(),
            subject: "s1".to_string(),
            time: t,
            data: data.to_string(),
            ingested_at: t,
            stored_at: t,
        }
    }

    #[test]
    fn test_extract_sum() {
        let row = NumericExtractor::extract(
            &meter(Aggregation::Sum),
            &event(json!({"tokens": 1.5, "model": "gpt-4", "meta": {"region": "eu"}})),
        )
        .unwrap();
        assert_eq!(row.value, 1.5);
        assert_eq!(row.meter_id, "m1");
        assert_eq!(row.subject, "s1");
        assert_eq!(row.group_by.get("model").map(String::as_str), Some("gpt-4"));
        assert_eq!(row.group_by.get("region").map(String::as_str), Some("eu"));
    }

    #[test]
    fn test_extract_numeric_string() {
        let row = NumericExtractor::extract(
            &meter(Aggregation::Max),
            &event(json!({"tokens": "42"})),
        )
        .unwrap();
        assert_eq!(row.value, 42.0);
        assert!(row.group_by.is_empty());
    }

    #[test]
    fn test_extract_skips_unsafe_values() {
        let m = meter(Aggregation::Sum);
        for data in [
            json!({"tokens": "abc"}),
            json!({"tokens": "NaN"}),
            json!({"tokens": "inf"}),
            json!({"tokens": "-Infinity"}),
            json!({"tokens": true}),
            json!({"tokens": null}),
            json!({"other": 1}),
        ] {
            assert!(
                NumericExtractor::extract(&m, &event(data.clone())).is_none(),
                "{}",
                data
            );
        }
    }

    #[test]
    fn test_extract_count_ignores_payload() {
        let row =
            NumericExtractor::extract(&meter(Aggregation::Count), &event(json!({}))).unwrap();
        assert_eq!(row.value, 1.0);
    }

    #[test]
    fn test_extract_other_meter_or_unique_count() {
        let mut other = event(json!({"tokens": 1}));
        other.event_type = "completion".to_string();
        assert!(NumericExtractor::extract(&meter(Aggregation::Sum), &other).is_none());

        assert!(
            NumericExtractor::extract(
                &meter(Aggregation::UniqueCount),
                &event(json!({"tokens": 1}))
            )
            .is_none()
        );
    }

    #[test]
    fn test_empty_group_value_is_missing() {
        let row = NumericExtractor::extract(
            &meter(Aggregation::Sum),
            &event(json!({"tokens": 1, "model": ""})),
        )
        .unwrap();
        assert!(!row.group_by.contains_key("model"));
    }

    #[test]
    fn test_lookup_path() {
        let doc = json!({"a": {"b": [10, {"c": "x"}]}, "d e": 1});
        assert_eq!(lookup_path(&doc, "$.a.b[0]"), Some(&json!(10)));
        assert_eq!(lookup_path(&doc, "$.a.b[1].c"), Some(&json!("x")));
        assert_eq!(lookup_path(&doc, r#"$["d e"]"#), Some(&json!(1)));
        assert_eq!(lookup_path(&doc, "$.a.z"), None);
        assert_eq!(lookup_path(&doc, "a.b"), None);
        assert_eq!(lookup_path(&doc, "$."), None);
    }
}
