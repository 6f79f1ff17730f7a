//! Meter definitions, query parameters and result rows

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{
    DateTime, Datelike, Duration, LocalResult, NaiveDate, NaiveDateTime, TimeZone, Timelike, Utc,
};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use super::engine::EngineState;
use crate::data::filters::FilterString;
use crate::domain::meter::MeterError;

/// Group-by dimension backed by the event subject column
pub const DIMENSION_SUBJECT: &str = "subject";

/// Group-by dimension resolved from the customer filter
pub const DIMENSION_CUSTOMER_ID: &str = "customer_id";

// =============================================================================
// Aggregation
// =============================================================================

/// Aggregation applied to a meter's extracted values
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Aggregation {
    Sum,
    Count,
    Avg,
    Min,
    Max,
    UniqueCount,
    Latest,
}

impl Aggregation {
    pub const ALL: [Aggregation; 7] = [
        Self::Sum,
        Self::Count,
        Self::Avg,
        Self::Min,
        Self::Max,
        Self::UniqueCount,
        Self::Latest,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sum => "SUM",
            Self::Count => "COUNT",
            Self::Avg => "AVG",
            Self::Min => "MIN",
            Self::Max => "MAX",
            Self::UniqueCount => "UNIQUE_COUNT",
            Self::Latest => "LATEST",
        }
    }

    /// COUNT is the only aggregation that ignores the value property
    pub fn requires_value_property(&self) -> bool {
        !matches!(self, Self::Count)
    }

    /// Whether per-window results can be combined into a wider window
    pub fn is_cacheable(&self) -> bool {
        matches!(self, Self::Sum | Self::Count | Self::Min | Self::Max)
    }

    /// Whether the numeric table can serve this aggregation
    pub fn supports_numeric_table(&self) -> bool {
        !matches!(self, Self::UniqueCount)
    }

    /// Combine two partial results. Returns None for aggregations that cannot be merged.
    pub fn combine(&self, a: f64, b: f64) -> Option<f64> {
        match self {
            Self::Sum | Self::Count => Some(a + b),
            Self::Min => Some(a.min(b)),
            Self::Max => Some(a.max(b)),
            Self::Avg | Self::UniqueCount | Self::Latest => None,
        }
    }
}

impl fmt::Display for Aggregation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Aggregation {
    type Err = MeterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|a| a.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| MeterError::InvalidAggregation(s.to_string()))
    }
}

// =============================================================================
// Window Size
// =============================================================================

/// Tumbling window granularity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum WindowSize {
    Minute,
    Hour,
    Day,
    Month,
}

impl WindowSize {
    pub const ALL: [WindowSize; 4] = [Self::Minute, Self::Hour, Self::Day, Self::Month];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Minute => "MINUTE",
            Self::Hour => "HOUR",
            Self::Day => "DAY",
            Self::Month => "MONTH",
        }
    }

    /// Start of the window containing `t`, with boundaries aligned in `tz`
    pub fn truncate(&self, t: DateTime<Utc>, tz: Tz) -> DateTime<Utc> {
        let local = t.with_timezone(&tz).naive_local();
        let truncated = match self {
            Self::Minute => local.date().and_hms_opt(local.hour(), local.minute(), 0),
            Self::Hour => local.date().and_hms_opt(local.hour(), 0, 0),
            Self::Day => local.date().and_hms_opt(0, 0, 0),
            Self::Month => NaiveDate::from_ymd_opt(local.year(), local.month(), 1)
                .and_then(|d| d.and_hms_opt(0, 0, 0)),
        };
        match truncated {
            Some(naive) => resolve_local(tz, naive).min(t),
            None => t,
        }
    }

    /// Start of the window following the one starting at `start`
    pub fn next(&self, start: DateTime<Utc>, tz: Tz) -> DateTime<Utc> {
        match self {
            Self::Minute => start + Duration::minutes(1),
            Self::Hour => start + Duration::hours(1),
            Self::Day => {
                let date = start.with_timezone(&tz).date_naive();
                match date.succ_opt().and_then(|d| d.and_hms_opt(0, 0, 0)) {
                    Some(naive) => resolve_local(tz, naive),
                    None => start + Duration::days(1),
                }
            }
            Self::Month => {
                let date = start.with_timezone(&tz).date_naive();
                let (year, month) = if date.month() == 12 {
                    (date.year() + 1, 1)
                } else {
                    (date.year(), date.month() + 1)
                };
                match NaiveDate::from_ymd_opt(year, month, 1).and_then(|d| d.and_hms_opt(0, 0, 0))
                {
                    Some(naive) => resolve_local(tz, naive),
                    None => start + Duration::days(31),
                }
            }
        }
    }

    /// Smallest window boundary at or after `t`
    pub fn ceil(&self, t: DateTime<Utc>, tz: Tz) -> DateTime<Utc> {
        let start = self.truncate(t, tz);
        if start == t { t } else { self.next(start, tz) }
    }

    /// All windows `[start, end)` overlapping `[from, to)`
    pub fn windows(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        tz: Tz,
    ) -> Vec<(DateTime<Utc>, DateTime<Utc>)> {
        let mut windows = Vec::new();
        let mut start = self.truncate(from, tz);
        while start < to {
            let end = self.next(start, tz);
            if end <= start {
                break;
            }
            windows.push((start, end));
            start = end;
        }
        windows
    }
}

impl fmt::Display for WindowSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WindowSize {
    type Err = MeterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|w| w.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| MeterError::InvalidWindowSize(s.to_string()))
    }
}

/// Map a local wall-clock time to UTC. DST gaps move forward to the first valid instant.
fn resolve_local(tz: Tz, naive: NaiveDateTime) -> DateTime<Utc> {
    let mut candidate = naive;
    for _ in 0..4 {
        match tz.from_local_datetime(&candidate) {
            LocalResult::Single(dt) => return dt.with_timezone(&Utc),
            LocalResult::Ambiguous(earliest, _) => return earliest.with_timezone(&Utc),
            LocalResult::None => candidate += Duration::minutes(30),
        }
    }
    Utc.from_utc_datetime(&naive)
}

/// Parse an IANA time zone name
pub fn parse_time_zone(name: Option<&str>) -> Result<Tz, MeterError> {
    match name {
        None => Ok(chrono_tz::UTC),
        Some(s) if s.is_empty() => Ok(chrono_tz::UTC),
        Some(s) => s
            .parse::<Tz>()
            .map_err(|_| MeterError::InvalidTimezone(s.to_string())),
    }
}

// =============================================================================
// Period
// =============================================================================

/// Half-open time range `[from, to)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Period {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
}

impl Period {
    pub fn new(from: DateTime<Utc>, to: DateTime<Utc>) -> Self {
        Self { from, to }
    }

    pub fn contains(&self, t: DateTime<Utc>) -> bool {
        t >= self.from && t < self.to
    }
}

// =============================================================================
// Meter Definition
// =============================================================================

/// A named aggregation over one event type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeterDefinition {
    pub namespace: String,
    pub id: String,
    pub slug: String,
    pub aggregation: Aggregation,
    pub event_type: String,
    /// JSON path into the event payload, e.g. `$.tokens`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_property: Option<String>,
    /// Dimension name -> JSON path
    #[serde(default)]
    pub group_by: BTreeMap<String, String>,
    /// Events before this time never count towards the meter
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_from: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table_engine: Option<EngineState>,
}

impl MeterDefinition {
    pub fn validate(&self) -> Result<(), MeterError> {
        let invalid = |msg: String| MeterError::InvalidMeterDefinition {
            meter: self.slug.clone(),
            reason: msg,
        };

        for (field, value) in [
            ("namespace", &self.namespace),
            ("id", &self.id),
            ("slug", &self.slug),
            ("event_type", &self.event_type),
        ] {
            if value.trim().is_empty() {
                return Err(invalid(format!("{} must not be empty", field)));
            }
        }

        match (&self.value_property, self.aggregation.requires_value_property()) {
            (Some(_), false) => {
                return Err(invalid(format!(
                    "value_property is not allowed for {} meters",
                    self.aggregation
                )));
            }
            (None, true) => {
                return Err(invalid(format!(
                    "value_property is required for {} meters",
                    self.aggregation
                )));
            }
            (Some(path), true) if !is_json_path(path) => {
                return Err(invalid(format!("invalid value_property path: {}", path)));
            }
            _ => {}
        }

        for (dimension, path) in &self.group_by {
            if !is_dimension_name(dimension) {
                return Err(invalid(format!(
                    "group_by dimension must be a non-empty identifier: {:?}",
                    dimension
                )));
            }
            if dimension == DIMENSION_SUBJECT || dimension == DIMENSION_CUSTOMER_ID {
                return Err(invalid(format!(
                    "group_by dimension {} is reserved",
                    dimension
                )));
            }
            if !is_json_path(path) {
                return Err(invalid(format!(
                    "invalid group_by path for {}: {}",
                    dimension, path
                )));
            }
        }

        Ok(())
    }

    /// True once the numeric table is complete and can serve queries
    pub fn uses_numeric_table(&self) -> bool {
        self.aggregation.supports_numeric_table()
            && self.table_engine.as_ref().is_some_and(|s| s.ready)
    }
}

fn is_json_path(path: &str) -> bool {
    path.len() > 1 && path.starts_with('$')
}

fn is_dimension_name(name: &str) -> bool {
    !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

// =============================================================================
// Query Parameters
// =============================================================================

/// A customer and the subjects that belong to it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomerFilter {
    pub id: String,
    #[serde(default)]
    pub subject_keys: Vec<String>,
}

/// Parameters of a single meter query
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryParams {
    #[serde(default)]
    pub from: Option<DateTime<Utc>>,
    #[serde(default)]
    pub to: Option<DateTime<Utc>>,
    #[serde(default)]
    pub window_size: Option<WindowSize>,
    #[serde(default)]
    pub window_time_zone: Option<String>,
    #[serde(default)]
    pub filter_subject: Vec<String>,
    #[serde(default)]
    pub filter_customer: Vec<CustomerFilter>,
    #[serde(default)]
    pub filter_group_by: BTreeMap<String, FilterString>,
    #[serde(default)]
    pub group_by: Vec<String>,
    #[serde(default)]
    pub cachable: bool,
}

impl QueryParams {
    pub fn time_zone(&self) -> Result<Tz, MeterError> {
        parse_time_zone(self.window_time_zone.as_deref())
    }
}

// =============================================================================
// Result Row
// =============================================================================

/// One aggregated value for a window and group
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeterQueryRow {
    pub value: f64,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub customer_id: Option<String>,
    /// Present key with None: path not found. Absent key: not requested.
    #[serde(default)]
    pub group_by: BTreeMap<String, Option<String>>,
}

impl MeterQueryRow {
    /// Placeholder rows carry NaN until the window is computed
    pub fn is_placeholder(&self) -> bool {
        self.value.is_nan()
    }
}
