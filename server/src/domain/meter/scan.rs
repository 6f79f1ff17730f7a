//! Result row decoding for compiled meter queries

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use crate::data::types::{MeterQueryRow, RawMeterRow, WindowSize};
use crate::utils::time::micros_to_datetime;

/// Source of one group column in a compiled query, in select order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GroupColumn {
    Subject,
    CustomerId,
    Dimension(String),
}

/// Turns backend rows into [`MeterQueryRow`]s.
///
/// Built by the compiler together with the query, so column positions always agree.
#[derive(Debug, Clone, PartialEq)]
pub struct RowScanner {
    window_size: Option<WindowSize>,
    from: Option<DateTime<Utc>>,
    to: Option<DateTime<Utc>>,
    columns: Vec<GroupColumn>,
}

impl RowScanner {
    pub fn new(
        window_size: Option<WindowSize>,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
        columns: Vec<GroupColumn>,
    ) -> Self {
        Self {
            window_size,
            from,
            to,
            columns,
        }
    }

    pub fn group_column_count(&self) -> usize {
        self.columns.len()
    }

    /// Decode rows, dropping those without a value. Absent values never become zero.
    pub fn scan(&self, rows: Vec<RawMeterRow>) -> Vec<MeterQueryRow> {
        let mut out: Vec<MeterQueryRow> = rows
            .into_iter()
            .filter_map(|row| self.scan_row(row))
            .collect();
        out.sort_by(|a, b| a.window_start.cmp(&b.window_start));
        out
    }

    fn scan_row(&self, row: RawMeterRow) -> Option<MeterQueryRow> {
        let value = row.value?;
        if !value.is_finite() {
            return None;
        }
        let start = micros_to_datetime(row.window_start?);
        let end = micros_to_datetime(row.window_end?);

        let (window_start, window_end) = match self.window_size {
            Some(_) => (start, end),
            None => (self.from.unwrap_or(start), self.to.unwrap_or(end)),
        };

        let mut result = MeterQueryRow {
            value,
            window_start,
            window_end,
            subject: None,
            customer_id: None,
            group_by: BTreeMap::new(),
        };

        let mut values = row.group_values.into_iter();
        for column in &self.columns {
            let value = values.next().flatten();
            match column {
                GroupColumn::Subject => result.subject = value,
                GroupColumn::CustomerId => result.customer_id = value,
                GroupColumn::Dimension(name) => {
                    result.group_by.insert(name.clone(), value);
                }
            }
        }

        Some(result)
    }
}
