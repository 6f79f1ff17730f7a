//! Meter query compilation
//!
//! Turns a meter definition plus query parameters into parameterized SQL for one of two
//! sources: the raw `events` table, where values are extracted from the JSON payload at
//! query time, or the `meter_events` numeric table filled by backfill and live ingestion.
//! Both sources produce the same column layout, decoded by the returned [`RowScanner`].

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;

use super::error::MeterError;
use super::scan::{GroupColumn, RowScanner};
use crate::data::filters::SqlParams;
use crate::data::sql::SqlDialect;
use crate::data::types::{
    Aggregation, ChunkImport, CompiledQuery, DIMENSION_CUSTOMER_ID, DIMENSION_SUBJECT,
    MeterDefinition, Period, QueryParam, QueryParams, WindowSize,
};

pub const EVENTS_TABLE: &str = "events";
pub const METER_EVENTS_TABLE: &str = "meter_events";

const TIME_COLUMN: &str = "time";
const DATA_COLUMN: &str = "data";
const SUBJECT_COLUMN: &str = "subject";
const VALUE_COLUMN: &str = "value";
const GROUP_BY_COLUMN: &str = "group_by";

/// Upper bound on windows joined into one query when SQL cannot align them
const MAX_PRECOMPUTED_WINDOWS: usize = 50_000;

/// Where a meter query reads its values from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuerySource {
    /// Aggregate the JSON payload of raw events
    RawEvents,
    /// Aggregate pre-extracted values of the numeric table
    NumericTable,
}

impl QuerySource {
    /// The numeric table serves a meter once its backfill is complete
    pub fn for_meter(meter: &MeterDefinition) -> Self {
        if meter.uses_numeric_table() {
            Self::NumericTable
        } else {
            Self::RawEvents
        }
    }

    pub fn table(&self) -> &'static str {
        match self {
            Self::RawEvents => EVENTS_TABLE,
            Self::NumericTable => METER_EVENTS_TABLE,
        }
    }
}

/// Compiles meter queries for one SQL dialect
#[derive(Clone, Copy)]
pub struct MeterQueryCompiler {
    dialect: &'static dyn SqlDialect,
    filter_max_depth: usize,
}

impl MeterQueryCompiler {
    pub fn new(dialect: &'static dyn SqlDialect, filter_max_depth: usize) -> Self {
        Self {
            dialect,
            filter_max_depth,
        }
    }

    pub fn dialect(&self) -> &'static dyn SqlDialect {
        self.dialect
    }

    /// Compile against the source the meter's engine state selects
    pub fn compile(
        &self,
        meter: &MeterDefinition,
        params: &QueryParams,
    ) -> Result<(CompiledQuery, RowScanner), MeterError> {
        self.compile_from(QuerySource::for_meter(meter), meter, params)
    }

    pub fn compile_from(
        &self,
        source: QuerySource,
        meter: &MeterDefinition,
        params: &QueryParams,
    ) -> Result<(CompiledQuery, RowScanner), MeterError> {
        meter.validate()?;
        if source == QuerySource::NumericTable && !meter.aggregation.supports_numeric_table() {
            return Err(MeterError::InvalidQuery(format!(
                "{} meters cannot be served from the numeric table",
                meter.aggregation
            )));
        }

        let tz = params.time_zone()?;
        if let (Some(from), Some(to)) = (params.from, params.to)
            && from > to
        {
            return Err(MeterError::InvalidQuery(format!(
                "from ({}) must not be after to ({})",
                from.to_rfc3339(),
                to.to_rfc3339()
            )));
        }

        let columns = resolve_group_columns(meter, params)?;
        for (dimension, filter) in &params.filter_group_by {
            if !meter.group_by.contains_key(dimension) {
                return Err(MeterError::UnknownGroupByDimension(dimension.clone()));
            }
            filter.validate(self.filter_max_depth)?;
        }

        let d = self.dialect;
        let mut select_params = SqlParams::default();
        let mut select = Vec::with_capacity(3 + columns.len());
        let mut window_join = None;

        match params.window_size {
            Some(window) if !d.native_time_zone(tz.name()) => {
                let windows = self.precomputed_windows(meter, params, window, tz)?;
                window_join = Some(d.window_join(TIME_COLUMN, &windows));
                select.push("w.ws AS window_start".to_string());
                select.push("w.we AS window_end".to_string());
            }
            Some(window) => {
                select.push(format!(
                    "{} AS window_start",
                    d.window_start(TIME_COLUMN, window, tz.name())
                ));
                select.push(format!(
                    "{} AS window_end",
                    d.window_end(TIME_COLUMN, window, tz.name())
                ));
            }
            None => {
                select.push(format!("{} AS window_start", d.first_minute(TIME_COLUMN)));
                select.push(format!("{} AS window_end", d.last_minute_end(TIME_COLUMN)));
            }
        }

        let value = self.value_expr(source, meter);
        select.push(format!(
            "{} AS meter_value",
            d.aggregate(meter.aggregation, &value, TIME_COLUMN)
        ));

        for (i, column) in columns.iter().enumerate() {
            let expr = self.group_expr(source, meter, column, params, &mut select_params);
            select.push(format!("{} AS g{}", expr, i));
        }

        let mut where_params = SqlParams::default();
        let conditions = self.conditions(source, meter, params, &mut where_params);

        let mut from_clause = source.table().to_string();
        if let Some(join) = window_join {
            from_clause.push(' ');
            from_clause.push_str(&join);
        }
        let mut sql = format!(
            "SELECT {} FROM {} WHERE {}",
            select.join(", "),
            from_clause,
            conditions.join(" AND ")
        );

        let mut group_by: Vec<String> = Vec::new();
        if params.window_size.is_some() {
            group_by.push("window_start".to_string());
            group_by.push("window_end".to_string());
        }
        group_by.extend((0..columns.len()).map(|i| format!("g{}", i)));
        if !group_by.is_empty() {
            sql.push_str(" GROUP BY ");
            sql.push_str(&group_by.join(", "));
        }

        let sql = d.wrap_meter_query(sql, columns.len());
        select_params.extend(where_params);

        tracing::trace!(
            meter = %meter.slug,
            source = ?source,
            params = select_params.len(),
            "Compiled meter query"
        );

        let scanner = RowScanner::new(params.window_size, params.from, params.to, columns);
        Ok((CompiledQuery::new(sql, select_params.values), scanner))
    }

    /// Whether a windowed query lacks the `from`/`to` bounds its precomputed windows need
    pub fn missing_window_bounds(
        &self,
        meter: &MeterDefinition,
        params: &QueryParams,
    ) -> Result<bool, MeterError> {
        let tz = params.time_zone()?;
        Ok(params.window_size.is_some()
            && !self.dialect.native_time_zone(tz.name())
            && (later(params.from, meter.event_from).is_none() || params.to.is_none()))
    }

    /// Earliest and latest matching event time in microseconds, as the window columns of a
    /// single row. Both are NULL when nothing matches.
    pub fn compile_time_bounds(
        &self,
        meter: &MeterDefinition,
        params: &QueryParams,
    ) -> Result<CompiledQuery, MeterError> {
        meter.validate()?;
        let d = self.dialect;
        let source = QuerySource::for_meter(meter);
        let mut sql_params = SqlParams::default();
        let conditions = self.conditions(source, meter, params, &mut sql_params);
        let sql = format!(
            "SELECT {} AS window_start, {} AS window_end, CAST(count(*) AS DOUBLE) AS meter_value \
             FROM {} WHERE {}",
            d.timestamp_to_micros(&format!("min({})", TIME_COLUMN)),
            d.timestamp_to_micros(&format!("max({})", TIME_COLUMN)),
            source.table(),
            conditions.join(" AND ")
        );
        Ok(CompiledQuery::new(sql, sql_params.values))
    }

    fn precomputed_windows(
        &self,
        meter: &MeterDefinition,
        params: &QueryParams,
        window: WindowSize,
        tz: Tz,
    ) -> Result<Vec<(i64, i64)>, MeterError> {
        let (Some(from), Some(to)) = (later(params.from, meter.event_from), params.to) else {
            return Err(MeterError::InvalidQuery(format!(
                "{} windows in {} need both from and to on the {} backend",
                window,
                tz.name(),
                self.dialect.name()
            )));
        };
        let windows = window.windows(from, to, tz);
        if windows.len() > MAX_PRECOMPUTED_WINDOWS {
            return Err(MeterError::InvalidQuery(format!(
                "{} {} windows exceed the limit of {}",
                windows.len(),
                window,
                MAX_PRECOMPUTED_WINDOWS
            )));
        }
        if windows.is_empty() {
            // An empty window matches no rows
            let at = from.timestamp_micros();
            return Ok(vec![(at, at)]);
        }
        Ok(windows
            .into_iter()
            .map(|(start, end)| (start.timestamp_micros(), end.timestamp_micros()))
            .collect())
    }

    /// Distinct subjects that reported events for the meter, sorted
    pub fn compile_subjects(
        &self,
        meter: &MeterDefinition,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Result<CompiledQuery, MeterError> {
        meter.validate()?;
        if let (Some(from), Some(to)) = (from, to)
            && from > to
        {
            return Err(MeterError::InvalidQuery(
                "from must not be after to".to_string(),
            ));
        }

        let ts = self.dialect.timestamp_param();
        let mut params = vec![
            QueryParam::String(meter.namespace.clone()),
            QueryParam::String(meter.event_type.clone()),
        ];
        let mut conditions = vec!["namespace = ?".to_string(), "type = ?".to_string()];
        if let Some(from) = later(from, meter.event_from) {
            conditions.push(format!("{} >= {}", TIME_COLUMN, ts));
            params.push(QueryParam::Int64(from.timestamp_micros()));
        }
        if let Some(to) = to {
            conditions.push(format!("{} < {}", TIME_COLUMN, ts));
            params.push(QueryParam::Int64(to.timestamp_micros()));
        }

        let sql = format!(
            "SELECT DISTINCT {col} FROM {table} WHERE {cond} ORDER BY {col}",
            col = SUBJECT_COLUMN,
            table = EVENTS_TABLE,
            cond = conditions.join(" AND ")
        );
        Ok(CompiledQuery::new(sql, params))
    }

    /// Number of the meter's events and their earliest `stored_at` in microseconds
    pub fn compile_min_stored_at(&self, meter: &MeterDefinition) -> CompiledQuery {
        let sql = format!(
            "SELECT count(*) AS cnt, {} AS min_stored_at FROM {} WHERE namespace = ? AND type = ?",
            self.dialect.timestamp_to_micros("min(stored_at)"),
            EVENTS_TABLE
        );
        CompiledQuery::new(
            sql,
            vec![
                QueryParam::String(meter.namespace.clone()),
                QueryParam::String(meter.event_type.clone()),
            ],
        )
    }

    /// Statements replacing the numeric rows of one backfill chunk.
    ///
    /// Only events stored inside `chunk` and before `cutover` are imported; later events
    /// belong to live ingestion. Values that fail numeric parsing are skipped.
    pub fn compile_chunk_import(
        &self,
        meter: &MeterDefinition,
        chunk: &Period,
        cutover: DateTime<Utc>,
    ) -> Result<ChunkImport, MeterError> {
        meter.validate()?;
        if !meter.aggregation.supports_numeric_table() {
            return Err(MeterError::InvalidQuery(format!(
                "{} meters cannot be imported into the numeric table",
                meter.aggregation
            )));
        }

        let d = self.dialect;
        let ts = d.timestamp_param();

        let delete = CompiledQuery::new(
            d.delete_rows(
                METER_EVENTS_TABLE,
                &format!(
                    "namespace = ? AND meter_id = ? AND stored_at >= {ts} AND stored_at < {ts}",
                    ts = ts
                ),
            ),
            vec![
                QueryParam::String(meter.namespace.clone()),
                QueryParam::String(meter.id.clone()),
                QueryParam::Int64(chunk.from.timestamp_micros()),
                QueryParam::Int64(chunk.to.timestamp_micros()),
            ],
        );

        let entries: Vec<(String, String)> = meter
            .group_by
            .iter()
            .map(|(dimension, path)| {
                (
                    dimension.clone(),
                    d.json_extract_string(DATA_COLUMN, path),
                )
            })
            .collect();

        let sql = format!(
            "INSERT INTO {table} (namespace, meter_id, subject, time, stored_at, value, group_by) \
             SELECT namespace, meter_id, subject, time, stored_at, {value}, g FROM (\
             SELECT namespace, CAST(? AS VARCHAR) AS meter_id, subject, time, stored_at, \
             {extract} AS v, {map} AS g FROM {events} \
             WHERE namespace = ? AND type = ? AND stored_at >= {ts} AND stored_at < {ts} \
             AND stored_at < {ts}) WHERE v IS NOT NULL",
            table = METER_EVENTS_TABLE,
            value = d.assume_not_null("v"),
            extract = self.value_expr(QuerySource::RawEvents, meter),
            map = d.build_map(&entries),
            events = EVENTS_TABLE,
            ts = ts
        );
        let insert = CompiledQuery::new(
            sql,
            vec![
                QueryParam::String(meter.id.clone()),
                QueryParam::String(meter.namespace.clone()),
                QueryParam::String(meter.event_type.clone()),
                QueryParam::Int64(chunk.from.timestamp_micros()),
                QueryParam::Int64(chunk.to.timestamp_micros()),
                QueryParam::Int64(cutover.timestamp_micros()),
            ],
        );

        Ok(ChunkImport { delete, insert })
    }

    fn value_expr(&self, source: QuerySource, meter: &MeterDefinition) -> String {
        let d = self.dialect;
        match (source, meter.aggregation, meter.value_property.as_deref()) {
            (QuerySource::NumericTable, _, _) => VALUE_COLUMN.to_string(),
            (_, Aggregation::Count, _) | (_, _, None) => d.constant_one().to_string(),
            (_, Aggregation::UniqueCount, Some(path)) => {
                d.nullif_empty(&d.json_extract_string(DATA_COLUMN, path))
            }
            (_, _, Some(path)) => d.safe_number(&d.json_extract_string(DATA_COLUMN, path)),
        }
    }

    fn dimension_expr(&self, source: QuerySource, dimension: &str, path: &str) -> String {
        let d = self.dialect;
        match source {
            QuerySource::RawEvents => d.nullif_empty(&d.json_extract_string(DATA_COLUMN, path)),
            QuerySource::NumericTable => d.nullif_empty(&d.map_value(GROUP_BY_COLUMN, dimension)),
        }
    }

    fn group_expr(
        &self,
        source: QuerySource,
        meter: &MeterDefinition,
        column: &GroupColumn,
        params: &QueryParams,
        sql_params: &mut SqlParams,
    ) -> String {
        let d = self.dialect;
        match column {
            GroupColumn::Subject => d.nullif_empty(SUBJECT_COLUMN),
            GroupColumn::CustomerId => {
                let mut branches = Vec::new();
                for customer in &params.filter_customer {
                    if customer.subject_keys.is_empty() {
                        continue;
                    }
                    let placeholders = bind_strings(&customer.subject_keys, sql_params);
                    sql_params.push(QueryParam::String(customer.id.clone()));
                    branches.push(format!(
                        "WHEN {} IN ({}) THEN CAST(? AS VARCHAR)",
                        SUBJECT_COLUMN, placeholders
                    ));
                }
                if branches.is_empty() {
                    d.null_string().to_string()
                } else {
                    format!("CASE {} ELSE {} END", branches.join(" "), d.null_string())
                }
            }
            GroupColumn::Dimension(name) => match meter.group_by.get(name) {
                Some(path) => self.dimension_expr(source, name, path),
                None => d.null_string().to_string(),
            },
        }
    }

    fn conditions(
        &self,
        source: QuerySource,
        meter: &MeterDefinition,
        params: &QueryParams,
        sql_params: &mut SqlParams,
    ) -> Vec<String> {
        let d = self.dialect;
        let ts = d.timestamp_param();

        let mut conditions = vec!["namespace = ?".to_string()];
        sql_params.push(QueryParam::String(meter.namespace.clone()));
        match source {
            QuerySource::RawEvents => {
                conditions.push("type = ?".to_string());
                sql_params.push(QueryParam::String(meter.event_type.clone()));
            }
            QuerySource::NumericTable => {
                conditions.push("meter_id = ?".to_string());
                sql_params.push(QueryParam::String(meter.id.clone()));
            }
        }

        if let Some(from) = later(params.from, meter.event_from) {
            conditions.push(format!("{} >= {}", TIME_COLUMN, ts));
            sql_params.push(QueryParam::Int64(from.timestamp_micros()));
        }
        if let Some(to) = params.to {
            conditions.push(format!("{} < {}", TIME_COLUMN, ts));
            sql_params.push(QueryParam::Int64(to.timestamp_micros()));
        }

        if !params.filter_subject.is_empty() || !params.filter_customer.is_empty() {
            let subjects: BTreeSet<&String> = params
                .filter_subject
                .iter()
                .chain(params.filter_customer.iter().flat_map(|c| &c.subject_keys))
                .collect();
            if subjects.is_empty() {
                // Customers without subjects match nothing
                conditions.push("1 = 0".to_string());
            } else {
                let subjects: Vec<String> = subjects.into_iter().cloned().collect();
                conditions.push(format!(
                    "{} IN ({})",
                    SUBJECT_COLUMN,
                    bind_strings(&subjects, sql_params)
                ));
            }
        }

        for (dimension, filter) in &params.filter_group_by {
            let Some(path) = meter.group_by.get(dimension) else {
                continue;
            };
            let expr = self.dimension_expr(source, dimension, path);
            if let Some(predicate) = filter.to_sql(&expr, d, sql_params) {
                conditions.push(predicate);
            }
        }

        conditions
    }
}

fn resolve_group_columns(
    meter: &MeterDefinition,
    params: &QueryParams,
) -> Result<Vec<GroupColumn>, MeterError> {
    let mut seen = BTreeSet::new();
    let mut columns = Vec::with_capacity(params.group_by.len());
    for name in &params.group_by {
        if !seen.insert(name.as_str()) {
            continue;
        }
        let column = match name.as_str() {
            DIMENSION_SUBJECT => GroupColumn::Subject,
            DIMENSION_CUSTOMER_ID => {
                if params.filter_customer.is_empty() {
                    return Err(MeterError::InvalidQuery(
                        "grouping by customer_id requires a customer filter".to_string(),
                    ));
                }
                GroupColumn::CustomerId
            }
            dimension if meter.group_by.contains_key(dimension) => {
                GroupColumn::Dimension(dimension.to_string())
            }
            other => return Err(MeterError::UnknownGroupByDimension(other.to_string())),
        };
        columns.push(column);
    }
    Ok(columns)
}

fn bind_strings(values: &[String], params: &mut SqlParams) -> String {
    values
        .iter()
        .map(|v| {
            params.push(QueryParam::String(v.clone()));
            "?"
        })
        .collect::<Vec<_>>()
        .join(", ")
}

/// The later of two optional lower bounds
fn later(a: Option<DateTime<Utc>>, b: Option<DateTime<Utc>>) -> Option<DateTime<Utc>> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.max(b)),
        (a, b) => a.or(b),
    }
}

#[cfg(test)]
#[path = "compile_tests.rs"]
mod tests;
