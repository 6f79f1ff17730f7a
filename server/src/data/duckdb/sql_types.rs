//! SQL type wrappers for DuckDB
//!
//! Shared type wrappers for converting Rust types to DuckDB-compatible SQL values.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use duckdb::ToSql;
use duckdb::types::{ToSqlOutput, Value, ValueRef};

use crate::data::types::QueryParam;

/// Wrapper for DateTime<Utc> to implement ToSql for DuckDB TIMESTAMP
pub struct SqlTimestamp(pub DateTime<Utc>);

impl ToSql for SqlTimestamp {
    fn to_sql(&self) -> duckdb::Result<ToSqlOutput<'_>> {
        let ts = self.0.format("%Y-%m-%d %H:%M:%S%.6f").to_string();
        Ok(ToSqlOutput::Owned(Value::Text(ts)))
    }
}

/// Wrapper for a compiled query parameter
pub struct SqlParam<'a>(pub &'a QueryParam);

impl ToSql for SqlParam<'_> {
    fn to_sql(&self) -> duckdb::Result<ToSqlOutput<'_>> {
        Ok(match self.0 {
            QueryParam::String(s) => ToSqlOutput::Borrowed(ValueRef::Text(s.as_bytes())),
            QueryParam::Int64(v) => ToSqlOutput::Owned(Value::BigInt(*v)),
            QueryParam::Float64(v) => ToSqlOutput::Owned(Value::Double(*v)),
        })
    }
}

/// Wrapper for a dimension map, stored as a JSON object in a VARCHAR column
pub struct SqlJsonMap<'a, V>(pub &'a BTreeMap<String, V>);

impl<V: serde::Serialize> ToSql for SqlJsonMap<'_, V> {
    fn to_sql(&self) -> duckdb::Result<ToSqlOutput<'_>> {
        let json = serde_json::to_string(self.0).unwrap_or_else(|_| "{}".to_string());
        Ok(ToSqlOutput::Owned(Value::Text(json)))
    }
}

/// Bind a compiled query's parameters in order
pub fn bind_params(params: &[QueryParam]) -> Vec<SqlParam<'_>> {
    params.iter().map(SqlParam).collect()
}
