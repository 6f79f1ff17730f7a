//! Query filter system
//!
//! Typed predicates (`eq`, `ne`, `gt`, `gte`, `lt`, `lte`, `like`, `notLike`, `ilike`,
//! `notIlike`, `in`, `notIn`, `and`, `or`) compiled into SQL fragments with positional
//! `?` parameters.
//!
//! ## Usage
//!
//! ```no_run
//! use meterhouse_server::data::filters::{FilterString, SqlParams};
//! use meterhouse_server::data::sql::Backend;
//!
//! let filter: FilterString = serde_json::from_str(r#"{"in": ["gpt-4", "gpt-4o"]}"#).unwrap();
//! filter.validate(8).unwrap();
//! let mut params = SqlParams::default();
//! let sql = filter.to_sql("model", Backend::Duckdb.dialect(), &mut params);
//! assert_eq!(sql.as_deref(), Some("model IN (?, ?)"));
//! ```

mod error;
mod types;

pub use error::FilterError;
pub use types::{
    Filter, FilterFloat, FilterInteger, FilterString, FilterTime, FilterValue, SqlParams,
};
