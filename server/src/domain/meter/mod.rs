//! Meter query compilation and execution
//!
//! - `compile` - meter definition + query parameters to parameterized SQL
//! - `scan` - decoding of raw result rows
//! - `extract` - per-event numeric extraction for the numeric table
//! - `runner` - execution against an analytics store
//! - `service` - the public query surface

mod compile;
mod error;
mod extract;
mod runner;
mod scan;
mod service;

pub use compile::{EVENTS_TABLE, METER_EVENTS_TABLE, MeterQueryCompiler, QuerySource};
pub use error::MeterError;
pub use extract::{NumericExtractor, lookup_path};
pub use runner::{MeterQueryExecutor, MeterQueryRunner};
pub use scan::{GroupColumn, RowScanner};
pub use service::MeterService;
