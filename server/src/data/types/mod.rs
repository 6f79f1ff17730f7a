//! Shared data types across all backends

pub mod engine;
pub mod meter;
pub mod query;
pub mod rows;

pub use engine::{ENGINE_STATE_VERSION, EngineState, EngineStateError};
pub use meter::{
    Aggregation, CustomerFilter, DIMENSION_CUSTOMER_ID, DIMENSION_SUBJECT, MeterDefinition,
    MeterQueryRow, Period, QueryParams, WindowSize, parse_time_zone,
};
pub use query::{ChunkImport, CompiledQuery, QueryParam};
pub use rows::{EventRow, MeterEventRow, RawMeterRow};
