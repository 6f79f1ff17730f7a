//! Domain logic for usage metering
//!
//! - `meter` - query compilation and execution against the analytics backend
//! - `cache` - per-window result cache for long-range queries
//! - `registry` - in-process snapshot of meter definitions
//! - `backfill` - migration of meters onto the numeric table
//! - `ingest` - live writes into the numeric table
//! - `maintenance` - background backfill scheduling

pub mod backfill;
pub mod cache;
pub mod ingest;
pub mod maintenance;
pub mod meter;
pub mod registry;

pub use backfill::{BackfillConfig, BackfillEngine, StepAction, StepOutcome};
pub use cache::{QueryCache, QueryCacheConfig};
pub use ingest::StreamingSink;
pub use maintenance::BackfillScheduler;
pub use meter::{MeterError, MeterService};
pub use registry::MeterCache;
