//! Errors from the ClickHouse analytics store, folded into `DataError` at the trait boundary

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ClickhouseError {
    #[error("ClickHouse error: {0}")]
    Database(#[from] clickhouse::error::Error),

    /// The schema version table could not be read at startup
    #[error("ClickHouse unreachable: {0}")]
    Unreachable(String),

    #[error("ClickHouse migration {version} ({name}) failed: {error}")]
    MigrationFailed {
        version: i32,
        name: String,
        error: String,
    },

    /// A cached or imported row whose group-by map is not valid JSON
    #[error("Invalid meter row: {0}")]
    InvalidRow(String),
}
