//! SQLite error types

use thiserror::Error;

use crate::data::types::EngineStateError;

#[derive(Error, Debug)]
pub enum SqliteError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration {version} ({name}) failed: {error}")]
    MigrationFailed {
        version: i32,
        name: String,
        error: String,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Engine state error: {0}")]
    EngineState(#[from] EngineStateError),

    #[error("Invalid meter row: {0}")]
    InvalidRow(String),
}
