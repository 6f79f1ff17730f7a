//! Core application infrastructure

pub mod cli;
pub mod config;
pub mod constants;
pub mod shutdown;

pub use crate::app::CoreApp;
pub use cli::{CliConfig, Commands};
pub use config::AppConfig;

// Re-export service types from data layer
pub use crate::data::{AnalyticsService, DuckdbService, SqliteService};

pub use shutdown::ShutdownService;
