use clap::{Parser, Subcommand};

use std::path::PathBuf;

use chrono::{DateTime, Utc};

use super::config::AnalyticsBackend;
use super::constants::{
    ENV_ANALYTICS_BACKEND, ENV_CLICKHOUSE_DATABASE, ENV_CLICKHOUSE_PASSWORD, ENV_CLICKHOUSE_URL,
    ENV_CLICKHOUSE_USER, ENV_CONFIG, ENV_DUCKDB_PATH, ENV_METADATA_PATH,
};
use crate::data::types::WindowSize;
use crate::utils::time::parse_iso_timestamp;

#[derive(Parser)]
#[command(name = "meterhouse")]
#[command(version, about = "Usage metering engine", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Path to config file
    #[arg(long, short = 'c', global = true, env = ENV_CONFIG)]
    pub config: Option<PathBuf>,

    /// Analytics database backend (duckdb or clickhouse)
    #[arg(long, global = true, env = ENV_ANALYTICS_BACKEND, value_parser = parse_analytics_backend)]
    pub analytics_backend: Option<AnalyticsBackend>,

    /// DuckDB database file (when using duckdb backend)
    #[arg(long, global = true, env = ENV_DUCKDB_PATH)]
    pub duckdb_path: Option<PathBuf>,

    /// SQLite file holding the meter registry
    #[arg(long, global = true, env = ENV_METADATA_PATH)]
    pub metadata_path: Option<PathBuf>,

    /// ClickHouse connection URL (when using clickhouse backend)
    #[arg(long, global = true, env = ENV_CLICKHOUSE_URL)]
    pub clickhouse_url: Option<String>,

    /// ClickHouse database name
    #[arg(long, global = true, env = ENV_CLICKHOUSE_DATABASE)]
    pub clickhouse_database: Option<String>,

    /// ClickHouse user
    #[arg(long, global = true, env = ENV_CLICKHOUSE_USER)]
    pub clickhouse_user: Option<String>,

    /// ClickHouse password
    #[arg(long, global = true, env = ENV_CLICKHOUSE_PASSWORD, hide_env_values = true)]
    pub clickhouse_password: Option<String>,
}

/// Parse analytics backend from CLI/env string
fn parse_analytics_backend(s: &str) -> Result<AnalyticsBackend, String> {
    match s.to_lowercase().as_str() {
        "duckdb" => Ok(AnalyticsBackend::Duckdb),
        "clickhouse" => Ok(AnalyticsBackend::Clickhouse),
        _ => Err(format!(
            "Invalid analytics backend '{}'. Valid options: duckdb, clickhouse",
            s
        )),
    }
}

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>, String> {
    parse_iso_timestamp(s).ok_or_else(|| format!("Invalid RFC 3339 timestamp '{}'", s))
}

fn parse_window_size(s: &str) -> Result<WindowSize, String> {
    s.parse().map_err(|e: crate::domain::MeterError| e.to_string())
}

#[derive(Subcommand, Clone, Debug)]
pub enum Commands {
    /// Run the maintenance daemon (default command)
    Serve,
    /// Query a meter and print the rows as JSON
    Query(QueryArgs),
    /// List the subjects that reported usage for a meter
    Subjects {
        /// Meter id or slug
        meter: String,
        #[arg(long, short = 'n', default_value = "default")]
        namespace: String,
        #[arg(long, value_parser = parse_timestamp)]
        from: Option<DateTime<Utc>>,
        #[arg(long, value_parser = parse_timestamp)]
        to: Option<DateTime<Utc>>,
    },
    /// Advance one meter's numeric table backfill
    BackfillStep {
        /// Meter id or slug
        meter: String,
        #[arg(long, short = 'n', default_value = "default")]
        namespace: String,
        /// Steps the meter may take
        #[arg(long, default_value_t = 1)]
        budget: u32,
    },
}

#[derive(clap::Args, Clone, Debug)]
pub struct QueryArgs {
    /// Meter id or slug
    pub meter: String,

    #[arg(long, short = 'n', default_value = "default")]
    pub namespace: String,

    #[arg(long, value_parser = parse_timestamp)]
    pub from: Option<DateTime<Utc>>,

    #[arg(long, value_parser = parse_timestamp)]
    pub to: Option<DateTime<Utc>>,

    /// MINUTE, HOUR, DAY or MONTH
    #[arg(long, value_parser = parse_window_size)]
    pub window_size: Option<WindowSize>,

    /// IANA time zone for window boundaries
    #[arg(long)]
    pub window_time_zone: Option<String>,

    /// Restrict to these subjects (repeatable)
    #[arg(long = "subject")]
    pub subjects: Vec<String>,

    /// Group by these dimensions (repeatable)
    #[arg(long = "group-by")]
    pub group_by: Vec<String>,

    /// Allow the result cache
    #[arg(long)]
    pub cachable: bool,
}

/// Configuration derived from CLI arguments
#[derive(Debug, Clone, Default)]
pub struct CliConfig {
    pub config: Option<PathBuf>,
    pub analytics_backend: Option<AnalyticsBackend>,
    pub duckdb_path: Option<PathBuf>,
    pub metadata_path: Option<PathBuf>,
    pub clickhouse_url: Option<String>,
    pub clickhouse_database: Option<String>,
    pub clickhouse_user: Option<String>,
    pub clickhouse_password: Option<String>,
}

/// Parse CLI arguments and return config with command
pub fn parse() -> (CliConfig, Option<Commands>) {
    let cli = Cli::parse();
    let config = CliConfig {
        config: cli.config,
        analytics_backend: cli.analytics_backend,
        duckdb_path: cli.duckdb_path,
        metadata_path: cli.metadata_path,
        clickhouse_url: cli.clickhouse_url,
        clickhouse_database: cli.clickhouse_database,
        clickhouse_user: cli.clickhouse_user,
        clickhouse_password: cli.clickhouse_password,
    };
    (config, cli.command)
}
