use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration as StdDuration;

use anyhow::{Context, Result};
use chrono::Duration;
use serde::{Deserialize, Serialize};

use super::cli::CliConfig;
use super::constants::{
    CLICKHOUSE_DEFAULT_DATABASE, CLICKHOUSE_DEFAULT_TIMEOUT_SECS, CONFIG_FILE_NAME,
    DEFAULT_BACKFILL_INTERVAL_SECS, DEFAULT_BACKFILL_STEPS_PER_TICK,
    DEFAULT_CUTOVER_SETTLE_DELAY_SECS, DEFAULT_DUCKDB_PATH, DEFAULT_FILTER_MAX_DEPTH,
    DEFAULT_METADATA_PATH, DEFAULT_METER_CACHE_REFRESH_SECS,
    DEFAULT_MINIMUM_CACHEABLE_QUERY_PERIOD_HOURS, DEFAULT_MINIMUM_CACHEABLE_USAGE_AGE_HOURS,
    DEFAULT_STREAM_START_OFFSET_SECS,
};
use crate::data::types::MeterDefinition;
use crate::domain::{BackfillConfig, QueryCacheConfig};

// =============================================================================
// Analytics Backend Enum
// =============================================================================

/// Analytics database backend
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AnalyticsBackend {
    #[default]
    Duckdb,
    Clickhouse,
}

impl fmt::Display for AnalyticsBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AnalyticsBackend::Duckdb => write!(f, "duckdb"),
            AnalyticsBackend::Clickhouse => write!(f, "clickhouse"),
        }
    }
}

// =============================================================================
// File Config Sections
// =============================================================================

/// ClickHouse configuration section (from JSON config file)
#[derive(Debug, Default, Clone, Deserialize)]
pub struct ClickhouseFileConfig {
    /// ClickHouse connection URL (or use METERHOUSE_CLICKHOUSE_URL env var)
    pub url: Option<String>,
    /// Database name (default: "meterhouse")
    pub database: Option<String>,
    pub user: Option<String>,
    pub password: Option<String>,
    /// Query timeout in seconds
    pub timeout_secs: Option<u64>,
    /// Enable LZ4 compression (default: true)
    pub compression: Option<bool>,
}

#[derive(Debug, Default, Clone, Deserialize)]
pub struct DuckdbFileConfig {
    pub path: Option<PathBuf>,
}

/// Database configuration section (from JSON config file)
#[derive(Debug, Default, Clone, Deserialize)]
pub struct DatabaseFileConfig {
    /// Analytics backend: duckdb (default) or clickhouse
    pub analytics: Option<AnalyticsBackend>,
    pub duckdb: Option<DuckdbFileConfig>,
    pub clickhouse: Option<ClickhouseFileConfig>,
    /// SQLite file holding the meter registry
    pub metadata_path: Option<PathBuf>,
}

#[derive(Debug, Default, Clone, Deserialize)]
pub struct QueryCacheFileConfig {
    pub enabled: Option<bool>,
    pub minimum_cacheable_query_period_hours: Option<i64>,
    pub minimum_cacheable_usage_age_hours: Option<i64>,
}

#[derive(Debug, Default, Clone, Deserialize)]
pub struct BackfillFileConfig {
    pub enabled: Option<bool>,
    pub interval_secs: Option<u64>,
    pub steps_per_tick: Option<u32>,
    pub stream_start_offset_secs: Option<u64>,
    pub cutover_settle_delay_secs: Option<u64>,
}

#[derive(Debug, Default, Clone, Deserialize)]
pub struct MeterCacheFileConfig {
    pub refresh_interval_secs: Option<u64>,
}

#[derive(Debug, Default, Clone, Deserialize)]
pub struct FilterFileConfig {
    pub max_depth: Option<usize>,
}

/// File-based configuration (JSON)
#[derive(Debug, Default, Deserialize)]
pub struct FileConfig {
    pub database: Option<DatabaseFileConfig>,
    pub query_cache: Option<QueryCacheFileConfig>,
    pub backfill: Option<BackfillFileConfig>,
    pub meter_cache: Option<MeterCacheFileConfig>,
    pub filter: Option<FilterFileConfig>,
    /// Meter definitions upserted into the registry on start
    pub meters: Option<Vec<MeterDefinition>>,
    #[serde(flatten)]
    pub extra: serde_json::Value,
}

impl FileConfig {
    /// Load configuration from a JSON file
    fn load_from_file(path: &Path) -> Result<Self> {
        tracing::debug!(path = %path.display(), "Loading config file");
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        tracing::trace!(config = ?config, "Parsed config file");
        Ok(config)
    }

    /// Warn about unknown fields in the config
    fn warn_unknown_fields(&self) {
        if let serde_json::Value::Object(map) = &self.extra
            && !map.is_empty()
        {
            let keys_str: String = map
                .keys()
                .map(|k| k.as_str())
                .collect::<Vec<_>>()
                .join(", ");
            tracing::warn!(
                fields = %keys_str,
                "Unknown fields in config file (possible typos)"
            );
        }
    }
}

// =============================================================================
// Final Config
// =============================================================================

#[derive(Debug, Clone)]
pub struct ClickhouseConfig {
    pub url: String,
    pub database: String,
    pub user: Option<String>,
    pub password: Option<String>,
    pub timeout_secs: u64,
    pub compression: bool,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub analytics: AnalyticsBackend,
    pub duckdb_path: PathBuf,
    /// Present whenever a ClickHouse URL is configured
    pub clickhouse: Option<ClickhouseConfig>,
    pub metadata_path: PathBuf,
}

/// Maintenance loop settings
#[derive(Debug, Clone)]
pub struct MaintenanceConfig {
    pub enabled: bool,
    pub interval: StdDuration,
    pub steps_per_tick: u32,
}

/// Final merged application configuration
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub query_cache: QueryCacheConfig,
    pub backfill: BackfillConfig,
    pub maintenance: MaintenanceConfig,
    pub meter_cache_refresh: StdDuration,
    pub filter_max_depth: usize,
    pub meters: Vec<MeterDefinition>,
}

impl AppConfig {
    /// Load configuration from all sources
    ///
    /// Priority (lowest to highest):
    /// 1. Defaults
    /// 2. CLI-specified config path OR local directory config
    /// 3. CLI arguments (which include env var fallbacks via clap)
    pub fn load(cli: &CliConfig) -> Result<Self> {
        tracing::debug!("Loading application configuration");
        tracing::trace!(cli = ?cli, "CLI config");

        let path = if let Some(ref path) = cli.config {
            if !path.exists() {
                anyhow::bail!("Config file not found: {}", path.display());
            }
            Some(path.clone())
        } else {
            let local = PathBuf::from(CONFIG_FILE_NAME);
            if local.exists() { Some(local) } else { None }
        };

        let file_config = match path {
            Some(path) => {
                let config = FileConfig::load_from_file(&path)?;
                config.warn_unknown_fields();
                config
            }
            None => FileConfig::default(),
        };

        let config = Self::from_layers(cli, file_config);
        config.validate()?;
        tracing::debug!(
            analytics = %config.database.analytics,
            meters = config.meters.len(),
            "Configuration loaded"
        );
        Ok(config)
    }

    /// Layer defaults -> file config -> CLI/env overrides
    fn from_layers(cli: &CliConfig, file_config: FileConfig) -> Self {
        let file_database = file_config.database.unwrap_or_default();
        let file_duckdb = file_database.duckdb.unwrap_or_default();
        let file_clickhouse = file_database.clickhouse.unwrap_or_default();
        let file_query_cache = file_config.query_cache.unwrap_or_default();
        let file_backfill = file_config.backfill.unwrap_or_default();
        let file_meter_cache = file_config.meter_cache.unwrap_or_default();
        let file_filter = file_config.filter.unwrap_or_default();

        let analytics = cli
            .analytics_backend
            .or(file_database.analytics)
            .unwrap_or_default();

        let clickhouse = cli
            .clickhouse_url
            .clone()
            .or(file_clickhouse.url)
            .filter(|url| !url.is_empty())
            .map(|url| ClickhouseConfig {
                url,
                database: cli
                    .clickhouse_database
                    .clone()
                    .or(file_clickhouse.database)
                    .unwrap_or_else(|| CLICKHOUSE_DEFAULT_DATABASE.to_string()),
                user: cli.clickhouse_user.clone().or(file_clickhouse.user),
                password: cli.clickhouse_password.clone().or(file_clickhouse.password),
                timeout_secs: file_clickhouse
                    .timeout_secs
                    .unwrap_or(CLICKHOUSE_DEFAULT_TIMEOUT_SECS),
                compression: file_clickhouse.compression.unwrap_or(true),
            });

        let database = DatabaseConfig {
            analytics,
            duckdb_path: cli
                .duckdb_path
                .clone()
                .or(file_duckdb.path)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_DUCKDB_PATH)),
            clickhouse,
            metadata_path: cli
                .metadata_path
                .clone()
                .or(file_database.metadata_path)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_METADATA_PATH)),
        };

        let query_cache = QueryCacheConfig {
            enabled: file_query_cache.enabled.unwrap_or(true),
            minimum_cacheable_query_period: Duration::hours(
                file_query_cache
                    .minimum_cacheable_query_period_hours
                    .unwrap_or(DEFAULT_MINIMUM_CACHEABLE_QUERY_PERIOD_HOURS),
            ),
            minimum_cacheable_usage_age: Duration::hours(
                file_query_cache
                    .minimum_cacheable_usage_age_hours
                    .unwrap_or(DEFAULT_MINIMUM_CACHEABLE_USAGE_AGE_HOURS),
            ),
        };

        let backfill = BackfillConfig {
            stream_start_offset: Duration::seconds(
                file_backfill
                    .stream_start_offset_secs
                    .unwrap_or(DEFAULT_STREAM_START_OFFSET_SECS) as i64,
            ),
            cutover_settle_delay: Duration::seconds(
                file_backfill
                    .cutover_settle_delay_secs
                    .unwrap_or(DEFAULT_CUTOVER_SETTLE_DELAY_SECS) as i64,
            ),
        };

        let maintenance = MaintenanceConfig {
            enabled: file_backfill.enabled.unwrap_or(true),
            interval: StdDuration::from_secs(
                file_backfill
                    .interval_secs
                    .unwrap_or(DEFAULT_BACKFILL_INTERVAL_SECS),
            ),
            steps_per_tick: file_backfill
                .steps_per_tick
                .unwrap_or(DEFAULT_BACKFILL_STEPS_PER_TICK),
        };

        Self {
            database,
            query_cache,
            backfill,
            maintenance,
            meter_cache_refresh: StdDuration::from_secs(
                file_meter_cache
                    .refresh_interval_secs
                    .unwrap_or(DEFAULT_METER_CACHE_REFRESH_SECS),
            ),
            filter_max_depth: file_filter.max_depth.unwrap_or(DEFAULT_FILTER_MAX_DEPTH),
            meters: file_config.meters.unwrap_or_default(),
        }
    }

    /// Validate the configuration for consistency and correctness
    fn validate(&self) -> Result<()> {
        if self.database.analytics == AnalyticsBackend::Clickhouse
            && self.database.clickhouse.is_none()
        {
            anyhow::bail!(
                "Configuration error: database.clickhouse.url is required when database.analytics is 'clickhouse'"
            );
        }

        if self.maintenance.interval.is_zero() {
            anyhow::bail!("Configuration error: backfill.interval_secs must be greater than 0");
        }
        if self.maintenance.steps_per_tick == 0 {
            anyhow::bail!("Configuration error: backfill.steps_per_tick must be greater than 0");
        }
        if self.meter_cache_refresh.is_zero() {
            anyhow::bail!(
                "Configuration error: meter_cache.refresh_interval_secs must be greater than 0"
            );
        }
        // The sink only sees a cutover after the next snapshot refresh
        if !self
            .backfill
            .stream_start_offset
            .to_std()
            .is_ok_and(|offset| offset > self.meter_cache_refresh)
        {
            anyhow::bail!(
                "Configuration error: backfill.stream_start_offset_secs must be greater than meter_cache.refresh_interval_secs"
            );
        }
        if self.filter_max_depth == 0 {
            anyhow::bail!("Configuration error: filter.max_depth must be greater than 0");
        }
        if self.query_cache.minimum_cacheable_query_period < Duration::zero()
            || self.query_cache.minimum_cacheable_usage_age < Duration::zero()
        {
            anyhow::bail!("Configuration error: query_cache periods must not be negative");
        }

        for meter in &self.meters {
            meter.validate().with_context(|| {
                format!(
                    "Configuration error: invalid meter '{}' in namespace '{}'",
                    meter.slug, meter.namespace
                )
            })?;
        }

        if self.query_cache.enabled
            && self.query_cache.minimum_cacheable_usage_age > self.query_cache.minimum_cacheable_query_period
        {
            tracing::warn!(
                "query_cache.minimum_cacheable_usage_age exceeds minimum_cacheable_query_period, \
                 no query will use the cache"
            );
        }

        Ok(())
    }
}
