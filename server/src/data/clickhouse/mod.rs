//! ClickHouse analytics service
//!
//! Production backend for raw events, the numeric table and the query cache.
//! Uses async HTTP connections with LZ4 compression and keep-alive pooling.

pub mod error;
pub mod schema;
mod store;

pub use error::ClickhouseError;

use std::sync::Arc;
use std::time::Duration;

use clickhouse::Client;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::core::config::ClickhouseConfig;
use crate::core::constants::CLICKHOUSE_HEALTH_CHECK_INTERVAL_SECS;

/// ClickHouse analytics service
///
/// The clickhouse crate's Client internally uses hyper with connection pooling
/// via HTTP keep-alive, so one service is shared by every caller.
pub struct ClickhouseService {
    client: Client,
    config: ClickhouseConfig,
}

impl ClickhouseService {
    /// Connect and create the schema if needed
    pub async fn init(config: &ClickhouseConfig) -> Result<Self, ClickhouseError> {
        let mut client = Client::default()
            .with_url(&config.url)
            .with_database(&config.database);

        if let Some(ref user) = config.user {
            client = client.with_user(user);
        }
        if let Some(ref password) = config.password {
            client = client.with_password(password);
        }
        if config.compression {
            client = client.with_compression(clickhouse::Compression::Lz4);
        }

        // Process each partition independently during FINAL reads of the cache table
        client = client.with_option("do_not_merge_across_partitions_select_final", "1");
        client = client.with_option("max_execution_time", config.timeout_secs.to_string());

        let service = Self {
            client,
            config: config.clone(),
        };

        service.run_migrations().await?;

        tracing::debug!(
            url = %config.url,
            database = %config.database,
            compression = %config.compression,
            "ClickhouseService initialized"
        );

        Ok(service)
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn database(&self) -> &str {
        &self.config.database
    }

    /// Health check - verify connection to ClickHouse
    pub async fn health_check(&self) -> Result<(), ClickhouseError> {
        self.client
            .query("SELECT 1")
            .execute()
            .await
            .map_err(ClickhouseError::from)
    }

    async fn run_migrations(&self) -> Result<(), ClickhouseError> {
        let table_exists: bool = self
            .client
            .query(
                "SELECT count() > 0 FROM system.tables WHERE database = currentDatabase() AND name = 'schema_version'",
            )
            .fetch_one()
            .await
            .map_err(|e| {
                ClickhouseError::Unreachable(format!(
                    "Failed to check schema_version table: {}. Verify ClickHouse is running and accessible.",
                    e
                ))
            })?;

        let current_version: Option<i32> = if table_exists {
            self.client
                .query("SELECT version FROM schema_version FINAL WHERE id = 1")
                .fetch_optional()
                .await?
        } else {
            None
        };

        match current_version {
            None => {
                tracing::debug!(
                    "Applying initial ClickHouse schema v{}",
                    schema::SCHEMA_VERSION
                );
                self.apply_initial_schema().await
            }
            Some(v) if v > schema::SCHEMA_VERSION => Err(ClickhouseError::MigrationFailed {
                version: v,
                name: "version_check".to_string(),
                error: format!(
                    "Database schema version {} is newer than application version {}. Upgrade the application.",
                    v,
                    schema::SCHEMA_VERSION
                ),
            }),
            Some(v) if v < schema::SCHEMA_VERSION => {
                for version in (v + 1)..=schema::SCHEMA_VERSION {
                    apply_versioned_migration(version)?;
                }
                Ok(())
            }
            Some(v) => {
                tracing::debug!("ClickHouse schema is up to date (v{})", v);
                Ok(())
            }
        }
    }

    async fn apply_initial_schema(&self) -> Result<(), ClickhouseError> {
        for table_sql in schema::schema_statements() {
            self.client.query(table_sql).execute().await?;
        }

        let now = chrono::Utc::now().timestamp();
        self.client
            .query(
                "INSERT INTO schema_version (id, version, applied_at, description) VALUES (?, ?, ?, ?)",
            )
            .bind(1u8)
            .bind(schema::SCHEMA_VERSION)
            .bind(now)
            .bind("Initial schema")
            .execute()
            .await?;

        tracing::debug!(
            version = schema::SCHEMA_VERSION,
            "ClickHouse schema applied successfully"
        );
        Ok(())
    }

    pub fn start_health_check_task(
        self: &Arc<Self>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let service = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(Duration::from_secs(CLICKHOUSE_HEALTH_CHECK_INTERVAL_SECS));
            loop {
                tokio::select! {
                    biased;
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            tracing::debug!("ClickHouse health check task shutting down");
                            break;
                        }
                    }
                    _ = interval.tick() => {
                        if let Err(e) = service.health_check().await {
                            tracing::warn!("ClickHouse health check failed: {}", e);
                        }
                    }
                }
            }
        })
    }

    /// Close the connection (no-op for the HTTP client)
    pub async fn close(&self) {
        tracing::debug!("ClickHouse connection closed");
    }
}

fn apply_versioned_migration(version: i32) -> Result<(), ClickhouseError> {
    match version {
        1 => Ok(()), // Handled by apply_initial_schema
        _ => Err(ClickhouseError::MigrationFailed {
            version,
            name: "unknown".to_string(),
            error: format!("No migration defined for version {}", version),
        }),
    }
}
