//! Core application

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};

use crate::core::cli::{self, CliConfig, Commands, QueryArgs};
use crate::core::config::AppConfig;
use crate::core::constants::{APP_NAME, DEFAULT_LOG_FILTER, ENV_LOG};
use crate::core::shutdown::ShutdownService;
use crate::data::traits::MeterRegistry;
use crate::data::types::QueryParams;
use crate::data::{AnalyticsService, SqliteService};
use crate::domain::meter::{MeterQueryCompiler, MeterQueryExecutor};
use crate::domain::{
    BackfillEngine, BackfillScheduler, MeterCache, MeterService, QueryCache, StreamingSink,
};

pub struct CoreApp {
    pub shutdown: ShutdownService,
    pub config: AppConfig,
    pub metadata: Arc<SqliteService>,
    pub analytics: Arc<AnalyticsService>,
    pub meters: Arc<MeterCache>,
    pub service: Arc<MeterService>,
    pub backfill: Arc<BackfillEngine>,
    /// Live numeric table writer for embedding ingestion pipelines
    pub sink: Arc<StreamingSink>,
}

impl CoreApp {
    /// Run the application with CLI argument parsing
    pub async fn run() -> Result<()> {
        dotenvy::dotenv().ok();
        Self::init_logging();

        tracing::debug!("Application starting");

        let (cli_config, command) = cli::parse();
        tracing::trace!(command = ?command, "Parsed command");

        let app = Self::init(&cli_config).await?;
        let result = match command {
            Some(Commands::Serve) | None => return app.serve().await,
            Some(Commands::Query(args)) => app.query(args).await,
            Some(Commands::Subjects {
                meter,
                namespace,
                from,
                to,
            }) => app.subjects(&namespace, &meter, from, to).await,
            Some(Commands::BackfillStep {
                meter,
                namespace,
                budget,
            }) => app.backfill_step(&namespace, &meter, budget).await,
        };
        app.shutdown.shutdown().await;
        result
    }

    pub async fn init(cli: &CliConfig) -> Result<Self> {
        let config = AppConfig::load(cli)?;

        let (metadata, analytics) = tokio::try_join!(
            async {
                SqliteService::init(&config.database.metadata_path)
                    .await
                    .map_err(anyhow::Error::from)
            },
            async {
                AnalyticsService::init(
                    config.database.analytics,
                    &config.database.duckdb_path,
                    config.database.clickhouse.as_ref(),
                )
                .await
                .map_err(anyhow::Error::from)
            },
        )?;
        let metadata = Arc::new(metadata);
        let analytics = Arc::new(analytics);

        let registry: Arc<dyn MeterRegistry> = Arc::new(Arc::clone(&metadata));
        for meter in &config.meters {
            registry
                .upsert_meter(meter)
                .await
                .with_context(|| format!("Failed to seed meter '{}'", meter.slug))?;
        }

        let meters = Arc::new(MeterCache::new(
            Arc::clone(&registry),
            config.meter_cache_refresh,
        ));
        let loaded = meters
            .refresh()
            .await
            .context("Failed to load meter definitions")?;

        let dialect = analytics.backend().dialect();
        let executor = Arc::new(MeterQueryExecutor::new(
            MeterQueryCompiler::new(dialect, config.filter_max_depth),
            analytics.query_store(),
        ));
        let cache = QueryCache::new(
            executor.clone(),
            analytics.cache_store(),
            config.query_cache.clone(),
        );
        let service = Arc::new(MeterService::new(meters.clone(), executor, cache));

        let backfill = Arc::new(BackfillEngine::new(
            MeterQueryCompiler::new(dialect, config.filter_max_depth),
            analytics.table_store(),
            registry,
            config.backfill,
        ));
        let sink = Arc::new(StreamingSink::new(meters.clone(), analytics.table_store()));
        let shutdown = ShutdownService::new(metadata.clone(), analytics.clone());

        tracing::debug!(
            backend = %analytics.backend(),
            meters = loaded,
            "Application initialized"
        );

        Ok(Self {
            shutdown,
            config,
            metadata,
            analytics,
            meters,
            service,
            backfill,
            sink,
        })
    }

    fn init_logging() {
        let filter = std::env::var(ENV_LOG)
            .or_else(|_| std::env::var("RUST_LOG"))
            .unwrap_or_else(|_| DEFAULT_LOG_FILTER.to_string());

        tracing_subscriber::fmt()
            .with_target(false)
            .with_thread_ids(false)
            .with_level(true)
            .with_ansi(true)
            .compact()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }

    /// Run background tasks until Ctrl+C/SIGTERM
    async fn serve(self) -> Result<()> {
        self.shutdown.install_signal_handlers();
        self.start_background_tasks().await;

        tracing::info!(
            backend = %self.analytics.backend(),
            meters = self.meters.meters().len(),
            backfill = self.config.maintenance.enabled,
            "{} started",
            APP_NAME
        );

        self.shutdown.wait().await;
        self.shutdown.shutdown().await;
        Ok(())
    }

    pub async fn start_background_tasks(&self) {
        self.shutdown
            .register(
                self.metadata
                    .start_checkpoint_task(self.shutdown.subscribe()),
            )
            .await;

        self.shutdown
            .register(
                self.analytics
                    .start_checkpoint_task(self.shutdown.subscribe()),
            )
            .await;

        self.shutdown
            .register(self.meters.start(self.shutdown.subscribe()))
            .await;

        if self.config.maintenance.enabled {
            let scheduler = Arc::new(BackfillScheduler::new(
                self.backfill.clone(),
                self.meters.clone(),
                self.config.maintenance.steps_per_tick,
                self.config.maintenance.interval,
            ));
            self.shutdown
                .register(scheduler.start(self.shutdown.subscribe()))
                .await;
        } else {
            tracing::debug!("Backfill disabled by config");
        }

        tracing::debug!("Background tasks started");
    }

    async fn query(&self, args: QueryArgs) -> Result<()> {
        let params = QueryParams {
            from: args.from,
            to: args.to,
            window_size: args.window_size,
            window_time_zone: args.window_time_zone,
            filter_subject: args.subjects,
            group_by: args.group_by,
            cachable: args.cachable,
            ..Default::default()
        };
        let rows = self
            .service
            .query_meter(&args.namespace, &args.meter, &params)
            .await?;
        println!("{}", serde_json::to_string_pretty(&rows)?);
        Ok(())
    }

    async fn subjects(
        &self,
        namespace: &str,
        meter: &str,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Result<()> {
        for subject in self
            .service
            .list_meter_subjects(namespace, meter, from, to)
            .await?
        {
            println!("{}", subject);
        }
        Ok(())
    }

    async fn backfill_step(&self, namespace: &str, meter: &str, budget: u32) -> Result<()> {
        let mut meter = self.meters.get(namespace, meter).await?;
        let outcome = self.backfill.run(&mut meter, budget, Utc::now()).await?;
        if outcome.consumed > 0
            && let Some(state) = &meter.table_engine
        {
            self.meters
                .set_table_engine(&meter.namespace, &meter.id, state);
        }
        println!(
            "{}: consumed={} done={} last={:?}",
            meter.slug, outcome.consumed, outcome.done, outcome.action
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    use crate::data::types::EventRow;

    fn write_config(dir: &std::path::Path) -> std::path::PathBuf {
        let path = dir.join("meterhouse.json");
        let mut file = std::fs::File::create(&path).unwrap();
        write!(
            file,
            r#"{{
                "backfill": {{ "cutover_settle_delay_secs": 0 }},
                "meters": [{{
                    "namespace": "default",
                    "id": "m1",
                    "slug": "tokens",
                    "aggregation": "SUM",
                    "event_type": "prompt",
                    "value_property": "$.tokens"
                }}]
            }}"#
        )
        .unwrap();
        path
    }

    #[tokio::test]
    async fn test_init_seeds_meters_and_answers_queries() {
        let dir = tempfile::tempdir().unwrap();
        let cli = CliConfig {
            config: Some(write_config(dir.path())),
            duckdb_path: Some(dir.path().join("analytics.duckdb")),
            metadata_path: Some(dir.path().join("meters.db")),
            ..Default::default()
        };
        let app = CoreApp::init(&cli).await.unwrap();
        assert_eq!(app.meters.meters().len(), 1);

        let time = Utc::now() - chrono::Duration::hours(1);
        let store = app.analytics.event_store();
        store
            .insert_events(&[EventRow {
                namespace: "default".to_string(),
                id: "e1".to_string(),
                event_type: "prompt".to_string(),
                source: "test".to_string(),
                subject: "s1".to_string(),
                time,
                data: r#"{"tokens": 5}"#.to_string(),
                ingested_at: time,
                stored_at: time,
            }])
            .await
            .unwrap();

        let rows = app
            .service
            .query_meter("default", "tokens", &QueryParams::default())
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].value, 5.0);

        let subjects = app
            .service
            .list_meter_subjects("default", "tokens", None, None)
            .await
            .unwrap();
        assert_eq!(subjects, vec!["s1"]);

        app.shutdown.shutdown().await;
    }
}
