//! Background backfill scheduling
//!
//! Every tick each cached meter gets a fixed step budget. Meters that are done cost
//! nothing; a failing meter is logged and retried on the next tick.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::domain::backfill::BackfillEngine;
use crate::domain::registry::MeterCache;

/// Counts of one scheduler pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickSummary {
    pub meters: usize,
    pub steps: u32,
    pub ready: usize,
    pub failed: usize,
}

pub struct BackfillScheduler {
    engine: Arc<BackfillEngine>,
    meters: Arc<MeterCache>,
    steps_per_tick: u32,
    interval: Duration,
}

impl BackfillScheduler {
    pub fn new(
        engine: Arc<BackfillEngine>,
        meters: Arc<MeterCache>,
        steps_per_tick: u32,
        interval: Duration,
    ) -> Self {
        Self {
            engine,
            meters,
            steps_per_tick,
            interval,
        }
    }

    /// Give every cached meter one budget of steps
    pub async fn tick(&self, now: DateTime<Utc>) -> TickSummary {
        let mut summary = TickSummary::default();

        for mut meter in self.meters.meters() {
            summary.meters += 1;
            let cached = meter.table_engine.clone();
            match self.engine.run(&mut meter, self.steps_per_tick, now).await {
                Ok(outcome) => {
                    summary.steps += outcome.consumed;
                    if meter.uses_numeric_table() {
                        summary.ready += 1;
                    }
                    if meter.table_engine != cached
                        && let Some(state) = &meter.table_engine
                    {
                        self.meters
                            .set_table_engine(&meter.namespace, &meter.id, state);
                    }
                }
                Err(e) => {
                    summary.failed += 1;
                    tracing::warn!(
                        meter = %meter.slug,
                        namespace = %meter.namespace,
                        error = %e,
                        "Backfill step failed"
                    );
                }
            }
        }

        if summary.steps > 0 || summary.failed > 0 {
            tracing::debug!(
                meters = summary.meters,
                steps = summary.steps,
                ready = summary.ready,
                failed = summary.failed,
                "Backfill tick completed"
            );
        }
        summary
    }

    pub fn start(self: Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) -> JoinHandle<()> {
        tracing::debug!(
            interval_secs = self.interval.as_secs(),
            steps_per_tick = self.steps_per_tick,
            "Starting backfill task"
        );

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.interval);
            loop {
                tokio::select! {
                    biased;
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            tracing::debug!("Backfill task shutting down");
                            break;
                        }
                    }
                    _ = interval.tick() => {
                        self.tick(Utc::now()).await;
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    use async_trait::async_trait;
    use chrono::TimeZone;

    use crate::data::error::DataError;
    use crate::data::memory::InMemoryMeterRegistry;
    use crate::data::sql::Backend;
    use crate::data::traits::{MeterRegistry, MeterTableStore};
    use crate::data::types::{
        Aggregation, ChunkImport, CompiledQuery, EngineState, MeterDefinition, MeterEventRow,
    };
    use crate::domain::backfill::BackfillConfig;
    use crate::domain::meter::MeterQueryCompiler;

    struct EmptyTableStore;

    #[async_trait]
    impl MeterTableStore for EmptyTableStore {
        async fn min_stored_at(
            &self,
            _query: &CompiledQuery,
        ) -> Result<Option<DateTime<Utc>>, DataError> {
            Ok(None)
        }

        async fn replace_chunk(&self, _import: &ChunkImport) -> Result<(), DataError> {
            Ok(())
        }

        async fn insert_meter_events(&self, _rows: &[MeterEventRow]) -> Result<(), DataError> {
            Ok(())
        }
    }

    fn meter(id: &str, aggregation: Aggregation) -> MeterDefinition {
        MeterDefinition {
            namespace: "default".to_string(),
            id: id.to_string(),
            slug: id.to_string(),
            aggregation,
            event_type: "prompt".to_string(),
            value_property: Some("$.tokens".to_string()),
            group_by: BTreeMap::new(),
            event_from: None,
            table_engine: None,
        }
    }

    async fn scheduler(steps_per_tick: u32) -> (Arc<InMemoryMeterRegistry>, Arc<BackfillScheduler>) {
        let registry = Arc::new(InMemoryMeterRegistry::default());
        registry.upsert_meter(&meter("sum", Aggregation::Sum)).await.unwrap();
        registry
            .upsert_meter(&meter("unique", Aggregation::UniqueCount))
            .await
            .unwrap();
        let meters = Arc::new(MeterCache::new(registry.clone(), Duration::from_secs(30)));
        meters.refresh().await.unwrap();

        let engine = Arc::new(BackfillEngine::new(
            MeterQueryCompiler::new(Backend::Duckdb.dialect(), 8),
            Arc::new(EmptyTableStore),
            registry.clone(),
            BackfillConfig::default(),
        ));
        let scheduler = Arc::new(BackfillScheduler::new(
            engine,
            meters,
            steps_per_tick,
            Duration::from_millis(10),
        ));
        (registry, scheduler)
    }

    #[tokio::test]
    async fn test_ticks_drive_meters_to_ready() {
        let (registry, scheduler) = scheduler(2).await;
        let now = Utc.with_ymd_and_hms(2024, 1, 3, 12, 0, 0).unwrap();

        let first = scheduler.tick(now).await;
        assert_eq!(first.meters, 2);
        assert_eq!(first.steps, 2);
        assert_eq!(first.ready, 0);
        // Cache sees the persisted state without a refresh
        let cached = scheduler.meters.find("default", "sum").unwrap();
        assert!(cached.table_engine.unwrap().backfill_min_time.is_some());

        let later = now + chrono::Duration::hours(1);
        let mut summary = TickSummary::default();
        for _ in 0..5 {
            summary = scheduler.tick(later).await;
        }
        assert_eq!(summary.ready, 1);
        assert_eq!(summary.steps, 0);
        assert_eq!(summary.failed, 0);

        let stored = registry.get_meter_by_id_or_slug("default", "sum").await.unwrap();
        assert!(stored.uses_numeric_table());
        let unique = registry
            .get_meter_by_id_or_slug("default", "unique")
            .await
            .unwrap();
        assert!(unique.table_engine.is_none());
    }

    #[tokio::test]
    async fn test_tick_after_stale_refresh_keeps_cutover() {
        let (registry, scheduler) = scheduler(1).await;
        let now = Utc.with_ymd_and_hms(2024, 1, 3, 12, 0, 0).unwrap();

        scheduler.tick(now).await;
        let cutover = registry
            .get_meter_by_id_or_slug("default", "sum")
            .await
            .unwrap()
            .table_engine
            .unwrap()
            .stream_cutover_at;
        assert!(cutover.is_some());

        // A snapshot read before the first step lands after it
        scheduler.meters.set_table_engine("default", "sum", &EngineState::default());
        scheduler.tick(now + chrono::Duration::minutes(5)).await;

        let state = registry
            .get_meter_by_id_or_slug("default", "sum")
            .await
            .unwrap()
            .table_engine
            .unwrap();
        assert_eq!(state.stream_cutover_at, cutover);
        assert!(state.backfill_min_time.is_some());
        let cached = scheduler.meters.find("default", "sum").unwrap();
        assert_eq!(cached.table_engine, Some(state));
    }

    #[tokio::test]
    async fn test_task_stops_on_shutdown() {
        let (_registry, scheduler) = scheduler(4).await;
        let (tx, rx) = watch::channel(false);
        let handle = Arc::clone(&scheduler).start(rx);

        tokio::time::sleep(Duration::from_millis(30)).await;
        tx.send(true).unwrap();
        handle.await.unwrap();

        let cached = scheduler.meters.find("default", "sum").unwrap();
        assert!(cached.table_engine.is_some());
    }
}
