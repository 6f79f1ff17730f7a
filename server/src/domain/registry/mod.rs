//! In-process snapshot of meter definitions
//!
//! Meters are read on every query and every ingested event, and change rarely. The
//! snapshot is swapped wholesale on refresh so readers never block on the registry.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::data::error::DataError;
use crate::data::traits::MeterRegistry;
use crate::data::types::{EngineState, MeterDefinition};
use crate::domain::meter::MeterError;

#[derive(Default)]
struct Snapshot {
    meters: Vec<MeterDefinition>,
    /// (namespace, event_type) -> indexes into `meters`
    by_event_type: HashMap<(String, String), Vec<usize>>,
}

impl Snapshot {
    fn build(meters: Vec<MeterDefinition>) -> Self {
        let mut by_event_type: HashMap<(String, String), Vec<usize>> = HashMap::new();
        for (i, meter) in meters.iter().enumerate() {
            by_event_type
                .entry((meter.namespace.clone(), meter.event_type.clone()))
                .or_default()
                .push(i);
        }
        Self {
            meters,
            by_event_type,
        }
    }

    fn find(&self, namespace: &str, id_or_slug: &str) -> Option<&MeterDefinition> {
        let in_namespace = || self.meters.iter().filter(|m| m.namespace == namespace);
        in_namespace()
            .find(|m| m.id == id_or_slug)
            .or_else(|| in_namespace().find(|m| m.slug == id_or_slug))
    }
}

pub struct MeterCache {
    registry: Arc<dyn MeterRegistry>,
    snapshot: RwLock<Arc<Snapshot>>,
    refresh_interval: Duration,
}

impl MeterCache {
    pub fn new(registry: Arc<dyn MeterRegistry>, refresh_interval: Duration) -> Self {
        Self {
            registry,
            snapshot: RwLock::new(Arc::new(Snapshot::default())),
            refresh_interval,
        }
    }

    pub fn registry(&self) -> &Arc<dyn MeterRegistry> {
        &self.registry
    }

    /// Reload all meters from the registry. Returns the number of meters loaded.
    ///
    /// An engine state applied through [`set_table_engine`](Self::set_table_engine) while
    /// the registry was being read is kept when the loaded one is behind it.
    pub async fn refresh(&self) -> Result<usize, DataError> {
        let mut meters = self.registry.list_meters(None).await?;
        let count = meters.len();

        let mut guard = self.snapshot.write();
        let current: HashMap<(&str, &str), &EngineState> = guard
            .meters
            .iter()
            .filter_map(|m| {
                m.table_engine
                    .as_ref()
                    .map(|s| ((m.namespace.as_str(), m.id.as_str()), s))
            })
            .collect();
        let mut kept = 0;
        for meter in &mut meters {
            let Some(&newer) = current.get(&(meter.namespace.as_str(), meter.id.as_str())) else {
                continue;
            };
            let behind = match &meter.table_engine {
                Some(loaded) => loaded.is_behind(newer),
                None => true,
            };
            if behind {
                meter.table_engine = Some(newer.clone());
                kept += 1;
            }
        }
        *guard = Arc::new(Snapshot::build(meters));
        drop(guard);

        tracing::debug!(meters = count, kept_engine_states = kept, "Meter cache refreshed");
        Ok(count)
    }

    /// Every cached meter
    pub fn meters(&self) -> Vec<MeterDefinition> {
        self.snapshot.read().meters.clone()
    }

    /// Meters fed by events of `event_type` in `namespace`
    pub fn meters_for_event(&self, namespace: &str, event_type: &str) -> Vec<MeterDefinition> {
        let snapshot = self.snapshot.read().clone();
        snapshot
            .by_event_type
            .get(&(namespace.to_string(), event_type.to_string()))
            .map(|indexes| {
                indexes
                    .iter()
                    .filter_map(|&i| snapshot.meters.get(i).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn find(&self, namespace: &str, id_or_slug: &str) -> Option<MeterDefinition> {
        self.snapshot.read().find(namespace, id_or_slug).cloned()
    }

    /// Resolve a meter from the snapshot, falling back to the registry on a miss
    pub async fn get(&self, namespace: &str, id_or_slug: &str) -> Result<MeterDefinition, MeterError> {
        if let Some(meter) = self.find(namespace, id_or_slug) {
            return Ok(meter);
        }
        match self
            .registry
            .get_meter_by_id_or_slug(namespace, id_or_slug)
            .await
        {
            Ok(meter) if meter.namespace == namespace => Ok(meter),
            Ok(_) => Err(MeterError::MeterNotFound(id_or_slug.to_string())),
            Err(e) if e.is_not_found() => Err(MeterError::MeterNotFound(id_or_slug.to_string())),
            Err(e) => Err(e.into()),
        }
    }

    /// Apply an engine state that was already persisted, without waiting for a refresh
    pub fn set_table_engine(&self, namespace: &str, meter_id: &str, state: &EngineState) {
        let mut guard = self.snapshot.write();
        let mut meters = guard.meters.clone();
        let Some(meter) = meters
            .iter_mut()
            .find(|m| m.namespace == namespace && m.id == meter_id)
        else {
            return;
        };
        meter.table_engine = Some(state.clone());
        *guard = Arc::new(Snapshot::build(meters));
    }

    /// Start the periodic refresh task
    pub fn start(self: &Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) -> JoinHandle<()> {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            tracing::debug!(
                interval_secs = cache.refresh_interval.as_secs(),
                "Meter cache refresh task started"
            );
            let mut interval = tokio::time::interval(cache.refresh_interval);
            loop {
                tokio::select! {
                    biased;
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            tracing::debug!("Meter cache refresh task shutting down");
                            break;
                        }
                    }
                    _ = interval.tick() => {
                        if let Err(e) = cache.refresh().await {
                            tracing::warn!(error = %e, "Meter cache refresh failed");
                        }
                    }
                }
            }
        })
    }
}
