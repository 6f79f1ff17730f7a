//! In-memory meter registry for tests and one-shot CLI runs

use std::collections::BTreeMap;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::data::error::DataError;
use crate::data::traits::MeterRegistry;
use crate::data::types::{EngineState, MeterDefinition};

/// Meters keyed by (namespace, id)
#[derive(Default)]
pub struct InMemoryMeterRegistry {
    meters: RwLock<BTreeMap<(String, String), MeterDefinition>>,
}

#[async_trait]
impl MeterRegistry for InMemoryMeterRegistry {
    async fn list_meters(&self, namespace: Option<&str>) -> Result<Vec<MeterDefinition>, DataError> {
        Ok(self
            .meters
            .read()
            .values()
            .filter(|m| namespace.is_none_or(|ns| m.namespace == ns))
            .cloned()
            .collect())
    }

    async fn get_meter_by_id_or_slug(
        &self,
        namespace: &str,
        id_or_slug: &str,
    ) -> Result<MeterDefinition, DataError> {
        let meters = self.meters.read();
        if let Some(meter) = meters.get(&(namespace.to_string(), id_or_slug.to_string())) {
            return Ok(meter.clone());
        }
        meters
            .values()
            .find(|m| m.namespace == namespace && m.slug == id_or_slug)
            .cloned()
            .ok_or_else(|| DataError::not_found("meter", id_or_slug))
    }

    async fn update_table_engine(
        &self,
        namespace: &str,
        meter_id: &str,
        state: &EngineState,
    ) -> Result<(), DataError> {
        let mut meters = self.meters.write();
        let meter = meters
            .get_mut(&(namespace.to_string(), meter_id.to_string()))
            .ok_or_else(|| DataError::not_found("meter", meter_id))?;
        meter.table_engine = Some(state.clone());
        Ok(())
    }

    async fn upsert_meter(&self, meter: &MeterDefinition) -> Result<(), DataError> {
        let mut meters = self.meters.write();
        let key = (meter.namespace.clone(), meter.id.clone());
        let table_engine = meters
            .get(&key)
            .and_then(|m| m.table_engine.clone())
            .or_else(|| meter.table_engine.clone());
        meters.insert(
            key,
            MeterDefinition {
                table_engine,
                ..meter.clone()
            },
        );
        Ok(())
    }
}
