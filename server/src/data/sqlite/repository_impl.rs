//! MeterRegistry trait implementation for SQLite
//!
//! This module implements the MeterRegistry trait for Arc<SqliteService>,
//! mapping repository results onto the unified data layer errors.

use std::sync::Arc;

use async_trait::async_trait;

use crate::data::error::DataError;
use crate::data::traits::MeterRegistry;
use crate::data::types::{EngineState, MeterDefinition};

use super::SqliteService;
use super::repositories::meter;

#[async_trait]
impl MeterRegistry for Arc<SqliteService> {
    async fn list_meters(&self, namespace: Option<&str>) -> Result<Vec<MeterDefinition>, DataError> {
        meter::list_meters(self.pool(), namespace)
            .await
            .map_err(Into::into)
    }

    async fn get_meter_by_id_or_slug(
        &self,
        namespace: &str,
        id_or_slug: &str,
    ) -> Result<MeterDefinition, DataError> {
        meter::get_meter(self.pool(), namespace, id_or_slug)
            .await?
            .ok_or_else(|| DataError::not_found("meter", id_or_slug))
    }

    async fn update_table_engine(
        &self,
        namespace: &str,
        meter_id: &str,
        state: &EngineState,
    ) -> Result<(), DataError> {
        if meter::update_table_engine(self.pool(), namespace, meter_id, state).await? {
            Ok(())
        } else {
            Err(DataError::not_found("meter", meter_id))
        }
    }

    async fn upsert_meter(&self, meter: &MeterDefinition) -> Result<(), DataError> {
        meter::upsert_meter(self.pool(), meter)
            .await
            .map_err(Into::into)
    }
}
