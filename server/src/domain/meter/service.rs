//! Public meter query surface

use std::sync::Arc;

use chrono::{DateTime, Utc};

use super::error::MeterError;
use super::runner::MeterQueryExecutor;
use crate::data::types::{MeterQueryRow, QueryParams};
use crate::domain::cache::QueryCache;
use crate::domain::registry::MeterCache;

/// Resolves meters and answers usage queries through the result cache
pub struct MeterService {
    meters: Arc<MeterCache>,
    executor: Arc<MeterQueryExecutor>,
    cache: QueryCache,
}

impl MeterService {
    pub fn new(meters: Arc<MeterCache>, executor: Arc<MeterQueryExecutor>, cache: QueryCache) -> Self {
        Self {
            meters,
            executor,
            cache,
        }
    }

    pub async fn query_meter(
        &self,
        namespace: &str,
        meter_id_or_slug: &str,
        params: &QueryParams,
    ) -> Result<Vec<MeterQueryRow>, MeterError> {
        self.query_meter_at(namespace, meter_id_or_slug, params, Utc::now())
            .await
    }

    /// Same as [`query_meter`](Self::query_meter) with an explicit clock
    pub async fn query_meter_at(
        &self,
        namespace: &str,
        meter_id_or_slug: &str,
        params: &QueryParams,
        now: DateTime<Utc>,
    ) -> Result<Vec<MeterQueryRow>, MeterError> {
        let meter = self.meters.get(namespace, meter_id_or_slug).await?;
        let rows = self.cache.query(&meter, params, now).await.inspect_err(|e| {
            if !e.is_configuration_error() {
                tracing::warn!(meter = %meter.slug, error = %e, "Meter query failed");
            }
        })?;
        tracing::debug!(
            namespace,
            meter = %meter.slug,
            rows = rows.len(),
            "Meter query completed"
        );
        Ok(rows)
    }

    pub async fn list_meter_subjects(
        &self,
        namespace: &str,
        meter_id_or_slug: &str,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Result<Vec<String>, MeterError> {
        let meter = self.meters.get(namespace, meter_id_or_slug).await?;
        self.executor.list_subjects(&meter, from, to).await
    }
}
