//! Execution of compiled meter queries

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use super::compile::MeterQueryCompiler;
use super::error::MeterError;
use crate::data::traits::MeterQueryStore;
use crate::data::types::{MeterDefinition, MeterQueryRow, QueryParams};
use crate::utils::time::micros_to_datetime;

/// Runs one meter query end to end
#[async_trait]
pub trait MeterQueryRunner: Send + Sync {
    async fn run(
        &self,
        meter: &MeterDefinition,
        params: &QueryParams,
    ) -> Result<Vec<MeterQueryRow>, MeterError>;
}

/// Compiles queries and executes them against an analytics store
pub struct MeterQueryExecutor {
    compiler: MeterQueryCompiler,
    store: Arc<dyn MeterQueryStore>,
}

impl MeterQueryExecutor {
    pub fn new(compiler: MeterQueryCompiler, store: Arc<dyn MeterQueryStore>) -> Self {
        Self { compiler, store }
    }

    pub fn compiler(&self) -> &MeterQueryCompiler {
        &self.compiler
    }

    /// Fill a missing `from`/`to` with the time span of the matching events.
    ///
    /// None when no event matches.
    async fn resolve_window_bounds(
        &self,
        meter: &MeterDefinition,
        params: &QueryParams,
    ) -> Result<Option<QueryParams>, MeterError> {
        let query = self.compiler.compile_time_bounds(meter, params)?;
        let rows = self.store.query_meter_rows(&query, 0).await?;
        let Some((first, last)) = rows
            .first()
            .and_then(|r| Some((r.window_start?, r.window_end?)))
        else {
            return Ok(None);
        };

        let mut resolved = params.clone();
        if resolved.from.is_none() {
            resolved.from = Some(micros_to_datetime(first));
        }
        if resolved.to.is_none() {
            resolved.to = Some(micros_to_datetime(last) + Duration::microseconds(1));
        }
        tracing::trace!(
            meter = %meter.slug,
            from = ?resolved.from,
            to = ?resolved.to,
            "Resolved window bounds"
        );
        Ok(Some(resolved))
    }

    pub async fn list_subjects(
        &self,
        meter: &MeterDefinition,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Result<Vec<String>, MeterError> {
        let query = self.compiler.compile_subjects(meter, from, to)?;
        Ok(self.store.query_strings(&query).await?)
    }
}

#[async_trait]
impl MeterQueryRunner for MeterQueryExecutor {
    async fn run(
        &self,
        meter: &MeterDefinition,
        params: &QueryParams,
    ) -> Result<Vec<MeterQueryRow>, MeterError> {
        let resolved;
        let params = if self.compiler.missing_window_bounds(meter, params)? {
            match self.resolve_window_bounds(meter, params).await? {
                Some(p) => {
                    resolved = p;
                    &resolved
                }
                None => return Ok(Vec::new()),
            }
        } else {
            params
        };

        let (query, scanner) = self.compiler.compile(meter, params)?;
        let raw = self
            .store
            .query_meter_rows(&query, scanner.group_column_count())
            .await?;
        let rows = scanner.scan(raw);
        tracing::debug!(meter = %meter.slug, rows = rows.len(), "Meter query executed");
        Ok(rows)
    }
}
