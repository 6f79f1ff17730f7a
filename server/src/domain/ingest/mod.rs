//! Live ingestion into the numeric table
//!
//! Called once per stored event. Every operational meter fed by the event's type gets a
//! numeric row when the event was stored at or after the meter's stream cutover; earlier
//! events belong to the backfill.

use std::sync::Arc;
use std::time::Duration;

use crate::core::constants::{INGEST_WRITE_BACKOFF_MS, INGEST_WRITE_MAX_ATTEMPTS};
use crate::data::error::DataError;
use crate::data::traits::MeterTableStore;
use crate::data::types::{EventRow, MeterDefinition, MeterEventRow};
use crate::domain::meter::{MeterError, NumericExtractor};
use crate::domain::registry::MeterCache;
use crate::utils::retry::{RetryPolicy, retry_with_backoff};

pub struct StreamingSink {
    meters: Arc<MeterCache>,
    store: Arc<dyn MeterTableStore>,
    retry: RetryPolicy,
}

impl StreamingSink {
    pub fn new(meters: Arc<MeterCache>, store: Arc<dyn MeterTableStore>) -> Self {
        Self {
            meters,
            store,
            retry: RetryPolicy::new(
                INGEST_WRITE_MAX_ATTEMPTS,
                Duration::from_millis(INGEST_WRITE_BACKOFF_MS),
            ),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Write the numeric rows of one event. Returns the number of rows written.
    pub async fn on_event(&self, event: &EventRow) -> Result<usize, MeterError> {
        self.on_events(std::slice::from_ref(event)).await
    }

    /// Write the numeric rows of a batch of events in one store call
    pub async fn on_events(&self, events: &[EventRow]) -> Result<usize, MeterError> {
        let rows: Vec<MeterEventRow> = events
            .iter()
            .flat_map(|event| {
                self.meters
                    .meters_for_event(&event.namespace, &event.event_type)
                    .into_iter()
                    .filter(|meter| streams(meter, event))
                    .filter_map(|meter| NumericExtractor::extract(&meter, event))
                    .collect::<Vec<_>>()
            })
            .collect();
        if rows.is_empty() {
            return Ok(0);
        }

        let count = rows.len();
        let result = retry_with_backoff(self.retry, DataError::is_transient, || {
            self.store.insert_meter_events(&rows)
        })
        .await;

        match result {
            Ok(((), attempts)) => {
                tracing::debug!(events = events.len(), rows = count, attempts, "Wrote numeric rows");
                Ok(count)
            }
            Err((e, attempts)) => {
                tracing::error!(
                    error = %e,
                    events = events.len(),
                    rows = count,
                    attempts,
                    "Failed to write numeric rows"
                );
                Err(e.into())
            }
        }
    }
}

/// Live ingestion owns events stored at or after the cutover
fn streams(meter: &MeterDefinition, event: &EventRow) -> bool {
    if !meter.aggregation.supports_numeric_table() {
        return false;
    }
    meter
        .table_engine
        .as_ref()
        .and_then(|state| state.stream_cutover_at)
        .is_some_and(|cutover| event.stored_at >= cutover)
}
