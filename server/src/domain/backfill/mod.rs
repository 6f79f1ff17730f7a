//! Migration of meters onto the numeric table
//!
//! A meter starts out answering queries from raw events. The backfill engine moves it onto
//! the per-event numeric table without double counting:
//!
//! 1. Fix a stream cutover slightly in the future. From then on live ingestion writes
//!    every event stored at or after the cutover.
//! 2. Find the earliest stored event and plan daily chunks up to the cutover.
//! 3. Import the chunks one by one. Each import replaces whatever a previous attempt wrote.
//! 4. After a settle delay past the cutover, mark the table ready.
//!
//! Each transition is persisted before the next one starts, so a crash resumes from the
//! last completed step and a failed step leaves the stored state untouched.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;

use crate::core::constants::{
    BACKFILL_FALLBACK_WINDOW_HOURS, DEFAULT_CUTOVER_SETTLE_DELAY_SECS,
    DEFAULT_STREAM_START_OFFSET_SECS,
};
use crate::data::traits::{MeterRegistry, MeterTableStore};
use crate::data::types::{MeterDefinition, Period};
use crate::domain::meter::{MeterError, MeterQueryCompiler};
use crate::utils::time::{start_of_utc_day, truncate_to_second};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackfillConfig {
    /// Distance between enabling the engine and the stream cutover
    pub stream_start_offset: Duration,
    /// Time after the cutover before the numeric table serves queries
    pub cutover_settle_delay: Duration,
}

impl Default for BackfillConfig {
    fn default() -> Self {
        Self {
            stream_start_offset: Duration::seconds(DEFAULT_STREAM_START_OFFSET_SECS as i64),
            cutover_settle_delay: Duration::seconds(DEFAULT_CUTOVER_SETTLE_DELAY_SECS as i64),
        }
    }
}

/// What a step did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepAction {
    /// Stream cutover fixed
    Initialized { cutover: DateTime<Utc> },
    /// Import chunks planned from the earliest stored event
    Planned { min_time: DateTime<Utc>, chunks: usize },
    /// One chunk copied into the numeric table
    Imported { chunk: Period },
    /// Numeric table complete
    Ready,
    /// Nothing to do until a later time
    Waiting { until: DateTime<Utc> },
    /// Budget exhausted before any work was done
    OutOfBudget,
    /// Another task is stepping this meter
    Busy,
    /// The aggregation cannot be served from the numeric table
    Unsupported,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepOutcome {
    /// Budget units used, at most one per step
    pub consumed: u32,
    /// The meter needs no further steps
    pub done: bool,
    pub action: StepAction,
}

impl StepOutcome {
    fn idle(action: StepAction, done: bool) -> Self {
        Self {
            consumed: 0,
            done,
            action,
        }
    }
}

pub struct BackfillEngine {
    compiler: MeterQueryCompiler,
    store: Arc<dyn MeterTableStore>,
    registry: Arc<dyn MeterRegistry>,
    config: BackfillConfig,
    in_flight: Mutex<HashSet<(String, String)>>,
}

/// Releases a meter claimed by [`BackfillEngine::claim`]
struct Claim<'a> {
    in_flight: &'a Mutex<HashSet<(String, String)>>,
    key: (String, String),
}

impl Drop for Claim<'_> {
    fn drop(&mut self) {
        self.in_flight.lock().remove(&self.key);
    }
}

impl BackfillEngine {
    pub fn new(
        compiler: MeterQueryCompiler,
        store: Arc<dyn MeterTableStore>,
        registry: Arc<dyn MeterRegistry>,
        config: BackfillConfig,
    ) -> Self {
        Self {
            compiler,
            store,
            registry,
            config,
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    fn claim(&self, meter: &MeterDefinition) -> Option<Claim<'_>> {
        let key = (meter.namespace.clone(), meter.id.clone());
        if !self.in_flight.lock().insert(key.clone()) {
            return None;
        }
        Some(Claim {
            in_flight: &self.in_flight,
            key,
        })
    }

    /// Advance the meter by at most one transition.
    ///
    /// The step starts from the persisted state, not from `meter.table_engine`, which may
    /// come from a stale snapshot. On success the new state is persisted and written back
    /// to `meter.table_engine`. On failure the persisted state is left as it was.
    pub async fn step(
        &self,
        meter: &mut MeterDefinition,
        budget: u32,
        now: DateTime<Utc>,
    ) -> Result<StepOutcome, MeterError> {
        if !meter.aggregation.supports_numeric_table() {
            return Ok(StepOutcome::idle(StepAction::Unsupported, true));
        }
        // Ready is terminal, so a snapshot saying so is never stale
        if meter.table_engine.as_ref().is_some_and(|s| s.ready) {
            return Ok(StepOutcome::idle(StepAction::Ready, true));
        }
        if budget == 0 {
            return Ok(StepOutcome::idle(StepAction::OutOfBudget, false));
        }
        let Some(_claim) = self.claim(meter) else {
            return Ok(StepOutcome::idle(StepAction::Busy, false));
        };

        let stored = self
            .registry
            .get_meter_by_id_or_slug(&meter.namespace, &meter.id)
            .await?;
        if stored.table_engine != meter.table_engine {
            tracing::debug!(meter = %meter.slug, "Backfill resumed from persisted engine state");
            meter.table_engine = stored.table_engine;
        }
        let state = meter.table_engine.clone().unwrap_or_default();
        if state.ready {
            return Ok(StepOutcome::idle(StepAction::Ready, true));
        }

        let mut next = state.clone();
        let action = match (state.stream_cutover_at, state.backfill_min_time) {
            (None, _) => {
                let cutover = truncate_to_second(now + self.config.stream_start_offset);
                next.stream_cutover_at = Some(cutover);
                StepAction::Initialized { cutover }
            }
            (Some(cutover), None) => {
                let query = self.compiler.compile_min_stored_at(meter);
                let fallback = Duration::hours(BACKFILL_FALLBACK_WINDOW_HOURS);
                let min_time = match self.store.min_stored_at(&query).await? {
                    Some(t) => t,
                    None => truncate_to_second((cutover - fallback).min(now - fallback)),
                };
                next.backfill_min_time = Some(min_time);
                next.import_chunks = daily_chunks(start_of_utc_day(min_time), cutover);
                StepAction::Planned {
                    min_time,
                    chunks: next.import_chunks.len(),
                }
            }
            (Some(cutover), Some(_)) => match state.import_chunks.first() {
                Some(chunk) => {
                    // Events may still be stored inside a chunk that has not ended
                    if chunk.to > now {
                        return Ok(StepOutcome::idle(
                            StepAction::Waiting { until: chunk.to },
                            false,
                        ));
                    }
                    let import = self.compiler.compile_chunk_import(meter, chunk, cutover)?;
                    self.store.replace_chunk(&import).await?;
                    next.import_chunks.remove(0);
                    StepAction::Imported { chunk: *chunk }
                }
                None => {
                    let until = cutover + self.config.cutover_settle_delay;
                    if now < until {
                        return Ok(StepOutcome::idle(StepAction::Waiting { until }, false));
                    }
                    next.ready = true;
                    StepAction::Ready
                }
            },
        };

        self.registry
            .update_table_engine(&meter.namespace, &meter.id, &next)
            .await?;
        tracing::debug!(
            meter = %meter.slug,
            action = ?action,
            remaining_chunks = next.import_chunks.len(),
            "Backfill step completed"
        );

        let done = next.ready;
        meter.table_engine = Some(next);
        Ok(StepOutcome {
            consumed: 1,
            done,
            action,
        })
    }

    /// Step until the budget is spent, the meter is done, or it has to wait
    pub async fn run(
        &self,
        meter: &mut MeterDefinition,
        budget: u32,
        now: DateTime<Utc>,
    ) -> Result<StepOutcome, MeterError> {
        let mut consumed = 0;
        loop {
            let outcome = self.step(meter, budget - consumed, now).await?;
            consumed += outcome.consumed;
            if outcome.done || outcome.consumed == 0 {
                return Ok(StepOutcome {
                    consumed,
                    ..outcome
                });
            }
        }
    }
}

/// Half-open daily periods covering `[from, to)`
pub fn daily_chunks(from: DateTime<Utc>, to: DateTime<Utc>) -> Vec<Period> {
    let mut chunks = Vec::new();
    let mut start = from;
    while start < to {
        let end = (start + Duration::days(1)).min(to);
        chunks.push(Period::new(start, end));
        start = end;
    }
    chunks
}

#[cfg(test)]
#[path = "backfill_tests.rs"]
mod tests;
