//! Persisted state of a meter's numeric table engine
//!
//! The state is stored as a versioned JSON document next to the meter definition.
//! Readers reject versions they do not understand instead of guessing.

use std::cmp::Reverse;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::meter::Period;

/// Current encoding version
pub const ENGINE_STATE_VERSION: u32 = 1;

#[derive(Error, Debug)]
pub enum EngineStateError {
    #[error("Malformed engine state: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("Unsupported engine state version {found} (expected {expected})")]
    UnsupportedVersion { found: u32, expected: u32 },
}

/// Progress of a meter's migration onto the numeric table
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineState {
    /// Events stored at or after this instant are written by live ingestion
    #[serde(default)]
    pub stream_cutover_at: Option<DateTime<Utc>>,
    /// Earliest `stored_at` covered by the backfill
    #[serde(default)]
    pub backfill_min_time: Option<DateTime<Utc>>,
    /// Daily chunks still to import, ordered and disjoint
    #[serde(default)]
    pub import_chunks: Vec<Period>,
    /// Numeric table is complete and may serve queries
    #[serde(default)]
    pub ready: bool,
}

#[derive(Serialize, Deserialize)]
struct Envelope<S> {
    version: u32,
    #[serde(flatten)]
    state: S,
}

#[derive(Deserialize)]
struct VersionHeader {
    version: u32,
}

impl EngineState {
    pub fn encode(&self) -> Result<String, EngineStateError> {
        Ok(serde_json::to_string(&Envelope {
            version: ENGINE_STATE_VERSION,
            state: self,
        })?)
    }

    pub fn decode(raw: &str) -> Result<Self, EngineStateError> {
        let header: VersionHeader = serde_json::from_str(raw)?;
        if header.version != ENGINE_STATE_VERSION {
            return Err(EngineStateError::UnsupportedVersion {
                found: header.version,
                expected: ENGINE_STATE_VERSION,
            });
        }
        let envelope: Envelope<EngineState> = serde_json::from_str(raw)?;
        Ok(envelope.state)
    }

    /// Live ingestion writes to the numeric table once the cutover is fixed
    pub fn is_operational(&self) -> bool {
        self.stream_cutover_at.is_some()
    }

    /// Whether `other` is further along the migration than `self`.
    ///
    /// States only move forward: cutover, then plan, then chunks, then ready.
    pub fn is_behind(&self, other: &EngineState) -> bool {
        self.progress() < other.progress()
    }

    fn progress(&self) -> (bool, bool, bool, Reverse<usize>) {
        (
            self.ready,
            self.stream_cutover_at.is_some(),
            self.backfill_min_time.is_some(),
            Reverse(self.import_chunks.len()),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_encode_decode() {
        let from = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let to = Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap();
        let state = EngineState {
            stream_cutover_at: Some(to),
            backfill_min_time: Some(from),
            import_chunks: vec![Period::new(from, to)],
            ready: false,
        };
        let encoded = state.encode().unwrap();
        assert!(encoded.contains(r#""version":1"#));
        assert_eq!(EngineState::decode(&encoded).unwrap(), state);
    }

    #[test]
    fn test_decode_empty_state() {
        let state = EngineState::decode(r#"{"version":1}"#).unwrap();
        assert_eq!(state, EngineState::default());
        assert!(!state.is_operational());
    }

    #[test]
    fn test_decode_rejects_unknown_version() {
        let err = EngineState::decode(r#"{"version":7,"ready":true}"#).unwrap_err();
        assert!(matches!(
            err,
            EngineStateError::UnsupportedVersion { found: 7, .. }
        ));
    }

    #[test]
    fn test_progress_order() {
        let day = |d: u32| Utc.with_ymd_and_hms(2024, 1, d, 0, 0, 0).unwrap();
        let initialized = EngineState {
            stream_cutover_at: Some(day(3)),
            ..Default::default()
        };
        let planned = EngineState {
            backfill_min_time: Some(day(1)),
            import_chunks: vec![Period::new(day(1), day(2)), Period::new(day(2), day(3))],
            ..initialized.clone()
        };
        let imported = EngineState {
            import_chunks: vec![Period::new(day(2), day(3))],
            ..planned.clone()
        };
        let ready = EngineState {
            import_chunks: Vec::new(),
            ready: true,
            ..planned.clone()
        };

        let states = [EngineState::default(), initialized, planned, imported, ready];
        for pair in states.windows(2) {
            assert!(pair[0].is_behind(&pair[1]));
            assert!(!pair[1].is_behind(&pair[0]));
        }
        assert!(!states[2].is_behind(&states[2]));
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(
            EngineState::decode("not json"),
            Err(EngineStateError::Malformed(_))
        ));
    }
}
