//! Meter error taxonomy

use thiserror::Error;

use crate::data::error::DataError;
use crate::data::filters::FilterError;

#[derive(Error, Debug)]
pub enum MeterError {
    #[error("Meter not found: {0}")]
    MeterNotFound(String),

    #[error("Invalid filter: {0}")]
    InvalidFilter(String),

    #[error("Filter exceeds maximum nesting depth of {max_depth}")]
    FilterTooComplex { max_depth: usize },

    #[error("Invalid window size: {0}")]
    InvalidWindowSize(String),

    #[error("Invalid aggregation: {0}")]
    InvalidAggregation(String),

    #[error("Invalid meter definition {meter}: {reason}")]
    InvalidMeterDefinition { meter: String, reason: String },

    #[error("Unknown group by dimension: {0}")]
    UnknownGroupByDimension(String),

    #[error("Invalid time zone: {0}")]
    InvalidTimezone(String),

    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    #[error(transparent)]
    Data(#[from] DataError),
}

impl From<FilterError> for MeterError {
    fn from(e: FilterError) -> Self {
        match e {
            FilterError::InvalidFilter(msg) => Self::InvalidFilter(msg),
            FilterError::FilterTooComplex { max_depth } => Self::FilterTooComplex { max_depth },
        }
    }
}

impl MeterError {
    /// Errors caused by the meter or the request itself. Never retried.
    pub fn is_configuration_error(&self) -> bool {
        !matches!(self, Self::MeterNotFound(_) | Self::Data(_))
    }

    pub fn is_not_found(&self) -> bool {
        match self {
            Self::MeterNotFound(_) => true,
            Self::Data(e) => e.is_not_found(),
            _ => false,
        }
    }

    /// Storage failures worth retrying on the next tick
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Data(e) if e.is_transient())
    }
}
