//! Filter validation errors

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FilterError {
    #[error("Invalid filter: {0}")]
    InvalidFilter(String),

    #[error("Filter too complex: nesting exceeds {max_depth} levels")]
    FilterTooComplex { max_depth: usize },
}
