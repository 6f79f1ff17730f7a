//! SQL abstraction layer for multi-database support
//!
//! This module provides abstractions for generating SQL that works across
//! the analytics backends (DuckDB, ClickHouse).

mod clickhouse_dialect;
mod dialect;
mod duckdb_dialect;

pub use clickhouse_dialect::ClickhouseDialect;
pub use dialect::SqlDialect;
pub use duckdb_dialect::DuckdbDialect;

/// Analytics backend identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    Duckdb,
    Clickhouse,
}

impl Backend {
    /// Get the SQL dialect for this backend
    pub fn dialect(&self) -> &'static dyn SqlDialect {
        match self {
            Backend::Duckdb => &DuckdbDialect,
            Backend::Clickhouse => &ClickhouseDialect,
        }
    }

    /// Get the backend name
    pub fn name(&self) -> &'static str {
        match self {
            Backend::Duckdb => "duckdb",
            Backend::Clickhouse => "clickhouse",
        }
    }
}

impl std::fmt::Display for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dialect_matches_backend() {
        for backend in [Backend::Duckdb, Backend::Clickhouse] {
            assert_eq!(backend.dialect().name(), backend.name());
            assert_eq!(backend.to_string(), backend.name());
        }
    }
}
