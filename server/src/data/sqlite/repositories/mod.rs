//! SQLite repositories

pub mod meter;
