//! Compiled, parameterized SQL

/// Query parameter bound positionally to a `?` placeholder.
/// All user-controllable values MUST go through this enum.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryParam {
    String(String),
    /// Integers, and timestamps as microseconds since epoch
    Int64(i64),
    Float64(f64),
}

/// SQL text plus the parameters for its placeholders, in textual order
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CompiledQuery {
    pub sql: String,
    pub params: Vec<QueryParam>,
}

impl CompiledQuery {
    pub fn new(sql: impl Into<String>, params: Vec<QueryParam>) -> Self {
        Self {
            sql: sql.into(),
            params,
        }
    }

    /// Number of positional placeholders in the SQL text, ignoring quoted literals
    pub fn placeholder_count(&self) -> usize {
        let mut count = 0;
        let mut in_literal = false;
        let mut chars = self.sql.chars().peekable();
        while let Some(c) = chars.next() {
            match c {
                '\\' if in_literal => {
                    chars.next();
                }
                '\'' => in_literal = !in_literal,
                '?' if !in_literal => count += 1,
                _ => {}
            }
        }
        count
    }
}

/// Statements replacing one backfill chunk of the numeric table
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkImport {
    /// Removes rows a previous attempt may have written for the chunk
    pub delete: CompiledQuery,
    /// Copies the chunk's events into the numeric table
    pub insert: CompiledQuery,
}
