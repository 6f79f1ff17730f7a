//! Filter type definitions and SQL generation

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::error::FilterError;
use crate::data::sql::SqlDialect;
use crate::data::types::QueryParam;

/// Collects SQL parameters during query building (maintains insertion order)
#[derive(Debug, Default, Clone, PartialEq)]
pub struct SqlParams {
    pub values: Vec<QueryParam>,
}

impl SqlParams {
    pub fn push(&mut self, value: QueryParam) {
        self.values.push(value);
    }

    pub fn extend(&mut self, other: SqlParams) {
        self.values.extend(other.values);
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// A value type that can appear in a filter
pub trait FilterValue: Clone {
    /// Whether `like`/`ilike` style pattern operators apply
    const SUPPORTS_PATTERN: bool = false;

    fn to_param(&self) -> QueryParam;

    /// Placeholder expression for one bound value
    fn placeholder(_dialect: &dyn SqlDialect) -> &'static str {
        "?"
    }
}

impl FilterValue for String {
    const SUPPORTS_PATTERN: bool = true;

    fn to_param(&self) -> QueryParam {
        QueryParam::String(self.clone())
    }
}

impl FilterValue for i64 {
    fn to_param(&self) -> QueryParam {
        QueryParam::Int64(*self)
    }
}

impl FilterValue for f64 {
    fn to_param(&self) -> QueryParam {
        QueryParam::Float64(*self)
    }
}

impl FilterValue for DateTime<Utc> {
    fn to_param(&self) -> QueryParam {
        QueryParam::Int64(self.timestamp_micros())
    }

    fn placeholder(dialect: &dyn SqlDialect) -> &'static str {
        dialect.timestamp_param()
    }
}

/// Predicate over one field. Exactly one operator may be set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Filter<T> {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eq: Option<T>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ne: Option<T>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gt: Option<T>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gte: Option<T>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lt: Option<T>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lte: Option<T>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub like: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub not_like: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ilike: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub not_ilike: Option<String>,
    #[serde(default, rename = "in", skip_serializing_if = "Option::is_none")]
    pub in_: Option<Vec<T>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub not_in: Option<Vec<T>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub and: Option<Vec<Filter<T>>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub or: Option<Vec<Filter<T>>>,
}

pub type FilterString = Filter<String>;
pub type FilterInteger = Filter<i64>;
pub type FilterFloat = Filter<f64>;
pub type FilterTime = Filter<DateTime<Utc>>;

impl<T> Default for Filter<T> {
    fn default() -> Self {
        Self {
            eq: None,
            ne: None,
            gt: None,
            gte: None,
            lt: None,
            lte: None,
            like: None,
            not_like: None,
            ilike: None,
            not_ilike: None,
            in_: None,
            not_in: None,
            and: None,
            or: None,
        }
    }
}

impl<T: FilterValue> Filter<T> {
    /// Names of the operators that are set
    fn set_operators(&self) -> Vec<&'static str> {
        let mut ops = Vec::new();
        let flags = [
            ("eq", self.eq.is_some()),
            ("ne", self.ne.is_some()),
            ("gt", self.gt.is_some()),
            ("gte", self.gte.is_some()),
            ("lt", self.lt.is_some()),
            ("lte", self.lte.is_some()),
            ("like", self.like.is_some()),
            ("notLike", self.not_like.is_some()),
            ("ilike", self.ilike.is_some()),
            ("notIlike", self.not_ilike.is_some()),
            ("in", self.in_.is_some()),
            ("notIn", self.not_in.is_some()),
            ("and", self.and.is_some()),
            ("or", self.or.is_some()),
        ];
        for (name, set) in flags {
            if set {
                ops.push(name);
            }
        }
        ops
    }

    pub fn is_empty(&self) -> bool {
        self.set_operators().is_empty()
    }

    /// Validate operator exclusivity, pattern applicability and nesting depth.
    /// A flat predicate has depth 1.
    pub fn validate(&self, max_depth: usize) -> Result<(), FilterError> {
        self.validate_at(1, max_depth)
    }

    fn validate_at(&self, depth: usize, max_depth: usize) -> Result<(), FilterError> {
        if depth > max_depth {
            return Err(FilterError::FilterTooComplex { max_depth });
        }

        let ops = self.set_operators();
        if ops.len() > 1 {
            return Err(FilterError::InvalidFilter(format!(
                "only one operator may be set, found: {}",
                ops.join(", ")
            )));
        }

        if !T::SUPPORTS_PATTERN
            && let Some(op) = ops
                .iter()
                .find(|op| matches!(**op, "like" | "notLike" | "ilike" | "notIlike"))
        {
            return Err(FilterError::InvalidFilter(format!(
                "{} is only supported on string fields",
                op
            )));
        }

        for nested in self.and.iter().chain(self.or.iter()).flatten() {
            nested.validate_at(depth + 1, max_depth)?;
        }

        Ok(())
    }

    /// Generate a boolean SQL expression for `field`.
    ///
    /// Returns None when the filter imposes no constraint. Expects a validated filter.
    pub fn to_sql(
        &self,
        field: &str,
        dialect: &dyn SqlDialect,
        params: &mut SqlParams,
    ) -> Option<String> {
        let ph = T::placeholder(dialect);

        let compare = |op: &str, value: &T, params: &mut SqlParams| {
            params.push(value.to_param());
            Some(format!("{} {} {}", field, op, ph))
        };
        let pattern = |op: &str, value: &String, params: &mut SqlParams| {
            params.push(QueryParam::String(value.clone()));
            Some(format!("{} {} ?", field, op))
        };

        if let Some(v) = &self.eq {
            return compare("=", v, params);
        }
        if let Some(v) = &self.ne {
            return compare("!=", v, params);
        }
        if let Some(v) = &self.gt {
            return compare(">", v, params);
        }
        if let Some(v) = &self.gte {
            return compare(">=", v, params);
        }
        if let Some(v) = &self.lt {
            return compare("<", v, params);
        }
        if let Some(v) = &self.lte {
            return compare("<=", v, params);
        }
        if let Some(p) = &self.like {
            return pattern("LIKE", p, params);
        }
        if let Some(p) = &self.not_like {
            return pattern("NOT LIKE", p, params);
        }
        if let Some(p) = &self.ilike {
            return pattern("ILIKE", p, params);
        }
        if let Some(p) = &self.not_ilike {
            return pattern("NOT ILIKE", p, params);
        }
        if let Some(values) = &self.in_ {
            if values.is_empty() {
                // Nothing can match an empty set
                return Some("1 = 0".to_string());
            }
            return Some(format!(
                "{} IN ({})",
                field,
                Self::bind_list(values, ph, params)
            ));
        }
        if let Some(values) = &self.not_in {
            if values.is_empty() {
                return None;
            }
            return Some(format!(
                "{} NOT IN ({})",
                field,
                Self::bind_list(values, ph, params)
            ));
        }
        if let Some(filters) = &self.and {
            return Self::combine(filters, "AND", field, dialect, params);
        }
        if let Some(filters) = &self.or {
            return Self::combine(filters, "OR", field, dialect, params);
        }
        None
    }

    fn bind_list(values: &[T], ph: &str, params: &mut SqlParams) -> String {
        values
            .iter()
            .map(|v| {
                params.push(v.to_param());
                ph
            })
            .collect::<Vec<_>>()
            .join(", ")
    }

    fn combine(
        filters: &[Filter<T>],
        op: &str,
        field: &str,
        dialect: &dyn SqlDialect,
        params: &mut SqlParams,
    ) -> Option<String> {
        let parts: Vec<String> = filters
            .iter()
            .filter_map(|f| f.to_sql(field, dialect, params))
            .collect();
        match parts.len() {
            0 => None,
            1 => parts.into_iter().next(),
            _ => Some(format!("({})", parts.join(&format!(" {} ", op)))),
        }
    }
}

#[cfg(test)]
#[path = "types_tests.rs"]
mod tests;
