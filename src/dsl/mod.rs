//! Filter / Aggregator / Column DSL.
//!
//! Each element is a small tagged value that knows how to render itself to a
//! SQL fragment. Escaping is centralized here: callers never interpolate a
//! literal value themselves.

mod handler_filter;

pub use handler_filter::{HandlerFilter, HandlerOperator};

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DslError {
    #[error("column '{0}' is not a member of the owning table's whitelist")]
    UnknownColumn(String),
    #[error("IN/NOT IN list must not be empty")]
    EmptyInList,
}

/// A raw, unescaped value carried by a DSL element. Quoting/escaping is
/// applied only at render time, never before.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SqlValue {
    Text(String),
    Int(i64),
    Float(f64),
    Bool(bool),
}

impl SqlValue {
    /// Render as a SQL literal: strings single-quoted with `'` doubled,
    /// everything else printed as-is.
    pub fn to_sql_literal(&self) -> String {
        match self {
            SqlValue::Text(s) => format!("'{}'", s.replace('\'', "''")),
            SqlValue::Int(i) => i.to_string(),
            SqlValue::Float(f) => f.to_string(),
            SqlValue::Bool(b) => if *b { "TRUE" } else { "FALSE" }.to_string(),
        }
    }

    /// Render as a bare (unquoted) literal, used for CQL expressions where
    /// strings still need quoting but booleans are lowercase.
    pub fn to_cql_literal(&self) -> String {
        match self {
            SqlValue::Text(s) => format!("'{}'", s.replace('\'', "''")),
            SqlValue::Int(i) => i.to_string(),
            SqlValue::Float(f) => f.to_string(),
            SqlValue::Bool(b) => if *b { "true" } else { "false" }.to_string(),
        }
    }
}

/// Validates a column name against a table's known columns. The Registry is
/// the source of truth for this whitelist; this helper is reused by the
/// `dsl` and `analysis` modules to avoid duplicating the check.
pub fn validate_column<'a>(column: &str, whitelist: &'a [String]) -> Result<&'a str, DslError> {
    whitelist
        .iter()
        .find(|c| c.eq_ignore_ascii_case(column))
        .map(|s| s.as_str())
        .ok_or_else(|| DslError::UnknownColumn(column.to_string()))
}

/// A projected SELECT column, with optional output alias.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Column {
    pub column: String,
    pub alias: Option<String>,
}

impl Column {
    pub fn to_sql_fragment(&self) -> String {
        match &self.alias {
            Some(alias) => format!("\"{}\" AS \"{}\"", self.column, alias),
            None => format!("\"{}\"", self.column),
        }
    }

    /// The name this column surfaces as in the result set.
    pub fn output_name(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.column)
    }
}

/// Closed comparison-operator enum for WHERE clauses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ComparisonOperator {
    #[serde(rename = "=")]
    Eq,
    #[serde(rename = "!=")]
    Ne,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = ">=")]
    Ge,
    #[serde(rename = "<=")]
    Le,
    Like,
    Ilike,
    In,
    #[serde(rename = "NOT IN")]
    NotIn,
    Between,
    #[serde(rename = "IS NULL")]
    IsNull,
    #[serde(rename = "IS NOT NULL")]
    IsNotNull,
}

impl ComparisonOperator {
    fn as_sql(self) -> &'static str {
        match self {
            ComparisonOperator::Eq => "=",
            ComparisonOperator::Ne => "!=",
            ComparisonOperator::Gt => ">",
            ComparisonOperator::Lt => "<",
            ComparisonOperator::Ge => ">=",
            ComparisonOperator::Le => "<=",
            ComparisonOperator::Like => "LIKE",
            ComparisonOperator::Ilike => "ILIKE",
            ComparisonOperator::In => "IN",
            ComparisonOperator::NotIn => "NOT IN",
            ComparisonOperator::Between => "BETWEEN",
            ComparisonOperator::IsNull => "IS NULL",
            ComparisonOperator::IsNotNull => "IS NOT NULL",
        }
    }
}

/// A single WHERE-clause element. Variants carry only the fields meaningful
/// to their operator, matching the source's discriminated-union shape but
/// unified into one Rust enum instead of several sibling Pydantic models.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "operator")]
pub enum WhereClause {
    #[serde(rename = "=")]
    Eq { column: String, value: SqlValue },
    #[serde(rename = "!=")]
    Ne { column: String, value: SqlValue },
    #[serde(rename = ">")]
    Gt { column: String, value: SqlValue },
    #[serde(rename = "<")]
    Lt { column: String, value: SqlValue },
    #[serde(rename = ">=")]
    Ge { column: String, value: SqlValue },
    #[serde(rename = "<=")]
    Le { column: String, value: SqlValue },
    Like { column: String, value: SqlValue },
    Ilike { column: String, value: SqlValue },
    In { column: String, value_list: Vec<SqlValue> },
    #[serde(rename = "NOT IN")]
    NotIn { column: String, value_list: Vec<SqlValue> },
    Between { column: String, lower: SqlValue, upper: SqlValue },
    #[serde(rename = "IS NULL")]
    IsNull { column: String },
    #[serde(rename = "IS NOT NULL")]
    IsNotNull { column: String },
}

impl WhereClause {
    pub fn column(&self) -> &str {
        match self {
            WhereClause::Eq { column, .. }
            | WhereClause::Ne { column, .. }
            | WhereClause::Gt { column, .. }
            | WhereClause::Lt { column, .. }
            | WhereClause::Ge { column, .. }
            | WhereClause::Le { column, .. }
            | WhereClause::Like { column, .. }
            | WhereClause::Ilike { column, .. }
            | WhereClause::In { column, .. }
            | WhereClause::NotIn { column, .. }
            | WhereClause::Between { column, .. }
            | WhereClause::IsNull { column }
            | WhereClause::IsNotNull { column } => column,
        }
    }

    pub fn operator(&self) -> ComparisonOperator {
        match self {
            WhereClause::Eq { .. } => ComparisonOperator::Eq,
            WhereClause::Ne { .. } => ComparisonOperator::Ne,
            WhereClause::Gt { .. } => ComparisonOperator::Gt,
            WhereClause::Lt { .. } => ComparisonOperator::Lt,
            WhereClause::Ge { .. } => ComparisonOperator::Ge,
            WhereClause::Le { .. } => ComparisonOperator::Le,
            WhereClause::Like { .. } => ComparisonOperator::Like,
            WhereClause::Ilike { .. } => ComparisonOperator::Ilike,
            WhereClause::In { .. } => ComparisonOperator::In,
            WhereClause::NotIn { .. } => ComparisonOperator::NotIn,
            WhereClause::Between { .. } => ComparisonOperator::Between,
            WhereClause::IsNull { .. } => ComparisonOperator::IsNull,
            WhereClause::IsNotNull { .. } => ComparisonOperator::IsNotNull,
        }
    }

    /// Validates the column against a whitelist and, for IN/NOT IN, rejects
    /// an empty value list rather than silently rendering a constant-false
    /// clause (see DESIGN.md for the reasoning).
    pub fn validate(&self, whitelist: &[String]) -> Result<(), DslError> {
        validate_column(self.column(), whitelist)?;
        match self {
            WhereClause::In { value_list, .. } | WhereClause::NotIn { value_list, .. }
                if value_list.is_empty() =>
            {
                Err(DslError::EmptyInList)
            }
            _ => Ok(()),
        }
    }

    pub fn to_sql_fragment(&self) -> String {
        let op = self.operator().as_sql();
        let col = format!("\"{}\"", self.column());
        match self {
            WhereClause::Eq { value, .. }
            | WhereClause::Ne { value, .. }
            | WhereClause::Gt { value, .. }
            | WhereClause::Lt { value, .. }
            | WhereClause::Ge { value, .. }
            | WhereClause::Le { value, .. }
            | WhereClause::Like { value, .. }
            | WhereClause::Ilike { value, .. } => {
                format!("{col} {op} {}", value.to_sql_literal())
            }
            WhereClause::In { value_list, .. } | WhereClause::NotIn { value_list, .. } => {
                let rendered: Vec<String> =
                    value_list.iter().map(SqlValue::to_sql_literal).collect();
                format!("{col} {op} ({})", rendered.join(", "))
            }
            WhereClause::Between { lower, upper, .. } => {
                format!("{col} {op} {} AND {}", lower.to_sql_literal(), upper.to_sql_literal())
            }
            WhereClause::IsNull { .. } | WhereClause::IsNotNull { .. } => {
                format!("{col} {op}")
            }
        }
    }
}

/// Aggregate-operator enum for GROUP BY projections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AggregateOperator {
    Count,
    Sum,
    Avg,
    Min,
    Max,
}

impl AggregateOperator {
    fn as_sql(self) -> &'static str {
        match self {
            AggregateOperator::Count => "COUNT",
            AggregateOperator::Sum => "SUM",
            AggregateOperator::Avg => "AVG",
            AggregateOperator::Min => "MIN",
            AggregateOperator::Max => "MAX",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregateColumn {
    pub operator: AggregateOperator,
    /// `None` only valid for `Count` (COUNT(*)).
    pub column: Option<String>,
    pub alias: Option<String>,
    #[serde(default)]
    pub distinct: bool,
}

impl AggregateColumn {
    pub fn validate(&self, whitelist: &[String]) -> Result<(), DslError> {
        match &self.column {
            Some(c) => {
                validate_column(c, whitelist)?;
                Ok(())
            }
            None if self.operator == AggregateOperator::Count => Ok(()),
            None => Err(DslError::UnknownColumn("<missing>".to_string())),
        }
    }

    pub fn to_sql_fragment(&self) -> String {
        let target = match &self.column {
            Some(c) => format!("\"{c}\""),
            None => "*".to_string(),
        };
        let distinct = if self.distinct && self.operator == AggregateOperator::Count {
            "DISTINCT "
        } else {
            ""
        };
        let expr = format!("{}({}{})", self.operator.as_sql(), distinct, target);
        match &self.alias {
            Some(alias) => format!("{expr} AS \"{alias}\""),
            None => expr,
        }
    }

    /// The name this aggregate surfaces as in the result set.
    pub fn output_name(&self) -> String {
        match &self.alias {
            Some(alias) => alias.clone(),
            None => match &self.column {
                Some(c) => format!("{}_{}", self.operator.as_sql().to_lowercase(), c),
                None => "count".to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn string_value_escapes_internal_quote() {
        let where_clause =
            WhereClause::Eq { column: "name".into(), value: SqlValue::Text("O'Brien".into()) };
        assert_eq!(where_clause.to_sql_fragment(), "\"name\" = 'O''Brien'");
    }

    #[test]
    fn between_renders_both_bounds() {
        let wc = WhereClause::Between {
            column: "area".into(),
            lower: SqlValue::Int(0),
            upper: SqlValue::Int(100),
        };
        assert_eq!(wc.to_sql_fragment(), "\"area\" BETWEEN 0 AND 100");
    }

    #[test]
    fn empty_in_list_is_rejected() {
        let wc = WhereClause::In { column: "id".into(), value_list: vec![] };
        let whitelist = vec!["id".to_string()];
        assert!(matches!(wc.validate(&whitelist), Err(DslError::EmptyInList)));
    }

    #[test]
    fn unknown_column_is_rejected() {
        let wc = WhereClause::IsNull { column: "ghost".into() };
        let whitelist = vec!["id".to_string()];
        assert!(matches!(wc.validate(&whitelist), Err(DslError::UnknownColumn(_))));
    }

    #[test]
    fn count_star_renders_without_quotes() {
        let agg = AggregateColumn {
            operator: AggregateOperator::Count,
            column: None,
            alias: Some("n".into()),
            distinct: false,
        };
        assert_eq!(agg.to_sql_fragment(), "COUNT(*) AS \"n\"");
    }
}
