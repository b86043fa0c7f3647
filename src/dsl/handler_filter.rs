//! Handler filter — the DSL element used by the Map State Handler to encode
//! an attribute-query string for a tile URL, and (for the same predicate) a
//! SQL WHERE fragment, so both renderings stay equivalent. Grounded on
//! `handlers/_filter.py`'s `GeoFilter`, extended with a `contains` operator
//! absent from the source.

use serde::{Deserialize, Serialize};

use super::SqlValue;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum HandlerOperator {
    Equal,
    GreaterThan,
    LessThan,
    GreaterThanOrEqual,
    LessThanOrEqual,
    NotEqual,
    Contains,
}

impl HandlerOperator {
    fn sql_op(self) -> Option<&'static str> {
        match self {
            HandlerOperator::Equal => Some("="),
            HandlerOperator::GreaterThan => Some(">"),
            HandlerOperator::LessThan => Some("<"),
            HandlerOperator::GreaterThanOrEqual => Some(">="),
            HandlerOperator::LessThanOrEqual => Some("<="),
            HandlerOperator::NotEqual => Some("!="),
            HandlerOperator::Contains => None,
        }
    }

    fn cql_op(self) -> Option<&'static str> {
        match self {
            HandlerOperator::NotEqual => Some("<>"),
            HandlerOperator::Contains => None,
            other => other.sql_op(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandlerFilter {
    pub field: String,
    pub value: SqlValue,
    pub op: HandlerOperator,
}

impl HandlerFilter {
    /// Render a parameter-safe SQL predicate fragment (e.g. `"borough" = 'BK'`).
    pub fn to_sql(&self) -> String {
        match self.op.sql_op() {
            Some(op) => format!("\"{}\" {} {}", self.field, op, self.value.to_sql_literal()),
            None => {
                // `contains`: only meaningful for text values.
                let needle = match &self.value {
                    SqlValue::Text(s) => s.clone(),
                    other => format!("{:?}", other),
                };
                format!("\"{}\" ILIKE '%{}%'", self.field, needle.replace('\'', "''"))
            }
        }
    }

    /// Render a CQL expression, URL-encoded for embedding in a tile URL.
    pub fn to_cql(&self) -> String {
        let expr = match self.op.cql_op() {
            Some(op) => format!("{} {} {}", self.field, op, self.cql_literal()),
            None => {
                let needle = match &self.value {
                    SqlValue::Text(s) => s.clone(),
                    other => format!("{:?}", other),
                };
                format!("{} LIKE '%{}%'", self.field, needle.replace('\'', "''"))
            }
        };
        urlencoding::encode(&expr).into_owned()
    }

    fn cql_literal(&self) -> String {
        match &self.value {
            SqlValue::Text(s) => format!("'{}'", s.replace('\'', "''")),
            SqlValue::Bool(b) => if *b { "true" } else { "false" }.to_string(),
            SqlValue::Int(i) => i.to_string(),
            SqlValue::Float(f) => f.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equal_renders_matching_sql_and_cql() {
        let f = HandlerFilter {
            field: "borough".into(),
            value: SqlValue::Text("BK".into()),
            op: HandlerOperator::Equal,
        };
        assert_eq!(f.to_sql(), "\"borough\" = 'BK'");
        assert_eq!(f.to_cql(), urlencoding::encode("borough = 'BK'"));
    }

    #[test]
    fn single_quotes_are_doubled_in_both_renderings() {
        let f = HandlerFilter {
            field: "name".into(),
            value: SqlValue::Text("O'Brien".into()),
            op: HandlerOperator::Equal,
        };
        assert!(f.to_sql().contains("O''Brien"));
        assert!(f.to_cql().contains(&urlencoding::encode("O''Brien").into_owned()));
    }

    #[test]
    fn not_equal_uses_different_operator_tokens() {
        let f = HandlerFilter {
            field: "x".into(),
            value: SqlValue::Int(1),
            op: HandlerOperator::NotEqual,
        };
        assert_eq!(f.to_sql(), "\"x\" != 1");
        assert_eq!(f.to_cql(), urlencoding::encode("x <> 1"));
    }
}
