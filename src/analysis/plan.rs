//! Source-table references and the top-level analysis plan.
//!
//! `Source` is modelled as a sum type rather than the source implementation's
//! "two-optional-fields + post-validator" pattern.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use super::steps::AnalysisStep;

static VALID_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z][a-z0-9_]*$").expect("identifier pattern is a fixed literal"));

/// A step-level slot referencing another table: either a back-reference to
/// an earlier step's output, or a name drawn from the table whitelist in
/// scope for the current turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Source {
    ByIndex { index: usize },
    ByName { name: String },
}

impl Source {
    pub fn by_index(index: usize) -> Self {
        Source::ByIndex { index }
    }

    pub fn by_name(name: impl Into<String>) -> Self {
        Source::ByName { name: name.into() }
    }
}

/// {snake_case name, ordered list of steps}. Owns a dedicated SQL schema
/// named after it for the duration of execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisPlan {
    pub name: String,
    pub steps: Vec<AnalysisStep>,
}

impl AnalysisPlan {
    /// `analysis_name` is a valid, schema-safe snake_case identifier.
    pub fn is_valid_name(name: &str) -> bool {
        VALID_NAME.is_match(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_name_accepts_snake_case_only() {
        assert!(AnalysisPlan::is_valid_name("near_subway"));
        assert!(AnalysisPlan::is_valid_name("a1"));
        assert!(!AnalysisPlan::is_valid_name(""));
        assert!(!AnalysisPlan::is_valid_name("NearSubway"));
        assert!(!AnalysisPlan::is_valid_name("1_near_subway"));
        assert!(!AnalysisPlan::is_valid_name("near-subway"));
        assert!(!AnalysisPlan::is_valid_name("near subway"));
    }
}
