//! Metadata shapes held in the two document stores: field definitions
//! (projected into tool schemas/enums) and supplemental markdown sections.
//! Grounded on `original_source/geo_assistant/data_dictionary.py`.

use serde::{Deserialize, Serialize};

use super::DocumentMetadata;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldFormat {
    String,
    Number,
    Boolean,
}

/// {name, pretty name, description, source, format, optional enum of
/// allowed values, owning table}. Immutable once indexed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldDefinition {
    pub name: String,
    pub pretty_name: String,
    pub description: String,
    pub source: String,
    pub format: FieldFormat,
    #[serde(default)]
    pub allowed_values: Option<Vec<String>>,
    pub owning_table: String,
}

impl DocumentMetadata for FieldDefinition {
    fn embedding_text(&self) -> &str {
        &self.description
    }

    fn dedup_key(&self) -> &str {
        &self.name
    }
}

/// {title, markdown text, owning table, source document}. Immutable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupplementalInfoSection {
    pub title: String,
    pub markdown: String,
    pub owning_table: String,
    pub source_document: String,
}

impl DocumentMetadata for SupplementalInfoSection {
    fn embedding_text(&self) -> &str {
        &self.markdown
    }

    fn dedup_key(&self) -> &str {
        &self.title
    }
}
