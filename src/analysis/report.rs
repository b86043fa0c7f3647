//! Reporting artifacts emitted by a completed analysis run.
//!
//! Supplements the source's `TableCreated`/`MapLayerCreated` pair
//! (`agent/report.py`) with a `SaveTable` variant for tables a plan
//! explicitly persists beyond the run.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ReportItem {
    TableCreated { name: String, reason: String, table: String, columns: Vec<String> },
    MapLayerArguments {
        name: String,
        reason: String,
        layer_id: String,
        source_table: String,
        color: String,
    },
    SaveTable { schema: String, table: String },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Report {
    pub items: Vec<ReportItem>,
}

impl Report {
    pub fn push(&mut self, item: ReportItem) {
        self.items.push(item);
    }

    /// Tables that must survive cleanup: explicit `SaveTable` outputs, plus
    /// any table that fed into a `MapLayerArguments` item.
    pub fn retained_tables(&self) -> Vec<String> {
        self.items
            .iter()
            .filter_map(|item| match item {
                ReportItem::SaveTable { schema, table } => Some(format!("{schema}.{table}")),
                ReportItem::MapLayerArguments { source_table, .. } => Some(source_table.clone()),
                ReportItem::TableCreated { .. } => None,
            })
            .collect()
    }
}
