//! Table Registry: the process-wide catalog of known tables, their
//! geometry kind, bounds, and tile-server URLs.
//!
//! Discovers tables published by the tile server, tracks their schema,
//! columns, bounds and geometry type, and answers the multi-criteria
//! lookups the planner and map state handler need. Grounded on
//! `original_source/geo_assistant/table_registry.py`.

use std::collections::HashMap;
use std::sync::RwLock;

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use thiserror::Error;

use crate::sql_runner::{SqlRunner, TemplateArgs};
use crate::tileserver::{TileServerClient, TileServerError};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("table '{0}' is not registered")]
    NotFound(String),
    #[error("schema '{0}' has no registered tables")]
    UnknownSchema(String),
    #[error("analysis '{0}' has no registered tables")]
    UnknownAnalysis(String),
    #[error("tile server error: {0}")]
    TileServer(#[from] TileServerError),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Geographic bounding box, `(west, south, east, north)` in degrees.
/// The world default corrects an ordering slip in the source's fallback
/// literal (`table_registry.py`'s `_extract_table_from_tileserv`), which
/// read `{west: -90, south: -180, east: 90, north: 180}` — swapped
/// latitude/longitude ranges. See DESIGN.md.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bounds {
    pub west: f64,
    pub south: f64,
    pub east: f64,
    pub north: f64,
}

impl Bounds {
    pub const WORLD: Bounds = Bounds { west: -180.0, south: -90.0, east: 180.0, north: 90.0 };

    pub fn union(&self, other: &Bounds) -> Bounds {
        Bounds {
            west: self.west.min(other.west),
            south: self.south.min(other.south),
            east: self.east.max(other.east),
            north: self.north.max(other.north),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableDescriptor {
    pub name: String,
    /// Renamed from the source's `schema` field, which shadows the
    /// built-in `schema` keyword-adjacent name in several ORMs; kept
    /// distinct here for clarity (DESIGN.md Open Question decision).
    pub schema_name: String,
    pub columns: Vec<String>,
    pub index_url: String,
    pub tile_url: String,
    pub bounds: Bounds,
    pub geometry_kind: crate::analysis::GeometryKind,
    /// Tables created mid-analysis and eligible for bulk cleanup, as
    /// opposed to tables loaded once at startup from the tile server.
    pub temporary: bool,
}

impl TableDescriptor {
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.schema_name, self.name)
    }

    /// Drops columns not present in `fields`, keeping declaration order of
    /// `fields`. Returns `None` if the intersection is empty (mirrors
    /// `table_registry.py`'s `Table.filter`, which drops tables whose
    /// projected column set would be empty).
    pub fn filter(&self, fields: &[String]) -> Option<TableDescriptor> {
        let kept: Vec<String> = fields
            .iter()
            .filter(|f| self.columns.iter().any(|c| c.eq_ignore_ascii_case(f)))
            .cloned()
            .collect();
        if kept.is_empty() {
            return None;
        }
        Some(TableDescriptor { columns: kept, ..self.clone() })
    }
}

/// One criterion of a multi-criteria lookup. `Schema` also serves the
/// `analysis` selector kind: an analysis's created tables live in the
/// schema named after it, so selecting by schema name is selecting by
/// analysis.
#[derive(Debug, Clone, Copy)]
pub enum Selector<'a> {
    Table(&'a str),
    Schema(&'a str),
    Fields(&'a [String]),
}

#[derive(Default)]
pub struct TableRegistry {
    tables: RwLock<HashMap<String, TableDescriptor>>,
}

impl TableRegistry {
    pub fn new() -> Self {
        Self { tables: RwLock::new(HashMap::new()) }
    }

    /// Loads every table published by the tile server's index, probing
    /// each one's geometry type against the database (`_get_geometry_type`
    /// in the source).
    pub async fn load_from_tileserv(
        &self,
        client: &TileServerClient,
        pool: &PgPool,
        base_schema: &str,
    ) -> Result<(), RegistryError> {
        let index = client.list_tables().await?;
        for entry in index {
            let detail = match client.table_detail(&entry.id).await {
                Ok(detail) => detail,
                Err(e) => {
                    tracing::warn!(table = %entry.id, error = %e, "tile server discovery failed for table; omitting it");
                    continue;
                }
            };
            let geometry_kind = match Self::geometry_type(pool, base_schema, &entry.id).await {
                Ok(kind) => kind,
                Err(e) => {
                    tracing::warn!(table = %entry.id, error = %e, "geometry type probe failed for table; omitting it");
                    continue;
                }
            };
            let bounds = detail.bounds.unwrap_or(Bounds::WORLD);
            let descriptor = TableDescriptor {
                name: entry.id.clone(),
                schema_name: base_schema.to_string(),
                columns: detail.columns,
                index_url: entry.self_url,
                tile_url: detail.tile_url,
                bounds,
                geometry_kind,
                temporary: false,
            };
            self.tables.write().unwrap().insert(descriptor.qualified_name(), descriptor);
        }
        Ok(())
    }

    async fn geometry_type(
        pool: &PgPool,
        schema: &str,
        table: &str,
    ) -> Result<crate::analysis::GeometryKind, RegistryError> {
        let row: Result<(String,), sqlx::Error> = sqlx::query_as(&format!(
            "SELECT ST_GeometryType(geometry) FROM \"{schema}\".\"{table}\" LIMIT 1"
        ))
        .fetch_one(pool)
        .await;
        match row {
            Ok((name,)) => {
                Ok(crate::analysis::GeometryKind::from_postgis_name(name.trim_start_matches("ST_")))
            }
            Err(sqlx::Error::RowNotFound) => Ok(crate::analysis::GeometryKind::NotFound),
            Err(sqlx::Error::Database(_)) => Ok(crate::analysis::GeometryKind::NotFound),
            Err(e) => Err(RegistryError::Database(e)),
        }
    }

    pub fn geometry_kind(&self, schema: &str, table: &str) -> Option<crate::analysis::GeometryKind> {
        self.tables.read().unwrap().get(&format!("{schema}.{table}")).map(|t| t.geometry_kind)
    }

    pub fn get(&self, qualified_name: &str) -> Option<TableDescriptor> {
        self.tables.read().unwrap().get(qualified_name).cloned()
    }

    pub fn schemas(&self) -> Vec<String> {
        let mut schemas: Vec<String> =
            self.tables.read().unwrap().values().map(|t| t.schema_name.clone()).collect();
        schemas.sort();
        schemas.dedup();
        schemas
    }

    /// Multi-criteria lookup mirroring `TableRegistry.__getitem__`: by exact
    /// table, by schema (analysis namespace), or by field projection
    /// (columns filtered per table, empty-intersection tables dropped).
    pub fn select(&self, selector: Selector<'_>) -> Vec<TableDescriptor> {
        let tables = self.tables.read().unwrap();
        match selector {
            Selector::Table(name) => tables
                .values()
                .filter(|t| t.name == name || t.qualified_name() == name)
                .cloned()
                .collect(),
            Selector::Schema(schema) => {
                tables.values().filter(|t| t.schema_name == schema).cloned().collect()
            }
            Selector::Fields(fields) => {
                tables.values().filter_map(|t| t.filter(fields)).collect()
            }
        }
    }

    /// Applies a sequence of selectors left-to-right, each one narrowing the
    /// result of the previous — e.g. `[Schema("base"), Fields(["owner"])]`
    /// finds every base-schema table projected down to just `owner`.
    /// Mirrors `TableRegistry.__getitem__` being called with a chain of
    /// keys in the source.
    pub fn select_many(&self, selectors: &[Selector<'_>]) -> Vec<TableDescriptor> {
        let mut current: Option<Vec<TableDescriptor>> = None;
        for selector in selectors {
            let next = match &current {
                None => self.select(*selector),
                Some(prev) => match selector {
                    Selector::Table(name) => prev
                        .iter()
                        .filter(|t| t.name == *name || t.qualified_name() == *name)
                        .cloned()
                        .collect(),
                    Selector::Schema(schema) => {
                        prev.iter().filter(|t| t.schema_name == *schema).cloned().collect()
                    }
                    Selector::Fields(fields) => {
                        prev.iter().filter_map(|t| t.filter(fields)).collect()
                    }
                },
            };
            current = Some(next);
        }
        current.unwrap_or_default()
    }

    /// Inserts an already-built descriptor, replacing any prior entry under
    /// the same qualified name. Used internally by discovery and by
    /// `register` once it has probed the database.
    pub fn insert(&self, descriptor: TableDescriptor) {
        self.tables.write().unwrap().insert(descriptor.qualified_name(), descriptor);
    }

    /// Re-discovers one table directly from the database (no tile-server
    /// round trip — analysis-created tables are not published there) and
    /// adds it to the registry, marked temporary so `cleanup` will drop it.
    /// Mirrors `table_registry.py`'s `register(id_, engine)`.
    pub async fn register(
        &self,
        pool: &PgPool,
        tileserv_base_url: &str,
        schema: &str,
        table: &str,
    ) -> Result<TableDescriptor, RegistryError> {
        let columns: Vec<(String,)> = sqlx::query_as(
            "SELECT column_name FROM information_schema.columns \
             WHERE table_schema = $1 AND table_name = $2 ORDER BY ordinal_position",
        )
        .bind(schema)
        .bind(table)
        .fetch_all(pool)
        .await?;
        let geometry_kind = Self::geometry_type(pool, schema, table).await?;
        let base_url = tileserv_base_url.trim_end_matches('/');
        let descriptor = TableDescriptor {
            name: table.to_string(),
            schema_name: schema.to_string(),
            columns: columns.into_iter().map(|(c,)| c).collect(),
            index_url: format!("{base_url}/{schema}.{table}.json"),
            tile_url: format!("{base_url}/{schema}.{table}/{{z}}/{{x}}/{{y}}.pbf"),
            bounds: Bounds::WORLD,
            geometry_kind,
            temporary: true,
        };
        self.insert(descriptor.clone());
        Ok(descriptor)
    }

    pub async fn unregister(
        &self,
        qualified_name: &str,
        runner: &SqlRunner,
        pool: &PgPool,
    ) -> Result<(), RegistryError> {
        let descriptor = self
            .tables
            .write()
            .unwrap()
            .remove(qualified_name)
            .ok_or_else(|| RegistryError::NotFound(qualified_name.to_string()))?;
        let args = TemplateArgs::new()
            .with("schema", &descriptor.schema_name)
            .with("table", &descriptor.name);
        runner.run("drop", pool, &args).await?;
        Ok(())
    }

    /// Drops every temporary table, used after an analysis session ends.
    pub async fn cleanup(&self, runner: &SqlRunner, pool: &PgPool) -> Result<(), RegistryError> {
        let temp: Vec<String> = self
            .tables
            .read()
            .unwrap()
            .values()
            .filter(|t| t.temporary)
            .map(|t| t.qualified_name())
            .collect();
        for qualified in temp {
            self.unregister(&qualified, runner, pool).await?;
        }
        Ok(())
    }

    pub async fn drop_schema(&self, schema: &str, pool: &PgPool) -> Result<(), RegistryError> {
        sqlx::query(&format!("DROP SCHEMA IF EXISTS \"{schema}\" CASCADE"))
            .execute(pool)
            .await?;
        self.tables.write().unwrap().retain(|_, t| t.schema_name != schema);
        Ok(())
    }

    /// Case-insensitive field verification across every registered table:
    /// returns the subset of `fields` that match a column on *some* table,
    /// rewritten to that table's canonical-case column name. Fields with
    /// no match anywhere are silently dropped rather than erroring
    /// (`table_registry.py`'s `verify_fields`).
    pub fn verify_fields(&self, fields: &[String]) -> Vec<String> {
        let tables = self.tables.read().unwrap();
        fields
            .iter()
            .filter_map(|f| {
                tables
                    .values()
                    .find_map(|t| t.columns.iter().find(|c| c.eq_ignore_ascii_case(f)).cloned())
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::GeometryKind;

    fn descriptor(name: &str, schema: &str, columns: &[&str]) -> TableDescriptor {
        TableDescriptor {
            name: name.to_string(),
            schema_name: schema.to_string(),
            columns: columns.iter().map(|s| s.to_string()).collect(),
            index_url: String::new(),
            tile_url: String::new(),
            bounds: Bounds::WORLD,
            geometry_kind: GeometryKind::MultiPolygon,
            temporary: false,
        }
    }

    #[test]
    fn filter_drops_tables_with_empty_intersection() {
        let t = descriptor("parcels", "base", &["id", "owner"]);
        assert!(t.filter(&["acreage".to_string()]).is_none());
        assert!(t.filter(&["owner".to_string()]).is_some());
    }

    #[test]
    fn select_by_schema_returns_matching_tables() {
        let registry = TableRegistry::new();
        registry.insert(descriptor("parcels", "base", &["id"]));
        registry.insert(descriptor("roads", "base", &["id"]));
        registry.insert(descriptor("buffered", "an_1", &["id"]));
        let found = registry.select(Selector::Schema("base"));
        assert_eq!(found.len(), 2);
    }

    #[test]
    fn world_default_bounds_use_standard_ordering() {
        assert_eq!(Bounds::WORLD.west, -180.0);
        assert_eq!(Bounds::WORLD.south, -90.0);
        assert_eq!(Bounds::WORLD.east, 180.0);
        assert_eq!(Bounds::WORLD.north, 90.0);
    }

    #[test]
    fn select_many_applies_selectors_left_to_right() {
        let registry = TableRegistry::new();
        registry.insert(descriptor("parcels", "base", &["id", "owner"]));
        registry.insert(descriptor("roads", "base", &["id"]));
        let found = registry.select_many(&[
            Selector::Schema("base"),
            Selector::Fields(&["owner".to_string()]),
        ]);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].name, "parcels");
        assert_eq!(found[0].columns, vec!["owner".to_string()]);
    }

    #[test]
    fn verify_fields_returns_canonical_case() {
        let registry = TableRegistry::new();
        registry.insert(descriptor("parcels", "base", &["OwnerName"]));
        let result = registry.verify_fields(&["ownername".to_string()]);
        assert_eq!(result, vec!["OwnerName".to_string()]);
    }

    #[test]
    fn verify_fields_drops_non_matching_fields_across_all_tables() {
        let registry = TableRegistry::new();
        registry.insert(descriptor("parcels", "base", &["OwnerName"]));
        registry.insert(descriptor("roads", "base", &["Length"]));
        let result = registry
            .verify_fields(&["ownername".to_string(), "length".to_string(), "bogus".to_string()]);
        assert_eq!(result, vec!["OwnerName".to_string(), "Length".to_string()]);
    }
}
