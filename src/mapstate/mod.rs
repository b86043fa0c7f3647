//! Map State Handler: a per-session projection of the desired map as an
//! ordered set of vector-tile layers, each bound to a table and an encoded
//! attribute filter.
//!
//! Grounded on `original_source/geo_assistant/handlers/_map_handler.py`'s
//! `MapHandler`, generalized from a single cached active table to the
//! ordered multi-layer model (one map can show several tables at once).
//! `get_latlong_data` is carried over as `query_point`, run against the
//! most recently touched layer's source table (the source's
//! `self.active_tables[0]`).

use serde::{Deserialize, Serialize};

use crate::dsl::HandlerFilter;
use crate::registry::{Bounds, TableDescriptor, TableRegistry};
use crate::sql_runner::{RowMapping, SqlRunner, SqlRunnerError, TemplateArgs};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LayerStyle {
    Line,
    Fill,
}

/// One entry in the map state: a table bound to a style, color, and the
/// handler filters that narrowed it, with the composed tile URL the
/// front-end actually requests.
#[derive(Debug, Clone, Serialize)]
pub struct LayerSpec {
    pub layer_id: String,
    pub source_table: String,
    pub style: LayerStyle,
    pub color: String,
    pub filters: Vec<HandlerFilter>,
    pub url: String,
}

/// Summary shape exported by `status()`, scoped down to what the agent's
/// next system prompt needs (no internal `source_table` bookkeeping).
#[derive(Debug, Clone, Serialize)]
pub struct LayerStatus {
    pub layer_id: String,
    pub color: String,
    pub style: LayerStyle,
    pub filters: Vec<HandlerFilter>,
}

impl From<&LayerSpec> for LayerStatus {
    fn from(spec: &LayerSpec) -> Self {
        LayerStatus {
            layer_id: spec.layer_id.clone(),
            color: spec.color.clone(),
            style: spec.style,
            filters: spec.filters.clone(),
        }
    }
}

/// A bounding box plus the centre/zoom derived from it, suitable for
/// driving a map front-end's initial view.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct Viewport {
    pub center_lon: f64,
    pub center_lat: f64,
    pub zoom: f64,
    pub bounds: Bounds,
}

impl Viewport {
    pub fn world() -> Self {
        Self::from_bounds(&Bounds::WORLD)
    }

    pub fn from_bounds(bounds: &Bounds) -> Self {
        let center_lon = (bounds.west + bounds.east) / 2.0;
        let center_lat = (bounds.south + bounds.north) / 2.0;
        let lon_span = (bounds.east - bounds.west).abs();
        let lat_span = (bounds.north - bounds.south).abs();
        let max_span = lon_span.max(lat_span).max(f64::MIN_POSITIVE);
        let zoom = -(max_span / 360.0).log2();
        Self { center_lon, center_lat, zoom, bounds: *bounds }
    }
}

/// Per-session map state. Owned by the session's turn loop; nothing
/// outside it mutates this directly.
#[derive(Debug, Default)]
pub struct MapState {
    layers: Vec<LayerSpec>,
}

impl MapState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a layer, or replaces the existing one with the same id in
    /// place (position is preserved on replace, matching the source's
    /// dict-keyed layer map).
    pub fn add_layer(
        &mut self,
        table: &TableDescriptor,
        layer_id: impl Into<String>,
        color: impl Into<String>,
        filters: Vec<HandlerFilter>,
        style: LayerStyle,
    ) {
        let layer_id = layer_id.into();
        let url = Self::build_url(table, &filters);
        let spec = LayerSpec {
            layer_id: layer_id.clone(),
            source_table: table.qualified_name(),
            style,
            color: color.into(),
            filters,
            url,
        };
        match self.layers.iter_mut().find(|l| l.layer_id == layer_id) {
            Some(existing) => *existing = spec,
            None => self.layers.push(spec),
        }
    }

    /// Removes a layer by id. Leaves map state unchanged if the id is not
    /// present.
    pub fn remove_layer(&mut self, layer_id: &str) {
        self.layers.retain(|l| l.layer_id != layer_id);
    }

    pub fn reset(&mut self) {
        self.layers.clear();
    }

    pub fn layers(&self) -> &[LayerSpec] {
        &self.layers
    }

    /// Union of every referenced table's bounds, or the whole world when
    /// no layer exists.
    pub fn viewport(&self, registry: &TableRegistry) -> Viewport {
        let mut bounds: Option<Bounds> = None;
        for layer in &self.layers {
            if let Some(table) = registry.get(&layer.source_table) {
                bounds = Some(match bounds {
                    Some(b) => b.union(&table.bounds),
                    None => table.bounds,
                });
            }
        }
        bounds.map(|b| Viewport::from_bounds(&b)).unwrap_or_else(Viewport::world)
    }

    /// Ordered summary suitable for inclusion in the agent's next system
    /// prompt.
    pub fn status(&self) -> Vec<LayerStatus> {
        self.layers.iter().map(LayerStatus::from).collect()
    }

    fn build_url(table: &TableDescriptor, filters: &[HandlerFilter]) -> String {
        if filters.is_empty() {
            table.tile_url.clone()
        } else {
            let cql = filters.iter().map(|f| f.to_cql()).collect::<Vec<_>>().join("%20AND%20");
            format!("{}?filter={}", table.tile_url, cql)
        }
    }

    /// Runs the `lat_long` template against the most recently touched
    /// layer's source table, returning the rows whose geometry lies within
    /// `tolerance_meters` of the given point. Returns `None` when no layer
    /// is active, mirroring the source's empty-list fallback.
    pub async fn query_point(
        &self,
        runner: &SqlRunner,
        pool: &sqlx::PgPool,
        geometry_column: &str,
        lat: f64,
        lon: f64,
        tolerance_meters: f64,
    ) -> Result<Option<Vec<RowMapping>>, SqlRunnerError> {
        let Some(layer) = self.layers.first() else { return Ok(None) };
        let (schema, table) =
            layer.source_table.split_once('.').unwrap_or(("public", layer.source_table.as_str()));
        let args = TemplateArgs::new()
            .with("schema", schema)
            .with("table", table)
            .with("geometry_column", geometry_column)
            .with("lat", lat)
            .with("lon", lon)
            .with("tolerance_meters", tolerance_meters);
        let rows = runner.run("lat_long", pool, &args).await?;
        Ok(Some(rows.unwrap_or_default()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::GeometryKind;

    fn table(name: &str, schema: &str, bounds: Bounds) -> TableDescriptor {
        TableDescriptor {
            name: name.to_string(),
            schema_name: schema.to_string(),
            columns: vec!["id".to_string()],
            index_url: String::new(),
            tile_url: format!("https://tiles.example/{schema}.{name}/{{z}}/{{x}}/{{y}}.pbf"),
            bounds,
            geometry_kind: GeometryKind::MultiPolygon,
            temporary: false,
        }
    }

    #[test]
    fn adding_layer_with_existing_id_replaces_in_place() {
        let mut state = MapState::new();
        let t = table("parcels", "base", Bounds::WORLD);
        state.add_layer(&t, "layer-1", "#ff0000", vec![], LayerStyle::Fill);
        state.add_layer(&t, "other", "#00ff00", vec![], LayerStyle::Line);
        state.add_layer(&t, "layer-1", "#0000ff", vec![], LayerStyle::Fill);

        assert_eq!(state.layers().len(), 2);
        assert_eq!(state.layers()[0].layer_id, "layer-1");
        assert_eq!(state.layers()[0].color, "#0000ff");
    }

    #[test]
    fn removing_unknown_id_leaves_state_unchanged() {
        let mut state = MapState::new();
        let t = table("parcels", "base", Bounds::WORLD);
        state.add_layer(&t, "layer-1", "#ff0000", vec![], LayerStyle::Fill);
        state.remove_layer("nope");
        assert_eq!(state.layers().len(), 1);
    }

    #[test]
    fn filters_are_joined_into_the_tile_url() {
        let mut state = MapState::new();
        let t = table("parcels", "base", Bounds::WORLD);
        let filter = HandlerFilter {
            field: "borough".to_string(),
            value: crate::dsl::SqlValue::Text("BK".to_string()),
            op: crate::dsl::HandlerOperator::Equal,
        };
        state.add_layer(&t, "layer-1", "#ff0000", vec![filter], LayerStyle::Fill);
        assert!(state.layers()[0].url.contains("?filter="));
    }

    #[test]
    fn empty_state_defaults_viewport_to_world() {
        let state = MapState::new();
        let registry = TableRegistry::new();
        let viewport = state.viewport(&registry);
        assert_eq!(viewport.bounds, Bounds::WORLD);
    }

    #[test]
    fn viewport_unions_bounds_of_referenced_tables() {
        let mut state = MapState::new();
        let registry = TableRegistry::new();
        let t1 = table("parcels", "base", Bounds { west: -10.0, south: -5.0, east: 0.0, north: 5.0 });
        let t2 = table("roads", "base", Bounds { west: 0.0, south: 0.0, east: 10.0, north: 8.0 });
        registry.insert(t1.clone());
        registry.insert(t2.clone());
        state.add_layer(&t1, "a", "#fff", vec![], LayerStyle::Fill);
        state.add_layer(&t2, "b", "#000", vec![], LayerStyle::Line);

        let viewport = state.viewport(&registry);
        assert_eq!(viewport.bounds, Bounds { west: -10.0, south: -5.0, east: 10.0, north: 8.0 });
        assert_eq!(viewport.center_lon, 0.0);
        assert_eq!(viewport.center_lat, 1.5);
    }
}
