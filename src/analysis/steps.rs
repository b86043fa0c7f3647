//! Analysis step types.
//!
//! Grounded on `original_source/geo_assistant/agent/analysis/_steps.py`.
//! Each SQL step type knows its template name, how its fields map to
//! template inputs, and which fields are `Source` references the executor
//! must resolve before execution.

use serde::{Deserialize, Serialize};

use super::plan::Source;
use crate::dsl::{AggregateColumn, Column, WhereClause};

/// All geometry types compatible with PostGIS, plus `NotFound` for tables
/// whose geometry type could not be determined (an unregistered table).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GeometryKind {
    Point,
    MultiPoint,
    LineString,
    MultiLineString,
    Polygon,
    MultiPolygon,
    GeometryCollection,
    Geometry,
    NotFound,
}

impl GeometryKind {
    /// Parses a PostGIS `ST_GeometryType` result with the leading `ST_`
    /// prefix already stripped (matching `table_registry.py`'s
    /// `row[0].removeprefix('ST_')`).
    pub fn from_postgis_name(name: &str) -> Self {
        match name {
            "Point" => GeometryKind::Point,
            "MultiPoint" => GeometryKind::MultiPoint,
            "LineString" => GeometryKind::LineString,
            "MultiLineString" => GeometryKind::MultiLineString,
            "Polygon" => GeometryKind::Polygon,
            "MultiPolygon" => GeometryKind::MultiPolygon,
            "GeometryCollection" => GeometryKind::GeometryCollection,
            "Geometry" => GeometryKind::Geometry,
            _ => GeometryKind::NotFound,
        }
    }
}

/// Dominant-geometry-type selection rule (`choose_typmod` in the source).
pub fn choose_geometry_kind(kinds: &[GeometryKind]) -> GeometryKind {
    let is_poly = |k: &GeometryKind| matches!(k, GeometryKind::Polygon | GeometryKind::MultiPolygon);
    let is_line =
        |k: &GeometryKind| matches!(k, GeometryKind::LineString | GeometryKind::MultiLineString);
    let is_point = |k: &GeometryKind| matches!(k, GeometryKind::Point | GeometryKind::MultiPoint);

    if kinds.iter().all(is_poly) {
        GeometryKind::MultiPolygon
    } else if kinds.iter().all(is_line) {
        GeometryKind::MultiLineString
    } else if kinds.iter().all(is_point) {
        GeometryKind::MultiPoint
    } else {
        GeometryKind::GeometryCollection
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SpatialPredicate {
    Intersects,
    Contains,
    Within,
    Dwithin,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SpatialAggregator {
    Collect,
    Union,
    Centroid,
    Extent,
    Envelope,
    Convexhull,
    Concavehull,
}

impl SpatialAggregator {
    /// EXTENT returns a `Box2D`, not a geometry; every other aggregator
    /// returns a geometry value.
    pub fn returns_geometry(self) -> bool {
        !matches!(self, SpatialAggregator::Extent)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BufferUnit {
    Meters,
    Kilometers,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterStep {
    pub id: String,
    pub name: String,
    pub reasoning: String,
    pub select: Vec<Column>,
    pub from_table: Source,
    pub where_clause: Vec<WhereClause>,
    pub order_by: Vec<Column>,
    pub order_desc: bool,
    pub limit: i64,
    pub output_table: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeStep {
    pub id: String,
    pub name: String,
    pub reasoning: String,
    pub left_select: Vec<Column>,
    pub right_select: Vec<Column>,
    pub from_left_table: Source,
    pub join_right_table: Source,
    pub spatial_aggregator: Option<SpatialAggregator>,
    pub spatial_predicate: SpatialPredicate,
    /// Buffer distance in meters, required when `spatial_predicate` is `Dwithin`.
    pub distance: Option<f64>,
    pub output_table: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregateStep {
    pub id: String,
    pub name: String,
    pub reasoning: String,
    pub select: Vec<AggregateColumn>,
    pub from_table: Source,
    pub spatial_aggregator: Option<SpatialAggregator>,
    /// Empty for a global aggregate over the whole table (e.g. a bare
    /// `COUNT(*)` or `ST_Extent`); defaulted so the LLM may omit the
    /// field entirely rather than emit `[]`.
    #[serde(default)]
    pub group_by: Vec<Column>,
    pub output_table: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BufferStep {
    pub id: String,
    pub name: String,
    pub reasoning: String,
    pub from_table: Source,
    pub buffer_distance: f64,
    pub buffer_unit: BufferUnit,
    pub output_table: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlotlyMapLayerStep {
    pub id: String,
    pub name: String,
    pub reasoning: String,
    pub source_table: Source,
    pub layer_id: String,
    pub color: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SaveTableStep {
    pub id: String,
    pub name: String,
    pub reasoning: String,
    pub source_table: Source,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "step_type")]
pub enum AnalysisStep {
    #[serde(rename = "filter")]
    Filter(FilterStep),
    #[serde(rename = "merge")]
    Merge(MergeStep),
    #[serde(rename = "buffer")]
    Buffer(BufferStep),
    #[serde(rename = "aggregate")]
    Aggregate(AggregateStep),
    #[serde(rename = "addLayer")]
    PlotlyMapLayer(PlotlyMapLayerStep),
    #[serde(rename = "saveTable")]
    SaveTable(SaveTableStep),
}

impl AnalysisStep {
    pub fn id(&self) -> &str {
        match self {
            AnalysisStep::Filter(s) => &s.id,
            AnalysisStep::Merge(s) => &s.id,
            AnalysisStep::Buffer(s) => &s.id,
            AnalysisStep::Aggregate(s) => &s.id,
            AnalysisStep::PlotlyMapLayer(s) => &s.id,
            AnalysisStep::SaveTable(s) => &s.id,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            AnalysisStep::Filter(s) => &s.name,
            AnalysisStep::Merge(s) => &s.name,
            AnalysisStep::Buffer(s) => &s.name,
            AnalysisStep::Aggregate(s) => &s.name,
            AnalysisStep::PlotlyMapLayer(s) => &s.name,
            AnalysisStep::SaveTable(s) => &s.name,
        }
    }

    /// `true` for steps that run SQL and create a new table; `false` for
    /// reporting steps (`PlotlyMapLayer`, `SaveTable`).
    pub fn is_sql_step(&self) -> bool {
        matches!(
            self,
            AnalysisStep::Filter(_)
                | AnalysisStep::Merge(_)
                | AnalysisStep::Buffer(_)
                | AnalysisStep::Aggregate(_)
        )
    }

    pub fn output_table(&self) -> Option<&str> {
        match self {
            AnalysisStep::Filter(s) => Some(&s.output_table),
            AnalysisStep::Merge(s) => Some(&s.output_table),
            AnalysisStep::Buffer(s) => Some(&s.output_table),
            AnalysisStep::Aggregate(s) => Some(&s.output_table),
            AnalysisStep::PlotlyMapLayer(_) | AnalysisStep::SaveTable(_) => None,
        }
    }

    /// The `Source` references carried by this step, in field-declaration
    /// order, for cross-step resolution.
    pub fn source_refs(&self) -> Vec<&Source> {
        match self {
            AnalysisStep::Filter(s) => vec![&s.from_table],
            AnalysisStep::Merge(s) => vec![&s.from_left_table, &s.join_right_table],
            AnalysisStep::Buffer(s) => vec![&s.from_table],
            AnalysisStep::Aggregate(s) => vec![&s.from_table],
            AnalysisStep::PlotlyMapLayer(s) => vec![&s.source_table],
            AnalysisStep::SaveTable(s) => vec![&s.source_table],
        }
    }

    pub fn template_name(&self) -> Option<&'static str> {
        match self {
            AnalysisStep::Filter(_) => Some("filter"),
            AnalysisStep::Merge(_) => Some("merge"),
            AnalysisStep::Buffer(_) => Some("buffer"),
            AnalysisStep::Aggregate(_) => Some("aggregate"),
            AnalysisStep::PlotlyMapLayer(_) | AnalysisStep::SaveTable(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_polygons_choose_multipolygon() {
        let kinds = [GeometryKind::Polygon, GeometryKind::MultiPolygon];
        assert_eq!(choose_geometry_kind(&kinds), GeometryKind::MultiPolygon);
    }

    #[test]
    fn mixed_types_fall_back_to_geometry_collection() {
        let kinds = [GeometryKind::Polygon, GeometryKind::Point];
        assert_eq!(choose_geometry_kind(&kinds), GeometryKind::GeometryCollection);
    }

    #[test]
    fn all_points_choose_multipoint() {
        let kinds = [GeometryKind::Point, GeometryKind::Point];
        assert_eq!(choose_geometry_kind(&kinds), GeometryKind::MultiPoint);
    }

    #[test]
    fn extent_does_not_return_geometry() {
        assert!(!SpatialAggregator::Extent.returns_geometry());
        assert!(SpatialAggregator::Centroid.returns_geometry());
    }
}
