//! Analysis Planner/Executor.
//!
//! Validates an LLM-emitted plan against the field/table whitelists in
//! scope for the turn, resolves cross-step `Source` references to
//! fully-qualified tables, executes SQL steps sequentially (each in its own
//! transaction), post-processes every created table, and emits a `Report`.
//! Grounded on `agent/analysis/_steps.py` (`_execute`, two-phase template
//! run) and `table_registry.py` (`_postprocess`/`_create_spatial_index`).

use std::collections::HashSet;

use serde::Serialize;
use sqlx::PgPool;
use thiserror::Error;

use super::plan::{AnalysisPlan, Source};
use super::report::{Report, ReportItem};
use super::steps::{choose_geometry_kind, AnalysisStep, GeometryKind, SpatialAggregator};
use crate::dsl::DslError;
use crate::registry::TableRegistry;
use crate::sql_runner::{SqlRunner, TemplateArgs};

#[derive(Debug, Error)]
pub enum PlanError {
    #[error("invalid analysis name '{0}'")]
    InvalidName(String),
    #[error("duplicate output table '{0}' within analysis")]
    DuplicateOutputTable(String),
    #[error("step '{0}' references a later step (forward reference) at index {1}")]
    ForwardReference(String, usize),
    #[error("step '{0}' references unknown table '{1}'")]
    UnknownTable(String, String),
    #[error("step '{0}': {1}")]
    InvalidField(String, DslError),
    #[error("buffer step '{0}' requires a distance > 0, got {1}")]
    InvalidBufferDistance(String, f64),
    #[error("merge step '{0}' requires a distance for the dwithin predicate")]
    MissingDwithinDistance(String),
    #[error("sql error: {0}")]
    Sql(#[from] crate::sql_runner::SqlRunnerError),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressStatus {
    Generating,
    Processing,
    Succeeded,
    Error,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProgressEvent {
    pub id: String,
    pub query: String,
    pub step: String,
    pub status: ProgressStatus,
    pub progress: f64,
}

pub type Emitter<'a> = dyn Fn(ProgressEvent) + Send + Sync + 'a;

pub struct AnalysisExecutor {
    runner: SqlRunner,
    geometry_column: String,
    srid: i32,
    base_schema: String,
    tileserv_role: String,
}

impl AnalysisExecutor {
    pub fn new(
        runner: SqlRunner,
        geometry_column: impl Into<String>,
        srid: i32,
        base_schema: impl Into<String>,
        tileserv_role: impl Into<String>,
    ) -> Self {
        Self {
            runner,
            geometry_column: geometry_column.into(),
            srid,
            base_schema: base_schema.into(),
            tileserv_role: tileserv_role.into(),
        }
    }

    /// Validates the plan shape before any SQL runs: unique output-table
    /// names, back-reference-only `Source`s, field/table whitelist
    /// membership, and the buffer-distance-positive invariant this crate
    /// adds on top of the source's looser validation.
    pub fn validate(
        &self,
        plan: &AnalysisPlan,
        field_whitelist: &[String],
        table_whitelist: &[String],
    ) -> Result<(), PlanError> {
        if !AnalysisPlan::is_valid_name(&plan.name) {
            return Err(PlanError::InvalidName(plan.name.clone()));
        }

        let mut seen_outputs: HashSet<&str> = HashSet::new();
        for (idx, step) in plan.steps.iter().enumerate() {
            if let Some(output) = step.output_table() {
                if !seen_outputs.insert(output) {
                    return Err(PlanError::DuplicateOutputTable(output.to_string()));
                }
            }

            for source in step.source_refs() {
                match source {
                    Source::ByIndex { index } => {
                        if *index >= idx {
                            return Err(PlanError::ForwardReference(step.id().to_string(), *index));
                        }
                    }
                    Source::ByName { name } => {
                        if !table_whitelist.iter().any(|t| t == name) {
                            return Err(PlanError::UnknownTable(
                                step.id().to_string(),
                                name.clone(),
                            ));
                        }
                    }
                }
            }

            self.validate_step_fields(step, field_whitelist)?;
        }

        Ok(())
    }

    fn validate_step_fields(
        &self,
        step: &AnalysisStep,
        field_whitelist: &[String],
    ) -> Result<(), PlanError> {
        let id = step.id().to_string();
        match step {
            AnalysisStep::Filter(s) => {
                for wc in &s.where_clause {
                    wc.validate(field_whitelist).map_err(|e| PlanError::InvalidField(id.clone(), e))?;
                }
            }
            AnalysisStep::Aggregate(s) => {
                for col in &s.select {
                    col.validate(field_whitelist)
                        .map_err(|e| PlanError::InvalidField(id.clone(), e))?;
                }
            }
            AnalysisStep::Buffer(s) => {
                if s.buffer_distance <= 0.0 {
                    return Err(PlanError::InvalidBufferDistance(id, s.buffer_distance));
                }
            }
            AnalysisStep::Merge(s) => {
                if matches!(s.spatial_predicate, super::steps::SpatialPredicate::Dwithin)
                    && s.distance.is_none()
                {
                    return Err(PlanError::MissingDwithinDistance(id));
                }
            }
            AnalysisStep::PlotlyMapLayer(_) | AnalysisStep::SaveTable(_) => {}
        }
        Ok(())
    }

    fn resolve(&self, source: &Source, analysis_name: &str, outputs: &[String]) -> String {
        match source {
            Source::ByIndex { index } => format!("{analysis_name}.{}", outputs[*index]),
            Source::ByName { name } => format!("{}.{}", self.base_schema, name),
        }
    }

    /// Executes a validated plan. Assumes `validate` already succeeded.
    pub async fn execute(
        &self,
        plan: &AnalysisPlan,
        pool: &PgPool,
        registry: &TableRegistry,
        query: &str,
        emitter: Option<&Emitter<'_>>,
    ) -> Result<Report, PlanError> {
        let emit = |event: ProgressEvent| {
            if let Some(f) = emitter {
                f(event);
            }
        };

        sqlx::query(&format!("CREATE SCHEMA IF NOT EXISTS \"{}\"", plan.name))
            .execute(pool)
            .await?;
        sqlx::query(&format!(
            "GRANT USAGE ON SCHEMA \"{}\" TO {}",
            plan.name, self.tileserv_role
        ))
        .execute(pool)
        .await?;

        let mut report = Report::default();
        // outputs[i] is Some(table_name) for SQL steps, None for reporting steps.
        let mut outputs: Vec<String> = Vec::new();
        let mut created: Vec<String> = Vec::new();

        for (idx, step) in plan.steps.iter().enumerate() {
            let progress = (idx as f64) / (plan.steps.len().max(1) as f64);
            emit(ProgressEvent {
                id: plan.name.clone(),
                query: query.to_string(),
                step: step.name().to_string(),
                status: ProgressStatus::Processing,
                progress,
            });

            let result = self.execute_step(step, plan, pool, registry, &outputs).await;
            match result {
                Ok(Some(output_table)) => {
                    created.push(format!("{}.{}", plan.name, output_table));
                    outputs.push(output_table);
                }
                Ok(None) => {
                    // Reporting step: no new table, keep outputs index-aligned
                    // for any later ByIndex reference (none valid in practice,
                    // since reporting steps never appear before an index they
                    // would be referenced by, but we keep alignment regardless).
                    outputs.push(String::new());
                }
                Err(e) => {
                    emit(ProgressEvent {
                        id: plan.name.clone(),
                        query: query.to_string(),
                        step: step.name().to_string(),
                        status: ProgressStatus::Error,
                        progress,
                    });
                    self.cleanup(pool, &created, &[]).await;
                    return Err(e);
                }
            }

            if let Some(item) = self.report_item_for(step, plan, &outputs, registry) {
                report.push(item);
            }
        }

        let retained = report.retained_tables();
        self.cleanup(pool, &created, &retained).await;

        emit(ProgressEvent {
            id: plan.name.clone(),
            query: query.to_string(),
            step: "complete".to_string(),
            status: ProgressStatus::Succeeded,
            progress: 1.0,
        });

        Ok(report)
    }

    async fn cleanup(&self, pool: &PgPool, created: &[String], retained: &[String]) {
        for qualified in created {
            if retained.iter().any(|r| r == qualified) {
                continue;
            }
            let Some((schema, table)) = qualified.split_once('.') else { continue };
            let args = TemplateArgs::new().with("schema", schema).with("table", table);
            if let Err(e) = self.runner.run("drop", pool, &args).await {
                tracing::warn!(table = %qualified, error = %e, "failed to drop intermediate table");
            }
        }
    }

    fn report_item_for(
        &self,
        step: &AnalysisStep,
        plan: &AnalysisPlan,
        outputs: &[String],
        registry: &TableRegistry,
    ) -> Option<ReportItem> {
        match step {
            AnalysisStep::Filter(_)
            | AnalysisStep::Merge(_)
            | AnalysisStep::Buffer(_)
            | AnalysisStep::Aggregate(_) => {
                let output_table = step.output_table()?;
                let columns = self.projected_columns(step, plan, outputs, registry);
                Some(ReportItem::TableCreated {
                    name: step.name().to_string(),
                    reason: reasoning(step).to_string(),
                    table: format!("{}.{}", plan.name, output_table),
                    columns,
                })
            }
            AnalysisStep::PlotlyMapLayer(s) => {
                let resolved = self.resolve(&s.source_table, &plan.name, outputs);
                Some(ReportItem::MapLayerArguments {
                    name: s.name.clone(),
                    reason: s.reasoning.clone(),
                    layer_id: s.layer_id.clone(),
                    source_table: resolved,
                    color: s.color.clone(),
                })
            }
            AnalysisStep::SaveTable(s) => {
                let resolved = self.resolve(&s.source_table, &plan.name, outputs);
                let (schema, table) = resolved.split_once('.').unwrap_or((&plan.name, &resolved));
                Some(ReportItem::SaveTable { schema: schema.to_string(), table: table.to_string() })
            }
        }
    }

    /// Best-effort list of the columns an SQL step's output table carries,
    /// for the `TableCreated` reporting item. Derived from the step's own
    /// select list where one exists; a plain buffer step preserves every
    /// column of its source table, so that case is looked up in the
    /// registry instead.
    fn projected_columns(
        &self,
        step: &AnalysisStep,
        plan: &AnalysisPlan,
        outputs: &[String],
        registry: &TableRegistry,
    ) -> Vec<String> {
        match step {
            AnalysisStep::Filter(s) => s.select.iter().map(|c| c.output_name().to_string()).collect(),
            AnalysisStep::Aggregate(s) => s
                .select
                .iter()
                .map(|c| c.output_name())
                .chain(s.group_by.iter().map(|c| c.output_name().to_string()))
                .collect(),
            AnalysisStep::Merge(s) => s
                .left_select
                .iter()
                .map(|c| c.output_name().to_string())
                .chain(s.right_select.iter().map(|c| c.output_name().to_string()))
                .chain(std::iter::once(self.geometry_column.clone()))
                .collect(),
            AnalysisStep::Buffer(s) => {
                let qualified = self.resolve(&s.from_table, &plan.name, outputs);
                qualified
                    .split_once('.')
                    .and_then(|(schema, table)| registry.get(&format!("{schema}.{table}")))
                    .map(|t| t.columns.clone())
                    .unwrap_or_default()
            }
            _ => vec![],
        }
    }

    async fn execute_step(
        &self,
        step: &AnalysisStep,
        plan: &AnalysisPlan,
        pool: &PgPool,
        registry: &TableRegistry,
        outputs: &[String],
    ) -> Result<Option<String>, PlanError> {
        if !step.is_sql_step() {
            return Ok(None);
        }

        let resolved_sources: Vec<String> =
            step.source_refs().iter().map(|s| self.resolve(s, &plan.name, outputs)).collect();

        let mut kinds: Vec<GeometryKind> = Vec::new();
        for qualified in &resolved_sources {
            if let Some((schema, table)) = qualified.split_once('.') {
                kinds.push(registry.geometry_kind(schema, table).unwrap_or(GeometryKind::NotFound));
            }
        }
        let gtype = match step {
            AnalysisStep::Aggregate(s)
                if s.spatial_aggregator == Some(SpatialAggregator::Extent) =>
            {
                GeometryKind::GeometryCollection
            }
            _ => choose_geometry_kind(&kinds),
        };

        let output_table = step.output_table().unwrap().to_string();
        let mut tx = pool.begin().await?;

        let args = self.build_template_args(step, plan, &resolved_sources, gtype);
        let template_name = step.template_name().unwrap();
        match self.runner.run_in_tx(template_name, &mut tx, &args).await {
            Ok(_) => {}
            Err(e) => {
                let _ = tx.rollback().await;
                return Err(PlanError::Sql(e));
            }
        }
        tx.commit().await?;

        let post_args = TemplateArgs::new()
            .with("schema", &plan.name)
            .with("table", &output_table)
            .with("geometry_column", &self.geometry_column)
            .with("tileserv_role", &self.tileserv_role);
        self.runner.run("postprocess", pool, &post_args).await?;

        Ok(Some(output_table))
    }

    fn build_template_args(
        &self,
        step: &AnalysisStep,
        plan: &AnalysisPlan,
        resolved_sources: &[String],
        gtype: GeometryKind,
    ) -> TemplateArgs {
        let base = TemplateArgs::new()
            .with("schema", &plan.name)
            .with("geometry_column", &self.geometry_column)
            .with("srid", self.srid)
            .with("gtype", format!("{gtype:?}"));

        match step {
            AnalysisStep::Filter(s) => {
                let (schema, table) =
                    resolved_sources[0].split_once('.').unwrap_or(("public", &resolved_sources[0]));
                let select = s.select.iter().map(|c| c.to_sql_fragment()).collect::<Vec<_>>().join(", ");
                let where_sql = if s.where_clause.is_empty() {
                    String::new()
                } else {
                    format!(
                        "WHERE {}",
                        s.where_clause.iter().map(|w| w.to_sql_fragment()).collect::<Vec<_>>().join(" AND ")
                    )
                };
                let order_by = if s.order_by.is_empty() {
                    String::new()
                } else {
                    let cols = s.order_by.iter().map(|c| c.to_sql_fragment()).collect::<Vec<_>>().join(", ");
                    format!("ORDER BY {} {}", cols, if s.order_desc { "DESC" } else { "ASC" })
                };
                let limit = if s.limit > 0 { format!("LIMIT {}", s.limit) } else { String::new() };
                base.with("output_table", &s.output_table)
                    .with("from_schema", schema)
                    .with("from_table", table)
                    .with("select", select)
                    .with("where", where_sql)
                    .with("order_by", order_by)
                    .with("limit", limit)
            }
            AnalysisStep::Merge(s) => {
                let (left_schema, left_table) =
                    resolved_sources[0].split_once('.').unwrap_or(("public", &resolved_sources[0]));
                let (right_schema, right_table) =
                    resolved_sources[1].split_once('.').unwrap_or(("public", &resolved_sources[1]));
                let select = s
                    .left_select
                    .iter()
                    .map(|c| format!("l.{}", c.to_sql_fragment()))
                    .chain(s.right_select.iter().map(|c| format!("r.{}", c.to_sql_fragment())))
                    .collect::<Vec<_>>()
                    .join(", ");
                let predicate = match s.spatial_predicate {
                    super::steps::SpatialPredicate::Intersects => {
                        format!("ST_Intersects(l.{0}, r.{0})", self.geometry_column)
                    }
                    super::steps::SpatialPredicate::Contains => {
                        format!("ST_Contains(l.{0}, r.{0})", self.geometry_column)
                    }
                    super::steps::SpatialPredicate::Within => {
                        format!("ST_Within(l.{0}, r.{0})", self.geometry_column)
                    }
                    super::steps::SpatialPredicate::Dwithin => {
                        format!(
                            "ST_DWithin(l.{0}, r.{0}, {1})",
                            self.geometry_column,
                            s.distance.unwrap_or(0.0)
                        )
                    }
                };
                let geometry_expr = match s.spatial_aggregator {
                    Some(SpatialAggregator::Collect) => format!("ST_Collect(l.{0}, r.{0})", self.geometry_column),
                    Some(SpatialAggregator::Union) => format!("ST_Union(l.{0}, r.{0})", self.geometry_column),
                    Some(SpatialAggregator::Centroid) => format!("ST_Centroid(l.{0})", self.geometry_column),
                    Some(SpatialAggregator::Envelope) => format!("ST_Envelope(l.{0})", self.geometry_column),
                    Some(SpatialAggregator::Convexhull) => format!("ST_ConvexHull(l.{0})", self.geometry_column),
                    Some(SpatialAggregator::Concavehull) => format!("ST_ConcaveHull(l.{0}, 0.8)", self.geometry_column),
                    Some(SpatialAggregator::Extent) => format!("ST_Extent(l.{0})", self.geometry_column),
                    None => format!("l.{0}", self.geometry_column),
                };
                base.with("output_table", &s.output_table)
                    .with("left_schema", left_schema)
                    .with("left_table", left_table)
                    .with("right_schema", right_schema)
                    .with("right_table", right_table)
                    .with("select", select)
                    .with("join_predicate", predicate)
                    .with("geometry_expr", geometry_expr)
            }
            AnalysisStep::Buffer(s) => {
                let (schema, table) =
                    resolved_sources[0].split_once('.').unwrap_or(("public", &resolved_sources[0]));
                let meters = match s.buffer_unit {
                    super::steps::BufferUnit::Meters => s.buffer_distance,
                    super::steps::BufferUnit::Kilometers => s.buffer_distance * 1000.0,
                };
                base.with("output_table", &s.output_table)
                    .with("from_schema", schema)
                    .with("from_table", table)
                    .with("buffer_distance_meters", meters)
            }
            AnalysisStep::Aggregate(s) => {
                let (schema, table) =
                    resolved_sources[0].split_once('.').unwrap_or(("public", &resolved_sources[0]));
                let select = s.select.iter().map(|c| c.to_sql_fragment()).collect::<Vec<_>>().join(", ");
                // An empty group_by is a global aggregate over the whole
                // table (e.g. a bare COUNT(*) or ST_Extent) rather than a
                // grouped one; omit the projection and the GROUP BY clause
                // entirely rather than rendering a trailing comma or an
                // empty GROUP BY, both invalid SQL.
                let group_by_projection = if s.group_by.is_empty() {
                    String::new()
                } else {
                    let cols = s.group_by.iter().map(|c| c.to_sql_fragment()).collect::<Vec<_>>().join(", ");
                    format!(",\n    {cols}")
                };
                let group_by_clause = if s.group_by.is_empty() {
                    String::new()
                } else {
                    let cols =
                        s.group_by.iter().map(|c| format!("\"{}\"", c.column)).collect::<Vec<_>>().join(", ");
                    format!("GROUP BY {cols}")
                };
                base.with("output_table", &s.output_table)
                    .with("from_schema", schema)
                    .with("from_table", table)
                    .with("select", select)
                    .with("group_by_projection", group_by_projection)
                    .with("group_by_clause", group_by_clause)
            }
            AnalysisStep::PlotlyMapLayer(_) | AnalysisStep::SaveTable(_) => base,
        }
    }
}

fn reasoning(step: &AnalysisStep) -> &str {
    match step {
        AnalysisStep::Filter(s) => &s.reasoning,
        AnalysisStep::Merge(s) => &s.reasoning,
        AnalysisStep::Buffer(s) => &s.reasoning,
        AnalysisStep::Aggregate(s) => &s.reasoning,
        AnalysisStep::PlotlyMapLayer(s) => &s.reasoning,
        AnalysisStep::SaveTable(s) => &s.reasoning,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::steps::{BufferStep, BufferUnit, FilterStep};

    fn buffer_step(distance: f64) -> AnalysisStep {
        AnalysisStep::Buffer(BufferStep {
            id: "s1".into(),
            name: "buffer".into(),
            reasoning: "test".into(),
            from_table: Source::by_name("parcels"),
            buffer_distance: distance,
            buffer_unit: BufferUnit::Meters,
            output_table: "buffered".into(),
        })
    }

    fn executor() -> AnalysisExecutor {
        AnalysisExecutor::new(SqlRunner::new("templates"), "geometry", 3857, "base", "pg_database_owner")
    }

    #[test]
    fn rejects_non_positive_buffer_distance() {
        let plan = AnalysisPlan { name: "an_1".into(), steps: vec![buffer_step(0.0)] };
        let whitelist = vec!["parcels".to_string()];
        let err = executor().validate(&plan, &[], &whitelist).unwrap_err();
        assert!(matches!(err, PlanError::InvalidBufferDistance(_, _)));
    }

    #[test]
    fn accepts_positive_buffer_distance() {
        let plan = AnalysisPlan { name: "an_1".into(), steps: vec![buffer_step(100.0)] };
        let whitelist = vec!["parcels".to_string()];
        assert!(executor().validate(&plan, &[], &whitelist).is_ok());
    }

    #[test]
    fn rejects_forward_reference() {
        let step = AnalysisStep::Filter(FilterStep {
            id: "s1".into(),
            name: "filter".into(),
            reasoning: "t".into(),
            select: vec![],
            from_table: Source::by_index(1),
            where_clause: vec![],
            order_by: vec![],
            order_desc: false,
            limit: 0,
            output_table: "out1".into(),
        });
        let plan = AnalysisPlan { name: "an_1".into(), steps: vec![step, buffer_step(10.0)] };
        let err = executor().validate(&plan, &[], &["parcels".to_string()]).unwrap_err();
        assert!(matches!(err, PlanError::ForwardReference(_, _)));
    }

    #[test]
    fn rejects_duplicate_output_table_names() {
        let plan = AnalysisPlan {
            name: "an_1".into(),
            steps: vec![buffer_step(10.0), buffer_step(20.0)],
        };
        let whitelist = vec!["parcels".to_string()];
        let err = executor().validate(&plan, &[], &whitelist).unwrap_err();
        assert!(matches!(err, PlanError::DuplicateOutputTable(_)));
    }

    #[test]
    fn rejects_invalid_analysis_name() {
        let plan = AnalysisPlan { name: "Not Valid!".into(), steps: vec![] };
        let err = executor().validate(&plan, &[], &[]).unwrap_err();
        assert!(matches!(err, PlanError::InvalidName(_)));
    }
}
