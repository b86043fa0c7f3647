//! The concrete geospatial assistant: system-message builder, the
//! "filter" tool sub-type, and the four user-facing tools
//! (`add_map_layer`, `remove_map_layer`, `reset_map`, `run_analysis`).
//!
//! Grounded on `original_source/geo_assistant/agent/_agent.py`'s
//! `GeoAgent` — the `#[derive]`-free `Agent<SessionContext>` assembled
//! here is the declarative-registration target
//! `original_source/geo_assistant/agent/_base.py`'s decorators would
//! have produced via reflection; see `src/agent/mod.rs`'s module doc for
//! why that reflection step has no direct Rust analogue.

use std::sync::Arc;

use serde_json::{Map, Value};

use crate::agent::{Agent, BoxFuture, EnumResolver, ToolSpec, ToolTypeSpec};
use crate::analysis::{AnalysisPlan, ProgressEvent, ProgressStatus};
use crate::dsl::{HandlerFilter, HandlerOperator, SqlValue};
use crate::mapstate::LayerStyle;
use crate::registry::Selector;
use crate::session::SessionContext;

const SYSTEM_MESSAGE_TEMPLATE: &str = "\
You are a geo-assistant who is an expert at making maps in GIS software. You will be given access
to a large dataset of GeoJSON data, and you are tasked to keep the map in a state that best reflects
the conversation with the user.

To do so, you will be given access to the following tools:
  - add_map_layer: You can add a new layer to the map, with the filters and color of your choosing
  - remove_map_layer: You can remove a layer when it is no longer applicable to the conversation
  - reset_map: You can reset the map to have 0 layers and start over
  - run_analysis: You can request a spatial analysis when a question needs more than a filtered view

Here is the current status of the map:
{map_status}

Here is any other relevant information:
{context}

Here are the tables that are available:
{tables}

When the user makes a request:
1. Look at the fields available
2. See what tables the fields are associated with
3. Analyze if the request requires data across tables
    a. If yes, then request an analysis
    b. If no, then add map layers
";

const ANALYSIS_SYSTEM_MESSAGE_TEMPLATE: &str = "\
You are planning a spatial analysis over a PostGIS database. Produce a JSON object with the shape
{{\"name\": \"<snake_case analysis name>\", \"steps\": [...]}} where each step carries a
\"step_type\" field set to one of: \"filter\", \"merge\", \"buffer\", \"aggregate\", \"addLayer\"
(a map-layer reporting step), \"saveTable\" (a persistence-marking step). Only reference the
fields and tables listed below; any other name will be rejected.

Fields available for this analysis:
{field_definitions}

Tables available for this analysis:
{tables}

Other relevant context:
{context}
";

/// Builds the concrete geospatial assistant: one system-message builder,
/// the `filter` tool sub-type, and the four tools described in spec §4.8
/// via the `original_source` tool definitions above.
pub fn build() -> Agent<SessionContext> {
    Agent::new(Arc::new(|ctx: Arc<SessionContext>, user_message: String| {
        Box::pin(system_message(ctx, user_message)) as BoxFuture<String>
    }))
    .with_tool_type(filter_tool_type())
    .with_tool(add_map_layer_tool())
    .with_tool(remove_map_layer_tool())
    .with_tool(reset_map_tool())
    .with_tool(run_analysis_tool())
}

async fn system_message(ctx: Arc<SessionContext>, user_message: String) -> String {
    let tables = ctx.app.registry.select(Selector::Schema(&ctx.app.config.database.base_schema));
    let table_names: Vec<&str> = tables.iter().map(|t| t.name.as_str()).collect();

    let context = match ctx.app.supplemental.query(&ctx.app.llm, &user_message, 3).await {
        Ok(hits) => hits.iter().map(|h| h.metadata.markdown.clone()).collect::<Vec<_>>().join("\n\n"),
        Err(e) => {
            tracing::warn!(error = %e, "failed to query supplemental info store for system message");
            String::new()
        }
    };

    let map_status = serde_json::to_string(&ctx.map_state.lock().await.status()).unwrap_or_default();

    SYSTEM_MESSAGE_TEMPLATE
        .replace("{map_status}", &map_status)
        .replace("{context}", &context)
        .replace("{tables}", &serde_json::to_string(&table_names).unwrap_or_default())
}

/// The "filter" sub-type: one CQL/SQL filter clause, `field` drawn from
/// the field document store so the model only ever names a real column.
fn filter_tool_type() -> ToolTypeSpec<SessionContext> {
    ToolTypeSpec {
        name: "filter".to_string(),
        description: "One filter clause applied to a map layer's source table".to_string(),
        build: Arc::new(|ctx: Arc<SessionContext>, user_message: String| {
            Box::pin(async move {
                let fields = match ctx.app.fields.query(&ctx.app.llm, &user_message, 10).await {
                    Ok(hits) => hits.into_iter().map(|h| h.metadata.name).collect::<Vec<_>>(),
                    Err(e) => {
                        tracing::warn!(error = %e, "failed to query field store for filter type");
                        Vec::new()
                    }
                };
                let mut props = Map::new();
                props.insert(
                    "field".to_string(),
                    serde_json::json!({ "type": "string", "enum": fields }),
                );
                props.insert(
                    "op".to_string(),
                    serde_json::json!({
                        "type": "string",
                        "enum": ["equal", "greaterThan", "lessThan", "greaterThanOrEqual",
                                 "lessThanOrEqual", "notEqual", "contains"],
                    }),
                );
                props.insert("value".to_string(), serde_json::json!({ "type": "string" }));
                props
            }) as BoxFuture<Map<String, Value>>
        }),
    }
}

fn parse_handler_operator(op: &str) -> Option<HandlerOperator> {
    match op {
        "equal" => Some(HandlerOperator::Equal),
        "greaterThan" => Some(HandlerOperator::GreaterThan),
        "lessThan" => Some(HandlerOperator::LessThan),
        "greaterThanOrEqual" => Some(HandlerOperator::GreaterThanOrEqual),
        "lessThanOrEqual" => Some(HandlerOperator::LessThanOrEqual),
        "notEqual" => Some(HandlerOperator::NotEqual),
        "contains" => Some(HandlerOperator::Contains),
        _ => None,
    }
}

fn parse_filters(value: &Value) -> Result<Vec<HandlerFilter>, String> {
    let Some(items) = value.as_array() else { return Ok(Vec::new()) };
    items
        .iter()
        .map(|item| {
            let field = item["field"].as_str().ok_or("filter is missing 'field'")?.to_string();
            let op_str = item["op"].as_str().ok_or("filter is missing 'op'")?;
            let op = parse_handler_operator(op_str).ok_or_else(|| format!("unknown filter op '{op_str}'"))?;
            let value = item["value"].as_str().ok_or("filter is missing 'value'")?.to_string();
            Ok(HandlerFilter { field, value: SqlValue::Text(value), op })
        })
        .collect()
}

fn add_map_layer_tool() -> ToolSpec<SessionContext> {
    let mut properties = Map::new();
    properties.insert(
        "table".to_string(),
        serde_json::json!({ "type": "string", "enum": "$dynamic:base_tables" }),
    );
    properties.insert("layer_id".to_string(), serde_json::json!({ "type": "string" }));
    properties
        .insert("style".to_string(), serde_json::json!({ "type": "string", "enum": ["line", "fill"] }));
    properties.insert(
        "color".to_string(),
        serde_json::json!({ "type": "string", "description": "A hex value for the color of the layer" }),
    );
    properties.insert(
        "filters".to_string(),
        serde_json::json!({ "type": "array", "items": { "type": "#filter" } }),
    );

    let mut enum_resolvers = std::collections::HashMap::new();
    let base_tables_resolver: EnumResolver<SessionContext> = Arc::new(|ctx: &SessionContext| {
        ctx.app
            .registry
            .select(Selector::Schema(&ctx.app.config.database.base_schema))
            .into_iter()
            .map(|t| Value::String(t.name))
            .collect()
    });
    enum_resolvers.insert("base_tables".to_string(), base_tables_resolver);

    ToolSpec {
        name: "add_map_layer".to_string(),
        description: "Add a layer to the map with optional filters".to_string(),
        properties,
        required: vec!["table".to_string(), "layer_id".to_string(), "color".to_string()],
        enum_resolvers,
        handler: Arc::new(|args, ctx: Arc<SessionContext>| {
            Box::pin(async move {
                let table_name = args["table"].as_str().ok_or("'table' is required")?;
                let layer_id = args["layer_id"].as_str().ok_or("'layer_id' is required")?;
                let color = args["color"].as_str().ok_or("'color' is required")?;
                let style = match args.get("style").and_then(Value::as_str) {
                    Some("fill") => LayerStyle::Fill,
                    _ => LayerStyle::Line,
                };
                let filters = args
                    .get("filters")
                    .map(parse_filters)
                    .transpose()?
                    .unwrap_or_default();

                let table = ctx
                    .app
                    .registry
                    .select(Selector::Table(table_name))
                    .into_iter()
                    .next()
                    .ok_or_else(|| format!("table '{table_name}' is not registered"))?;

                {
                    let mut map_state = ctx.map_state.lock().await;
                    map_state.add_layer(&table, layer_id, color, filters.clone(), style);
                }
                ctx.emit_figure().await;

                let count = count_filtered_rows(&ctx, &table, &filters).await;
                match count {
                    Ok(n) => Ok(format!("Layer {layer_id} added with {n} rows")),
                    Err(e) => {
                        tracing::warn!(error = %e, "failed to count filtered rows for add_map_layer");
                        Ok(format!("Layer {layer_id} added"))
                    }
                }
            })
        }),
    }
}

async fn count_filtered_rows(
    ctx: &SessionContext,
    table: &crate::registry::TableDescriptor,
    filters: &[HandlerFilter],
) -> Result<i64, sqlx::Error> {
    let sql = if filters.is_empty() {
        format!("SELECT COUNT(*) FROM \"{}\".\"{}\"", table.schema_name, table.name)
    } else {
        let clauses: Vec<String> = filters.iter().map(HandlerFilter::to_sql).collect();
        format!(
            "SELECT COUNT(*) FROM \"{}\".\"{}\" WHERE {}",
            table.schema_name,
            table.name,
            clauses.join(" AND ")
        )
    };
    let (count,): (i64,) = sqlx::query_as(&sql).fetch_one(&ctx.app.db).await?;
    Ok(count)
}

fn remove_map_layer_tool() -> ToolSpec<SessionContext> {
    let mut properties = Map::new();
    properties.insert(
        "layer_id".to_string(),
        serde_json::json!({ "type": "string", "enum": "$dynamic:layer_ids" }),
    );

    let mut enum_resolvers = std::collections::HashMap::new();
    let layer_ids_resolver: EnumResolver<SessionContext> = Arc::new(|ctx: &SessionContext| {
        // Enum resolvers are plain sync functions, but map_state sits
        // behind an async mutex; try_lock is safe here since no tool
        // handler holds it across an `.await`. Falling back to an empty
        // enum on contention only loosens validation, it never blocks
        // removal (the handler re-reads the live set itself).
        match ctx.map_state.try_lock() {
            Ok(map_state) => map_state.layers().iter().map(|l| Value::String(l.layer_id.clone())).collect(),
            Err(_) => Vec::new(),
        }
    });
    enum_resolvers.insert("layer_ids".to_string(), layer_ids_resolver);

    ToolSpec {
        name: "remove_map_layer".to_string(),
        description: "Remove a layer by its ID".to_string(),
        properties,
        required: vec!["layer_id".to_string()],
        enum_resolvers,
        handler: Arc::new(|args, ctx: Arc<SessionContext>| {
            Box::pin(async move {
                let layer_id = args["layer_id"].as_str().ok_or("'layer_id' is required")?;
                {
                    let mut map_state = ctx.map_state.lock().await;
                    map_state.remove_layer(layer_id);
                }
                ctx.emit_figure().await;
                Ok(format!("Layer {layer_id} removed from map"))
            })
        }),
    }
}

fn reset_map_tool() -> ToolSpec<SessionContext> {
    ToolSpec {
        name: "reset_map".to_string(),
        description: "Resets the map, removing all layers".to_string(),
        properties: Map::new(),
        required: Vec::new(),
        enum_resolvers: std::collections::HashMap::new(),
        handler: Arc::new(|_args, ctx: Arc<SessionContext>| {
            Box::pin(async move {
                {
                    let mut map_state = ctx.map_state.lock().await;
                    map_state.reset();
                }
                ctx.emit_figure().await;
                Ok("Map reset".to_string())
            })
        }),
    }
}

fn run_analysis_tool() -> ToolSpec<SessionContext> {
    let mut properties = Map::new();
    properties.insert(
        "goal".to_string(),
        serde_json::json!({ "type": "string", "description": "Describe the goal of this analysis" }),
    );

    ToolSpec {
        name: "run_analysis".to_string(),
        description: "Perform an analysis by querying the PostGIS database, with optional steps \
                       such as filter, aggregate, merge, and buffer"
            .to_string(),
        properties,
        required: vec!["goal".to_string()],
        enum_resolvers: std::collections::HashMap::new(),
        handler: Arc::new(|args, ctx: Arc<SessionContext>| Box::pin(run_analysis(args, ctx))),
    }
}

/// Generates then runs a plan, registering any table it creates and
/// mirroring resulting layers into the session's map state. Mirrors
/// `GeoAgent.run_analysis`: plan generation failure and execution failure
/// both emit an `error` progress event before the handler returns its
/// failure string.
async fn run_analysis(args: Value, ctx: Arc<SessionContext>) -> Result<String, String> {
    let goal = args["goal"].as_str().ok_or("'goal' is required")?.to_string();
    let analysis_id = format!("{:x}", seahash(&goal));

    let emit = |event: ProgressEvent| {
        let _ = ctx.outbound.send(crate::transport::OutboundMessage::from(event));
    };
    emit(ProgressEvent {
        id: analysis_id.clone(),
        query: goal.clone(),
        step: "Generating analysis plan...".to_string(),
        status: ProgressStatus::Generating,
        progress: 0.0,
    });

    let field_hits = ctx
        .app
        .fields
        .query(&ctx.app.llm, &goal, 15)
        .await
        .map_err(|e| format!("failed to query field definitions: {e}"))?;
    let field_names: Vec<String> = field_hits.iter().map(|h| h.metadata.name.clone()).collect();
    let field_names = ctx.app.registry.verify_fields(&field_names);

    let base_schema = &ctx.app.config.database.base_schema;
    let tables = ctx.app.registry.select_many(&[
        Selector::Schema(base_schema),
        Selector::Fields(&field_names),
    ]);
    let table_names: Vec<String> = tables.iter().map(|t| t.name.clone()).collect();

    let context_hits = ctx
        .app
        .supplemental
        .query(&ctx.app.llm, &goal, 10)
        .await
        .map_err(|e| format!("failed to query supplemental context: {e}"))?;
    let context = context_hits.iter().map(|h| h.metadata.markdown.clone()).collect::<Vec<_>>().join("\n\n");

    let system_message = ANALYSIS_SYSTEM_MESSAGE_TEMPLATE
        .replace("{field_definitions}", &serde_json::to_string(&field_hits.iter().map(|h| &h.metadata).collect::<Vec<_>>()).unwrap_or_default())
        .replace("{tables}", &serde_json::to_string(&table_names).unwrap_or_default())
        .replace("{context}", &context);

    let plan: AnalysisPlan =
        match ctx.app.llm.parse_structured(&ctx.app.config.llm.parsing_model, &system_message, &goal).await {
            Ok(plan) => plan,
            Err(e) => {
                emit(ProgressEvent {
                    id: analysis_id.clone(),
                    query: goal.clone(),
                    step: "Analysis plan failed to generate.".to_string(),
                    status: ProgressStatus::Error,
                    progress: 1.0,
                });
                return Err(format!("failed to generate analysis plan: {e}"));
            }
        };

    if let Err(e) = ctx.app.executor.validate(&plan, &field_names, &table_names) {
        emit(ProgressEvent {
            id: analysis_id.clone(),
            query: goal.clone(),
            step: "Analysis plan is invalid.".to_string(),
            status: ProgressStatus::Error,
            progress: 1.0,
        });
        return Err(format!("generated plan failed validation: {e}"));
    }

    let emitter = |event: ProgressEvent| emit(event);
    let report = ctx
        .app
        .executor
        .execute(&plan, &ctx.app.db, &ctx.app.registry, &goal, Some(&emitter))
        .await
        .map_err(|e| {
            emit(ProgressEvent {
                id: analysis_id.clone(),
                query: goal.clone(),
                step: "Analysis execution failed.".to_string(),
                status: ProgressStatus::Error,
                progress: 1.0,
            });
            format!("analysis failed: {e}")
        })?;

    let mut summary_lines = Vec::new();
    for item in &report.items {
        match item {
            crate::analysis::ReportItem::TableCreated { name, table, .. } => {
                let (schema, table_name) = table.split_once('.').unwrap_or((plan.name.as_str(), table.as_str()));
                match ctx.app.registry.register(&ctx.app.db, &ctx.app.config.tileserver.base_url, schema, table_name).await {
                    Ok(_) => summary_lines.push(format!("created table {table} ({name})")),
                    Err(e) => tracing::warn!(table = %table, error = %e, "failed to register analysis output table"),
                }
            }
            crate::analysis::ReportItem::MapLayerArguments { name, layer_id, source_table, color, .. } => {
                if let Some(descriptor) =
                    ctx.app.registry.select(Selector::Table(source_table.as_str())).into_iter().next()
                {
                    {
                        let mut map_state = ctx.map_state.lock().await;
                        map_state.add_layer(
                            &descriptor,
                            layer_id.as_str(),
                            color.as_str(),
                            Vec::new(),
                            LayerStyle::Fill,
                        );
                    }
                    ctx.emit_figure().await;
                }
                summary_lines.push(format!("added layer {layer_id} from {name}"));
            }
            crate::analysis::ReportItem::SaveTable { schema, table } => {
                summary_lines.push(format!("saved table {schema}.{table}"));
            }
        }
    }

    emit(ProgressEvent {
        id: analysis_id,
        query: goal,
        step: "complete".to_string(),
        status: ProgressStatus::Succeeded,
        progress: 1.0,
    });

    if summary_lines.is_empty() {
        Ok("Analysis completed with no reportable artifacts.".to_string())
    } else {
        Ok(summary_lines.join("; "))
    }
}

/// Stable, non-cryptographic hash used only to derive a human-readable
/// analysis id from the user's goal text (mirrors `str(abs(hash(goal)))`
/// in the source, without depending on Python's seeded string hash).
fn seahash(text: &str) -> u64 {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    text.hash(&mut hasher);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_every_handler_operator_name() {
        for (name, expected) in [
            ("equal", HandlerOperator::Equal),
            ("greaterThan", HandlerOperator::GreaterThan),
            ("lessThan", HandlerOperator::LessThan),
            ("greaterThanOrEqual", HandlerOperator::GreaterThanOrEqual),
            ("lessThanOrEqual", HandlerOperator::LessThanOrEqual),
            ("notEqual", HandlerOperator::NotEqual),
            ("contains", HandlerOperator::Contains),
        ] {
            assert_eq!(parse_handler_operator(name), Some(expected));
        }
        assert_eq!(parse_handler_operator("bogus"), None);
    }

    #[test]
    fn parse_filters_builds_handler_filters_from_json() {
        let value = serde_json::json!([
            { "field": "borough", "op": "equal", "value": "BK" },
        ]);
        let filters = parse_filters(&value).unwrap();
        assert_eq!(filters.len(), 1);
        assert_eq!(filters[0].field, "borough");
        assert_eq!(filters[0].op, HandlerOperator::Equal);
    }

    #[test]
    fn parse_filters_rejects_unknown_operator() {
        let value = serde_json::json!([{ "field": "x", "op": "nope", "value": "1" }]);
        assert!(parse_filters(&value).is_err());
    }

    #[test]
    fn analysis_id_is_deterministic_per_goal() {
        assert_eq!(seahash("buffer the parcels"), seahash("buffer the parcels"));
        assert_ne!(seahash("buffer the parcels"), seahash("merge the parcels"));
    }

    #[test]
    fn builds_agent_with_all_four_tools() {
        let agent = build();
        assert!(agent.tool_names().contains(&"add_map_layer".to_string()));
        assert!(agent.tool_names().contains(&"remove_map_layer".to_string()));
        assert!(agent.tool_names().contains(&"reset_map".to_string()));
        assert!(agent.tool_names().contains(&"run_analysis".to_string()));
    }
}
