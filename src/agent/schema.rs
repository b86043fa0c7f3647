//! Per-turn tool-schema synthesis: resolves `#<name>` sentinel markers into
//! JSON-schema `$ref`s (with an accompanying `definitions` block scoped to
//! the sub-types a tool actually uses) and `"$dynamic:<key>"` enum markers
//! into the live enum values a `ToolSpec`'s resolver produces for the
//! current agent state.
//!
//! Grounded on `original_source/geo_assistant/agent/_base.py`'s
//! `_build_tool_defs` (the `#foo` shorthand-type convention, the
//! callable-enum convention, and "only include definitions actually used
//! by this tool").

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde_json::{Map, Value};

use super::{ToolSpec, ToolTypeSpec};
use crate::llm::ToolDefinition;

/// A resolver producing the live `enum` array for one dynamic enum marker,
/// evaluated against the agent's context at schema-synthesis time (e.g.
/// "the current set of table names", "the current set of layer ids").
pub type EnumResolver<C> = Arc<dyn Fn(&C) -> Vec<Value> + Send + Sync>;

fn resolve_value<C>(
    value: &Value,
    ctx: &C,
    enum_resolvers: &HashMap<String, EnumResolver<C>>,
    used: &mut HashSet<String>,
) -> Value {
    match value {
        Value::Object(map) => {
            if let Some(Value::String(t)) = map.get("type") {
                if let Some(name) = t.strip_prefix('#') {
                    used.insert(name.to_string());
                    return serde_json::json!({ "$ref": format!("#/definitions/{name}") });
                }
            }
            let mut resolved = Map::new();
            for (key, inner) in map {
                if key == "enum" {
                    if let Value::String(marker) = inner {
                        if let Some(enum_key) = marker.strip_prefix("$dynamic:") {
                            if let Some(resolver) = enum_resolvers.get(enum_key) {
                                resolved.insert(key.clone(), Value::Array(resolver(ctx)));
                                continue;
                            }
                        }
                    }
                }
                resolved.insert(key.clone(), resolve_value(inner, ctx, enum_resolvers, used));
            }
            Value::Object(resolved)
        }
        Value::Array(items) => {
            Value::Array(items.iter().map(|v| resolve_value(v, ctx, enum_resolvers, used)).collect())
        }
        other => other.clone(),
    }
}

/// Synthesises the full JSON-schema `parameters` object for one tool:
/// `{type: "object", properties, required, definitions?}`. Async because
/// a sub-type's `build` may need to query a document store (e.g. the
/// "filter" type's `field` enum).
pub async fn synthesize_parameters<C>(
    tool: &ToolSpec<C>,
    ctx: Arc<C>,
    user_message: &str,
    tool_types: &HashMap<String, ToolTypeSpec<C>>,
) -> Value {
    let mut used = HashSet::new();
    let properties: Map<String, Value> = tool
        .properties
        .iter()
        .map(|(name, schema)| (name.clone(), resolve_value(schema, &ctx, &tool.enum_resolvers, &mut used)))
        .collect();

    let mut parameters = Map::new();
    parameters.insert("type".to_string(), Value::String("object".to_string()));
    parameters.insert("properties".to_string(), Value::Object(properties));
    parameters.insert(
        "required".to_string(),
        Value::Array(tool.required.iter().cloned().map(Value::String).collect()),
    );

    if !used.is_empty() {
        let mut definitions = Map::new();
        let mut names: Vec<&String> = used.iter().collect();
        names.sort();
        for name in names {
            if let Some(sub_type) = tool_types.get(name) {
                let props = (sub_type.build)(Arc::clone(&ctx), user_message.to_string()).await;
                definitions.insert(
                    name.clone(),
                    serde_json::json!({
                        "type": "object",
                        "description": sub_type.description,
                        "properties": props,
                        "required": [],
                    }),
                );
            }
        }
        parameters.insert("definitions".to_string(), Value::Object(definitions));
    }

    Value::Object(parameters)
}

/// Synthesises every registered tool's `ToolDefinition`, ready to pass to
/// the LLM client's `chat` call.
pub async fn synthesize_tool_defs<C>(
    tools: &[ToolSpec<C>],
    ctx: Arc<C>,
    user_message: &str,
    tool_types: &HashMap<String, ToolTypeSpec<C>>,
) -> Vec<ToolDefinition> {
    let mut defs = Vec::with_capacity(tools.len());
    for tool in tools {
        let parameters = synthesize_parameters(tool, Arc::clone(&ctx), user_message, tool_types).await;
        defs.push(ToolDefinition {
            kind: "function".to_string(),
            function: crate::llm::ToolFunctionDefinition {
                name: tool.name.clone(),
                description: tool.description.clone(),
                parameters,
            },
        });
    }
    defs
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::ToolSpec;

    struct Ctx {
        layer_ids: Vec<String>,
    }

    fn sample_tool() -> ToolSpec<Ctx> {
        let mut properties = Map::new();
        properties.insert("layer_id".to_string(), serde_json::json!({ "type": "string", "enum": "$dynamic:layer_ids" }));
        properties.insert("filter".to_string(), serde_json::json!({ "type": "#handler_filter" }));

        let mut enum_resolvers: HashMap<String, EnumResolver<Ctx>> = HashMap::new();
        enum_resolvers.insert(
            "layer_ids".to_string(),
            Arc::new(|ctx: &Ctx| ctx.layer_ids.iter().cloned().map(Value::String).collect()),
        );

        ToolSpec {
            name: "add_layer".to_string(),
            description: "Add a map layer".to_string(),
            properties,
            required: vec!["layer_id".to_string()],
            enum_resolvers,
            handler: Arc::new(|_args, _ctx| Box::pin(async { Ok("ok".to_string()) })),
        }
    }

    fn sample_tool_types() -> HashMap<String, ToolTypeSpec<Ctx>> {
        let mut map = HashMap::new();
        map.insert(
            "handler_filter".to_string(),
            ToolTypeSpec {
                name: "handler_filter".to_string(),
                description: "A filter clause".to_string(),
                build: Arc::new(|_ctx: Arc<Ctx>, _msg: String| {
                    Box::pin(async {
                        let mut props = Map::new();
                        props.insert("field".to_string(), serde_json::json!({ "type": "string" }));
                        props
                    })
                }),
            },
        );
        map
    }

    #[tokio::test]
    async fn resolves_dynamic_enum_against_live_context() {
        let ctx = Arc::new(Ctx { layer_ids: vec!["a".to_string(), "b".to_string()] });
        let tool = sample_tool();
        let params = synthesize_parameters(&tool, ctx, "hello", &sample_tool_types()).await;
        let layer_enum = &params["properties"]["layer_id"]["enum"];
        assert_eq!(layer_enum, &serde_json::json!(["a", "b"]));
    }

    #[tokio::test]
    async fn sentinel_type_becomes_ref_with_scoped_definitions() {
        let ctx = Arc::new(Ctx { layer_ids: vec![] });
        let tool = sample_tool();
        let params = synthesize_parameters(&tool, ctx, "hello", &sample_tool_types()).await;
        assert_eq!(params["properties"]["filter"]["$ref"], "#/definitions/handler_filter");
        assert!(params["definitions"]["handler_filter"]["properties"]["field"].is_object());
    }

    #[tokio::test]
    async fn unused_subtypes_are_not_included_in_definitions() {
        let ctx = Arc::new(Ctx { layer_ids: vec![] });
        let mut tool = sample_tool();
        tool.properties.remove("filter");
        let params = synthesize_parameters(&tool, ctx, "hello", &sample_tool_types()).await;
        assert!(params.get("definitions").is_none());
    }
}
