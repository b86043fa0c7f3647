//! Agent Kernel: the generic tool-calling turn loop every chat session
//! runs on.
//!
//! Python's decorator-driven `BaseAgent` (`@system_message`, `@tool`,
//! `@tool_type`, `@prechat`/`@postchat` in
//! `original_source/geo_assistant/agent/_base.py`) has no direct Rust
//! analogue since Rust lacks reflection-based method discovery. It is
//! reimagined here as a declaratively-populated `Agent<C>` struct: tools
//! and tool sub-types are pushed onto it at construction time instead of
//! discovered by scanning decorated methods, but the per-turn control flow
//! in `chat()` below follows `BaseAgent.chat()` step for step.

pub mod message;
pub mod schema;

pub use message::Message;
pub use schema::EnumResolver;

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use crate::llm::{ChatMessage, ChatTurn, LlmClient, LlmError, ToolCall, ToolCallFunction};

/// A tool handler's return is either the textual result to hand back to
/// the model, or a textual failure explanation — both become a
/// `Message::ToolOutput`, so handlers never need to format their own
/// `"error: ..."` prefix for genuine tool-level failures.
pub type ToolFuture = Pin<Box<dyn Future<Output = Result<String, String>> + Send>>;
pub type ToolHandler<C> = Arc<dyn Fn(Value, Arc<C>) -> ToolFuture + Send + Sync>;

/// One callable the agent can invoke. `properties`/`required` are the
/// tool's parameter schema before dynamic-enum/sub-type resolution (see
/// `schema::synthesize_parameters`).
pub struct ToolSpec<C> {
    pub name: String,
    pub description: String,
    pub properties: serde_json::Map<String, Value>,
    pub required: Vec<String>,
    pub enum_resolvers: HashMap<String, EnumResolver<C>>,
    pub handler: ToolHandler<C>,
}

/// A reusable parameter sub-type (the `#<name>` shorthand a tool's
/// `properties` can reference), built fresh per turn against the live
/// context and user message.
pub struct ToolTypeSpec<C> {
    pub name: String,
    pub description: String,
    pub build: Arc<dyn Fn(Arc<C>, String) -> BoxFuture<serde_json::Map<String, Value>> + Send + Sync>,
}

/// A boxed, `Send` future resolving to `T` — the shape both the
/// system-message builder and tool sub-type builders return, since both
/// may need to query a document store before they can answer.
pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// Builds the system message fresh each turn, given the live context and
/// the user's message (it may need to retrieve supporting context for
/// it, as `GeoAgent`'s does). Async because `BaseAgent._build_system_message`
/// is async in the original: its concrete override queries a document
/// store before it can render the template.
pub type SystemMessageBuilder<C> = Arc<dyn Fn(Arc<C>, String) -> BoxFuture<String> + Send + Sync>;
pub type Transform<C> = Arc<dyn Fn(&C, &str) -> String + Send + Sync>;

/// A declaratively-populated agent: a system-message builder plus the
/// tools, tool sub-types, and optional pre/post transforms it carries.
pub struct Agent<C> {
    system_message: SystemMessageBuilder<C>,
    pre_chat: Option<Transform<C>>,
    post_chat: Option<Transform<C>>,
    tools: Vec<ToolSpec<C>>,
    tool_types: HashMap<String, ToolTypeSpec<C>>,
}

impl<C> Agent<C> {
    pub fn new(system_message: SystemMessageBuilder<C>) -> Self {
        Self {
            system_message,
            pre_chat: None,
            post_chat: None,
            tools: Vec::new(),
            tool_types: HashMap::new(),
        }
    }

    pub fn with_tool(mut self, tool: ToolSpec<C>) -> Self {
        self.tools.push(tool);
        self
    }

    pub fn with_tool_type(mut self, tool_type: ToolTypeSpec<C>) -> Self {
        self.tool_types.insert(tool_type.name.clone(), tool_type);
        self
    }

    /// Runs before the user message is recorded; may rewrite it (e.g. to
    /// expand shorthand or inline recent map state).
    pub fn with_pre_chat(mut self, f: Transform<C>) -> Self {
        self.pre_chat = Some(f);
        self
    }

    /// Runs after the model's final reply is produced; may rewrite it
    /// before it is recorded and returned.
    pub fn with_post_chat(mut self, f: Transform<C>) -> Self {
        self.post_chat = Some(f);
        self
    }

    fn tool(&self, name: &str) -> Option<&ToolSpec<C>> {
        self.tools.iter().find(|t| t.name == name)
    }

    /// Every registered tool's name, for introspection/tests.
    pub fn tool_names(&self) -> Vec<String> {
        self.tools.iter().map(|t| t.name.clone()).collect()
    }
}

#[derive(Debug, Error)]
pub enum KernelError {
    #[error("tool '{0}' is not registered on this agent")]
    UnknownTool(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnStatus {
    Generating,
    Processing,
    Succeeded,
    Error,
}

/// Progress notifications a turn emits as it runs, destined for the
/// session's transport layer (the wire `"tool"` message carries
/// `tool_call`/`tool_args`/`status`; a bare status update carries only
/// `status`).
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum KernelEvent {
    ToolProgress { tool_call: String, tool_args: String, status: TurnStatus },
    Status { status: TurnStatus },
}

pub type Emitter<'a> = dyn Fn(KernelEvent) + Send + Sync + 'a;

fn to_chat_messages(history: &[Message]) -> Vec<ChatMessage> {
    history
        .iter()
        .map(|m| match m {
            Message::System { content } => ChatMessage::system(content.clone()),
            Message::User { content } => ChatMessage::user(content.clone()),
            Message::Assistant { content } => ChatMessage {
                role: "assistant".to_string(),
                content: content.clone(),
                tool_call_id: None,
                tool_calls: None,
            },
            Message::ToolCall { call_id, name, arguments } => ChatMessage {
                role: "assistant".to_string(),
                content: String::new(),
                tool_call_id: None,
                tool_calls: Some(vec![ToolCall {
                    id: call_id.clone(),
                    kind: "function".to_string(),
                    function: ToolCallFunction { name: name.clone(), arguments: arguments.clone() },
                }]),
            },
            Message::ToolOutput { call_id, content } => {
                ChatMessage::tool_result(call_id.clone(), content.clone())
            }
        })
        .collect()
}

/// Runs one full turn: pre-chat transform, system-message install, tool
/// dispatch loop, final-reply generation, post-chat transform. Tool and
/// LLM failures are handled inline (recorded in history, surfaced via
/// `emit`) so a single bad turn never tears down the session; `history`
/// always ends the call in a consistent, appendable state.
pub async fn chat<C: Send + Sync + 'static>(
    agent: &Agent<C>,
    llm: &LlmClient,
    ctx: Arc<C>,
    history: &mut Vec<Message>,
    user_message: &str,
    emit: &Emitter<'_>,
) -> String {
    let user_message = match &agent.pre_chat {
        Some(transform) => transform(&ctx, user_message),
        None => user_message.to_string(),
    };

    let system_content = (agent.system_message)(Arc::clone(&ctx), user_message.clone()).await;
    match history.first_mut() {
        Some(Message::System { content }) => *content = system_content,
        _ => history.insert(0, Message::System { content: system_content }),
    }

    history.push(Message::User { content: user_message.clone() });

    emit(KernelEvent::Status { status: TurnStatus::Generating });
    let tool_defs =
        schema::synthesize_tool_defs(&agent.tools, Arc::clone(&ctx), &user_message, &agent.tool_types).await;
    let tools = if tool_defs.is_empty() { None } else { Some(tool_defs.as_slice()) };

    let turn = match llm.chat(&to_chat_messages(history), tools).await {
        Ok(turn) => turn,
        Err(err) => return fail_turn(history, emit, err),
    };

    let (ran_tool, initial_reply) = match turn {
        ChatTurn::Message { content, .. } => (false, content),
        ChatTurn::ToolCalls { calls, .. } => {
            for call in calls {
                dispatch_tool_call(agent, Arc::clone(&ctx), history, emit, call).await;
            }
            (true, String::new())
        }
    };

    let reply = if ran_tool {
        emit(KernelEvent::Status { status: TurnStatus::Generating });
        match llm.chat(&to_chat_messages(history), None).await {
            Ok(ChatTurn::Message { content, .. }) => content,
            Ok(ChatTurn::ToolCalls { .. }) => {
                "I gathered the requested information but could not form a final reply.".to_string()
            }
            Err(err) => return fail_turn(history, emit, err),
        }
    } else {
        initial_reply
    };

    let reply = match &agent.post_chat {
        Some(transform) => transform(&ctx, &reply),
        None => reply,
    };

    history.push(Message::Assistant { content: reply.clone() });
    emit(KernelEvent::Status { status: TurnStatus::Succeeded });
    reply
}

async fn dispatch_tool_call<C: Send + Sync + 'static>(
    agent: &Agent<C>,
    ctx: Arc<C>,
    history: &mut Vec<Message>,
    emit: &Emitter<'_>,
    call: ToolCall,
) {
    history.push(Message::ToolCall {
        call_id: call.id.clone(),
        name: call.function.name.clone(),
        arguments: call.function.arguments.clone(),
    });
    emit(KernelEvent::ToolProgress {
        tool_call: call.function.name.clone(),
        tool_args: call.function.arguments.clone(),
        status: TurnStatus::Processing,
    });

    let output = match agent.tool(&call.function.name) {
        None => {
            emit(KernelEvent::Status { status: TurnStatus::Error });
            format!("error: {}", KernelError::UnknownTool(call.function.name.clone()))
        }
        Some(tool) => match serde_json::from_str::<Value>(&call.function.arguments) {
            Err(err) => {
                emit(KernelEvent::Status { status: TurnStatus::Error });
                format!("error: arguments were not valid JSON: {err}")
            }
            Ok(args) => match (tool.handler)(args, ctx).await {
                Ok(result) => result,
                Err(message) => {
                    emit(KernelEvent::Status { status: TurnStatus::Error });
                    format!("error: {message}")
                }
            },
        },
    };

    history.push(Message::ToolOutput { call_id: call.id, content: output });
}

fn fail_turn(history: &mut Vec<Message>, emit: &Emitter<'_>, err: LlmError) -> String {
    emit(KernelEvent::Status { status: TurnStatus::Error });
    let reply = format!("I ran into a problem talking to the model: {err}");
    history.push(Message::Assistant { content: reply.clone() });
    reply
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Ctx {
        calls: Mutex<Vec<String>>,
    }

    fn echo_tool() -> ToolSpec<Ctx> {
        let mut properties = serde_json::Map::new();
        properties.insert("text".to_string(), serde_json::json!({ "type": "string" }));
        ToolSpec {
            name: "echo".to_string(),
            description: "Echoes text back".to_string(),
            properties,
            required: vec!["text".to_string()],
            enum_resolvers: HashMap::new(),
            handler: Arc::new(|args, ctx| {
                Box::pin(async move {
                    ctx.calls.lock().unwrap().push("echo".to_string());
                    Ok(args["text"].as_str().unwrap_or_default().to_string())
                })
            }),
        }
    }

    #[test]
    fn system_message_replaces_rather_than_appends() {
        let mut history = vec![
            Message::System { content: "old".to_string() },
            Message::User { content: "hi".to_string() },
        ];
        match history.first_mut() {
            Some(Message::System { content }) => *content = "new".to_string(),
            _ => history.insert(0, Message::System { content: "new".to_string() }),
        }
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].text(), "new");
    }

    #[test]
    fn unknown_tool_lookup_reports_none() {
        let agent: Agent<Ctx> = Agent::new(Arc::new(|_ctx: Arc<Ctx>, _msg: String| {
            Box::pin(async { "system".to_string() }) as BoxFuture<String>
        }));
        assert!(agent.tool("echo").is_none());
        let agent = agent.with_tool(echo_tool());
        assert!(agent.tool("echo").is_some());
    }

    #[test]
    fn chat_message_conversion_splits_tool_call_and_output() {
        let history = vec![
            Message::System { content: "sys".to_string() },
            Message::User { content: "hi".to_string() },
            Message::ToolCall {
                call_id: "call-1".to_string(),
                name: "echo".to_string(),
                arguments: "{\"text\":\"hi\"}".to_string(),
            },
            Message::ToolOutput { call_id: "call-1".to_string(), content: "hi".to_string() },
        ];
        let converted = to_chat_messages(&history);
        assert_eq!(converted.len(), 4);
        assert_eq!(converted[2].role, "assistant");
        assert!(converted[2].tool_calls.is_some());
        assert_eq!(converted[3].role, "tool");
        assert_eq!(converted[3].tool_call_id.as_deref(), Some("call-1"));
    }
}
