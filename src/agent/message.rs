//! Conversation message: a tagged, append-only record. Element 0 is always
//! the current system message and is *replaced*, never appended to, on
//! each turn; every other message is only ever appended.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum Message {
    System { content: String },
    User { content: String },
    Assistant { content: String },
    ToolCall { call_id: String, name: String, arguments: String },
    ToolOutput { call_id: String, content: String },
}

impl Message {
    pub fn text(&self) -> &str {
        match self {
            Message::System { content }
            | Message::User { content }
            | Message::Assistant { content } => content,
            Message::ToolCall { arguments, .. } => arguments,
            Message::ToolOutput { content, .. } => content,
        }
    }

    pub fn role(&self) -> &'static str {
        match self {
            Message::System { .. } => "system",
            Message::User { .. } => "user",
            Message::Assistant { .. } => "assistant",
            Message::ToolCall { .. } => "tool_call",
            Message::ToolOutput { .. } => "tool_output",
        }
    }
}
