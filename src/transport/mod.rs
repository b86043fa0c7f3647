//! Wire contract for the one bidirectional channel a chat session keeps
//! open with its client: a single inbound message shape and five tagged
//! outbound shapes.
//!
//! Grounded on `original_source/geo_assistant/server.py`'s websocket
//! handler (the `type` discriminator and field names are carried over
//! verbatim since they are the actual wire contract, not an internal
//! implementation detail free to rename).

use serde::{Deserialize, Serialize};

use crate::agent::{KernelEvent, TurnStatus};
use crate::analysis::{ProgressEvent, ProgressStatus};
use crate::mapstate::MapState;

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundMessage {
    User { message: String },
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundMessage {
    UserMessage { message: String },
    AiResponse { message: String },
    Tool { tool_call: String, tool_args: String, status: TurnStatus },
    Analysis { id: String, query: String, step: String, status: ProgressStatus, progress: f64 },
    FigureUpdate { figure: FigureState },
}

/// The map-state snapshot sent as `figure_update`'s payload: every layer
/// plus the viewport the front-end should frame them in.
#[derive(Debug, Clone, Serialize)]
pub struct FigureState {
    pub layers: Vec<crate::mapstate::LayerStatus>,
    pub viewport: crate::mapstate::Viewport,
}

impl FigureState {
    pub fn capture(map_state: &MapState, registry: &crate::registry::TableRegistry) -> Self {
        Self { layers: map_state.status(), viewport: map_state.viewport(registry) }
    }
}

impl From<ProgressEvent> for OutboundMessage {
    fn from(event: ProgressEvent) -> Self {
        OutboundMessage::Analysis {
            id: event.id,
            query: event.query,
            step: event.step,
            status: event.status,
            progress: event.progress,
        }
    }
}

/// Only tool-call progress has a wire shape; bare turn-status events
/// (`Generating`/`Succeeded`/overall `Error`) are session-internal
/// signals, not forwarded as their own message.
impl TryFrom<KernelEvent> for OutboundMessage {
    type Error = ();

    fn try_from(event: KernelEvent) -> Result<Self, Self::Error> {
        match event {
            KernelEvent::ToolProgress { tool_call, tool_args, status } => {
                Ok(OutboundMessage::Tool { tool_call, tool_args, status })
            }
            KernelEvent::Status { .. } => Err(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inbound_user_message_deserializes() {
        let parsed: InboundMessage =
            serde_json::from_str(r#"{"type":"user","message":"hello"}"#).unwrap();
        match parsed {
            InboundMessage::User { message } => assert_eq!(message, "hello"),
        }
    }

    #[test]
    fn outbound_ai_response_serializes_with_type_tag() {
        let msg = OutboundMessage::AiResponse { message: "hi".to_string() };
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["type"], "ai_response");
        assert_eq!(value["message"], "hi");
    }

    #[test]
    fn tool_progress_converts_to_tool_message() {
        let event = KernelEvent::ToolProgress {
            tool_call: "add_layer".to_string(),
            tool_args: "{}".to_string(),
            status: TurnStatus::Processing,
        };
        let msg = OutboundMessage::try_from(event).unwrap();
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["type"], "tool");
        assert_eq!(value["tool_call"], "add_layer");
    }

    #[test]
    fn bare_status_event_has_no_wire_form() {
        let event = KernelEvent::Status { status: TurnStatus::Succeeded };
        assert!(OutboundMessage::try_from(event).is_err());
    }
}
