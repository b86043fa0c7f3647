//! Session: the per-connection cooperative task that owns one chat's
//! message history and map state, and a process-wide registry connecting
//! inbound websocket frames to the task reading them.
//!
//! Grounded on `original_source/geo_assistant/server.py`'s per-websocket
//! handler loop (one agent instance and one `MapHandler` per connection,
//! messages processed strictly one at a time), with a dedicated tokio
//! task per long-lived unit of work plus a cooperative shutdown signal.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, Mutex};
use tracing::{info, warn};
use uuid::Uuid;

use crate::agent::{self, Agent, KernelEvent, Message};
use crate::mapstate::MapState;
use crate::transport::{FigureState, InboundMessage, OutboundMessage};
use crate::AppState;

pub type SessionId = Uuid;

/// The context a session's agent tools run against: shared application
/// state, this session's own map state, and the channel a tool uses to
/// push its own progress/figure events (the `run_analysis` tool emits
/// `analysis` events and both map tools emit `figure_update`, neither of
/// which is a kernel turn-status event). Tool handlers lock `map_state`
/// only for the duration of a mutation; it is never held across an
/// `.await` on the LLM or tileserv.
pub struct SessionContext {
    pub app: Arc<AppState>,
    pub map_state: Mutex<MapState>,
    pub outbound: mpsc::UnboundedSender<OutboundMessage>,
}

impl SessionContext {
    pub fn new(app: Arc<AppState>, outbound: mpsc::UnboundedSender<OutboundMessage>) -> Self {
        Self { app, map_state: Mutex::new(MapState::new()), outbound }
    }

    /// Publishes the current map state as a `figure_update`, as every map
    /// mutation does right after it commits.
    pub async fn emit_figure(&self) {
        let map_state = self.map_state.lock().await;
        let figure = FigureState::capture(&map_state, &self.app.registry);
        let _ = self.outbound.send(OutboundMessage::FigureUpdate { figure });
    }
}

/// One chat session's private state, processed one turn at a time by its
/// owning task. Never shared across tasks — the registry hands out a
/// channel to it, not the session itself.
pub struct Session {
    id: SessionId,
    ctx: Arc<SessionContext>,
    history: Vec<Message>,
}

impl Session {
    pub fn new(ctx: Arc<SessionContext>) -> Self {
        Self { id: Uuid::new_v4(), ctx, history: Vec::new() }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Runs one turn to completion: echoes the user message, forwards
    /// tool-progress events as the kernel dispatches tools, then sends the
    /// final reply. Tools that touch the map or run an analysis publish
    /// their own `figure_update`/`analysis` events directly through
    /// [`SessionContext::outbound`] as they happen, rather than waiting
    /// for the turn to finish.
    pub async fn handle_user_message(&mut self, agent: &Agent<SessionContext>, message: String) {
        let _ = self.ctx.outbound.send(OutboundMessage::UserMessage { message: message.clone() });

        let outbound = self.ctx.outbound.clone();
        let emit = move |event: KernelEvent| {
            if let Ok(wire) = OutboundMessage::try_from(event) {
                let _ = outbound.send(wire);
            }
        };

        let reply =
            agent::chat(agent, &self.ctx.app.llm, Arc::clone(&self.ctx), &mut self.history, &message, &emit)
                .await;
        let _ = self.ctx.outbound.send(OutboundMessage::AiResponse { message: reply });
    }
}

/// Drives one session's turn loop until its inbound channel closes
/// (client disconnect) or is aborted by the registry (server-initiated
/// close). Any SQL transaction or LLM call in flight when the task is
/// aborted unwinds via ordinary `Drop` — `sqlx::Transaction` rolls back,
/// the in-flight `reqwest` call is simply dropped — so no explicit
/// cancellation bookkeeping is needed here.
pub async fn run_session(
    mut session: Session,
    agent: Arc<Agent<SessionContext>>,
    mut inbound: mpsc::UnboundedReceiver<InboundMessage>,
) {
    info!(session_id = %session.id(), "session started");
    while let Some(message) = inbound.recv().await {
        match message {
            InboundMessage::User { message } => session.handle_user_message(&agent, message).await,
        }
    }
    info!(session_id = %session.id(), "session ended");
}

/// Process-wide map from session id to the inbound channel its task is
/// reading from, so a websocket handler can be looked up and closed by
/// id (e.g. for an administrative disconnect) without holding the
/// session itself.
#[derive(Default)]
pub struct SessionRegistry {
    inboxes: DashMap<SessionId, mpsc::UnboundedSender<InboundMessage>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, id: SessionId, inbox: mpsc::UnboundedSender<InboundMessage>) {
        self.inboxes.insert(id, inbox);
    }

    pub fn unregister(&self, id: &SessionId) {
        self.inboxes.remove(id);
    }

    pub fn dispatch(&self, id: &SessionId, message: InboundMessage) -> bool {
        match self.inboxes.get(id) {
            Some(inbox) => inbox.send(message).is_ok(),
            None => {
                warn!(session_id = %id, "dispatch to unknown session");
                false
            }
        }
    }

    pub fn len(&self) -> usize {
        self.inboxes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inboxes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_dispatch_reports_presence() {
        let registry = SessionRegistry::new();
        let id = Uuid::new_v4();
        let (tx, mut rx) = mpsc::unbounded_channel();
        registry.register(id, tx);
        assert!(registry.dispatch(&id, InboundMessage::User { message: "hi".to_string() }));
        match rx.try_recv().unwrap() {
            InboundMessage::User { message } => assert_eq!(message, "hi"),
        }

        registry.unregister(&id);
        assert!(!registry.dispatch(&id, InboundMessage::User { message: "hi".to_string() }));
    }
}
