//! Collaborator contracts.
//!
//! The engine never talks to a chat network, a database or a tool
//! registry directly.  Those live behind the traits below and are handed
//! to the [`TurnDispatcher`](crate::dispatcher::TurnDispatcher) at
//! construction.

use serde::{Deserialize, Serialize};

use rb_domain::error::Result;
use rb_domain::tool::ToolOutput;
use rb_providers::{ContextLengthInfo, ProviderRequest};

use crate::turn::{StreamingTurn, TurnRecord, TurnStatus};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Inbound items
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// What a room message asks the agent to do.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InboundPayload {
    Text { body: String },
    Media {
        url: String,
        mime_type: String,
        #[serde(default)]
        caption: Option<String>,
    },
    /// Re-run the turn that produced `target_event_id`.
    Regenerate { target_event_id: String },
    /// The user edited their message; answer the new text instead.
    EditRegenerate {
        target_event_id: String,
        new_body: String,
    },
}

impl InboundPayload {
    pub fn text(body: impl Into<String>) -> Self {
        Self::Text { body: body.into() }
    }

    /// Plain text payloads are the only ones the debouncer merges.
    pub fn is_text(&self) -> bool {
        matches!(self, Self::Text { .. })
    }

    /// Human-readable rendering used when several payloads are combined.
    pub fn summary_line(&self) -> String {
        match self {
            Self::Text { body } => body.clone(),
            Self::Media { mime_type, caption, .. } => match caption {
                Some(c) if !c.is_empty() => format!("[{mime_type}] {c}"),
                _ => format!("[{mime_type}]"),
            },
            Self::Regenerate { .. } => "[regenerate]".to_string(),
            Self::EditRegenerate { new_body, .. } => new_body.clone(),
        }
    }
}

/// One inbound room message, as delivered by the chat integration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundItem {
    pub room_id: String,
    /// Channel or network the room belongs to (for per-channel settings).
    #[serde(default)]
    pub channel: Option<String>,
    /// Room event id of the message, when it has one.
    #[serde(default)]
    pub event_id: Option<String>,
    #[serde(default)]
    pub sender: Option<String>,
    /// Groups messages of the same thread for `collect` drains.
    #[serde(default)]
    pub thread_key: Option<String>,
    pub payload: InboundPayload,
    /// Set for turns triggered by background jobs rather than a person.
    #[serde(default)]
    pub background: bool,
}

impl InboundItem {
    pub fn text(room_id: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            room_id: room_id.into(),
            channel: None,
            event_id: None,
            sender: None,
            thread_key: None,
            payload: InboundPayload::text(body),
            background: false,
        }
    }

    pub fn with_event_id(mut self, event_id: impl Into<String>) -> Self {
        self.event_id = Some(event_id.into());
        self
    }

    pub fn with_thread(mut self, thread_key: impl Into<String>) -> Self {
        self.thread_key = Some(thread_key.into());
        self
    }

    pub fn with_channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = Some(channel.into());
        self
    }
}

/// Room state the Prompt Builder needs.  Cloned at dispatch time so a
/// running turn never sees later changes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RoomContext {
    pub room_id: String,
    pub channel: Option<String>,
    pub agent_id: String,
    /// Response handle of the room's previous turn, for chaining.
    pub last_response_id: Option<String>,
    /// Set when the previous attempt overflowed the model's context
    /// window.  The builder is expected to prune history to fit.
    pub context_overflow: Option<ContextLengthInfo>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Presentation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Ordered delta forwarded to observers.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DeltaPayload {
    Text { text: String },
    Reasoning { text: String },
    ToolCallStarted { call_id: String, tool_name: String },
    ToolCallFinished {
        call_id: String,
        tool_name: String,
        is_error: bool,
    },
    /// The turn started over on another code path.  Deltas received so far
    /// for this turn id are void.
    Restarted,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Traits
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Assembles the provider request (system prompt, history, tools) for a
/// new turn.  Called once per turn; continuation requests are derived
/// from it by the engine.
#[async_trait::async_trait]
pub trait PromptBuilder: Send + Sync {
    async fn build(&self, room: &RoomContext, input: &TurnInput) -> Result<ProviderRequest>;
}

/// Runs a named tool.  An `Err` is not fatal: its text is handed back to
/// the model as the call's output.
#[async_trait::async_trait]
pub trait ToolExecutor: Send + Sync {
    async fn execute(&self, name: &str, arguments: &serde_json::Value) -> Result<ToolOutput>;
}

/// Persistence of finished turns and per-room chaining state.
#[async_trait::async_trait]
pub trait TurnStore: Send + Sync {
    async fn save_turn(&self, room_id: &str, turn: &StreamingTurn) -> Result<()>;

    async fn load_recent_turns(&self, room_id: &str, limit: usize) -> Result<Vec<TurnRecord>>;

    async fn last_response_id(&self, room_id: &str) -> Result<Option<String>>;

    async fn set_last_response_id(&self, room_id: &str, response_id: &str) -> Result<()>;
}

/// Where output becomes visible in the room.
#[async_trait::async_trait]
pub trait PresentationSink: Send + Sync {
    /// Post the first partial message of a turn; returns its event id.
    async fn render_partial(&self, room_id: &str, text: &str) -> Result<String>;

    /// Replace the body of a previously rendered message.
    async fn update_message(&self, room_id: &str, message_id: &str, text: &str) -> Result<()>;

    async fn emit_delta(&self, room_id: &str, turn_id: &str, seq: u64, payload: DeltaPayload);

    async fn emit_status(
        &self,
        room_id: &str,
        turn_id: &str,
        status: TurnStatus,
        detail: Option<&str>,
    );

    /// Deliver audio or images produced by a tool as their own message.
    async fn send_media(&self, room_id: &str, output: &ToolOutput) -> Result<String>;

    /// Tell the sender their message was not accepted.
    async fn report_rejected(&self, room_id: &str, item: &InboundItem);
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Dispatch input
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// What a turn answers: one inbound item, or several combined by a drain.
#[derive(Debug, Clone, PartialEq)]
pub struct TurnInput {
    pub room_id: String,
    pub channel: Option<String>,
    /// The inbound message that triggered the turn.
    pub source_event_id: Option<String>,
    pub payload: InboundPayload,
    /// Background turns are neither rendered nor persisted.
    pub background: bool,
    /// Context placed before the payload, e.g. a summary of messages the
    /// queue collapsed.
    pub preamble: Option<String>,
}

impl TurnInput {
    pub fn from_item(item: &InboundItem) -> Self {
        Self {
            room_id: item.room_id.clone(),
            channel: item.channel.clone(),
            source_event_id: item.event_id.clone(),
            payload: item.payload.clone(),
            background: item.background,
            preamble: None,
        }
    }

    /// The user-facing text of the turn, preamble first.
    pub fn prompt_text(&self) -> String {
        match &self.preamble {
            Some(pre) if !pre.is_empty() => format!("{pre}\n\n{}", self.payload.summary_line()),
            _ => self.payload.summary_line(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summary_lines() {
        assert_eq!(InboundPayload::text("hi").summary_line(), "hi");
        let media = InboundPayload::Media {
            url: "mxc://a".into(),
            mime_type: "image/png".into(),
            caption: Some("cat".into()),
        };
        assert_eq!(media.summary_line(), "[image/png] cat");
        assert!(!media.is_text());
    }

    #[test]
    fn payload_serialization_is_tagged() {
        let json = serde_json::to_value(InboundPayload::Regenerate {
            target_event_id: "$e".into(),
        })
        .unwrap();
        assert_eq!(json["kind"], "regenerate");
    }

    #[test]
    fn turn_input_copies_item_linkage() {
        let item = InboundItem::text("r", "hi").with_event_id("$1").with_channel("matrix");
        let input = TurnInput::from_item(&item);
        assert_eq!(input.source_event_id.as_deref(), Some("$1"));
        assert_eq!(input.channel.as_deref(), Some("matrix"));
        assert!(!input.background);
    }
}
