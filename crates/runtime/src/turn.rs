//! Per-turn state owned by the completion engine.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use rb_domain::stream::Usage;
use rb_domain::tool::{ImageRef, Message, ToolCallRecord};
use rb_providers::FunctionOutput;

/// Visible status of a turn, forwarded to the presentation sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnStatus {
    Starting,
    Thinking,
    Generating,
    ToolUse,
    Completed,
    Failed,
    Cancelled,
}

impl TurnStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Thinking => "thinking",
            Self::Generating => "generating",
            Self::ToolUse => "tool_use",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

/// A tool call being assembled from one provider stream.
#[derive(Debug, Clone)]
pub struct ActiveToolCall {
    pub call_id: String,
    pub tool_name: String,
    pub argument_buffer: String,
    /// Provider-side id the argument fragments are routed by.
    pub item_id: String,
    pub started_at_ms: i64,
    pub result: Option<String>,
}

/// Delta sequence of one turn id.  Clones share the counter, so every
/// attempt and retry of the turn continues where the previous one stopped.
#[derive(Debug, Clone, Default)]
pub struct DeltaSequence(Arc<AtomicU64>);

impl DeltaSequence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Last number handed out; zero before the first delta.
    pub fn current(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// StreamingTurn
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Accumulated state of one turn, created at dispatch and discarded once
/// persisted.
#[derive(Debug, Clone)]
pub struct StreamingTurn {
    pub turn_id: String,
    pub agent_id: String,
    pub room_id: String,

    pub started_at_ms: i64,
    pub first_token_at_ms: Option<i64>,
    /// Set once; never cleared.
    pub completed_at_ms: Option<i64>,

    pub text: String,
    pub reasoning: String,
    pub tool_calls: Vec<ToolCallRecord>,
    /// Images produced by tools, delivered after the reply is final.
    pub pending_images: Vec<ImageRef>,
    /// Tool results not yet submitted to the provider.  Drained to empty
    /// before each continuation request.
    pub pending_function_outputs: Vec<FunctionOutput>,
    /// Conversation snapshot the first request was built from.  Replayed
    /// on every continuation to a stateless provider.
    pub base_input: Vec<Message>,
    /// Prior rounds' calls, outputs and steering messages, in order.
    pub history: Vec<Message>,

    /// Room message the stream renders into (set on first render).
    pub initial_event_id: Option<String>,
    pub source_event_id: Option<String>,
    pub response_id: Option<String>,
    pub finish_reason: Option<String>,

    pub first_token: bool,
    /// Media already posted to the room during this turn.
    pub media_sent: bool,
    pub suppress_save: bool,
    pub suppress_send: bool,

    pub usage: Usage,
    pub sequence: DeltaSequence,
    /// Continuation requests issued so far.
    pub rounds: u32,
}

impl StreamingTurn {
    pub fn new(room_id: impl Into<String>, agent_id: impl Into<String>) -> Self {
        Self {
            turn_id: uuid::Uuid::new_v4().to_string(),
            agent_id: agent_id.into(),
            room_id: room_id.into(),
            started_at_ms: now_ms(),
            first_token_at_ms: None,
            completed_at_ms: None,
            text: String::new(),
            reasoning: String::new(),
            tool_calls: Vec::new(),
            pending_images: Vec::new(),
            pending_function_outputs: Vec::new(),
            base_input: Vec::new(),
            history: Vec::new(),
            initial_event_id: None,
            source_event_id: None,
            response_id: None,
            finish_reason: None,
            first_token: true,
            media_sent: false,
            suppress_save: false,
            suppress_send: false,
            usage: Usage::default(),
            sequence: DeltaSequence::new(),
            rounds: 0,
        }
    }

    /// Next delta sequence number.  Strictly increasing within a turn.
    pub fn next_seq(&self) -> u64 {
        self.sequence.next()
    }

    /// Whether anything of this turn is already visible in the room.
    pub fn has_visible_output(&self) -> bool {
        self.initial_event_id.is_some() || self.media_sent
    }

    /// Whether the provider produced anything at all.
    pub fn has_content(&self) -> bool {
        !self.text.is_empty() || !self.reasoning.is_empty() || !self.tool_calls.is_empty()
    }

    pub fn mark_completed(&mut self) {
        if self.completed_at_ms.is_none() {
            self.completed_at_ms = Some(now_ms());
        }
    }

    pub fn duration_ms(&self) -> u64 {
        let end = self.completed_at_ms.unwrap_or_else(now_ms);
        u64::try_from(end - self.started_at_ms).unwrap_or(0)
    }

    /// The persisted shape of this turn.
    pub fn record(&self) -> TurnRecord {
        TurnRecord {
            turn_id: self.turn_id.clone(),
            room_id: self.room_id.clone(),
            agent_id: self.agent_id.clone(),
            source_event_id: self.source_event_id.clone(),
            message_event_id: self.initial_event_id.clone(),
            text: self.text.clone(),
            reasoning: self.reasoning.clone(),
            tool_calls: self.tool_calls.clone(),
            response_id: self.response_id.clone(),
            finish_reason: self.finish_reason.clone(),
            usage: self.usage,
            started_at_ms: self.started_at_ms,
            completed_at_ms: self.completed_at_ms,
        }
    }
}

/// A finished turn as stored by a [`TurnStore`](crate::ports::TurnStore).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnRecord {
    pub turn_id: String,
    pub room_id: String,
    pub agent_id: String,
    pub source_event_id: Option<String>,
    pub message_event_id: Option<String>,
    pub text: String,
    pub reasoning: String,
    pub tool_calls: Vec<ToolCallRecord>,
    pub response_id: Option<String>,
    pub finish_reason: Option<String>,
    pub usage: Usage,
    pub started_at_ms: i64,
    pub completed_at_ms: Option<i64>,
}

/// How a turn ended, when it did not fail.
#[derive(Debug, Clone)]
pub enum TurnOutcome {
    Completed(StreamingTurn),
    /// Cancelled.  Partial output is kept only if it was already visible.
    Cancelled(StreamingTurn),
}

impl TurnOutcome {
    pub fn turn(&self) -> &StreamingTurn {
        match self {
            Self::Completed(t) | Self::Cancelled(t) => t,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Completed(_) => "completed",
            Self::Cancelled(_) => "cancelled",
        }
    }
}

pub(crate) fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn completion_time_is_monotonic() {
        let mut turn = StreamingTurn::new("r", "agent");
        turn.mark_completed();
        let first = turn.completed_at_ms;
        turn.mark_completed();
        assert_eq!(turn.completed_at_ms, first);
    }

    #[test]
    fn sequence_numbers_increase() {
        let turn = StreamingTurn::new("r", "agent");
        let a = turn.next_seq();
        let b = turn.next_seq();
        assert!(b > a);
    }

    #[test]
    fn shared_sequence_survives_a_fresh_turn() {
        let sequence = DeltaSequence::new();
        let mut first = StreamingTurn::new("r", "agent");
        first.sequence = sequence.clone();
        assert_eq!(first.next_seq(), 1);
        assert_eq!(first.next_seq(), 2);

        let mut retry = StreamingTurn::new("r", "agent");
        retry.sequence = sequence.clone();
        assert_eq!(retry.next_seq(), 3);
        assert_eq!(sequence.current(), 3);
    }

    #[test]
    fn visibility_and_content() {
        let mut turn = StreamingTurn::new("r", "agent");
        assert!(!turn.has_visible_output());
        assert!(!turn.has_content());
        turn.reasoning.push_str("hmm");
        assert!(turn.has_content());
        turn.media_sent = true;
        assert!(turn.has_visible_output());
    }
}
