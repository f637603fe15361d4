use serde::{Deserialize, Serialize};
use std::pin::Pin;

/// A boxed async stream, used for provider streaming responses.
pub type BoxStream<'a, T> = Pin<Box<dyn futures_core::Stream<Item = T> + Send + 'a>>;

/// Events emitted by a provider stream (protocol-agnostic).
///
/// Tool-call events carry the provider-side `item_id` so that argument
/// fragments of interleaved calls can be routed to the right buffer.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type")]
pub enum StreamEvent {
    /// A text token chunk.
    #[serde(rename = "text_delta")]
    TextDelta { text: String },

    /// A reasoning/thinking chunk.
    #[serde(rename = "reasoning_delta")]
    ReasoningDelta { text: String },

    /// A tool call has started.
    #[serde(rename = "tool_call_started")]
    ToolCallStarted {
        item_id: String,
        call_id: String,
        tool_name: String,
    },

    /// Incremental tool call argument data.
    #[serde(rename = "tool_call_delta")]
    ToolCallDelta { item_id: String, delta: String },

    /// A tool call is complete.  `arguments` is the full raw argument
    /// text when the provider sends it, otherwise empty and the streamed
    /// fragments are used.
    #[serde(rename = "tool_call_done")]
    ToolCallDone {
        item_id: String,
        call_id: String,
        tool_name: String,
        arguments: String,
    },

    /// The provider finished this response.
    #[serde(rename = "completed")]
    Completed {
        /// Provider-assigned response handle (stateful providers only).
        response_id: Option<String>,
        usage: Option<Usage>,
        finish_reason: Option<String>,
    },

    /// An error reported inside the stream.
    #[serde(rename = "error")]
    Error { message: String },
}

/// Token usage for a completion.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    #[serde(default)]
    pub reasoning_tokens: u32,
    pub total_tokens: u32,
}

impl Usage {
    /// Add another round's usage into this running total.
    pub fn accumulate(&mut self, other: &Usage) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
        self.reasoning_tokens += other.reasoning_tokens;
        self.total_tokens += other.total_tokens;
    }
}
