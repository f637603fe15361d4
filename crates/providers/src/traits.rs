use rb_domain::config::ApiKind;
use rb_domain::error::Result;
use rb_domain::stream::{BoxStream, StreamEvent};
use rb_domain::tool::{Message, ToolDefinition};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Request types
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The output of one tool call, submitted back to the provider.
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionOutput {
    pub call_id: String,
    pub output: String,
}

/// A protocol-agnostic streaming request.
#[derive(Debug, Clone, Default)]
pub struct ProviderRequest {
    /// Protocol to speak for this request.
    pub api: ApiKind,
    /// Model identifier override. When `None`, the provider uses its default.
    pub model: Option<String>,
    /// Conversation input.  For a chained continuation this holds only
    /// the new items (e.g. steering messages).
    pub input: Vec<Message>,
    /// Tool definitions the model may invoke.
    pub tools: Vec<ToolDefinition>,
    /// Server-side conversation handle to continue from.
    pub previous_response_id: Option<String>,
    /// Tool outputs answering the previous response's calls.
    pub function_outputs: Vec<FunctionOutput>,
    /// Reasoning effort hint (`"low"`, `"medium"`, `"high"`).
    pub reasoning_effort: Option<String>,
    /// Sampling temperature. `None` lets the provider choose.
    pub temperature: Option<f32>,
    /// Maximum tokens in the response. `None` lets the provider choose.
    pub max_output_tokens: Option<u32>,
    /// Ask the provider to keep the response for later chaining.
    pub store: bool,
}

impl ProviderRequest {
    /// Continuation that references the previous response server-side.
    ///
    /// Only the tool outputs and any new user input travel over the wire.
    pub fn chained_continuation(
        &self,
        response_id: &str,
        outputs: Vec<FunctionOutput>,
        new_input: Vec<Message>,
    ) -> Self {
        Self {
            previous_response_id: Some(response_id.to_owned()),
            function_outputs: outputs,
            input: new_input,
            store: true,
            ..self.clone()
        }
    }

    /// Continuation for a stateless provider: the base conversation plus
    /// every prior call/output pair (already rendered into `history`).
    pub fn replayed_continuation(&self, base_input: &[Message], history: &[Message]) -> Self {
        let mut input = Vec::with_capacity(base_input.len() + history.len());
        input.extend_from_slice(base_input);
        input.extend_from_slice(history);
        Self {
            previous_response_id: None,
            function_outputs: Vec::new(),
            input,
            ..self.clone()
        }
    }

    /// Same request spoken over a different protocol and/or without tools.
    pub fn downgraded(&self, api: ApiKind, tools_enabled: bool) -> Self {
        let mut req = self.clone();
        req.api = api;
        if !tools_enabled {
            req.tools.clear();
        }
        if api == ApiKind::ChatCompletions {
            req.previous_response_id = None;
            req.store = false;
        }
        req
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Core provider trait
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Trait that every AI provider client must implement.
///
/// Implementations translate between our internal types and the wire
/// format of the provider's streaming API.
#[async_trait::async_trait]
pub trait ProviderClient: Send + Sync {
    /// Send a request and return the event stream.
    ///
    /// An `Err` means the stream could not be opened at all; errors that
    /// happen mid-stream are yielded as items.
    async fn open_stream(
        &self,
        req: &ProviderRequest,
    ) -> Result<BoxStream<'static, Result<StreamEvent>>>;

    /// The protocol this provider speaks by default.
    fn primary_api(&self) -> ApiKind {
        ApiKind::Responses
    }

    /// Whether responses can be chained server-side via a response id.
    fn supports_chaining(&self) -> bool;

    /// A unique identifier for this provider instance.
    fn provider_id(&self) -> &str;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> ProviderRequest {
        ProviderRequest {
            api: ApiKind::Responses,
            input: vec![Message::system("sys"), Message::user("hi")],
            tools: vec![ToolDefinition {
                name: "lookup".into(),
                description: "look it up".into(),
                parameters: serde_json::json!({"type": "object"}),
            }],
            store: true,
            ..Default::default()
        }
    }

    #[test]
    fn chained_continuation_sends_only_new_items() {
        let req = base().chained_continuation(
            "resp_1",
            vec![FunctionOutput { call_id: "c1".into(), output: "42".into() }],
            Vec::new(),
        );
        assert_eq!(req.previous_response_id.as_deref(), Some("resp_1"));
        assert!(req.input.is_empty());
        assert_eq!(req.function_outputs.len(), 1);
        assert_eq!(req.tools.len(), 1);
    }

    #[test]
    fn replayed_continuation_resends_everything() {
        let b = base();
        let history = vec![Message::tool_result("c1", "42", false)];
        let req = b.replayed_continuation(&b.input, &history);
        assert_eq!(req.input.len(), 3);
        assert!(req.previous_response_id.is_none());
        assert!(req.function_outputs.is_empty());
    }

    #[test]
    fn downgrade_to_chat_drops_chaining_and_optionally_tools() {
        let mut b = base();
        b.previous_response_id = Some("resp_0".into());
        let req = b.downgraded(ApiKind::ChatCompletions, false);
        assert_eq!(req.api, ApiKind::ChatCompletions);
        assert!(req.tools.is_empty());
        assert!(req.previous_response_id.is_none());
        assert!(!req.store);
    }
}
