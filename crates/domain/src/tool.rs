use serde::{Deserialize, Serialize};

/// Tool definition exposed to the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    /// JSON Schema for the tool's parameters.
    pub parameters: serde_json::Value,
}

/// A fully assembled tool call requested by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub call_id: String,
    pub tool_name: String,
    pub arguments: serde_json::Value,
}

/// A message in the conversation (provider-agnostic).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: MessageContent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ContentPart {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "tool_use")]
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    #[serde(rename = "tool_result")]
    ToolResult {
        tool_use_id: String,
        content: String,
        #[serde(default)]
        is_error: bool,
    },
}

// ── Convenience constructors ───────────────────────────────────────

impl Message {
    pub fn system(text: impl Into<String>) -> Self {
        Self { role: Role::System, content: MessageContent::Text(text.into()) }
    }
    pub fn user(text: impl Into<String>) -> Self {
        Self { role: Role::User, content: MessageContent::Text(text.into()) }
    }
    pub fn assistant(text: impl Into<String>) -> Self {
        Self { role: Role::Assistant, content: MessageContent::Text(text.into()) }
    }
    pub fn tool_result(
        tool_use_id: impl Into<String>,
        content: impl Into<String>,
        is_error: bool,
    ) -> Self {
        Self {
            role: Role::Tool,
            content: MessageContent::Parts(vec![ContentPart::ToolResult {
                tool_use_id: tool_use_id.into(),
                content: content.into(),
                is_error,
            }]),
        }
    }

    /// An assistant message carrying optional text plus the tool calls it
    /// made (used to replay prior rounds to stateless providers).
    pub fn assistant_tool_calls(text: &str, calls: &[ToolCall]) -> Self {
        let mut parts = Vec::with_capacity(calls.len() + 1);
        if !text.is_empty() {
            parts.push(ContentPart::Text { text: text.to_owned() });
        }
        for call in calls {
            parts.push(ContentPart::ToolUse {
                id: call.call_id.clone(),
                name: call.tool_name.clone(),
                input: call.arguments.clone(),
            });
        }
        Self { role: Role::Assistant, content: MessageContent::Parts(parts) }
    }
}

impl MessageContent {
    /// Extract the plain-text content (first text part, or the full text).
    pub fn text(&self) -> Option<&str> {
        match self {
            MessageContent::Text(t) => Some(t.as_str()),
            MessageContent::Parts(parts) => parts.iter().find_map(|p| match p {
                ContentPart::Text { text } => Some(text.as_str()),
                _ => None,
            }),
        }
    }

    /// Concatenate every text part, newline separated.
    pub fn extract_all_text(&self) -> String {
        match self {
            MessageContent::Text(t) => t.clone(),
            MessageContent::Parts(parts) => parts
                .iter()
                .filter_map(|p| match p {
                    ContentPart::Text { text } => Some(text.as_str()),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tool results
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// What a tool returned.  Non-text variants are delivered into the room
/// as separate media messages instead of being echoed back as text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ToolOutput {
    Text { text: String },
    Audio { mime_type: String, data_b64: String },
    Images { images: Vec<ImageRef> },
}

/// One generated image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageRef {
    pub mime_type: String,
    /// Either a URL or base64 data, depending on what the tool produced.
    pub data: String,
}

impl ToolOutput {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    /// Whether the payload must go through the media side channel.
    pub fn is_media(&self) -> bool {
        !matches!(self, Self::Text { .. })
    }

    /// The string handed back to the model as the call's output.
    pub fn model_text(&self) -> String {
        match self {
            Self::Text { text } => text.clone(),
            Self::Audio { mime_type, .. } => {
                format!("Audio ({mime_type}) was generated and sent to the room.")
            }
            Self::Images { images } => match images.len() {
                1 => "1 image was generated and sent to the room.".to_string(),
                n => format!("{n} images were generated and sent to the room."),
            },
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Persisted tool call summary
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolType {
    /// A locally executed function tool.
    Function,
    /// A tool run by the provider itself (e.g. hosted web search).
    Provider,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolCallStatus {
    Completed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultStatus {
    Success,
    Error,
}

/// Summary of a completed tool call, stored with the turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRecord {
    pub call_id: String,
    pub tool_name: String,
    pub tool_type: ToolType,
    pub input: serde_json::Value,
    pub output: String,
    pub status: ToolCallStatus,
    pub result_status: ResultStatus,
    pub started_at_ms: i64,
    pub completed_at_ms: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn model_text_for_media_is_an_acknowledgement() {
        let audio = ToolOutput::Audio {
            mime_type: "audio/ogg".into(),
            data_b64: "AAAA".into(),
        };
        assert!(audio.is_media());
        assert!(audio.model_text().contains("audio/ogg"));

        let images = ToolOutput::Images {
            images: vec![
                ImageRef { mime_type: "image/png".into(), data: "a".into() },
                ImageRef { mime_type: "image/png".into(), data: "b".into() },
            ],
        };
        assert_eq!(images.model_text(), "2 images were generated and sent to the room.");

        let text = ToolOutput::text("42");
        assert!(!text.is_media());
        assert_eq!(text.model_text(), "42");
    }

    #[test]
    fn tool_output_tagged_serialization() {
        let json = serde_json::to_value(ToolOutput::text("ok")).unwrap();
        assert_eq!(json["kind"], "text");
        assert_eq!(json["text"], "ok");
    }

    #[test]
    fn assistant_tool_calls_skips_empty_text() {
        let msg = Message::assistant_tool_calls(
            "",
            &[ToolCall {
                call_id: "c1".into(),
                tool_name: "lookup".into(),
                arguments: serde_json::json!({"q": 1}),
            }],
        );
        match msg.content {
            MessageContent::Parts(parts) => {
                assert_eq!(parts.len(), 1);
                assert!(matches!(parts[0], ContentPart::ToolUse { .. }));
            }
            MessageContent::Text(_) => panic!("expected parts"),
        }
    }

    #[test]
    fn extract_all_text_joins_parts() {
        let content = MessageContent::Parts(vec![
            ContentPart::Text { text: "a".into() },
            ContentPart::ToolResult {
                tool_use_id: "c1".into(),
                content: "ignored".into(),
                is_error: false,
            },
            ContentPart::Text { text: "b".into() },
        ]);
        assert_eq!(content.extract_all_text(), "a\nb");
        assert_eq!(content.text(), Some("a"));
    }
}
