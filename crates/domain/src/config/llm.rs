use serde::{Deserialize, Serialize};
use std::fmt;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// LLM provider system
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// Timeout for opening a provider stream (connect + response headers).
    #[serde(default = "d_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Provider used when a room does not name one.
    #[serde(default)]
    pub default_provider: Option<String>,
    /// Registered providers (adding a provider = adding config).
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: d_request_timeout_ms(),
            default_provider: None,
            providers: Vec::new(),
        }
    }
}

/// Streaming protocol spoken to a provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApiKind {
    /// The richer protocol: typed output items, reasoning deltas, and
    /// server-side conversation chaining via a response id.
    #[default]
    Responses,
    /// The simpler chat-completion protocol.  Always stateless.
    ChatCompletions,
}

impl ApiKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Responses => "responses",
            Self::ChatCompletions => "chat_completions",
        }
    }
}

impl fmt::Display for ApiKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub id: String,
    pub base_url: String,
    /// Primary protocol.  The fallback chain may downgrade per request.
    #[serde(default)]
    pub api: ApiKind,
    /// Environment variable holding the API key.
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default)]
    pub default_model: Option<String>,
    /// Whether the provider keeps conversation state server-side, so a
    /// continuation may reference the previous response id instead of
    /// re-sending the whole conversation.
    #[serde(default = "d_true")]
    pub stateful: bool,
    /// Reasoning effort hint (`"low"`, `"medium"`, `"high"`).
    #[serde(default)]
    pub reasoning_effort: Option<String>,
}

fn d_request_timeout_ms() -> u64 {
    30_000
}
fn d_true() -> bool {
    true
}
