use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Streaming engine
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Maximum continuation requests per turn before the tool loop is
    /// force-stopped.
    #[serde(default = "d_max_tool_rounds")]
    pub max_tool_rounds: u32,
    /// Longest silence tolerated between two provider stream events.
    #[serde(default = "d_stream_idle_timeout_ms")]
    pub stream_idle_timeout_ms: u64,
    /// Per tool invocation timeout.
    #[serde(default = "d_tool_timeout_ms")]
    pub tool_timeout_ms: u64,
    /// Text accumulated before the first partial render reaches the room.
    #[serde(default)]
    pub partial_render_min_chars: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_tool_rounds: d_max_tool_rounds(),
            stream_idle_timeout_ms: d_stream_idle_timeout_ms(),
            tool_timeout_ms: d_tool_timeout_ms(),
            partial_render_min_chars: 0,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Inbound debounce
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DebounceConfig {
    /// Merge window for bursts of inbound messages.  `0` disables merging.
    #[serde(default)]
    pub window_ms: u64,
    /// Header placed above a merged burst.
    #[serde(default = "d_combined_marker")]
    pub combined_marker: String,
}

impl Default for DebounceConfig {
    fn default() -> Self {
        Self {
            window_ms: 0,
            combined_marker: d_combined_marker(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Logging
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Emit JSON lines instead of human-readable output.
    #[serde(default)]
    pub json: bool,
}

fn d_max_tool_rounds() -> u32 {
    10
}
fn d_stream_idle_timeout_ms() -> u64 {
    120_000
}
fn d_tool_timeout_ms() -> u64 {
    60_000
}
fn d_combined_marker() -> String {
    "[combined messages]".into()
}
