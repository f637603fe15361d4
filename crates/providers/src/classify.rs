//! Upstream error classification.
//!
//! Providers and the proxies in front of them report the same failure in
//! many shapes: a bare status line, a JSON body, or a JSON body whose
//! `message` is itself an escaped JSON error from the next hop.  The
//! classifier digs through all of them and maps the failure onto the small
//! set of classes the turn engine reacts to.

use std::sync::OnceLock;

use rb_domain::error::Error;
use regex::Regex;
use serde_json::Value;

/// How the turn engine should react to a failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorClass {
    /// The provider rejected the tool definitions.
    ToolSchema,
    /// Two tools share a name.
    ToolUniqueness,
    /// The provider finished without producing anything.
    EmptyResponse,
    /// The prompt does not fit the model's context window.
    ContextLength(ContextLengthInfo),
    /// Timeouts, connection failures, 5xx.
    Transient,
    Other,
}

impl ErrorClass {
    /// Short label for logs and trace events.
    pub fn label(&self) -> &'static str {
        match self {
            Self::ToolSchema => "tool_schema",
            Self::ToolUniqueness => "tool_uniqueness",
            Self::EmptyResponse => "empty_response",
            Self::ContextLength(_) => "context_length",
            Self::Transient => "transient",
            Self::Other => "other",
        }
    }

    /// Whether the API fallback chain handles this class.
    pub fn triggers_fallback(&self) -> bool {
        matches!(self, Self::ToolSchema | Self::ToolUniqueness | Self::EmptyResponse)
    }
}

/// Details parsed from a context-length failure.  Either number may be
/// missing when the upstream only sent an error code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextLengthInfo {
    pub model_max_tokens: Option<u32>,
    pub requested_tokens: Option<u32>,
    pub message: String,
}

/// Classify a domain error.
pub fn classify(err: &Error) -> ErrorClass {
    match err {
        Error::EmptyResponse { .. } => ErrorClass::EmptyResponse,
        Error::Timeout(_) | Error::Http(_) | Error::Io(_) => ErrorClass::Transient,
        Error::Provider { message, .. } => classify_message(message),
        Error::Other(message) => classify_message(message),
        Error::Json(_) | Error::Config(_) => ErrorClass::Other,
    }
}

/// Classify a raw upstream error string (status line and/or body).
pub fn classify_message(raw: &str) -> ErrorClass {
    let candidates = error_texts(raw);

    if let Some(info) = candidates.iter().find_map(|t| parse_context_length(t)) {
        return ErrorClass::ContextLength(info);
    }

    let lowered: Vec<String> = candidates.iter().map(|t| t.to_ascii_lowercase()).collect();
    let any = |needles: &[&str]| lowered.iter().any(|t| needles.iter().any(|n| t.contains(n)));

    if any(&[
        "duplicate tool name",
        "duplicate function name",
        "tool names must be unique",
        "function names must be unique",
        "tools: names must be unique",
    ]) {
        return ErrorClass::ToolUniqueness;
    }

    if any(&[
        "invalid schema for function",
        "invalid_function_parameters",
        "invalid 'tools",
        "invalid value for 'tools",
        "tools.function.parameters",
        "tool schema",
        "does not support tools",
        "tool use is not supported",
        "tools are not supported",
        "tool calling is not supported",
    ]) {
        return ErrorClass::ToolSchema;
    }

    let status = status_code(raw);
    if matches!(status, Some(s) if s >= 500 || s == 429) {
        return ErrorClass::Transient;
    }

    ErrorClass::Other
}

// "maximum context length is 128000 tokens. However, your messages resulted in 130000 tokens"
const OPENAI_PATTERN: &str =
    r"(?is)maximum context length is (\d+) tokens.*?(?:resulted in|requested|you requested) (\d+) tokens";
// "prompt is too long: 212345 tokens > 200000 maximum"
const ANTHROPIC_PATTERN: &str = r"(?i)prompt is too long:\s*(\d+) tokens\s*>\s*(\d+)";
// "input length and `max_tokens` exceed context limit: 187254 + 20000 > 200000"
const SUM_PATTERN: &str = r"(?i)exceed(?:s|ed)? context limit:\s*(\d+)\s*\+\s*(\d+)\s*>\s*(\d+)";
const CODE_PATTERN: &str =
    r"(?i)context_length_exceeded|context window|context length exceeded|too many tokens";

/// Compile `pattern` once.  A pattern that fails to compile is logged and
/// then skipped on every call.
fn compiled(cell: &'static OnceLock<Option<Regex>>, pattern: &str) -> Option<&'static Regex> {
    cell.get_or_init(|| match Regex::new(pattern) {
        Ok(re) => Some(re),
        Err(e) => {
            tracing::warn!(error = %e, "context-length pattern failed to compile");
            None
        }
    })
    .as_ref()
}

/// Extract context-window details from one message, if it describes one.
pub fn parse_context_length(text: &str) -> Option<ContextLengthInfo> {
    static OPENAI: OnceLock<Option<Regex>> = OnceLock::new();
    static ANTHROPIC: OnceLock<Option<Regex>> = OnceLock::new();
    static SUM: OnceLock<Option<Regex>> = OnceLock::new();
    static CODE: OnceLock<Option<Regex>> = OnceLock::new();

    let num = |m: Option<regex::Match<'_>>| m.and_then(|m| m.as_str().parse::<u32>().ok());

    if let Some(c) = compiled(&OPENAI, OPENAI_PATTERN).and_then(|re| re.captures(text)) {
        return Some(ContextLengthInfo {
            model_max_tokens: num(c.get(1)),
            requested_tokens: num(c.get(2)),
            message: text.to_string(),
        });
    }
    if let Some(c) = compiled(&ANTHROPIC, ANTHROPIC_PATTERN).and_then(|re| re.captures(text)) {
        return Some(ContextLengthInfo {
            model_max_tokens: num(c.get(2)),
            requested_tokens: num(c.get(1)),
            message: text.to_string(),
        });
    }
    if let Some(c) = compiled(&SUM, SUM_PATTERN).and_then(|re| re.captures(text)) {
        let requested = match (num(c.get(1)), num(c.get(2))) {
            (Some(a), Some(b)) => Some(a.saturating_add(b)),
            _ => None,
        };
        return Some(ContextLengthInfo {
            model_max_tokens: num(c.get(3)),
            requested_tokens: requested,
            message: text.to_string(),
        });
    }
    if compiled(&CODE, CODE_PATTERN).is_some_and(|re| re.is_match(text)) {
        return Some(ContextLengthInfo {
            model_max_tokens: None,
            requested_tokens: None,
            message: text.to_string(),
        });
    }
    None
}

/// Leading `HTTP nnn` status code, as formatted by the adapters.
fn status_code(raw: &str) -> Option<u16> {
    raw.trim_start()
        .strip_prefix("HTTP ")
        .and_then(|rest| rest.get(..3))
        .and_then(|code| code.parse().ok())
}

/// Every human-readable error text reachable from `raw`: the raw string
/// itself plus `error.message`/`message`/`error.code` strings found in any
/// embedded JSON, recursing into messages that are JSON themselves.
fn error_texts(raw: &str) -> Vec<String> {
    let mut out = vec![raw.to_string()];
    collect_json_texts(raw, &mut out, 0);
    out
}

fn collect_json_texts(text: &str, out: &mut Vec<String>, depth: usize) {
    const MAX_DEPTH: usize = 4;
    if depth >= MAX_DEPTH {
        return;
    }
    let Some(start) = text.find('{') else {
        return;
    };
    let Some(end) = text.rfind('}') else {
        return;
    };
    if end <= start {
        return;
    }
    let Ok(value) = serde_json::from_str::<Value>(&text[start..=end]) else {
        return;
    };

    let mut strings = Vec::new();
    gather_error_strings(&value, &mut strings);
    for s in strings {
        collect_json_texts(&s, out, depth + 1);
        out.push(s);
    }
}

fn gather_error_strings(value: &Value, out: &mut Vec<String>) {
    let Value::Object(map) = value else {
        return;
    };
    for key in ["message", "code", "type", "detail"] {
        if let Some(Value::String(s)) = map.get(key) {
            out.push(s.clone());
        }
    }
    if let Some(inner) = map.get("error") {
        match inner {
            Value::String(s) => out.push(s.clone()),
            other => gather_error_strings(other, out),
        }
    }
}
