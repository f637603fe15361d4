//! Tool-call assembly and invocation.

use std::time::Duration;

use serde_json::Value;
use tracing::Instrument;

use rb_domain::tool::{ToolCall, ToolOutput};

use crate::ports::ToolExecutor;
use crate::turn::ActiveToolCall;

/// Parse streamed tool arguments, repairing the usual damage.
///
/// Handles code fences around the JSON, trailing commas, and output cut
/// off mid-string or mid-object.  Empty input is an empty object.
/// Returns `None` when the text is beyond repair.
pub fn repair_arguments(raw: &str) -> Option<Value> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Some(Value::Object(Default::default()));
    }
    if let Ok(v) = serde_json::from_str(trimmed) {
        return Some(v);
    }

    let unfenced = strip_code_fence(trimmed);
    if let Ok(v) = serde_json::from_str(unfenced) {
        return Some(v);
    }

    serde_json::from_str(&close_and_clean(unfenced)).ok()
}

/// Turn a finished [`ActiveToolCall`] into a [`ToolCall`].  Arguments
/// that cannot be repaired become `{}`.
pub fn assemble_call(active: ActiveToolCall, final_arguments: &str) -> ToolCall {
    let raw = if final_arguments.trim().is_empty() {
        active.argument_buffer.as_str()
    } else {
        final_arguments
    };
    let arguments = repair_arguments(raw).unwrap_or_else(|| {
        tracing::warn!(
            call_id = %active.call_id,
            tool = %active.tool_name,
            "tool call arguments are not valid JSON; defaulting to empty object"
        );
        Value::Object(Default::default())
    });
    ToolCall {
        call_id: active.call_id,
        tool_name: active.tool_name,
        arguments,
    }
}

/// Run one tool under a timeout.  Failures come back as their error text.
pub(crate) async fn invoke(
    executor: &dyn ToolExecutor,
    call: &ToolCall,
    timeout: Duration,
) -> Result<ToolOutput, String> {
    let span = tracing::info_span!("tool.call", tool_name = %call.tool_name, call_id = %call.call_id);
    async {
        match tokio::time::timeout(timeout, executor.execute(&call.tool_name, &call.arguments))
            .await
        {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "tool failed");
                Err(e.to_string())
            }
            Err(_) => {
                tracing::warn!(timeout_ms = timeout.as_millis() as u64, "tool timed out");
                Err(format!("tool '{}' timed out after {}ms", call.tool_name, timeout.as_millis()))
            }
        }
    }
    .instrument(span)
    .await
}

fn strip_code_fence(s: &str) -> &str {
    let Some(rest) = s.strip_prefix("```") else {
        return s;
    };
    // Drop the info string (```json).
    let body = rest.split_once('\n').map(|(_, b)| b).unwrap_or(rest);
    body.trim_end().trim_end_matches("```").trim()
}

/// Drop trailing commas and close whatever the text left open.
fn close_and_clean(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 4);
    let mut closers: Vec<char> = Vec::new();
    let mut in_string = false;
    let mut escaped = false;

    for c in s.chars() {
        if in_string {
            out.push(c);
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' => {
                in_string = true;
                out.push(c);
            }
            '{' => {
                closers.push('}');
                out.push(c);
            }
            '[' => {
                closers.push(']');
                out.push(c);
            }
            '}' | ']' => {
                strip_trailing_comma(&mut out);
                if closers.last() == Some(&c) {
                    closers.pop();
                }
                out.push(c);
            }
            _ => out.push(c),
        }
    }

    if in_string {
        if escaped {
            out.pop();
        }
        out.push('"');
    }
    strip_trailing_comma(&mut out);
    while let Some(c) = closers.pop() {
        out.push(c);
    }
    out
}

fn strip_trailing_comma(out: &mut String) {
    let len = out.trim_end().len();
    if out[..len].ends_with(',') {
        out.truncate(len - 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn valid_and_empty() {
        assert_eq!(repair_arguments(r#"{"a":1}"#), Some(json!({"a": 1})));
        assert_eq!(repair_arguments("  "), Some(json!({})));
    }

    #[test]
    fn fenced() {
        let raw = "```json\n{\"city\": \"Oslo\"}\n```";
        assert_eq!(repair_arguments(raw), Some(json!({"city": "Oslo"})));
    }

    #[test]
    fn trailing_commas() {
        assert_eq!(
            repair_arguments(r#"{"a": [1, 2,], "b": 3,}"#),
            Some(json!({"a": [1, 2], "b": 3}))
        );
    }

    #[test]
    fn truncated_string_and_object() {
        assert_eq!(
            repair_arguments(r#"{"q": "weather in Ber"#),
            Some(json!({"q": "weather in Ber"}))
        );
        assert_eq!(
            repair_arguments(r#"{"filters": {"tags": ["a", "b""#),
            Some(json!({"filters": {"tags": ["a", "b"]}}))
        );
    }

    #[test]
    fn comma_inside_string_is_kept() {
        assert_eq!(repair_arguments(r#"{"s": "a,}"#), Some(json!({"s": "a,}"})));
    }

    #[test]
    fn hopeless_input() {
        assert_eq!(repair_arguments("not json at all"), None);
        assert_eq!(repair_arguments(r#"{"a":"#), None);
    }

    #[test]
    fn assemble_prefers_final_arguments() {
        let active = ActiveToolCall {
            call_id: "c1".into(),
            tool_name: "lookup".into(),
            argument_buffer: r#"{"q": "partial"#.into(),
            item_id: "i1".into(),
            started_at_ms: 0,
            result: None,
        };
        let call = assemble_call(active.clone(), r#"{"q":"full"}"#);
        assert_eq!(call.arguments, json!({"q": "full"}));

        let call = assemble_call(active, "");
        assert_eq!(call.arguments, json!({"q": "partial"}));
    }
}
