//! OpenAI-compatible adapter.
//!
//! Speaks both streaming protocols an OpenAI-style endpoint may offer:
//!
//! - **Responses** (`POST /responses`): typed output items, reasoning
//!   deltas, and server-side chaining through `previous_response_id`.
//! - **Chat Completions** (`POST /chat/completions`): the simpler,
//!   stateless protocol.  The full conversation travels on every request.
//!
//! Which one a request uses is decided per request by [`ProviderRequest::api`],
//! so the fallback chain can downgrade without a second client.

use std::collections::BTreeMap;
use std::time::Duration;

use rb_domain::config::{ApiKind, ProviderConfig};
use rb_domain::error::{Error, Result};
use rb_domain::stream::{BoxStream, StreamEvent, Usage};
use rb_domain::tool::{ContentPart, Message, MessageContent, Role, ToolDefinition};
use serde_json::{json, Value};

use crate::sse::{sse_response_stream, SseFrame};
use crate::traits::{ProviderClient, ProviderRequest};
use crate::util::{from_reqwest, resolve_api_key};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Adapter struct
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct OpenAiProvider {
    id: String,
    base_url: String,
    api: ApiKind,
    api_key: Option<String>,
    default_model: String,
    stateful: bool,
    reasoning_effort: Option<String>,
    request_timeout: Duration,
    client: reqwest::Client,
}

impl OpenAiProvider {
    /// Build an adapter from its provider config.
    ///
    /// `request_timeout_ms` bounds connecting and receiving response
    /// headers.  The body of a stream is bounded by the engine's idle
    /// timeout instead, since a long answer is not a stalled one.
    pub fn from_config(cfg: &ProviderConfig, request_timeout_ms: u64) -> Result<Self> {
        let api_key = resolve_api_key(cfg.api_key_env.as_deref())?;
        let request_timeout = Duration::from_millis(request_timeout_ms);

        let client = reqwest::Client::builder()
            .connect_timeout(request_timeout)
            .build()
            .map_err(from_reqwest)?;

        Ok(Self {
            id: cfg.id.clone(),
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
            api: cfg.api,
            api_key,
            default_model: cfg.default_model.clone().unwrap_or_else(|| "gpt-4o".into()),
            stateful: cfg.stateful && cfg.api == ApiKind::Responses,
            reasoning_effort: cfg.reasoning_effort.clone(),
            request_timeout,
            client,
        })
    }

    fn effective_model(&self, req: &ProviderRequest) -> String {
        req.model.clone().unwrap_or_else(|| self.default_model.clone())
    }

    fn post(&self, url: &str) -> reqwest::RequestBuilder {
        let builder = self
            .client
            .post(url)
            .header("Content-Type", "application/json");
        match &self.api_key {
            Some(key) => builder.bearer_auth(key),
            None => builder,
        }
    }

    // ── Internal: request bodies ──────────────────────────────────

    fn build_responses_body(&self, req: &ProviderRequest) -> Value {
        let mut input: Vec<Value> = req.input.iter().flat_map(msg_to_responses_items).collect();
        for out in &req.function_outputs {
            input.push(json!({
                "type": "function_call_output",
                "call_id": out.call_id,
                "output": out.output,
            }));
        }

        let mut body = json!({
            "model": self.effective_model(req),
            "input": input,
            "stream": true,
            "store": req.store,
        });

        if !req.tools.is_empty() {
            let tools: Vec<Value> = req.tools.iter().map(tool_to_responses).collect();
            body["tools"] = Value::Array(tools);
        }
        if let Some(prev) = &req.previous_response_id {
            body["previous_response_id"] = Value::String(prev.clone());
        }
        if let Some(effort) = req.reasoning_effort.as_ref().or(self.reasoning_effort.as_ref()) {
            body["reasoning"] = json!({ "effort": effort, "summary": "auto" });
        }
        if let Some(temp) = req.temperature {
            body["temperature"] = json!(temp);
        }
        if let Some(max) = req.max_output_tokens {
            body["max_output_tokens"] = json!(max);
        }
        body
    }

    fn build_chat_body(&self, req: &ProviderRequest) -> Value {
        let messages: Vec<Value> = req.input.iter().map(msg_to_chat).collect();

        let mut body = json!({
            "model": self.effective_model(req),
            "messages": messages,
            "stream": true,
            "stream_options": { "include_usage": true },
        });

        if !req.tools.is_empty() {
            let tools: Vec<Value> = req.tools.iter().map(tool_to_chat).collect();
            body["tools"] = Value::Array(tools);
        }
        if let Some(temp) = req.temperature {
            body["temperature"] = json!(temp);
        }
        if let Some(max) = req.max_output_tokens {
            body["max_tokens"] = json!(max);
        }
        body
    }

    async fn send(&self, url: &str, body: &Value) -> Result<reqwest::Response> {
        tracing::debug!(provider = %self.id, url = %url, "opening provider stream");

        let resp = tokio::time::timeout(self.request_timeout, self.post(url).json(body).send())
            .await
            .map_err(|_| {
                Error::Timeout(format!(
                    "{}: no response headers after {}ms",
                    self.id,
                    self.request_timeout.as_millis()
                ))
            })?
            .map_err(from_reqwest)?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.map_err(from_reqwest)?;
            return Err(Error::provider(
                &self.id,
                format!("HTTP {} - {}", status.as_u16(), text),
            ));
        }
        Ok(resp)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Trait implementation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[async_trait::async_trait]
impl ProviderClient for OpenAiProvider {
    async fn open_stream(
        &self,
        req: &ProviderRequest,
    ) -> Result<BoxStream<'static, Result<StreamEvent>>> {
        match req.api {
            ApiKind::Responses => {
                let url = format!("{}/responses", self.base_url);
                let resp = self.send(&url, &self.build_responses_body(req)).await?;
                Ok(sse_response_stream(resp, parse_responses_frame))
            }
            ApiKind::ChatCompletions => {
                let url = format!("{}/chat/completions", self.base_url);
                let resp = self.send(&url, &self.build_chat_body(req)).await?;
                let mut state = ChatStreamState::default();
                Ok(sse_response_stream(resp, move |frame| state.on_frame(frame)))
            }
        }
    }

    fn primary_api(&self) -> ApiKind {
        self.api
    }

    fn supports_chaining(&self) -> bool {
        self.stateful
    }

    fn provider_id(&self) -> &str {
        &self.id
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Message serialization helpers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn role_to_str(role: Role) -> &'static str {
    match role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::Tool => "tool",
    }
}

/// One conversation message becomes one or more Responses input items:
/// text turns map to role items, tool calls to `function_call` items and
/// tool results to `function_call_output` items.
fn msg_to_responses_items(msg: &Message) -> Vec<Value> {
    let parts = match &msg.content {
        MessageContent::Text(text) => {
            return vec![json!({ "role": role_to_str(msg.role), "content": text })];
        }
        MessageContent::Parts(parts) => parts,
    };

    let mut items = Vec::new();
    let mut text = Vec::new();
    for part in parts {
        match part {
            ContentPart::Text { text: t } => text.push(t.as_str()),
            ContentPart::ToolUse { id, name, input } => items.push(json!({
                "type": "function_call",
                "call_id": id,
                "name": name,
                "arguments": input.to_string(),
            })),
            ContentPart::ToolResult { tool_use_id, content, .. } => items.push(json!({
                "type": "function_call_output",
                "call_id": tool_use_id,
                "output": content,
            })),
        }
    }
    if !text.is_empty() && msg.role != Role::Tool {
        items.insert(0, json!({ "role": role_to_str(msg.role), "content": text.join("\n") }));
    }
    items
}

fn msg_to_chat(msg: &Message) -> Value {
    match msg.role {
        Role::Tool => tool_result_to_chat(msg),
        Role::Assistant => assistant_to_chat(msg),
        _ => json!({
            "role": role_to_str(msg.role),
            "content": msg.content.extract_all_text(),
        }),
    }
}

fn assistant_to_chat(msg: &Message) -> Value {
    let mut obj = json!({ "role": "assistant" });
    let mut text_parts: Vec<&str> = Vec::new();
    let mut tool_calls: Vec<Value> = Vec::new();

    match &msg.content {
        MessageContent::Text(t) => text_parts.push(t),
        MessageContent::Parts(parts) => {
            for part in parts {
                match part {
                    ContentPart::Text { text } => text_parts.push(text),
                    ContentPart::ToolUse { id, name, input } => tool_calls.push(json!({
                        "id": id,
                        "type": "function",
                        "function": { "name": name, "arguments": input.to_string() },
                    })),
                    _ => {}
                }
            }
        }
    }

    obj["content"] = if text_parts.is_empty() {
        Value::Null
    } else {
        Value::String(text_parts.join("\n"))
    };
    if !tool_calls.is_empty() {
        obj["tool_calls"] = Value::Array(tool_calls);
    }
    obj
}

fn tool_result_to_chat(msg: &Message) -> Value {
    let found = match &msg.content {
        MessageContent::Parts(parts) => parts.iter().find_map(|p| match p {
            ContentPart::ToolResult { tool_use_id, content, .. } => {
                Some((tool_use_id.as_str(), content.as_str()))
            }
            _ => None,
        }),
        MessageContent::Text(t) => Some(("", t.as_str())),
    };
    let (id, content) = found.unwrap_or(("", ""));
    json!({ "role": "tool", "tool_call_id": id, "content": content })
}

fn tool_to_responses(tool: &ToolDefinition) -> Value {
    json!({
        "type": "function",
        "name": tool.name,
        "description": tool.description,
        "parameters": tool.parameters,
    })
}

fn tool_to_chat(tool: &ToolDefinition) -> Value {
    json!({
        "type": "function",
        "function": {
            "name": tool.name,
            "description": tool.description,
            "parameters": tool.parameters,
        }
    })
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Responses stream parsing
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn str_field(v: &Value, key: &str) -> String {
    v.get(key).and_then(Value::as_str).unwrap_or_default().to_string()
}

fn u32_field(v: &Value, key: &str) -> u32 {
    v.get(key)
        .and_then(Value::as_u64)
        .map(|n| u32::try_from(n).unwrap_or(u32::MAX))
        .unwrap_or(0)
}

fn parse_responses_usage(v: &Value) -> Option<Usage> {
    if !v.is_object() {
        return None;
    }
    let prompt_tokens = u32_field(v, "input_tokens");
    let completion_tokens = u32_field(v, "output_tokens");
    let reasoning_tokens = v
        .get("output_tokens_details")
        .map(|d| u32_field(d, "reasoning_tokens"))
        .unwrap_or(0);
    let total_tokens = match u32_field(v, "total_tokens") {
        0 => prompt_tokens.saturating_add(completion_tokens),
        n => n,
    };
    Some(Usage { prompt_tokens, completion_tokens, reasoning_tokens, total_tokens })
}

fn parse_responses_frame(frame: &SseFrame) -> Vec<Result<StreamEvent>> {
    let v: Value = match serde_json::from_str(&frame.data) {
        Ok(v) => v,
        Err(e) => return vec![Err(Error::Json(e))],
    };
    let kind = v
        .get("type")
        .and_then(Value::as_str)
        .or(frame.event.as_deref())
        .unwrap_or_default();

    let event = match kind {
        "response.output_text.delta" => StreamEvent::TextDelta { text: str_field(&v, "delta") },
        "response.reasoning_text.delta" | "response.reasoning_summary_text.delta" => {
            StreamEvent::ReasoningDelta { text: str_field(&v, "delta") }
        }
        "response.output_item.added" | "response.output_item.done" => {
            let Some(item) = v.get("item").filter(|i| i["type"] == "function_call") else {
                return Vec::new();
            };
            let item_id = str_field(item, "id");
            let call_id = str_field(item, "call_id");
            let tool_name = str_field(item, "name");
            if kind == "response.output_item.added" {
                StreamEvent::ToolCallStarted { item_id, call_id, tool_name }
            } else {
                StreamEvent::ToolCallDone {
                    item_id,
                    call_id,
                    tool_name,
                    arguments: str_field(item, "arguments"),
                }
            }
        }
        "response.function_call_arguments.delta" => StreamEvent::ToolCallDelta {
            item_id: str_field(&v, "item_id"),
            delta: str_field(&v, "delta"),
        },
        "response.completed" | "response.incomplete" => {
            let response = v.get("response").unwrap_or(&Value::Null);
            let finish_reason = if kind == "response.completed" {
                "stop".to_string()
            } else {
                response
                    .get("incomplete_details")
                    .and_then(|d| d.get("reason"))
                    .and_then(Value::as_str)
                    .unwrap_or("incomplete")
                    .to_string()
            };
            StreamEvent::Completed {
                response_id: response.get("id").and_then(Value::as_str).map(String::from),
                usage: response.get("usage").and_then(parse_responses_usage),
                finish_reason: Some(finish_reason),
            }
        }
        "response.failed" => {
            let err = v.get("response").and_then(|r| r.get("error")).unwrap_or(&Value::Null);
            StreamEvent::Error { message: error_message(err, "response failed") }
        }
        "error" => StreamEvent::Error { message: error_message(&v, "stream error") },
        _ => return Vec::new(),
    };
    vec![Ok(event)]
}

/// The raw error object is kept as JSON so the classifier sees the code.
fn error_message(err: &Value, fallback: &str) -> String {
    if err.is_null() {
        fallback.to_string()
    } else {
        err.to_string()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Chat Completions stream parsing
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Default)]
struct ChatToolCall {
    item_id: String,
    call_id: String,
    tool_name: String,
    arguments: String,
}

/// Chat Completions spreads each tool call over chunks keyed by `index`
/// and reports usage in a trailing chunk, so the parser keeps state
/// between frames.
#[derive(Debug, Default)]
struct ChatStreamState {
    calls: BTreeMap<u64, ChatToolCall>,
    usage: Option<Usage>,
    finish_reason: Option<String>,
}

impl ChatStreamState {
    fn on_frame(&mut self, frame: &SseFrame) -> Vec<Result<StreamEvent>> {
        if frame.data == "[DONE]" {
            let mut out = self.flush_calls();
            out.push(Ok(StreamEvent::Completed {
                response_id: None,
                usage: self.usage.take(),
                finish_reason: Some(self.finish_reason.take().unwrap_or_else(|| "stop".into())),
            }));
            return out;
        }

        let v: Value = match serde_json::from_str(&frame.data) {
            Ok(v) => v,
            Err(e) => return vec![Err(Error::Json(e))],
        };

        if v.get("error").is_some_and(|e| !e.is_null()) {
            return vec![Ok(StreamEvent::Error { message: v.to_string() })];
        }

        if let Some(usage) = v.get("usage").filter(|u| !u.is_null()) {
            self.usage = Some(Usage {
                prompt_tokens: u32_field(usage, "prompt_tokens"),
                completion_tokens: u32_field(usage, "completion_tokens"),
                reasoning_tokens: usage
                    .get("completion_tokens_details")
                    .map(|d| u32_field(d, "reasoning_tokens"))
                    .unwrap_or(0),
                total_tokens: u32_field(usage, "total_tokens"),
            });
        }

        let Some(choice) = v.get("choices").and_then(Value::as_array).and_then(|a| a.first())
        else {
            return Vec::new();
        };
        let delta = choice.get("delta").unwrap_or(&Value::Null);
        let mut out = Vec::new();

        if let Some(text) = delta.get("reasoning_content").and_then(Value::as_str) {
            if !text.is_empty() {
                out.push(Ok(StreamEvent::ReasoningDelta { text: text.to_string() }));
            }
        }
        if let Some(text) = delta.get("content").and_then(Value::as_str) {
            if !text.is_empty() {
                out.push(Ok(StreamEvent::TextDelta { text: text.to_string() }));
            }
        }

        for tc in delta.get("tool_calls").and_then(Value::as_array).into_iter().flatten() {
            let index = tc.get("index").and_then(Value::as_u64).unwrap_or(0);
            let function = tc.get("function").unwrap_or(&Value::Null);

            if !self.calls.contains_key(&index) {
                let call_id = tc
                    .get("id")
                    .and_then(Value::as_str)
                    .map(String::from)
                    .unwrap_or_else(|| format!("call_{index}"));
                let call = ChatToolCall {
                    item_id: format!("chat_tool_{index}"),
                    call_id,
                    tool_name: str_field(function, "name"),
                    arguments: String::new(),
                };
                out.push(Ok(StreamEvent::ToolCallStarted {
                    item_id: call.item_id.clone(),
                    call_id: call.call_id.clone(),
                    tool_name: call.tool_name.clone(),
                }));
                self.calls.insert(index, call);
            }

            if let Some(fragment) = function.get("arguments").and_then(Value::as_str) {
                if let Some(call) = self.calls.get_mut(&index) {
                    if !fragment.is_empty() {
                        call.arguments.push_str(fragment);
                        out.push(Ok(StreamEvent::ToolCallDelta {
                            item_id: call.item_id.clone(),
                            delta: fragment.to_string(),
                        }));
                    }
                }
            }
        }

        if let Some(reason) = choice.get("finish_reason").and_then(Value::as_str) {
            self.finish_reason = Some(reason.to_string());
            out.extend(self.flush_calls());
        }
        out
    }

    fn flush_calls(&mut self) -> Vec<Result<StreamEvent>> {
        std::mem::take(&mut self.calls)
            .into_values()
            .map(|c| {
                Ok(StreamEvent::ToolCallDone {
                    item_id: c.item_id,
                    call_id: c.call_id,
                    tool_name: c.tool_name,
                    arguments: c.arguments,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::FunctionOutput;

    fn frame(data: &str) -> SseFrame {
        SseFrame { event: None, data: data.to_string() }
    }

    fn events(out: Vec<Result<StreamEvent>>) -> Vec<StreamEvent> {
        out.into_iter().map(|e| e.unwrap()).collect()
    }

    fn provider(api: ApiKind) -> OpenAiProvider {
        let cfg = ProviderConfig {
            id: "test".into(),
            base_url: "http://localhost:9/v1/".into(),
            api,
            api_key_env: None,
            default_model: Some("m1".into()),
            stateful: true,
            reasoning_effort: None,
        };
        OpenAiProvider::from_config(&cfg, 1000).unwrap()
    }

    #[test]
    fn chaining_requires_responses_api() {
        assert!(provider(ApiKind::Responses).supports_chaining());
        assert!(!provider(ApiKind::ChatCompletions).supports_chaining());
        assert_eq!(provider(ApiKind::ChatCompletions).base_url, "http://localhost:9/v1");
    }

    #[test]
    fn responses_body_for_chained_continuation() {
        let p = provider(ApiKind::Responses);
        let base = ProviderRequest {
            input: vec![Message::user("hi")],
            tools: vec![ToolDefinition {
                name: "lookup".into(),
                description: "find things".into(),
                parameters: json!({"type": "object"}),
            }],
            ..Default::default()
        };
        let req = base.chained_continuation(
            "resp_1",
            vec![FunctionOutput { call_id: "c1".into(), output: "42".into() }],
            Vec::new(),
        );
        let body = p.build_responses_body(&req);
        assert_eq!(body["model"], "m1");
        assert_eq!(body["previous_response_id"], "resp_1");
        assert_eq!(body["store"], true);
        assert_eq!(body["input"][0]["type"], "function_call_output");
        assert_eq!(body["input"][0]["output"], "42");
        assert_eq!(body["tools"][0]["name"], "lookup");
    }

    #[test]
    fn chat_body_replays_tool_history() {
        let p = provider(ApiKind::ChatCompletions);
        let call = rb_domain::tool::ToolCall {
            call_id: "c1".into(),
            tool_name: "lookup".into(),
            arguments: json!({"q": "x"}),
        };
        let req = ProviderRequest {
            api: ApiKind::ChatCompletions,
            input: vec![
                Message::user("hi"),
                Message::assistant_tool_calls("", std::slice::from_ref(&call)),
                Message::tool_result("c1", "found", false),
            ],
            ..Default::default()
        };
        let body = p.build_chat_body(&req);
        let msgs = body["messages"].as_array().unwrap();
        assert_eq!(msgs.len(), 3);
        assert!(msgs[1]["content"].is_null());
        assert_eq!(msgs[1]["tool_calls"][0]["function"]["name"], "lookup");
        assert_eq!(msgs[2]["role"], "tool");
        assert_eq!(msgs[2]["tool_call_id"], "c1");
        assert!(body.get("tools").is_none());
    }

    #[test]
    fn responses_text_and_completion() {
        let delta = events(parse_responses_frame(&frame(
            r#"{"type":"response.output_text.delta","delta":"Hel"}"#,
        )));
        assert_eq!(delta, vec![StreamEvent::TextDelta { text: "Hel".into() }]);

        let done = events(parse_responses_frame(&frame(
            r#"{"type":"response.completed","response":{"id":"resp_9","usage":{"input_tokens":12,"output_tokens":3,"output_tokens_details":{"reasoning_tokens":1}}}}"#,
        )));
        match &done[0] {
            StreamEvent::Completed { response_id, usage, finish_reason } => {
                assert_eq!(response_id.as_deref(), Some("resp_9"));
                let usage = usage.unwrap();
                assert_eq!(usage.total_tokens, 15);
                assert_eq!(usage.reasoning_tokens, 1);
                assert_eq!(finish_reason.as_deref(), Some("stop"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn responses_function_call_items() {
        let started = events(parse_responses_frame(&frame(
            r#"{"type":"response.output_item.added","item":{"type":"function_call","id":"fc_1","call_id":"call_1","name":"lookup","arguments":""}}"#,
        )));
        assert_eq!(
            started,
            vec![StreamEvent::ToolCallStarted {
                item_id: "fc_1".into(),
                call_id: "call_1".into(),
                tool_name: "lookup".into(),
            }]
        );

        let delta = events(parse_responses_frame(&frame(
            r#"{"type":"response.function_call_arguments.delta","item_id":"fc_1","delta":"{\"q\":"}"#,
        )));
        assert_eq!(
            delta,
            vec![StreamEvent::ToolCallDelta { item_id: "fc_1".into(), delta: "{\"q\":".into() }]
        );

        let done = events(parse_responses_frame(&frame(
            r#"{"type":"response.output_item.done","item":{"type":"function_call","id":"fc_1","call_id":"call_1","name":"lookup","arguments":"{\"q\":1}"}}"#,
        )));
        assert!(matches!(
            &done[0],
            StreamEvent::ToolCallDone { arguments, .. } if arguments == "{\"q\":1}"
        ));

        let message_item = parse_responses_frame(&frame(
            r#"{"type":"response.output_item.added","item":{"type":"message","id":"msg_1"}}"#,
        ));
        assert!(message_item.is_empty());
    }

    #[test]
    fn responses_event_name_from_sse_header() {
        let f = SseFrame {
            event: Some("response.reasoning_summary_text.delta".into()),
            data: r#"{"delta":"thinking"}"#.into(),
        };
        assert_eq!(
            events(parse_responses_frame(&f)),
            vec![StreamEvent::ReasoningDelta { text: "thinking".into() }]
        );
    }

    #[test]
    fn responses_failure_keeps_error_json() {
        let out = events(parse_responses_frame(&frame(
            r#"{"type":"response.failed","response":{"error":{"code":"context_length_exceeded","message":"too long"}}}"#,
        )));
        match &out[0] {
            StreamEvent::Error { message } => assert!(message.contains("context_length_exceeded")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn chat_stream_assembles_tool_calls_and_usage() {
        let mut state = ChatStreamState::default();
        let mut all = Vec::new();
        for data in [
            r#"{"choices":[{"index":0,"delta":{"role":"assistant","content":"Let me check."}}]}"#,
            r#"{"choices":[{"index":0,"delta":{"tool_calls":[{"index":0,"id":"call_a","type":"function","function":{"name":"lookup","arguments":""}}]}}]}"#,
            r#"{"choices":[{"index":0,"delta":{"tool_calls":[{"index":0,"function":{"arguments":"{\"q\":"}}]}}]}"#,
            r#"{"choices":[{"index":0,"delta":{"tool_calls":[{"index":0,"function":{"arguments":"\"x\"}"}}]}}]}"#,
            r#"{"choices":[{"index":0,"delta":{},"finish_reason":"tool_calls"}]}"#,
            r#"{"choices":[],"usage":{"prompt_tokens":20,"completion_tokens":7,"total_tokens":27}}"#,
            "[DONE]",
        ] {
            all.extend(events(state.on_frame(&frame(data))));
        }

        assert_eq!(all[0], StreamEvent::TextDelta { text: "Let me check.".into() });
        assert!(matches!(&all[1], StreamEvent::ToolCallStarted { call_id, .. } if call_id == "call_a"));
        assert!(matches!(
            &all[4],
            StreamEvent::ToolCallDone { arguments, item_id, .. }
                if arguments == "{\"q\":\"x\"}" && item_id == "chat_tool_0"
        ));
        match all.last().unwrap() {
            StreamEvent::Completed { response_id, usage, finish_reason } => {
                assert!(response_id.is_none());
                assert_eq!(usage.unwrap().total_tokens, 27);
                assert_eq!(finish_reason.as_deref(), Some("tool_calls"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn chat_stream_error_chunk() {
        let mut state = ChatStreamState::default();
        let out = events(state.on_frame(&frame(
            r#"{"error":{"message":"Invalid schema for function 'x'"}}"#,
        )));
        assert!(matches!(&out[0], StreamEvent::Error { message } if message.contains("Invalid schema")));
    }
}
