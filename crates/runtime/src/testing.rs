//! Test doubles: a scripted provider, a recording sink and a
//! closure-backed tool executor.
//!
//! Public so integration tests and embedders can drive the dispatcher
//! without a network.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;

use rb_domain::config::ApiKind;
use rb_domain::error::{Error, Result};
use rb_domain::stream::{BoxStream, StreamEvent, Usage};
use rb_domain::tool::ToolOutput;
use rb_providers::{ProviderClient, ProviderRequest};

use crate::ports::{DeltaPayload, InboundItem, PresentationSink, ToolExecutor};
use crate::turn::TurnStatus;

pub use crate::memory::{MemoryStore, NoTools, SimplePromptBuilder};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Scripted provider
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One scripted answer to `open_stream`.
pub enum ScriptedRound {
    Events(Vec<StreamEvent>),
    /// Events separated by a pause.
    Paced { events: Vec<StreamEvent>, gap: Duration },
    /// Emit the events, then never finish.
    Stall(Vec<StreamEvent>),
    /// `open_stream` itself fails.
    Fail(Error),
}

impl ScriptedRound {
    /// A plain text answer in one delta.
    pub fn text(text: &str, response_id: Option<&str>) -> Self {
        Self::Events(vec![
            StreamEvent::TextDelta { text: text.into() },
            completed(response_id),
        ])
    }

    /// A round that only calls one tool.
    pub fn tool_call(call_id: &str, tool_name: &str, arguments: &str, response_id: Option<&str>) -> Self {
        Self::Events(vec![
            StreamEvent::ToolCallStarted {
                item_id: format!("item_{call_id}"),
                call_id: call_id.into(),
                tool_name: tool_name.into(),
            },
            StreamEvent::ToolCallDelta {
                item_id: format!("item_{call_id}"),
                delta: arguments.into(),
            },
            StreamEvent::ToolCallDone {
                item_id: format!("item_{call_id}"),
                call_id: call_id.into(),
                tool_name: tool_name.into(),
                arguments: String::new(),
            },
            completed(response_id),
        ])
    }
}

/// A `Completed` event with a small fixed usage.
pub fn completed(response_id: Option<&str>) -> StreamEvent {
    StreamEvent::Completed {
        response_id: response_id.map(str::to_owned),
        usage: Some(Usage {
            prompt_tokens: 10,
            completion_tokens: 5,
            reasoning_tokens: 0,
            total_tokens: 15,
        }),
        finish_reason: Some("stop".into()),
    }
}

/// Provider that replays scripted rounds in order and records every
/// request it receives.
pub struct ScriptedProvider {
    id: String,
    api: ApiKind,
    chaining: bool,
    rounds: Mutex<VecDeque<ScriptedRound>>,
    requests: Mutex<Vec<ProviderRequest>>,
}

impl ScriptedProvider {
    pub fn new(rounds: Vec<ScriptedRound>) -> Self {
        Self {
            id: "scripted".into(),
            api: ApiKind::Responses,
            chaining: false,
            rounds: Mutex::new(rounds.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn with_api(mut self, api: ApiKind) -> Self {
        self.api = api;
        self
    }

    pub fn with_chaining(mut self, chaining: bool) -> Self {
        self.chaining = chaining;
        self
    }

    /// Append rounds after construction.
    pub fn push(&self, round: ScriptedRound) {
        self.rounds.lock().push_back(round);
    }

    pub fn requests(&self) -> Vec<ProviderRequest> {
        self.requests.lock().clone()
    }

    pub fn remaining(&self) -> usize {
        self.rounds.lock().len()
    }
}

#[async_trait::async_trait]
impl ProviderClient for ScriptedProvider {
    async fn open_stream(
        &self,
        req: &ProviderRequest,
    ) -> Result<BoxStream<'static, Result<StreamEvent>>> {
        self.requests.lock().push(req.clone());
        let round = self.rounds.lock().pop_front();
        let (events, gap, stall) = match round {
            None => return Err(Error::Other("no scripted round left".into())),
            Some(ScriptedRound::Fail(e)) => return Err(e),
            Some(ScriptedRound::Events(events)) => (events, None, false),
            Some(ScriptedRound::Paced { events, gap }) => (events, Some(gap), false),
            Some(ScriptedRound::Stall(events)) => (events, None, true),
        };

        let stream = async_stream::stream! {
            for event in events {
                if let Some(gap) = gap {
                    tokio::time::sleep(gap).await;
                }
                yield Ok::<_, Error>(event);
            }
            if stall {
                std::future::pending::<()>().await;
            }
        };
        Ok(Box::pin(stream))
    }

    fn primary_api(&self) -> ApiKind {
        self.api
    }

    fn supports_chaining(&self) -> bool {
        self.chaining
    }

    fn provider_id(&self) -> &str {
        &self.id
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Presentation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, PartialEq)]
pub enum SinkEvent {
    Rendered { room_id: String, message_id: String, text: String },
    Updated { room_id: String, message_id: String, text: String },
    Delta { room_id: String, turn_id: String, seq: u64, payload: DeltaPayload },
    Status { room_id: String, turn_id: String, status: TurnStatus, detail: Option<String> },
    Media { room_id: String, output: ToolOutput },
    Rejected { room_id: String, event_id: Option<String> },
}

/// Sink that records everything it is asked to show.
#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<SinkEvent>>,
    next_id: Mutex<u64>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<SinkEvent> {
        self.events.lock().clone()
    }

    pub fn statuses(&self, room_id: &str) -> Vec<TurnStatus> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                SinkEvent::Status { room_id: r, status, .. } if r == room_id => Some(*status),
                _ => None,
            })
            .collect()
    }

    /// Messages posted to the room (first renders only).
    pub fn rendered(&self, room_id: &str) -> Vec<String> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                SinkEvent::Rendered { room_id: r, text, .. } if r == room_id => Some(text.clone()),
                _ => None,
            })
            .collect()
    }

    /// The current text of every message in the room, in posting order.
    pub fn room_messages(&self, room_id: &str) -> Vec<String> {
        let mut order: Vec<String> = Vec::new();
        let mut texts: HashMap<String, String> = HashMap::new();
        for event in self.events.lock().iter() {
            match event {
                SinkEvent::Rendered { room_id: r, message_id, text } if r == room_id => {
                    order.push(message_id.clone());
                    texts.insert(message_id.clone(), text.clone());
                }
                SinkEvent::Updated { room_id: r, message_id, text } if r == room_id => {
                    texts.insert(message_id.clone(), text.clone());
                }
                _ => {}
            }
        }
        order.into_iter().filter_map(|id| texts.remove(&id)).collect()
    }

    pub fn rejected(&self) -> Vec<(String, Option<String>)> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                SinkEvent::Rejected { room_id, event_id } => Some((room_id.clone(), event_id.clone())),
                _ => None,
            })
            .collect()
    }

    fn push(&self, event: SinkEvent) {
        self.events.lock().push(event);
    }
}

#[async_trait::async_trait]
impl PresentationSink for RecordingSink {
    async fn render_partial(&self, room_id: &str, text: &str) -> Result<String> {
        let message_id = {
            let mut next = self.next_id.lock();
            *next += 1;
            format!("$msg_{next}")
        };
        self.push(SinkEvent::Rendered {
            room_id: room_id.into(),
            message_id: message_id.clone(),
            text: text.into(),
        });
        Ok(message_id)
    }

    async fn update_message(&self, room_id: &str, message_id: &str, text: &str) -> Result<()> {
        self.push(SinkEvent::Updated {
            room_id: room_id.into(),
            message_id: message_id.into(),
            text: text.into(),
        });
        Ok(())
    }

    async fn emit_delta(&self, room_id: &str, turn_id: &str, seq: u64, payload: DeltaPayload) {
        self.push(SinkEvent::Delta {
            room_id: room_id.into(),
            turn_id: turn_id.into(),
            seq,
            payload,
        });
    }

    async fn emit_status(
        &self,
        room_id: &str,
        turn_id: &str,
        status: TurnStatus,
        detail: Option<&str>,
    ) {
        self.push(SinkEvent::Status {
            room_id: room_id.into(),
            turn_id: turn_id.into(),
            status,
            detail: detail.map(str::to_owned),
        });
    }

    async fn send_media(&self, room_id: &str, output: &ToolOutput) -> Result<String> {
        self.push(SinkEvent::Media { room_id: room_id.into(), output: output.clone() });
        Ok(format!("$media_{room_id}"))
    }

    async fn report_rejected(&self, room_id: &str, item: &InboundItem) {
        self.push(SinkEvent::Rejected {
            room_id: room_id.into(),
            event_id: item.event_id.clone(),
        });
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tools and prompts
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

type ToolFn = dyn Fn(&str, &Value) -> Result<ToolOutput> + Send + Sync;

/// Tool executor backed by a closure.  Records every call.
pub struct FnTools {
    handler: Arc<ToolFn>,
    delay: Option<Duration>,
    calls: Mutex<Vec<(String, Value)>>,
}

impl FnTools {
    pub fn new(handler: impl Fn(&str, &Value) -> Result<ToolOutput> + Send + Sync + 'static) -> Self {
        Self { handler: Arc::new(handler), delay: None, calls: Mutex::new(Vec::new()) }
    }

    /// Executor that knows no tools.
    pub fn none() -> Self {
        Self::new(|name, _| Err(Error::Other(format!("unknown tool: {name}"))))
    }

    /// Sleep this long before answering.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> Vec<(String, Value)> {
        self.calls.lock().clone()
    }
}

#[async_trait::async_trait]
impl ToolExecutor for FnTools {
    async fn execute(&self, name: &str, arguments: &Value) -> Result<ToolOutput> {
        self.calls.lock().push((name.to_owned(), arguments.clone()));
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        (self.handler)(name, arguments)
    }
}
