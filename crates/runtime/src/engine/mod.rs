//! Streaming completion engine.
//!
//! One turn runs as a loop over provider rounds:
//!
//! ```text
//! Starting ──▶ Generating ⇄ ToolUse ──▶ Finalizing ──▶ Completed
//!     └──────────────┴──────────┴─────────────┴──▶ Error
//! ```
//!
//! [`CompletionEngine::stream_round`] consumes one provider stream: it
//! appends text and reasoning, renders the first partial message, and runs
//! each tool as soon as its call is complete.  While tool outputs (or
//! steering messages) are pending, the engine issues a continuation
//! request, chained by response id for stateful providers and replayed
//! from the base input otherwise, and loops.
//!
//! The whole loop runs inside the API fallback chain.  Each attempt starts
//! the turn over, which is safe because only failures with nothing
//! visible in the room are eligible for fallback.

pub mod tools;

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use tracing::Instrument;

use rb_domain::config::{ApiKind, EngineConfig};
use rb_domain::error::Error;
use rb_domain::stream::StreamEvent;
use rb_domain::tool::{
    Message, ResultStatus, ToolCall, ToolCallRecord, ToolCallStatus, ToolOutput, ToolType,
};
use rb_domain::trace::TraceEvent;
use rb_providers::{
    classify, run_with_fallback, Attempt, ErrorClass, FunctionOutput, ProviderClient,
    ProviderRequest,
};

use crate::cancel::CancelToken;
use crate::error::TurnError;
use crate::ports::{DeltaPayload, PresentationSink, RoomContext, ToolExecutor, TurnStore};
use crate::steer::SteerInbox;
use crate::turn::{now_ms, ActiveToolCall, DeltaSequence, StreamingTurn, TurnOutcome, TurnStatus};

/// Finish reason recorded when the continuation loop is force-stopped.
pub const TOOL_ROUND_LIMIT: &str = "tool_round_limit";

/// Everything one turn needs, cloned at dispatch time.
pub struct TurnRequest {
    pub turn_id: String,
    pub room: RoomContext,
    pub request: ProviderRequest,
    pub source_event_id: Option<String>,
    pub suppress_save: bool,
    pub suppress_send: bool,
    pub cancel: CancelToken,
    pub steer: SteerInbox,
    /// Shared by every attempt of this turn id.
    pub sequence: DeltaSequence,
}

enum RoundEnd {
    Completed,
    Cancelled,
}

pub struct CompletionEngine {
    provider: Arc<dyn ProviderClient>,
    tools: Arc<dyn ToolExecutor>,
    sink: Arc<dyn PresentationSink>,
    store: Arc<dyn TurnStore>,
    config: EngineConfig,
}

impl CompletionEngine {
    pub fn new(
        provider: Arc<dyn ProviderClient>,
        tools: Arc<dyn ToolExecutor>,
        sink: Arc<dyn PresentationSink>,
        store: Arc<dyn TurnStore>,
        config: EngineConfig,
    ) -> Self {
        Self { provider, tools, sink, store, config }
    }

    /// Run one turn to completion, cancellation or failure.
    pub async fn run_turn(&self, req: &TurnRequest) -> Result<TurnOutcome, TurnError> {
        TraceEvent::TurnStarted {
            room_id: req.room.room_id.clone(),
            turn_id: req.turn_id.clone(),
            source_event_id: req.source_event_id.clone(),
        }
        .emit();

        let initial = Attempt::primary(self.provider.primary_api());
        let result = run_with_fallback(initial, |attempt| self.run_attempt(req, attempt)).await;

        let (outcome, rounds, duration_ms, usage) = match &result {
            Ok(o) => (o.label(), o.turn().rounds, o.turn().duration_ms(), o.turn().usage),
            Err(e) => (e.kind(), 0, 0, Default::default()),
        };
        if let Err(TurnError::PreDelta { source, .. }) = &result {
            self.sink
                .emit_status(
                    &req.room.room_id,
                    &req.turn_id,
                    TurnStatus::Failed,
                    Some(&source.to_string()),
                )
                .await;
        }
        TraceEvent::TurnFinished {
            room_id: req.room.room_id.clone(),
            turn_id: req.turn_id.clone(),
            outcome: outcome.to_string(),
            rounds,
            duration_ms,
            prompt_tokens: usage.prompt_tokens,
            completion_tokens: usage.completion_tokens,
        }
        .emit();
        result
    }

    async fn run_attempt(
        &self,
        req: &TurnRequest,
        attempt: Attempt,
    ) -> Result<TurnOutcome, TurnError> {
        req.steer.rewind();

        let mut turn = StreamingTurn::new(&req.room.room_id, &req.room.agent_id);
        turn.turn_id = req.turn_id.clone();
        turn.source_event_id = req.source_event_id.clone();
        turn.suppress_save = req.suppress_save;
        turn.suppress_send = req.suppress_send;
        turn.sequence = req.sequence.clone();

        if req.sequence.current() > 0 {
            let seq = turn.next_seq();
            self.sink
                .emit_delta(&turn.room_id, &turn.turn_id, seq, DeltaPayload::Restarted)
                .await;
        }

        let stateful = self.provider.supports_chaining() && attempt.api == ApiKind::Responses;
        let mut request = req.request.downgraded(attempt.api, attempt.tools_enabled);
        request.store = stateful;
        if !stateful {
            request.previous_response_id = None;
        }

        // Steers accepted before the first request ride along with it.
        request.input.extend(req.steer.take_pending());
        turn.base_input = request.input.clone();

        self.sink
            .emit_status(&turn.room_id, &turn.turn_id, TurnStatus::Starting, None)
            .await;

        loop {
            if req.cancel.is_cancelled() {
                return Ok(self.finish_cancelled(turn).await);
            }

            match self.stream_round(&mut turn, &request, &req.cancel).await {
                Ok(RoundEnd::Completed) => {}
                Ok(RoundEnd::Cancelled) => return Ok(self.finish_cancelled(turn).await),
                Err(e) => return Err(self.fail(&mut turn, e).await),
            }

            if !turn.has_content() {
                let err = Error::EmptyResponse {
                    provider: self.provider.provider_id().to_string(),
                };
                return Err(self.fail(&mut turn, err).await);
            }

            let mut steering = req.steer.take_pending();
            if turn.pending_function_outputs.is_empty() && steering.is_empty() {
                steering = req.steer.close_and_take();
                if steering.is_empty() {
                    break;
                }
            }

            if turn.rounds >= self.config.max_tool_rounds {
                tracing::warn!(
                    rounds = turn.rounds,
                    pending_outputs = turn.pending_function_outputs.len(),
                    "continuation limit reached; finalizing turn"
                );
                req.steer.close();
                req.steer.unconsume(steering);
                turn.pending_function_outputs.clear();
                turn.finish_reason = Some(TOOL_ROUND_LIMIT.to_string());
                break;
            }

            turn.rounds += 1;
            TraceEvent::ContinuationRound {
                room_id: turn.room_id.clone(),
                turn_id: turn.turn_id.clone(),
                round: turn.rounds,
                pending_outputs: turn.pending_function_outputs.len(),
                stateful,
            }
            .emit();

            let outputs: Vec<FunctionOutput> = std::mem::take(&mut turn.pending_function_outputs);
            turn.history.extend(steering.iter().cloned());
            request = match turn.response_id.as_deref().filter(|_| stateful) {
                Some(response_id) => request.chained_continuation(response_id, outputs, steering),
                None => request.replayed_continuation(&turn.base_input, &turn.history),
            };
        }

        self.finish_completed(&mut turn, stateful).await;
        Ok(TurnOutcome::Completed(turn))
    }

    // ── One provider round ─────────────────────────────────────────

    async fn stream_round(
        &self,
        turn: &mut StreamingTurn,
        request: &ProviderRequest,
        cancel: &CancelToken,
    ) -> Result<RoundEnd, Error> {
        let span = tracing::info_span!(
            "llm.call",
            api = %request.api,
            model = request.model.as_deref().unwrap_or("default"),
            round = turn.rounds,
            prompt_tokens = tracing::field::Empty,
            completion_tokens = tracing::field::Empty,
        );
        self.stream_round_inner(turn, request, cancel).instrument(span).await
    }

    async fn stream_round_inner(
        &self,
        turn: &mut StreamingTurn,
        request: &ProviderRequest,
        cancel: &CancelToken,
    ) -> Result<RoundEnd, Error> {
        let mut stream = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(RoundEnd::Cancelled),
            opened = self.provider.open_stream(request) => opened?,
        };

        let idle = Duration::from_millis(self.config.stream_idle_timeout_ms);
        let round_text_start = turn.text.len();
        let mut active: Vec<ActiveToolCall> = Vec::new();
        let mut round_calls: Vec<ToolCall> = Vec::new();
        let mut round_results: Vec<Message> = Vec::new();

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(RoundEnd::Cancelled),
                next = tokio::time::timeout(idle, stream.next()) => next,
            };
            let event = match next {
                Err(_) => {
                    return Err(Error::Timeout(format!(
                        "no provider event for {}ms",
                        idle.as_millis()
                    )))
                }
                Ok(None) => break,
                Ok(Some(event)) => event?,
            };

            match event {
                StreamEvent::TextDelta { text } => self.on_text(turn, text).await,
                StreamEvent::ReasoningDelta { text } => self.on_reasoning(turn, text).await,
                StreamEvent::ToolCallStarted { item_id, call_id, tool_name } => {
                    self.on_tool_started(turn, &call_id, &tool_name).await;
                    active.push(ActiveToolCall {
                        call_id,
                        tool_name,
                        argument_buffer: String::new(),
                        item_id,
                        started_at_ms: now_ms(),
                        result: None,
                    });
                }
                StreamEvent::ToolCallDelta { item_id, delta } => {
                    if let Some(call) = active.iter_mut().find(|c| c.item_id == item_id) {
                        call.argument_buffer.push_str(&delta);
                    }
                }
                StreamEvent::ToolCallDone { item_id, call_id, tool_name, arguments } => {
                    let entry = match active.iter().position(|c| c.item_id == item_id) {
                        Some(idx) => active.remove(idx),
                        None => {
                            self.on_tool_started(turn, &call_id, &tool_name).await;
                            ActiveToolCall {
                                call_id: call_id.clone(),
                                tool_name: tool_name.clone(),
                                argument_buffer: String::new(),
                                item_id,
                                started_at_ms: now_ms(),
                                result: None,
                            }
                        }
                    };
                    let started_at_ms = entry.started_at_ms;
                    let call = tools::assemble_call(entry, &arguments);
                    if !self.run_tool(turn, &call, started_at_ms, cancel, &mut round_results).await {
                        return Ok(RoundEnd::Cancelled);
                    }
                    round_calls.push(call);
                }
                StreamEvent::Completed { response_id, usage, finish_reason } => {
                    if let Some(u) = &usage {
                        let span = tracing::Span::current();
                        span.record("prompt_tokens", u.prompt_tokens);
                        span.record("completion_tokens", u.completion_tokens);
                        turn.usage.accumulate(u);
                    }
                    if response_id.is_some() {
                        turn.response_id = response_id;
                    }
                    turn.finish_reason = finish_reason;
                    break;
                }
                StreamEvent::Error { message } => {
                    return Err(Error::provider(self.provider.provider_id(), message));
                }
            }
        }

        // Calls that streamed a start but never a done event.
        for entry in std::mem::take(&mut active) {
            let started_at_ms = entry.started_at_ms;
            let call = tools::assemble_call(entry, "");
            if !self.run_tool(turn, &call, started_at_ms, cancel, &mut round_results).await {
                return Ok(RoundEnd::Cancelled);
            }
            round_calls.push(call);
        }

        let round_text = &turn.text[round_text_start..];
        if !round_calls.is_empty() {
            let assistant = Message::assistant_tool_calls(round_text, &round_calls);
            turn.history.push(assistant);
            turn.history.extend(round_results);
        } else if !round_text.is_empty() {
            let assistant = Message::assistant(round_text);
            turn.history.push(assistant);
        }
        Ok(RoundEnd::Completed)
    }

    // ── Event handlers ─────────────────────────────────────────────

    async fn on_text(&self, turn: &mut StreamingTurn, text: String) {
        if text.is_empty() {
            return;
        }
        if turn.first_token {
            turn.first_token = false;
            turn.first_token_at_ms = Some(now_ms());
        }
        turn.text.push_str(&text);
        let seq = turn.next_seq();
        self.sink
            .emit_delta(&turn.room_id, &turn.turn_id, seq, DeltaPayload::Text { text })
            .await;

        let threshold = self.config.partial_render_min_chars.max(1);
        if turn.suppress_send
            || turn.initial_event_id.is_some()
            || turn.text.chars().count() < threshold
        {
            return;
        }
        match self.sink.render_partial(&turn.room_id, &turn.text).await {
            Ok(event_id) => {
                turn.initial_event_id = Some(event_id);
                self.sink
                    .emit_status(&turn.room_id, &turn.turn_id, TurnStatus::Generating, None)
                    .await;
            }
            Err(e) => tracing::warn!(error = %e, "failed to render partial message"),
        }
    }

    async fn on_reasoning(&self, turn: &mut StreamingTurn, text: String) {
        if text.is_empty() {
            return;
        }
        if turn.first_token {
            turn.first_token = false;
            turn.first_token_at_ms = Some(now_ms());
        }
        let first = turn.reasoning.is_empty();
        turn.reasoning.push_str(&text);
        if first {
            self.sink
                .emit_status(&turn.room_id, &turn.turn_id, TurnStatus::Thinking, None)
                .await;
        }
        let seq = turn.next_seq();
        self.sink
            .emit_delta(&turn.room_id, &turn.turn_id, seq, DeltaPayload::Reasoning { text })
            .await;
    }

    async fn on_tool_started(&self, turn: &mut StreamingTurn, call_id: &str, tool_name: &str) {
        self.sink
            .emit_status(&turn.room_id, &turn.turn_id, TurnStatus::ToolUse, Some(tool_name))
            .await;
        let seq = turn.next_seq();
        self.sink
            .emit_delta(
                &turn.room_id,
                &turn.turn_id,
                seq,
                DeltaPayload::ToolCallStarted {
                    call_id: call_id.to_string(),
                    tool_name: tool_name.to_string(),
                },
            )
            .await;
    }

    /// Execute one call and record its result.  Returns `false` if the
    /// turn was cancelled while the tool ran.
    async fn run_tool(
        &self,
        turn: &mut StreamingTurn,
        call: &ToolCall,
        started_at_ms: i64,
        cancel: &CancelToken,
        results: &mut Vec<Message>,
    ) -> bool {
        let timeout = Duration::from_millis(self.config.tool_timeout_ms);
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => return false,
            r = tools::invoke(self.tools.as_ref(), call, timeout) => r,
        };

        let (output_text, ok) = match outcome {
            Ok(output) => {
                let text = output.model_text();
                if output.is_media() {
                    self.deliver_media(turn, output).await;
                }
                (text, true)
            }
            Err(message) => (format!("Error: {message}"), false),
        };

        turn.tool_calls.push(ToolCallRecord {
            call_id: call.call_id.clone(),
            tool_name: call.tool_name.clone(),
            tool_type: ToolType::Function,
            input: call.arguments.clone(),
            output: output_text.clone(),
            status: if ok { ToolCallStatus::Completed } else { ToolCallStatus::Failed },
            result_status: if ok { ResultStatus::Success } else { ResultStatus::Error },
            started_at_ms,
            completed_at_ms: now_ms(),
        });
        turn.pending_function_outputs.push(FunctionOutput {
            call_id: call.call_id.clone(),
            output: output_text.clone(),
        });
        results.push(Message::tool_result(&call.call_id, &output_text, !ok));

        let seq = turn.next_seq();
        self.sink
            .emit_delta(
                &turn.room_id,
                &turn.turn_id,
                seq,
                DeltaPayload::ToolCallFinished {
                    call_id: call.call_id.clone(),
                    tool_name: call.tool_name.clone(),
                    is_error: !ok,
                },
            )
            .await;
        true
    }

    /// Audio goes out right away; images wait until the reply is final so
    /// they land below it.
    async fn deliver_media(&self, turn: &mut StreamingTurn, output: ToolOutput) {
        match output {
            ToolOutput::Images { images } => turn.pending_images.extend(images),
            other => {
                if turn.suppress_send {
                    return;
                }
                match self.sink.send_media(&turn.room_id, &other).await {
                    Ok(_) => turn.media_sent = true,
                    Err(e) => tracing::warn!(error = %e, "failed to send tool media"),
                }
            }
        }
    }

    // ── Endings ────────────────────────────────────────────────────

    async fn finish_completed(&self, turn: &mut StreamingTurn, stateful: bool) {
        turn.mark_completed();

        if !turn.suppress_send {
            self.publish_final_text(turn).await;
            if !turn.pending_images.is_empty() {
                let images = ToolOutput::Images { images: std::mem::take(&mut turn.pending_images) };
                match self.sink.send_media(&turn.room_id, &images).await {
                    Ok(_) => turn.media_sent = true,
                    Err(e) => tracing::warn!(error = %e, "failed to send generated images"),
                }
            }
        }

        self.sink
            .emit_status(&turn.room_id, &turn.turn_id, TurnStatus::Completed, None)
            .await;

        if turn.suppress_save {
            return;
        }
        if let Err(e) = self.store.save_turn(&turn.room_id, turn).await {
            tracing::warn!(error = %e, "failed to persist turn");
        }
        if let Some(response_id) = turn.response_id.as_deref().filter(|_| stateful) {
            if let Err(e) = self.store.set_last_response_id(&turn.room_id, response_id).await {
                tracing::warn!(error = %e, "failed to store response id");
            }
        }
    }

    async fn finish_cancelled(&self, mut turn: StreamingTurn) -> TurnOutcome {
        tracing::info!(visible = turn.has_visible_output(), "turn cancelled");
        if turn.has_visible_output() {
            turn.mark_completed();
            turn.finish_reason = Some("cancelled".into());
            if !turn.suppress_send {
                self.publish_final_text(&mut turn).await;
            }
            if !turn.suppress_save {
                if let Err(e) = self.store.save_turn(&turn.room_id, &turn).await {
                    tracing::warn!(error = %e, "failed to persist cancelled turn");
                }
            }
        }
        self.sink
            .emit_status(&turn.room_id, &turn.turn_id, TurnStatus::Cancelled, None)
            .await;
        TurnOutcome::Cancelled(turn)
    }

    /// Classify a failure by whether anything was already visible.
    async fn fail(&self, turn: &mut StreamingTurn, err: Error) -> TurnError {
        if turn.has_visible_output() {
            tracing::warn!(error = %err, "turn failed after output was rendered");
            turn.mark_completed();
            turn.finish_reason = Some("error".into());
            if !turn.suppress_send {
                self.publish_final_text(turn).await;
            }
            let message = err.to_string();
            self.sink
                .emit_status(&turn.room_id, &turn.turn_id, TurnStatus::Failed, Some(&message))
                .await;
            return TurnError::NonFallback { message };
        }

        match classify(&err) {
            ErrorClass::ContextLength(info) => TurnError::ContextLength(info),
            class => {
                tracing::debug!(class = class.label(), error = %err, "turn failed before output");
                TurnError::PreDelta { class, source: err }
            }
        }
    }

    /// Bring the room message up to date with the accumulated text,
    /// posting it if nothing was rendered yet.
    async fn publish_final_text(&self, turn: &mut StreamingTurn) {
        match turn.initial_event_id.clone() {
            Some(event_id) => {
                if let Err(e) = self.sink.update_message(&turn.room_id, &event_id, &turn.text).await {
                    tracing::warn!(error = %e, "failed to update final message");
                }
            }
            None if !turn.text.is_empty() => {
                match self.sink.render_partial(&turn.room_id, &turn.text).await {
                    Ok(event_id) => turn.initial_event_id = Some(event_id),
                    Err(e) => tracing::warn!(error = %e, "failed to send final message"),
                }
            }
            None => {}
        }
    }
}
