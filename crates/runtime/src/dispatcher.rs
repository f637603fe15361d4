//! Turn dispatcher: admission, dispatch and drain.
//!
//! Ties the per-room [`TurnLockMap`], the [`InboundQueue`], the steering
//! registry and the [`Debouncer`] together.  Every inbound item goes
//! through [`TurnDispatcher::admit`]:
//!
//! 1. `interrupt` mode cancels the running turn and clears the queue,
//!    then continues as `queue`.
//! 2. An idle room with nothing queued dispatches the item right away.
//! 3. Steering modes try to inject the item into the running turn.
//!    `steer` stops there on success; `followup` and `steer-backlog` also
//!    queue it.
//! 4. Everything else is queued under the room's cap and drop policy.
//!
//! Releasing a room's turn lock fires a drain.  The drain waits for the
//! queue to settle, re-acquires the lock and dispatches the next batch,
//! whose own release cascades into the next drain.

use std::collections::HashSet;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use rb_domain::config::{Config, EngineConfig, QueueConfig, QueueMode};
use rb_domain::tool::Message;
use rb_domain::trace::TraceEvent;
use rb_providers::ProviderClient;

use crate::cancel::CancelToken;
use crate::debounce::Debouncer;
use crate::engine::{CompletionEngine, TurnRequest};
use crate::error::{AdmissionError, TurnError};
use crate::ports::{
    InboundItem, InboundPayload, PresentationSink, PromptBuilder, RoomContext, ToolExecutor,
    TurnInput, TurnStore,
};
use crate::queue::{EnqueueOutcome, InboundQueue, QueueSnapshot};
use crate::steer::{SteerInbox, SteerRegistry};
use crate::turn::{DeltaSequence, TurnOutcome, TurnStatus};
use crate::turn_lock::{TurnGuard, TurnLockMap};

/// External collaborators handed to the dispatcher.
#[derive(Clone)]
pub struct Collaborators {
    pub provider: Arc<dyn ProviderClient>,
    pub prompts: Arc<dyn PromptBuilder>,
    pub tools: Arc<dyn ToolExecutor>,
    pub sink: Arc<dyn PresentationSink>,
    pub store: Arc<dyn TurnStore>,
}

/// How an item was admitted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// A turn started for the item.
    Dispatched { turn_id: String },
    /// Injected into the running turn and not queued.
    Steered { turn_id: String },
    /// Stored until the room is free.  `steered` is set when the item was
    /// also injected into the running turn.
    Queued { depth: usize, steered: bool },
}

pub struct TurnDispatcher {
    agent_id: String,
    queue_config: QueueConfig,
    engine: CompletionEngine,
    prompts: Arc<dyn PromptBuilder>,
    sink: Arc<dyn PresentationSink>,
    store: Arc<dyn TurnStore>,
    locks: Arc<TurnLockMap>,
    queue: InboundQueue,
    steer: SteerRegistry,
    debouncer: Debouncer,
    /// Rooms with a drain waiting for its queue to settle.
    settling: Mutex<HashSet<String>>,
}

impl TurnDispatcher {
    /// Build the dispatcher and start its debounce consumer.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(agent_id: impl Into<String>, config: &Config, deps: Collaborators) -> Arc<Self> {
        let (debouncer, mut debounced) = Debouncer::new(&config.debounce);
        let engine = Self::build_engine(&config.engine, &deps);

        let dispatcher = Arc::new(Self {
            agent_id: agent_id.into(),
            queue_config: config.queue.clone(),
            engine,
            prompts: deps.prompts,
            sink: deps.sink,
            store: deps.store,
            locks: Arc::new(TurnLockMap::new()),
            queue: InboundQueue::new(),
            steer: SteerRegistry::new(),
            debouncer,
            settling: Mutex::new(HashSet::new()),
        });

        let weak: Weak<Self> = Arc::downgrade(&dispatcher);
        dispatcher.locks.set_release_hook(Arc::new(move |room_id: &str| {
            if let Some(dispatcher) = weak.upgrade() {
                dispatcher.schedule_drain(room_id);
            }
        }));

        let weak = Arc::downgrade(&dispatcher);
        tokio::spawn(async move {
            while let Some(item) = debounced.recv().await {
                let Some(dispatcher) = weak.upgrade() else { break };
                if let Err(e) = dispatcher.admit(item).await {
                    tracing::debug!(error = %e, "debounced item not admitted");
                }
            }
        });

        dispatcher
    }

    fn build_engine(config: &EngineConfig, deps: &Collaborators) -> CompletionEngine {
        CompletionEngine::new(
            deps.provider.clone(),
            deps.tools.clone(),
            deps.sink.clone(),
            deps.store.clone(),
            config.clone(),
        )
    }

    // ── Admission ──────────────────────────────────────────────────

    /// Entry point for inbound messages.  Bursts are merged by the
    /// debouncer before they reach [`admit`](Self::admit).
    pub fn submit(&self, item: InboundItem) {
        self.debouncer.submit(item);
    }

    /// Decide what happens to one inbound item.
    pub async fn admit(self: &Arc<Self>, item: InboundItem) -> Result<Admission, AdmissionError> {
        let room_id = item.room_id.clone();
        let settings = self.queue_config.resolve(&room_id, item.channel.as_deref());
        let mut mode = settings.mode;

        if mode == QueueMode::Interrupt {
            let cancelled = self.locks.cancel(&room_id);
            let cleared = self.queue.clear(&room_id);
            tracing::info!(room_id = %room_id, cancelled, cleared, "interrupting room");
            mode = QueueMode::Queue;
        }

        // Queued items go first, so an idle room with a backlog still queues.
        if self.queue.is_empty(&room_id) {
            if let Some(guard) = self.locks.try_guard(&room_id) {
                let turn_id = self.dispatch(guard, TurnInput::from_item(&item));
                admission_trace(&room_id, mode, "dispatched");
                return Ok(Admission::Dispatched { turn_id });
            }
        }

        // Any steer attempt, accepted or not, marks the queued copy as backlog.
        let steer_attempted = mode.steers() && self.locks.is_active(&room_id);
        let mut steered = false;
        if steer_attempted {
            let message = Message::user(item.payload.summary_line());
            if let Some(turn_id) = self.steer.try_steer(&room_id, message) {
                TraceEvent::SteerAccepted { room_id: room_id.clone(), turn_id: turn_id.clone() }
                    .emit();
                if mode == QueueMode::Steer {
                    admission_trace(&room_id, mode, "steered");
                    return Ok(Admission::Steered { turn_id });
                }
                steered = true;
            }
        }

        let depth = match self.queue.enqueue(item.clone(), &settings, steer_attempted) {
            EnqueueOutcome::Rejected => {
                tracing::info!(room_id = %room_id, "queue full; rejecting message");
                admission_trace(&room_id, mode, "rejected");
                self.sink.report_rejected(&room_id, &item).await;
                return Err(AdmissionError::Rejected { room_id });
            }
            EnqueueOutcome::QueuedWithDrop { depth, dropped } => {
                let dropped_total = self
                    .queue
                    .snapshot(&room_id)
                    .map(|s| s.dropped_count)
                    .unwrap_or(dropped);
                TraceEvent::QueueDropped {
                    room_id: room_id.clone(),
                    policy: settings.drop_policy.as_str().to_string(),
                    dropped_total,
                }
                .emit();
                depth
            }
            EnqueueOutcome::Queued { depth } => depth,
        };
        admission_trace(&room_id, mode, "queued");

        // The running turn may have ended between the lock check and the
        // enqueue; its release would then have seen an empty queue.
        if !self.locks.is_active(&room_id) {
            self.schedule_drain(&room_id);
        }
        Ok(Admission::Queued { depth, steered })
    }

    // ── Dispatch ───────────────────────────────────────────────────

    /// Start a turn for `input` under `guard`.  Returns the new turn id.
    fn dispatch(self: &Arc<Self>, guard: TurnGuard, input: TurnInput) -> String {
        let turn_id = uuid::Uuid::new_v4().to_string();
        let room_id = guard.room_id().to_owned();
        let cancel = self.locks.attach_cancel(&room_id).unwrap_or_default();
        let inbox = self.steer.open(&room_id, &turn_id);

        let span = tracing::info_span!("turn", room_id = %room_id, turn_id = %turn_id);
        let this = Arc::clone(self);
        let id = turn_id.clone();
        tokio::spawn(tracing::Instrument::instrument(
            async move {
                // Dropped last: the release fires the next drain.
                let _guard = guard;
                tracing::debug!("turn dispatched");
                this.run_dispatched(input, id, cancel, inbox).await;
            },
            span,
        ));
        turn_id
    }

    async fn run_dispatched(
        &self,
        input: TurnInput,
        turn_id: String,
        cancel: CancelToken,
        inbox: SteerInbox,
    ) {
        let room_id = input.room_id.clone();
        let last_response_id = match self.store.last_response_id(&room_id).await {
            Ok(id) => id,
            Err(e) => {
                tracing::warn!(error = %e, "failed to load last response id");
                None
            }
        };
        let mut room = RoomContext {
            room_id: room_id.clone(),
            channel: input.channel.clone(),
            agent_id: self.agent_id.clone(),
            last_response_id,
            context_overflow: None,
        };

        let sequence = DeltaSequence::new();
        let mut result = self.run_once(&room, &input, &turn_id, &cancel, &inbox, &sequence).await;

        // One retry with the overflow reported, so the builder can prune.
        if let Some(Err(TurnError::ContextLength(info))) = &result {
            tracing::warn!(
                max = ?info.model_max_tokens,
                requested = ?info.requested_tokens,
                "prompt exceeds context window; rebuilding"
            );
            room.context_overflow = Some(info.clone());
            result = self.run_once(&room, &input, &turn_id, &cancel, &inbox, &sequence).await;
        }

        self.steer.remove(&room_id);
        let unanswered = inbox.drain_unanswered();

        let cancelled = match result {
            None => false,
            Some(Ok(outcome)) => {
                let turn = outcome.turn();
                tracing::info!(
                    outcome = outcome.label(),
                    rounds = turn.rounds,
                    duration_ms = turn.duration_ms(),
                    "turn finished"
                );
                matches!(outcome, TurnOutcome::Cancelled(_))
            }
            Some(Err(e)) => {
                tracing::warn!(error = %e, kind = e.kind(), "turn failed");
                if let TurnError::ContextLength(info) = &e {
                    self.sink
                        .emit_status(&room_id, &turn_id, TurnStatus::Failed, Some(&info.message))
                        .await;
                }
                false
            }
        };

        if !unanswered.is_empty() && !cancelled {
            self.requeue_unanswered(&input, unanswered);
        }
    }

    /// Build the prompt and run the engine.  `None` when no prompt could
    /// be built.
    async fn run_once(
        &self,
        room: &RoomContext,
        input: &TurnInput,
        turn_id: &str,
        cancel: &CancelToken,
        inbox: &SteerInbox,
        sequence: &DeltaSequence,
    ) -> Option<Result<TurnOutcome, TurnError>> {
        let request = match self.prompts.build(room, input).await {
            Ok(request) => request,
            Err(e) => {
                tracing::warn!(error = %e, "prompt build failed");
                self.sink
                    .emit_status(&room.room_id, turn_id, TurnStatus::Failed, Some(&e.to_string()))
                    .await;
                return None;
            }
        };

        let req = TurnRequest {
            turn_id: turn_id.to_owned(),
            room: room.clone(),
            request,
            source_event_id: input.source_event_id.clone(),
            suppress_save: input.background,
            suppress_send: input.background,
            cancel: cancel.clone(),
            steer: inbox.clone(),
            sequence: sequence.clone(),
        };
        Some(self.engine.run_turn(&req).await)
    }

    /// Steers the turn accepted but never answered.  Under `steer` mode
    /// they exist nowhere else, so they go back into the queue.  The other
    /// steering modes queued a backlog copy at admission.
    fn requeue_unanswered(&self, input: &TurnInput, messages: Vec<Message>) {
        let settings = self.queue_config.resolve(&input.room_id, input.channel.as_deref());
        if settings.mode != QueueMode::Steer {
            tracing::debug!(count = messages.len(), "unanswered steers already backlogged");
            return;
        }
        tracing::info!(count = messages.len(), "re-queueing unanswered steers");
        for message in messages {
            let item = InboundItem {
                channel: input.channel.clone(),
                payload: InboundPayload::text(message.content.text().unwrap_or_default()),
                ..InboundItem::text(&input.room_id, "")
            };
            if self.queue.enqueue(item, &settings, true) == EnqueueOutcome::Rejected {
                tracing::warn!("queue full; unanswered steer dropped");
            }
        }
    }

    // ── Drain ──────────────────────────────────────────────────────

    /// Start a drain for the room unless one is already settling.
    fn schedule_drain(self: &Arc<Self>, room_id: &str) {
        if tokio::runtime::Handle::try_current().is_err() {
            tracing::debug!(room_id, "no runtime; drain skipped");
            return;
        }
        if self.queue.is_empty(room_id) || !self.settling.lock().insert(room_id.to_owned()) {
            return;
        }
        let this = Arc::clone(self);
        let room_id = room_id.to_owned();
        tokio::spawn(async move {
            this.wait_settled(&room_id).await;
            this.settling.lock().remove(&room_id);
            this.drain_now(&room_id);
        });
    }

    /// Sleep until nothing was enqueued for the room's debounce window.
    async fn wait_settled(&self, room_id: &str) {
        while let Some(delay) = self.queue.settle_delay(room_id) {
            if delay.is_zero() {
                break;
            }
            tokio::time::sleep(delay).await;
        }
    }

    /// Dispatch the next batch if the room is free.  A busy room is
    /// drained again when its turn releases the lock.
    fn drain_now(self: &Arc<Self>, room_id: &str) {
        if self.queue.is_empty(room_id) {
            return;
        }
        let Some(guard) = self.locks.try_guard(room_id) else {
            tracing::debug!(room_id, "room busy; drain deferred");
            return;
        };
        let Some(next) = self.queue.take_next(room_id) else {
            return;
        };
        tracing::debug!(room_id, merged = next.merged, backlog = next.backlog, "draining queue");
        let mode = self.queue_config.resolve(room_id, next.input.channel.as_deref()).mode;
        let decision = if next.backlog { "drained_backlog" } else { "drained" };
        admission_trace(room_id, mode, decision);
        self.dispatch(guard, next.input);
    }

    // ── Control ────────────────────────────────────────────────────

    /// Cancel the room's running turn.  Returns whether one was running.
    pub fn cancel(&self, room_id: &str) -> bool {
        self.locks.cancel(room_id)
    }

    pub fn is_busy(&self, room_id: &str) -> bool {
        self.locks.is_active(room_id)
    }

    pub fn active_turns(&self) -> usize {
        self.locks.active_count()
    }

    pub fn queue_snapshot(&self, room_id: &str) -> Option<QueueSnapshot> {
        self.queue.snapshot(room_id)
    }

    /// Flush buffered input and cancel every running turn.
    pub fn shutdown(&self) {
        let buffered = self.debouncer.pending_rooms();
        self.debouncer.flush_all();
        let cancelled = self.locks.cancel_all();
        tracing::info!(buffered, cancelled, "dispatcher shutting down");
    }
}

fn admission_trace(room_id: &str, mode: QueueMode, decision: &str) {
    TraceEvent::QueueAdmission {
        room_id: room_id.to_owned(),
        mode: mode.as_str().to_string(),
        decision: decision.to_string(),
    }
    .emit();
}
