use serde::Serialize;

/// Structured trace events emitted across all RoomBridge crates.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event")]
pub enum TraceEvent {
    TurnStarted {
        room_id: String,
        turn_id: String,
        source_event_id: Option<String>,
    },
    TurnFinished {
        room_id: String,
        turn_id: String,
        outcome: String,
        rounds: u32,
        duration_ms: u64,
        prompt_tokens: u32,
        completion_tokens: u32,
    },
    ContinuationRound {
        room_id: String,
        turn_id: String,
        round: u32,
        pending_outputs: usize,
        stateful: bool,
    },
    ApiFallback {
        from_api: String,
        to_api: String,
        tools_enabled: bool,
        reason: String,
    },
    QueueAdmission {
        room_id: String,
        mode: String,
        decision: String,
    },
    QueueDropped {
        room_id: String,
        policy: String,
        dropped_total: usize,
    },
    DebounceFlushed {
        room_id: String,
        merged: usize,
    },
    SteerAccepted {
        room_id: String,
        turn_id: String,
    },
}

impl TraceEvent {
    pub fn emit(&self) {
        let json = serde_json::to_string(self).unwrap_or_default();
        tracing::info!(trace_event = %json, "rb_event");
    }
}
