//! In-memory collaborators.
//!
//! Enough to run the dispatcher from the command line: turns and response
//! ids live for the life of the process, and the prompt is the turn's own
//! text under an optional system prompt.

use std::collections::HashMap;

use parking_lot::Mutex;
use serde_json::Value;

use rb_domain::error::{Error, Result};
use rb_domain::tool::{Message, ToolDefinition, ToolOutput};
use rb_providers::ProviderRequest;

use crate::ports::{PromptBuilder, RoomContext, ToolExecutor, TurnInput, TurnStore};
use crate::turn::{StreamingTurn, TurnRecord};

#[derive(Default)]
pub struct MemoryStore {
    turns: Mutex<HashMap<String, Vec<TurnRecord>>>,
    response_ids: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn turns(&self, room_id: &str) -> Vec<TurnRecord> {
        self.turns.lock().get(room_id).cloned().unwrap_or_default()
    }
}

#[async_trait::async_trait]
impl TurnStore for MemoryStore {
    async fn save_turn(&self, room_id: &str, turn: &StreamingTurn) -> Result<()> {
        self.turns.lock().entry(room_id.to_owned()).or_default().push(turn.record());
        Ok(())
    }

    async fn load_recent_turns(&self, room_id: &str, limit: usize) -> Result<Vec<TurnRecord>> {
        let turns = self.turns.lock();
        let all = turns.get(room_id).map(Vec::as_slice).unwrap_or_default();
        Ok(all[all.len().saturating_sub(limit)..].to_vec())
    }

    async fn last_response_id(&self, room_id: &str) -> Result<Option<String>> {
        Ok(self.response_ids.lock().get(room_id).cloned())
    }

    async fn set_last_response_id(&self, room_id: &str, response_id: &str) -> Result<()> {
        self.response_ids.lock().insert(room_id.to_owned(), response_id.to_owned());
        Ok(())
    }
}

/// Prompt builder that sends an optional system prompt plus the turn's
/// text, chaining from the room's last response when there is one.
#[derive(Default)]
pub struct SimplePromptBuilder {
    pub system: Option<String>,
    pub model: Option<String>,
    pub tools: Vec<ToolDefinition>,
}

#[async_trait::async_trait]
impl PromptBuilder for SimplePromptBuilder {
    async fn build(&self, room: &RoomContext, input: &TurnInput) -> Result<ProviderRequest> {
        let mut messages = Vec::new();
        if let Some(system) = &self.system {
            messages.push(Message::system(system.clone()));
        }
        messages.push(Message::user(input.prompt_text()));
        Ok(ProviderRequest {
            model: self.model.clone(),
            input: messages,
            tools: self.tools.clone(),
            previous_response_id: room.last_response_id.clone(),
            ..Default::default()
        })
    }
}

/// Executor for agents without tools.
pub struct NoTools;

#[async_trait::async_trait]
impl ToolExecutor for NoTools {
    async fn execute(&self, name: &str, _arguments: &Value) -> Result<ToolOutput> {
        Err(Error::Other(format!("unknown tool: {name}")))
    }
}
