//! `roombridge run` and `roombridge chat`.
//!
//! Both drive a real [`TurnDispatcher`] against the configured provider,
//! with stdout standing in for the room.

use std::io::Write;
use std::sync::Arc;

use tokio::io::AsyncBufReadExt;
use tokio::sync::mpsc;

use rb_domain::config::Config;
use rb_domain::error::Result;
use rb_domain::tool::ToolOutput;

use crate::dispatcher::{Collaborators, TurnDispatcher};
use crate::memory::{MemoryStore, NoTools, SimplePromptBuilder};
use crate::ports::{DeltaPayload, InboundItem, PresentationSink};
use crate::turn::TurnStatus;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Terminal sink
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Streams text deltas to stdout and reports terminal statuses on a
/// channel.
struct TerminalSink {
    finished: mpsc::UnboundedSender<TurnStatus>,
}

#[async_trait::async_trait]
impl PresentationSink for TerminalSink {
    async fn render_partial(&self, _room_id: &str, _text: &str) -> Result<String> {
        Ok("terminal".into())
    }

    async fn update_message(&self, _room_id: &str, _message_id: &str, _text: &str) -> Result<()> {
        Ok(())
    }

    async fn emit_delta(&self, _room_id: &str, _turn_id: &str, _seq: u64, payload: DeltaPayload) {
        match payload {
            DeltaPayload::Text { text } => {
                print!("{text}");
                std::io::stdout().flush().ok();
            }
            DeltaPayload::ToolCallStarted { tool_name, .. } => eprintln!("\n[tool: {tool_name}]"),
            DeltaPayload::Restarted => eprintln!("\n[retrying]"),
            DeltaPayload::Reasoning { .. } | DeltaPayload::ToolCallFinished { .. } => {}
        }
    }

    async fn emit_status(
        &self,
        _room_id: &str,
        _turn_id: &str,
        status: TurnStatus,
        detail: Option<&str>,
    ) {
        match status {
            TurnStatus::Completed | TurnStatus::Cancelled => {
                println!();
                let _ = self.finished.send(status);
            }
            TurnStatus::Failed => {
                eprintln!("\n[failed] {}", detail.unwrap_or("unknown error"));
                let _ = self.finished.send(status);
            }
            _ => {}
        }
    }

    async fn send_media(&self, _room_id: &str, output: &ToolOutput) -> Result<String> {
        match output {
            ToolOutput::Images { images } => {
                for image in images {
                    eprintln!("[image {}] {}", image.mime_type, image.data);
                }
            }
            ToolOutput::Audio { mime_type, data_b64 } => {
                eprintln!("[audio {mime_type}, {} bytes base64]", data_b64.len());
            }
            ToolOutput::Text { text } => eprintln!("{text}"),
        }
        Ok("terminal-media".into())
    }

    async fn report_rejected(&self, _room_id: &str, item: &InboundItem) {
        eprintln!("[rejected: queue full] {}", item.payload.summary_line());
    }
}

fn build_dispatcher(
    config: &Config,
    model: Option<String>,
    system: Option<String>,
) -> anyhow::Result<(Arc<TurnDispatcher>, mpsc::UnboundedReceiver<TurnStatus>)> {
    let provider = super::build_provider(config)?;
    let (tx, rx) = mpsc::unbounded_channel();
    let deps = Collaborators {
        provider,
        prompts: Arc::new(SimplePromptBuilder { system, model, tools: Vec::new() }),
        tools: Arc::new(NoTools),
        sink: Arc::new(TerminalSink { finished: tx }),
        store: Arc::new(MemoryStore::new()),
    };
    Ok((TurnDispatcher::new("cli", config, deps), rx))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Commands
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Send one message and wait for its turn to end.
pub async fn run(
    config: Config,
    message: String,
    room: String,
    model: Option<String>,
    system: Option<String>,
) -> anyhow::Result<()> {
    let (dispatcher, mut finished) = build_dispatcher(&config, model, system)?;
    dispatcher
        .admit(InboundItem::text(room, message))
        .await
        .map_err(|e| anyhow::anyhow!("{e}"))?;

    match finished.recv().await {
        Some(TurnStatus::Failed) => anyhow::bail!("turn failed"),
        Some(_) => Ok(()),
        None => anyhow::bail!("dispatcher stopped before the turn ended"),
    }
}

/// Line-per-message loop over stdin.  Ctrl-C cancels the running turn;
/// a second Ctrl-C (or EOF once the room is idle) exits.
pub async fn chat(
    config: Config,
    room: String,
    model: Option<String>,
    system: Option<String>,
) -> anyhow::Result<()> {
    let (dispatcher, mut finished) = build_dispatcher(&config, model, system)?;
    eprintln!("RoomBridge chat in room {room}  |  Ctrl+C cancels a reply, Ctrl+D exits");

    let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                dispatcher.submit(InboundItem::text(&room, line));
            }
            _ = tokio::signal::ctrl_c() => {
                if !dispatcher.cancel(&room) {
                    break;
                }
                eprintln!("\n[cancelled]");
            }
            Some(status) = finished.recv() => {
                tracing::debug!(status = status.as_str(), "turn ended");
            }
        }
    }

    // Let queued input finish before leaving.
    while dispatcher.is_busy(&room)
        || dispatcher.queue_snapshot(&room).is_some_and(|s| !s.items.is_empty())
    {
        if finished.recv().await.is_none() {
            break;
        }
    }
    dispatcher.shutdown();
    Ok(())
}
