use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Inbound queue policy
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// What happens to a message that arrives while a room is busy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum QueueMode {
    /// Queue it; run it as its own turn afterwards.
    Queue,
    /// Inject it into the running turn; queue only if that fails.
    Steer,
    /// Inject it into the running turn and also queue it.
    Followup,
    /// Queue it; batch consecutive same-thread items into one turn.
    #[default]
    Collect,
    /// Like `followup`, but the queued copy is marked as backlog.
    #[serde(alias = "steer+backlog")]
    SteerBacklog,
    /// Cancel the running turn, clear the queue, and run this instead.
    Interrupt,
}

impl QueueMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queue => "queue",
            Self::Steer => "steer",
            Self::Followup => "followup",
            Self::Collect => "collect",
            Self::SteerBacklog => "steer-backlog",
            Self::Interrupt => "interrupt",
        }
    }

    /// Modes that try to inject into the active turn first.
    pub fn steers(self) -> bool {
        matches!(self, Self::Steer | Self::Followup | Self::SteerBacklog)
    }
}

impl fmt::Display for QueueMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QueueMode {
    type Err = String;

    /// Lenient parser for user-facing commands (`/queue steer+backlog`).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "queue" | "queued" | "fifo" => Ok(Self::Queue),
            "steer" | "steering" => Ok(Self::Steer),
            "followup" | "follow-up" | "follow_up" => Ok(Self::Followup),
            "collect" | "coalesce" => Ok(Self::Collect),
            "steer-backlog" | "steer+backlog" | "steer_backlog" => Ok(Self::SteerBacklog),
            "interrupt" | "interrupts" | "abort" => Ok(Self::Interrupt),
            other => Err(format!("unknown queue mode '{other}'")),
        }
    }
}

/// What to do when a room's queue is full.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DropPolicy {
    DropOldest,
    DropNewest,
    /// Drop the oldest item but keep a one-line summary of it.
    #[default]
    Summarize,
}

impl DropPolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::DropOldest => "drop-oldest",
            Self::DropNewest => "drop-newest",
            Self::Summarize => "summarize",
        }
    }
}

/// Resolved queue policy for one dispatch.  Immutable per use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueSettings {
    pub mode: QueueMode,
    pub debounce_ms: u64,
    pub cap: usize,
    #[serde(rename = "drop")]
    pub drop_policy: DropPolicy,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            mode: QueueMode::Collect,
            debounce_ms: d_debounce_ms(),
            cap: d_cap(),
            drop_policy: DropPolicy::Summarize,
        }
    }
}

impl QueueSettings {
    /// A cap of zero is never honoured; the queue always holds one item.
    pub fn effective_cap(&self) -> usize {
        self.cap.max(1)
    }
}

/// Optional per-channel / per-room overrides.  Unset fields inherit.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueOverride {
    #[serde(default)]
    pub mode: Option<QueueMode>,
    #[serde(default)]
    pub debounce_ms: Option<u64>,
    #[serde(default)]
    pub cap: Option<usize>,
    #[serde(default, rename = "drop")]
    pub drop_policy: Option<DropPolicy>,
}

impl QueueOverride {
    fn apply(&self, base: &mut QueueSettings) {
        if let Some(mode) = self.mode {
            base.mode = mode;
        }
        if let Some(ms) = self.debounce_ms {
            base.debounce_ms = ms;
        }
        if let Some(cap) = self.cap {
            base.cap = cap;
        }
        if let Some(policy) = self.drop_policy {
            base.drop_policy = policy;
        }
    }
}

/// `[queue]` section: defaults plus channel and room overrides.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueueConfig {
    #[serde(flatten)]
    pub defaults: QueueSettings,
    /// Keyed by channel/connector kind (`"dm"`, `"group"`, …).
    #[serde(default)]
    pub by_channel: HashMap<String, QueueOverride>,
    /// Keyed by room id.  Wins over channel overrides.
    #[serde(default)]
    pub by_room: HashMap<String, QueueOverride>,
}

impl QueueConfig {
    /// Resolve the settings for one dispatch: room beats channel beats default.
    pub fn resolve(&self, room_id: &str, channel: Option<&str>) -> QueueSettings {
        let mut settings = self.defaults;
        if let Some(ov) = channel.and_then(|c| self.by_channel.get(c)) {
            ov.apply(&mut settings);
        }
        if let Some(ov) = self.by_room.get(room_id) {
            ov.apply(&mut settings);
        }
        settings
    }
}

fn d_debounce_ms() -> u64 {
    1000
}
fn d_cap() -> usize {
    20
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_mode_aliases() {
        assert_eq!("steer+backlog".parse::<QueueMode>().unwrap(), QueueMode::SteerBacklog);
        assert_eq!("Follow-Up".parse::<QueueMode>().unwrap(), QueueMode::Followup);
        assert_eq!("abort".parse::<QueueMode>().unwrap(), QueueMode::Interrupt);
        assert!("sideways".parse::<QueueMode>().is_err());
    }

    #[test]
    fn room_override_beats_channel_override() {
        let mut cfg = QueueConfig::default();
        cfg.by_channel.insert(
            "group".into(),
            QueueOverride { mode: Some(QueueMode::Queue), cap: Some(5), ..Default::default() },
        );
        cfg.by_room.insert(
            "!r:example.org".into(),
            QueueOverride { mode: Some(QueueMode::Interrupt), ..Default::default() },
        );

        let s = cfg.resolve("!r:example.org", Some("group"));
        assert_eq!(s.mode, QueueMode::Interrupt);
        assert_eq!(s.cap, 5);
        assert_eq!(s.debounce_ms, 1000);

        let other = cfg.resolve("!other:example.org", None);
        assert_eq!(other, QueueSettings::default());
    }

    #[test]
    fn zero_cap_is_clamped() {
        let s = QueueSettings { cap: 0, ..Default::default() };
        assert_eq!(s.effective_cap(), 1);
    }

    #[test]
    fn steering_modes() {
        assert!(QueueMode::Steer.steers());
        assert!(QueueMode::Followup.steers());
        assert!(QueueMode::SteerBacklog.steers());
        assert!(!QueueMode::Collect.steers());
        assert!(!QueueMode::Interrupt.steers());
    }
}
