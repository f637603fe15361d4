//! Inbound queue: messages that arrived while their room was busy.
//!
//! One [`RoomQueue`] per room behind a single table mutex.  Rooms never
//! share state, and every mutation goes through [`InboundQueue`] methods
//! so the enqueue/dequeue protocol stays atomic.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

use rb_domain::config::{DropPolicy, QueueMode, QueueSettings};

use crate::ports::{InboundItem, InboundPayload, TurnInput};

/// Header placed above a `collect` batch.
pub const COLLECT_HEADER: &str = "[Queued messages while agent was busy]";

/// A queued message.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingQueueItem {
    pub item: InboundItem,
    pub enqueued_at_ms: i64,
    pub thread_key: Option<String>,
    /// One-line rendering used when the item is merged or summarized.
    pub summary_line: String,
    /// Queued after its content was also injected as a steer.
    pub backlog_after: bool,
}

impl PendingQueueItem {
    fn new(item: InboundItem, backlog_after: bool) -> Self {
        Self {
            thread_key: item.thread_key.clone(),
            summary_line: item.payload.summary_line(),
            enqueued_at_ms: chrono::Utc::now().timestamp_millis(),
            item,
            backlog_after,
        }
    }
}

/// Read-only view of one room's queue.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueSnapshot {
    pub items: Vec<PendingQueueItem>,
    pub dropped_count: usize,
    pub last_enqueued_at_ms: i64,
    pub mode: QueueMode,
    pub debounce_ms: u64,
    /// Running summary of items collapsed by the `summarize` policy.
    pub summary: Option<String>,
    /// Most recent item, used when a summary supersedes individual items.
    pub last_item: Option<PendingQueueItem>,
}

/// Result of [`InboundQueue::enqueue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Queued { depth: usize },
    /// Queued after the oldest item was dropped or summarized.
    QueuedWithDrop { depth: usize, dropped: usize },
    /// Queue full under `drop-newest`; the new item was not stored.
    Rejected,
}

/// What a drain step hands to the dispatcher.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueDispatch {
    pub input: TurnInput,
    /// How many queued items the dispatch consumed.
    pub merged: usize,
    /// At least one consumed item was already offered to a running turn
    /// as a steer.
    pub backlog: bool,
}

#[derive(Debug)]
struct RoomQueue {
    items: VecDeque<PendingQueueItem>,
    dropped_count: usize,
    summarized: Vec<String>,
    last_item: Option<PendingQueueItem>,
    last_enqueued_at: Instant,
    last_enqueued_at_ms: i64,
    settings: QueueSettings,
}

impl RoomQueue {
    fn new(settings: QueueSettings) -> Self {
        Self {
            items: VecDeque::new(),
            dropped_count: 0,
            summarized: Vec::new(),
            last_item: None,
            last_enqueued_at: Instant::now(),
            last_enqueued_at_ms: 0,
            settings,
        }
    }

    fn summary(&self) -> Option<String> {
        if self.summarized.is_empty() {
            return None;
        }
        let mut out = format!(
            "[{} earlier message(s) were summarized while the agent was busy]",
            self.summarized.len()
        );
        for line in &self.summarized {
            out.push_str("\n- ");
            out.push_str(line);
        }
        Some(out)
    }
}

/// Room-keyed inbound queue table.
#[derive(Default)]
pub struct InboundQueue {
    rooms: Mutex<HashMap<String, RoomQueue>>,
}

impl InboundQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `item` for later, applying the cap and drop policy.
    pub fn enqueue(
        &self,
        item: InboundItem,
        settings: &QueueSettings,
        backlog_after: bool,
    ) -> EnqueueOutcome {
        let mut rooms = self.rooms.lock();
        let queue = rooms
            .entry(item.room_id.clone())
            .or_insert_with(|| RoomQueue::new(*settings));
        queue.settings = *settings;

        let cap = settings.effective_cap();
        let mut dropped = 0;
        while queue.items.len() >= cap {
            match settings.drop_policy {
                DropPolicy::DropNewest => {
                    queue.dropped_count += 1;
                    return EnqueueOutcome::Rejected;
                }
                DropPolicy::DropOldest => {
                    queue.items.pop_front();
                }
                DropPolicy::Summarize => {
                    if let Some(old) = queue.items.pop_front() {
                        queue.summarized.push(old.summary_line);
                    }
                }
            }
            queue.dropped_count += 1;
            dropped += 1;
        }

        let pending = PendingQueueItem::new(item, backlog_after);
        queue.last_enqueued_at = Instant::now();
        queue.last_enqueued_at_ms = pending.enqueued_at_ms;
        if settings.drop_policy == DropPolicy::Summarize {
            queue.last_item = Some(pending.clone());
        }
        queue.items.push_back(pending);

        let depth = queue.items.len();
        if dropped > 0 {
            EnqueueOutcome::QueuedWithDrop { depth, dropped }
        } else {
            EnqueueOutcome::Queued { depth }
        }
    }

    /// Drop everything queued for the room.  Returns how many items went.
    pub fn clear(&self, room_id: &str) -> usize {
        self.rooms
            .lock()
            .remove(room_id)
            .map(|q| q.items.len())
            .unwrap_or(0)
    }

    pub fn len(&self, room_id: &str) -> usize {
        self.rooms.lock().get(room_id).map(|q| q.items.len()).unwrap_or(0)
    }

    pub fn is_empty(&self, room_id: &str) -> bool {
        self.len(room_id) == 0
    }

    pub fn snapshot(&self, room_id: &str) -> Option<QueueSnapshot> {
        let rooms = self.rooms.lock();
        let q = rooms.get(room_id)?;
        Some(QueueSnapshot {
            items: q.items.iter().cloned().collect(),
            dropped_count: q.dropped_count,
            last_enqueued_at_ms: q.last_enqueued_at_ms,
            mode: q.settings.mode,
            debounce_ms: q.settings.debounce_ms,
            summary: q.summary(),
            last_item: q.last_item.clone(),
        })
    }

    /// How long a drain must still wait for late siblings to arrive.
    /// `None` when the queue is empty, zero when it has settled.
    pub fn settle_delay(&self, room_id: &str) -> Option<Duration> {
        let rooms = self.rooms.lock();
        let q = rooms.get(room_id).filter(|q| !q.items.is_empty())?;
        let window = Duration::from_millis(q.settings.debounce_ms);
        Some(window.saturating_sub(q.last_enqueued_at.elapsed()))
    }

    /// Pop the next dispatch according to the room's mode.
    ///
    /// - `collect`: a run of text items sharing the leading item's thread
    ///   key, combined under [`COLLECT_HEADER`].
    /// - otherwise, with a pending summary: the newest item (the snapshot's
    ///   `last_item`), prefixed by the summary and every other queued line.
    ///   The queue is emptied.
    /// - otherwise: the oldest item.
    pub fn take_next(&self, room_id: &str) -> Option<QueueDispatch> {
        let mut rooms = self.rooms.lock();
        let q = rooms.get_mut(room_id)?;
        if q.items.is_empty() {
            return None;
        }

        let dispatch = if q.settings.mode == QueueMode::Collect {
            Self::take_collect_run(q)
        } else if !q.summarized.is_empty() {
            Self::take_summarized(q)
        } else {
            let head = q.items.pop_front()?;
            QueueDispatch {
                input: TurnInput::from_item(&head.item),
                merged: 1,
                backlog: head.backlog_after,
            }
        };

        if q.items.is_empty() {
            q.last_item = None;
        }
        Some(dispatch)
    }

    fn take_collect_run(q: &mut RoomQueue) -> QueueDispatch {
        let mut run: Vec<PendingQueueItem> = Vec::new();
        let key = q.items.front().and_then(|i| i.thread_key.clone());

        while let Some(next) = q.items.front() {
            let joinable = next.thread_key == key
                && next.item.payload.is_text()
                && run.iter().all(|r| r.item.payload.is_text());
            if !run.is_empty() && !joinable {
                break;
            }
            if let Some(item) = q.items.pop_front() {
                run.push(item);
            }
        }

        let preamble = q.summary();
        q.summarized.clear();

        let merged = run.len();
        let mut input = match run.last() {
            Some(last) => TurnInput::from_item(&last.item),
            None => return QueueDispatch { input: empty_input(), merged: 0, backlog: false },
        };
        if merged > 1 {
            let mut body = String::from(COLLECT_HEADER);
            for (i, p) in run.iter().enumerate() {
                body.push_str(&format!("\n\n---\nQueued #{}\n{}", i + 1, p.summary_line));
            }
            input.payload = InboundPayload::Text { body };
        }
        input.preamble = preamble;
        let backlog = run.iter().any(|p| p.backlog_after);
        QueueDispatch { input, merged, backlog }
    }

    fn take_summarized(q: &mut RoomQueue) -> QueueDispatch {
        let mut items: Vec<PendingQueueItem> = q.items.drain(..).collect();
        let merged = items.len();
        let backlog = items.iter().any(|p| p.backlog_after);
        q.last_item = None;
        let newest = items.pop();

        let mut summary = q.summary().unwrap_or_default();
        q.summarized.clear();
        for p in &items {
            summary.push_str("\n- ");
            summary.push_str(&p.summary_line);
        }

        let mut input = match &newest {
            Some(newest) => TurnInput::from_item(&newest.item),
            None => empty_input(),
        };
        input.preamble = Some(summary);
        QueueDispatch { input, merged, backlog }
    }
}

fn empty_input() -> TurnInput {
    TurnInput {
        room_id: String::new(),
        channel: None,
        source_event_id: None,
        payload: InboundPayload::text(""),
        background: false,
        preamble: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(mode: QueueMode, cap: usize, drop_policy: DropPolicy) -> QueueSettings {
        QueueSettings { mode, debounce_ms: 0, cap, drop_policy }
    }

    fn text(input: &TurnInput) -> String {
        match &input.payload {
            InboundPayload::Text { body } => body.clone(),
            other => panic!("expected text, got {other:?}"),
        }
    }

    #[test]
    fn fifo_under_queue_mode() {
        let q = InboundQueue::new();
        let s = settings(QueueMode::Queue, 10, DropPolicy::DropOldest);
        for body in ["a", "b", "c"] {
            q.enqueue(InboundItem::text("r", body), &s, false);
        }
        let order: Vec<String> =
            std::iter::from_fn(|| q.take_next("r")).map(|d| text(&d.input)).collect();
        assert_eq!(order, vec!["a", "b", "c"]);
        assert!(q.is_empty("r"));
    }

    #[test]
    fn drop_oldest_keeps_newest() {
        let q = InboundQueue::new();
        let s = settings(QueueMode::Queue, 2, DropPolicy::DropOldest);
        q.enqueue(InboundItem::text("r", "1"), &s, false);
        q.enqueue(InboundItem::text("r", "2"), &s, false);
        let outcome = q.enqueue(InboundItem::text("r", "3"), &s, false);
        assert_eq!(outcome, EnqueueOutcome::QueuedWithDrop { depth: 2, dropped: 1 });

        let snap = q.snapshot("r").unwrap();
        let lines: Vec<&str> = snap.items.iter().map(|i| i.summary_line.as_str()).collect();
        assert_eq!(lines, vec!["2", "3"]);
        assert_eq!(snap.dropped_count, 1);
    }

    #[test]
    fn drop_newest_rejects_and_keeps_rest() {
        let q = InboundQueue::new();
        let s = settings(QueueMode::Queue, 2, DropPolicy::DropNewest);
        q.enqueue(InboundItem::text("r", "1"), &s, false);
        q.enqueue(InboundItem::text("r", "2"), &s, false);
        assert_eq!(q.enqueue(InboundItem::text("r", "3"), &s, false), EnqueueOutcome::Rejected);

        let snap = q.snapshot("r").unwrap();
        let lines: Vec<&str> = snap.items.iter().map(|i| i.summary_line.as_str()).collect();
        assert_eq!(lines, vec!["1", "2"]);
    }

    #[test]
    fn summarize_collapses_overflow_into_one_dispatch() {
        let q = InboundQueue::new();
        let s = settings(QueueMode::Queue, 2, DropPolicy::Summarize);
        for (i, body) in ["one", "two", "three", "four"].into_iter().enumerate() {
            q.enqueue(InboundItem::text("r", body).with_event_id(format!("$e{i}")), &s, false);
        }
        let snap = q.snapshot("r").unwrap();
        assert_eq!(snap.items.len(), 2);
        assert!(snap.summary.as_deref().unwrap().contains("- one"));
        assert_eq!(snap.last_item.unwrap().summary_line, "four");

        let dispatch = q.take_next("r").unwrap();
        assert_eq!(text(&dispatch.input), "four");
        assert_eq!(dispatch.input.source_event_id.as_deref(), Some("$e3"));
        let preamble = dispatch.input.preamble.unwrap();
        assert!(preamble.contains("- one"));
        assert!(preamble.contains("- two"));
        assert!(preamble.contains("- three"));
        assert!(!preamble.contains("four"));
        assert!(q.take_next("r").is_none());
    }

    #[test]
    fn collect_batches_leading_thread_run() {
        let q = InboundQueue::new();
        let s = settings(QueueMode::Collect, 10, DropPolicy::DropOldest);
        q.enqueue(InboundItem::text("r", "a1").with_thread("A"), &s, false);
        q.enqueue(InboundItem::text("r", "a2").with_thread("A"), &s, false);
        q.enqueue(InboundItem::text("r", "b1").with_thread("B"), &s, false);
        q.enqueue(InboundItem::text("r", "a3").with_thread("A"), &s, false);

        let first = q.take_next("r").unwrap();
        assert_eq!(first.merged, 2);
        let body = text(&first.input);
        assert!(body.starts_with(COLLECT_HEADER));
        assert!(body.contains("Queued #1\na1"));
        assert!(body.contains("Queued #2\na2"));

        let second = q.take_next("r").unwrap();
        assert_eq!(second.merged, 1);
        assert_eq!(text(&second.input), "b1");

        let third = q.take_next("r").unwrap();
        assert_eq!(text(&third.input), "a3");
    }

    #[test]
    fn collect_does_not_merge_media() {
        let q = InboundQueue::new();
        let s = settings(QueueMode::Collect, 10, DropPolicy::DropOldest);
        q.enqueue(InboundItem::text("r", "look"), &s, false);
        let mut media = InboundItem::text("r", "");
        media.payload = InboundPayload::Media {
            url: "mxc://x".into(),
            mime_type: "image/png".into(),
            caption: None,
        };
        q.enqueue(media, &s, false);

        assert_eq!(q.take_next("r").unwrap().merged, 1);
        let next = q.take_next("r").unwrap();
        assert!(matches!(next.input.payload, InboundPayload::Media { .. }));
    }

    #[test]
    fn clear_empties_room_only() {
        let q = InboundQueue::new();
        let s = settings(QueueMode::Queue, 10, DropPolicy::DropOldest);
        q.enqueue(InboundItem::text("r1", "x"), &s, false);
        q.enqueue(InboundItem::text("r1", "y"), &s, false);
        q.enqueue(InboundItem::text("r2", "z"), &s, false);
        assert_eq!(q.clear("r1"), 2);
        assert!(q.is_empty("r1"));
        assert_eq!(q.len("r2"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn settle_delay_counts_down_from_last_enqueue() {
        let q = InboundQueue::new();
        let s = QueueSettings { debounce_ms: 500, ..settings(QueueMode::Queue, 5, DropPolicy::DropOldest) };
        assert!(q.settle_delay("r").is_none());
        q.enqueue(InboundItem::text("r", "x"), &s, false);
        assert_eq!(q.settle_delay("r"), Some(Duration::from_millis(500)));
        tokio::time::advance(Duration::from_millis(300)).await;
        assert_eq!(q.settle_delay("r"), Some(Duration::from_millis(200)));
        tokio::time::advance(Duration::from_millis(300)).await;
        assert_eq!(q.settle_delay("r"), Some(Duration::ZERO));
    }

    #[test]
    fn backlog_flag_reaches_the_dispatch() {
        let q = InboundQueue::new();
        let s = settings(QueueMode::SteerBacklog, 5, DropPolicy::DropOldest);
        q.enqueue(InboundItem::text("r", "x"), &s, true);
        q.enqueue(InboundItem::text("r", "y"), &s, false);
        assert!(q.snapshot("r").unwrap().items[0].backlog_after);

        assert!(q.take_next("r").unwrap().backlog);
        assert!(!q.take_next("r").unwrap().backlog);
    }

    #[test]
    fn collect_batch_is_backlog_if_any_member_is() {
        let q = InboundQueue::new();
        let s = settings(QueueMode::Collect, 5, DropPolicy::DropOldest);
        q.enqueue(InboundItem::text("r", "plain"), &s, false);
        q.enqueue(InboundItem::text("r", "steered"), &s, true);
        let dispatch = q.take_next("r").unwrap();
        assert_eq!(dispatch.merged, 2);
        assert!(dispatch.backlog);
    }
}
