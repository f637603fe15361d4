//! Inbound debouncer.
//!
//! Merges bursts of text messages into one item before admission, so five
//! lines typed in quick succession become one turn instead of five.  Each
//! submit restarts the room's timer; when it expires the buffered items
//! are combined under a marker line and sent to the admission channel.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use rb_domain::config::DebounceConfig;
use rb_domain::trace::TraceEvent;

use crate::ports::{InboundItem, InboundPayload};

#[derive(Default)]
struct RoomBuffer {
    items: Vec<InboundItem>,
    timer: Option<JoinHandle<()>>,
}

struct Inner {
    window: Duration,
    marker: String,
    buffers: Mutex<HashMap<String, RoomBuffer>>,
    tx: mpsc::UnboundedSender<InboundItem>,
}

#[derive(Clone)]
pub struct Debouncer {
    inner: Arc<Inner>,
}

impl Debouncer {
    /// Create a debouncer and the receiving end of its output channel.
    pub fn new(config: &DebounceConfig) -> (Self, mpsc::UnboundedReceiver<InboundItem>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let inner = Arc::new(Inner {
            window: Duration::from_millis(config.window_ms),
            marker: config.combined_marker.clone(),
            buffers: Mutex::new(HashMap::new()),
            tx,
        });
        (Self { inner }, rx)
    }

    /// Buffer `item` and (re)start its room's timer.
    ///
    /// With a zero window items pass straight through.  Non-text items are
    /// never merged: the room's buffer is flushed first, then the item is
    /// forwarded on its own, which keeps arrival order.
    pub fn submit(&self, item: InboundItem) {
        if self.inner.window.is_zero() {
            self.inner.send(item);
            return;
        }

        if !item.payload.is_text() {
            let buffered = self.inner.take_room(&item.room_id);
            self.inner.emit_merged(buffered);
            self.inner.send(item);
            return;
        }

        let room_id = item.room_id.clone();
        let mut buffers = self.inner.buffers.lock();
        let buffer = buffers.entry(room_id.clone()).or_default();
        buffer.items.push(item);
        if let Some(timer) = buffer.timer.take() {
            timer.abort();
        }

        let inner = Arc::clone(&self.inner);
        let window = self.inner.window;
        buffer.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(window).await;
            let items = inner.take_room(&room_id);
            inner.emit_merged(items);
        }));
    }

    /// Fire every pending timer now.  Used at shutdown so buffered input
    /// is not lost.
    pub fn flush_all(&self) {
        let drained: Vec<Vec<InboundItem>> = {
            let mut buffers = self.inner.buffers.lock();
            buffers
                .drain()
                .map(|(_, mut buf)| {
                    if let Some(timer) = buf.timer.take() {
                        timer.abort();
                    }
                    buf.items
                })
                .collect()
        };
        for items in drained {
            self.inner.emit_merged(items);
        }
    }

    /// Number of rooms with buffered input.
    pub fn pending_rooms(&self) -> usize {
        self.inner.buffers.lock().len()
    }
}

impl Inner {
    fn take_room(&self, room_id: &str) -> Vec<InboundItem> {
        let mut buffers = self.buffers.lock();
        match buffers.remove(room_id) {
            Some(mut buf) => {
                if let Some(timer) = buf.timer.take() {
                    timer.abort();
                }
                buf.items
            }
            None => Vec::new(),
        }
    }

    fn emit_merged(&self, items: Vec<InboundItem>) {
        let count = items.len();
        if let Some(item) = merge(items, &self.marker) {
            if count > 1 {
                TraceEvent::DebounceFlushed { room_id: item.room_id.clone(), merged: count }
                    .emit();
            }
            self.send(item);
        }
    }

    fn send(&self, item: InboundItem) {
        if self.tx.send(item).is_err() {
            tracing::warn!("debounce output channel closed; dropping inbound item");
        }
    }
}

/// Combine a burst into one item.  The result keeps the metadata of the
/// last item so replies thread onto the most recent message.
fn merge(mut items: Vec<InboundItem>, marker: &str) -> Option<InboundItem> {
    if items.len() <= 1 {
        return items.pop();
    }
    let mut body = String::from(marker);
    for item in &items {
        body.push('\n');
        body.push_str(&item.payload.summary_line());
    }
    let mut last = items.pop()?;
    last.payload = InboundPayload::Text { body };
    Some(last)
}
