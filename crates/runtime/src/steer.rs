//! Steering: injecting a new user message into a running turn.
//!
//! Each active turn owns a [`SteerInbox`].  Admission pushes into it, and
//! the engine drains it at every continuation boundary.  Once the engine
//! decides the turn is done it closes the inbox; later pushes fail and the
//! message is queued instead.  Messages that were accepted before the
//! close are still answered, by one more continuation round.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;

use rb_domain::tool::Message;

#[derive(Debug, Default)]
struct InboxState {
    pending: VecDeque<Message>,
    /// Messages already handed to the engine in this turn.  Kept so a
    /// fallback attempt that restarts the turn can replay them.
    consumed: Vec<Message>,
    closed: bool,
}

#[derive(Debug, Clone, Default)]
pub struct SteerInbox {
    state: Arc<Mutex<InboxState>>,
}

impl SteerInbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Offer a message to the running turn.  Returns `false` once closed.
    pub fn try_push(&self, message: Message) -> bool {
        let mut state = self.state.lock();
        if state.closed {
            return false;
        }
        state.pending.push_back(message);
        true
    }

    /// Take everything accepted since the last call.
    pub fn take_pending(&self) -> Vec<Message> {
        let mut state = self.state.lock();
        let taken: Vec<Message> = state.pending.drain(..).collect();
        state.consumed.extend(taken.iter().cloned());
        taken
    }

    /// Refuse further pushes and return what is still pending.
    pub fn close_and_take(&self) -> Vec<Message> {
        self.state.lock().closed = true;
        self.take_pending()
    }

    /// Put consumed messages back in front of the pending ones, for a
    /// turn that starts over.
    pub fn rewind(&self) {
        let mut state = self.state.lock();
        let consumed = std::mem::take(&mut state.consumed);
        for message in consumed.into_iter().rev() {
            state.pending.push_front(message);
        }
    }

    /// Hand messages taken by [`take_pending`](Self::take_pending) back
    /// unanswered, so whoever closes the inbox last can re-queue them.
    pub fn unconsume(&self, messages: Vec<Message>) {
        if messages.is_empty() {
            return;
        }
        let mut state = self.state.lock();
        let keep = state.consumed.len().saturating_sub(messages.len());
        state.consumed.truncate(keep);
        for message in messages.into_iter().rev() {
            state.pending.push_front(message);
        }
    }

    /// Messages accepted but never handed to the engine.  Does not mark
    /// them consumed.
    pub fn drain_unanswered(&self) -> Vec<Message> {
        let mut state = self.state.lock();
        state.closed = true;
        state.pending.drain(..).collect()
    }

    pub fn close(&self) {
        self.state.lock().closed = true;
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }
}

struct RegisteredInbox {
    turn_id: String,
    inbox: SteerInbox,
}

/// Inboxes of the rooms that currently have a running turn.
#[derive(Default)]
pub struct SteerRegistry {
    inboxes: Mutex<HashMap<String, RegisteredInbox>>,
}

impl SteerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a fresh inbox for the room's new turn.
    pub fn open(&self, room_id: &str, turn_id: &str) -> SteerInbox {
        let inbox = SteerInbox::new();
        self.inboxes.lock().insert(
            room_id.to_owned(),
            RegisteredInbox { turn_id: turn_id.to_owned(), inbox: inbox.clone() },
        );
        inbox
    }

    /// Close and forget the room's inbox.
    pub fn remove(&self, room_id: &str) {
        if let Some(entry) = self.inboxes.lock().remove(room_id) {
            entry.inbox.close();
        }
    }

    /// Try to steer the room's running turn.  Returns the id of the turn
    /// that accepted the message.
    pub fn try_steer(&self, room_id: &str, message: Message) -> Option<String> {
        let (turn_id, inbox) = {
            let inboxes = self.inboxes.lock();
            let entry = inboxes.get(room_id)?;
            (entry.turn_id.clone(), entry.inbox.clone())
        };
        inbox.try_push(message).then_some(turn_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closed_inbox_rejects() {
        let inbox = SteerInbox::new();
        assert!(inbox.try_push(Message::user("a")));
        let left = inbox.close_and_take();
        assert_eq!(left, vec![Message::user("a")]);
        assert!(!inbox.try_push(Message::user("b")));
        assert!(inbox.is_closed());
    }

    #[test]
    fn rewind_replays_consumed_first() {
        let inbox = SteerInbox::new();
        inbox.try_push(Message::user("1"));
        inbox.try_push(Message::user("2"));
        assert_eq!(inbox.take_pending().len(), 2);
        inbox.try_push(Message::user("3"));
        inbox.rewind();
        assert_eq!(
            inbox.take_pending(),
            vec![Message::user("1"), Message::user("2"), Message::user("3")]
        );
    }

    #[test]
    fn unconsumed_messages_are_left_for_requeue() {
        let inbox = SteerInbox::new();
        inbox.try_push(Message::user("late"));
        let taken = inbox.take_pending();
        inbox.close();
        inbox.unconsume(taken);
        assert_eq!(inbox.drain_unanswered(), vec![Message::user("late")]);
        inbox.rewind();
        assert!(inbox.take_pending().is_empty());
    }

    #[test]
    fn registry_routes_by_room() {
        let registry = SteerRegistry::new();
        assert!(registry.try_steer("r", Message::user("x")).is_none());
        let inbox = registry.open("r", "turn-7");
        assert_eq!(registry.try_steer("r", Message::user("x")).as_deref(), Some("turn-7"));
        assert!(registry.try_steer("other", Message::user("x")).is_none());
        assert_eq!(inbox.take_pending().len(), 1);
        registry.remove("r");
        assert!(inbox.is_closed());
        assert!(registry.try_steer("r", Message::user("y")).is_none());
    }
}
