//! Per-room turn lock.
//!
//! Ensures only one turn runs per room at a time.  Unlike a semaphore,
//! a busy room does not make the caller wait: [`TurnLockMap::acquire`]
//! returns `false` and the caller queues the message instead.
//!
//! Every successful acquire must be paired with exactly one release.
//! [`TurnGuard`] releases on drop, which covers early returns, errors and
//! panics inside the turn task.  Release also fires the drain hook so
//! messages queued while the room was busy are not stranded.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::cancel::CancelToken;

/// Called with the room id after every release.
pub type ReleaseHook = Arc<dyn Fn(&str) + Send + Sync>;

#[derive(Debug, Default)]
struct RoomTurnState {
    active: bool,
    /// Always `Some` while `active`.
    cancel: Option<CancelToken>,
}

/// Manages per-room turn state.
#[derive(Default)]
pub struct TurnLockMap {
    rooms: Mutex<HashMap<String, RoomTurnState>>,
    on_release: Mutex<Option<ReleaseHook>>,
}

impl TurnLockMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install the hook fired after each release (the dispatcher's drain).
    pub fn set_release_hook(&self, hook: ReleaseHook) {
        *self.on_release.lock() = Some(hook);
    }

    /// Mark the room active.  Returns `false` if a turn is already running.
    pub fn acquire(&self, room_id: &str) -> bool {
        let mut rooms = self.rooms.lock();
        let state = rooms.entry(room_id.to_owned()).or_default();
        if state.active {
            return false;
        }
        state.active = true;
        state.cancel = Some(CancelToken::new());
        true
    }

    /// Acquire and wrap the lock in a guard that releases on drop.
    pub fn try_guard(self: &Arc<Self>, room_id: &str) -> Option<TurnGuard> {
        self.acquire(room_id).then(|| TurnGuard {
            map: Arc::clone(self),
            room_id: room_id.to_owned(),
        })
    }

    /// Clear the active flag, cancel the attached handle, and fire the
    /// release hook.  Releasing an idle room only fires the hook.
    pub fn release(&self, room_id: &str) {
        let token = {
            let mut rooms = self.rooms.lock();
            rooms.remove(room_id).and_then(|state| state.cancel)
        };
        if let Some(token) = token {
            token.cancel();
        }

        let hook = self.on_release.lock().clone();
        if let Some(hook) = hook {
            hook(room_id);
        }
    }

    /// The cancel handle of the room's active turn.  `None` when idle.
    pub fn attach_cancel(&self, room_id: &str) -> Option<CancelToken> {
        let mut rooms = self.rooms.lock();
        let state = rooms.get_mut(room_id).filter(|s| s.active)?;
        Some(state.cancel.get_or_insert_with(CancelToken::new).clone())
    }

    /// Cancel the room's active turn.  Returns whether one was running.
    pub fn cancel(&self, room_id: &str) -> bool {
        let rooms = self.rooms.lock();
        match rooms.get(room_id) {
            Some(RoomTurnState { active: true, cancel: Some(token) }) => {
                token.cancel();
                true
            }
            _ => false,
        }
    }

    /// Cancel every active turn.  Returns how many were signalled.
    pub fn cancel_all(&self) -> usize {
        let rooms = self.rooms.lock();
        rooms
            .values()
            .filter(|s| s.active)
            .filter_map(|s| s.cancel.as_ref())
            .inspect(|token| token.cancel())
            .count()
    }

    pub fn is_active(&self, room_id: &str) -> bool {
        self.rooms.lock().get(room_id).is_some_and(|s| s.active)
    }

    /// Number of rooms with a running turn (for monitoring).
    pub fn active_count(&self) -> usize {
        self.rooms.lock().values().filter(|s| s.active).count()
    }
}

/// Scoped ownership of a room's turn lock.
pub struct TurnGuard {
    map: Arc<TurnLockMap>,
    room_id: String,
}

impl TurnGuard {
    pub fn room_id(&self) -> &str {
        &self.room_id
    }
}

impl Drop for TurnGuard {
    fn drop(&mut self) {
        self.map.release(&self.room_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn acquire_is_exclusive_per_room() {
        let map = TurnLockMap::new();
        assert!(map.acquire("r1"));
        assert!(!map.acquire("r1"));
        assert!(map.acquire("r2"));
        assert_eq!(map.active_count(), 2);

        map.release("r1");
        assert!(!map.is_active("r1"));
        assert!(map.acquire("r1"));
    }

    #[test]
    fn release_cancels_attached_handle() {
        let map = TurnLockMap::new();
        assert!(map.acquire("r1"));
        let token = map.attach_cancel("r1").unwrap();
        assert!(!token.is_cancelled());
        map.release("r1");
        assert!(token.is_cancelled());
        assert!(map.attach_cancel("r1").is_none());
    }

    #[test]
    fn cancel_reports_whether_a_turn_was_running() {
        let map = TurnLockMap::new();
        assert!(!map.cancel("r1"));
        assert!(map.acquire("r1"));
        let token = map.attach_cancel("r1").unwrap();
        assert!(map.cancel("r1"));
        assert!(token.is_cancelled());
        // Still active until released.
        assert!(map.is_active("r1"));
    }

    #[test]
    fn guard_releases_on_drop_and_fires_hook() {
        let map = Arc::new(TurnLockMap::new());
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        map.set_release_hook(Arc::new(move |room| {
            assert_eq!(room, "r1");
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        {
            let guard = map.try_guard("r1").unwrap();
            assert_eq!(guard.room_id(), "r1");
            assert!(map.try_guard("r1").is_none());
        }
        assert!(!map.is_active("r1"));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn guard_releases_when_task_panics() {
        let map = Arc::new(TurnLockMap::new());
        let inner = map.clone();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(move || {
            let _guard = inner.try_guard("r1").unwrap();
            panic!("turn blew up");
        }));
        assert!(result.is_err());
        assert!(!map.is_active("r1"));
    }

    #[test]
    fn cancel_all_signals_active_rooms() {
        let map = TurnLockMap::new();
        map.acquire("a");
        map.acquire("b");
        let a = map.attach_cancel("a").unwrap();
        assert_eq!(map.cancel_all(), 2);
        assert!(a.is_cancelled());
    }
}
