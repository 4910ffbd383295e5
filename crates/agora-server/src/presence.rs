//! Timeout-based presence.
//!
//! Two maps of last-activity instants: one per user, one per (user, room).
//! Nothing is ever evicted; a missing or stale entry is what "offline"
//! means.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use agora_shared::types::{RoomId, UserId};
use tokio::sync::RwLock;

#[derive(Default)]
struct PresenceState {
    global: HashMap<UserId, Instant>,
    rooms: HashMap<(UserId, RoomId), Instant>,
}

#[derive(Clone)]
pub struct PresenceTracker {
    state: Arc<RwLock<PresenceState>>,
    timeout: Duration,
}

impl PresenceTracker {
    pub fn new(timeout: Duration) -> Self {
        Self {
            state: Arc::new(RwLock::new(PresenceState::default())),
            timeout,
        }
    }

    /// Mark `user` active now, globally and in `room` if given.
    pub async fn touch(&self, user: UserId, room: Option<RoomId>) {
        self.touch_at(user, room, Instant::now()).await;
    }

    pub async fn touch_at(&self, user: UserId, room: Option<RoomId>, at: Instant) {
        let mut state = self.state.write().await;
        state.global.insert(user, at);
        if let Some(room) = room {
            state.rooms.insert((user, room), at);
        }
    }

    /// Users seen in `room` within the timeout, ordered by id.
    pub async fn online_in_room(&self, room: RoomId) -> Vec<UserId> {
        let now = Instant::now();
        let state = self.state.read().await;
        let mut users: Vec<UserId> = state
            .rooms
            .iter()
            .filter(|((_, r), seen)| *r == room && self.is_fresh(now, **seen))
            .map(|((user, _), _)| *user)
            .collect();
        users.sort();
        users
    }

    /// Users seen anywhere within the timeout.
    pub async fn global_online_count(&self) -> usize {
        let now = Instant::now();
        let state = self.state.read().await;
        state
            .global
            .values()
            .filter(|seen| self.is_fresh(now, **seen))
            .count()
    }

    fn is_fresh(&self, now: Instant, seen: Instant) -> bool {
        now.saturating_duration_since(seen) <= self.timeout
    }
}
