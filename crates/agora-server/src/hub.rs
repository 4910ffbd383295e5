//! Connection registry and room fan-out.
//!
//! Each socket gets a bounded outbound queue. Room publishes go out under a
//! single lock, so every subscriber of a room sees events in the order they
//! were published. A full queue drops that event for that subscriber only.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use agora_shared::protocol::ServerEvent;
use agora_shared::types::RoomId;
use agora_shared::Identity;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};
use uuid::Uuid;

/// Opaque per-socket id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

struct Connection {
    identity: Identity,
    tx: mpsc::Sender<ServerEvent>,
    rooms: HashSet<RoomId>,
    dropped: u64,
}

#[derive(Default)]
struct HubState {
    connections: HashMap<ConnectionId, Connection>,
    rooms: HashMap<RoomId, HashSet<ConnectionId>>,
}

#[derive(Clone)]
pub struct Hub {
    state: Arc<Mutex<HubState>>,
    queue_capacity: usize,
}

impl Hub {
    pub fn new(queue_capacity: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(HubState::default())),
            queue_capacity: queue_capacity.max(1),
        }
    }

    /// Register a socket and return its id plus the receiving end of its
    /// outbound queue.
    pub async fn register(&self, identity: Identity) -> (ConnectionId, mpsc::Receiver<ServerEvent>) {
        let (tx, rx) = mpsc::channel(self.queue_capacity);
        let id = ConnectionId::new();

        let mut state = self.state.lock().await;
        state.connections.insert(
            id,
            Connection {
                identity,
                tx,
                rooms: HashSet::new(),
                dropped: 0,
            },
        );
        debug!(conn = %id, user = %identity.user_id, total = state.connections.len(), "connection registered");

        (id, rx)
    }

    /// Subscribe a connection to a room. Returns `false` for an unknown
    /// connection.
    pub async fn join(&self, conn: ConnectionId, room: RoomId) -> bool {
        let mut state = self.state.lock().await;
        let Some(connection) = state.connections.get_mut(&conn) else {
            return false;
        };
        connection.rooms.insert(room);
        state.rooms.entry(room).or_default().insert(conn);
        true
    }

    /// Unsubscribe a connection from a room. Returns whether it was a member.
    pub async fn leave(&self, conn: ConnectionId, room: RoomId) -> bool {
        let mut state = self.state.lock().await;
        let was_member = state
            .connections
            .get_mut(&conn)
            .is_some_and(|c| c.rooms.remove(&room));
        remove_from_room(&mut state, room, conn);
        was_member
    }

    /// Forget a connection entirely. Idempotent; returns the rooms it was
    /// still subscribed to and its identity the first time.
    pub async fn disconnect(&self, conn: ConnectionId) -> Option<(Identity, Vec<RoomId>)> {
        let mut state = self.state.lock().await;
        let connection = state.connections.remove(&conn)?;

        let mut rooms: Vec<RoomId> = connection.rooms.into_iter().collect();
        rooms.sort();
        for room in &rooms {
            remove_from_room(&mut state, *room, conn);
        }

        debug!(conn = %conn, rooms = rooms.len(), dropped = connection.dropped, "connection removed");
        Some((connection.identity, rooms))
    }

    /// Deliver to one connection. Returns `false` if it is gone or full.
    pub async fn send_to(&self, conn: ConnectionId, event: ServerEvent) -> bool {
        let mut state = self.state.lock().await;
        let Some(connection) = state.connections.get_mut(&conn) else {
            return false;
        };
        deliver(conn, connection, event)
    }

    /// Deliver to every subscriber of `room`. Returns how many accepted it.
    pub async fn publish(&self, room: RoomId, event: ServerEvent) -> usize {
        let mut state = self.state.lock().await;
        let HubState { connections, rooms } = &mut *state;

        let Some(members) = rooms.get(&room) else {
            return 0;
        };

        let mut delivered = 0;
        for conn in members {
            if let Some(connection) = connections.get_mut(conn) {
                if deliver(*conn, connection, event.clone()) {
                    delivered += 1;
                }
            }
        }
        delivered
    }

    /// Deliver to every registered connection.
    pub async fn broadcast_all(&self, event: ServerEvent) -> usize {
        let mut state = self.state.lock().await;
        let mut delivered = 0;
        for (conn, connection) in state.connections.iter_mut() {
            if deliver(*conn, connection, event.clone()) {
                delivered += 1;
            }
        }
        delivered
    }

    #[cfg(test)]
    pub async fn is_member(&self, conn: ConnectionId, room: RoomId) -> bool {
        self.state
            .lock()
            .await
            .rooms
            .get(&room)
            .is_some_and(|members| members.contains(&conn))
    }

    pub async fn connection_count(&self) -> usize {
        self.state.lock().await.connections.len()
    }
}

fn remove_from_room(state: &mut HubState, room: RoomId, conn: ConnectionId) {
    if let Some(members) = state.rooms.get_mut(&room) {
        members.remove(&conn);
        if members.is_empty() {
            state.rooms.remove(&room);
        }
    }
}

fn deliver(id: ConnectionId, connection: &mut Connection, event: ServerEvent) -> bool {
    let name = event.name();
    match connection.tx.try_send(event) {
        Ok(()) => true,
        Err(mpsc::error::TrySendError::Full(_)) => {
            connection.dropped = connection.dropped.saturating_add(1);
            warn!(conn = %id, event = name, dropped = connection.dropped, "subscriber queue full, dropping event");
            false
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {
            debug!(conn = %id, event = name, "subscriber gone");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use agora_shared::types::UserId;
    use agora_shared::Role;
    use tokio::time::timeout;

    use super::*;

    fn user(id: i64) -> Identity {
        Identity::new(UserId(id), Role::User)
    }

    async fn recv(rx: &mut mpsc::Receiver<ServerEvent>) -> ServerEvent {
        timeout(Duration::from_millis(200), rx.recv())
            .await
            .expect("timed out")
            .expect("channel closed")
    }

    #[tokio::test]
    async fn test_publish_reaches_only_room_members() {
        let hub = Hub::new(8);
        let (a, mut rx_a) = hub.register(user(2)).await;
        let (b, mut rx_b) = hub.register(user(3)).await;
        let (_c, mut rx_c) = hub.register(user(4)).await;

        hub.join(a, RoomId(1)).await;
        hub.join(b, RoomId(1)).await;

        assert_eq!(hub.publish(RoomId(1), ServerEvent::error("hi")).await, 2);
        assert_eq!(recv(&mut rx_a).await, ServerEvent::error("hi"));
        assert_eq!(recv(&mut rx_b).await, ServerEvent::error("hi"));
        assert!(rx_c.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_order_is_preserved_per_subscriber() {
        let hub = Hub::new(16);
        let (a, mut rx_a) = hub.register(user(2)).await;
        let (b, mut rx_b) = hub.register(user(3)).await;
        hub.join(a, RoomId(1)).await;
        hub.join(b, RoomId(1)).await;

        for i in 0..5 {
            hub.publish(RoomId(1), ServerEvent::error(format!("{i}"))).await;
        }
        for i in 0..5 {
            assert_eq!(recv(&mut rx_a).await, ServerEvent::error(format!("{i}")));
            assert_eq!(recv(&mut rx_b).await, ServerEvent::error(format!("{i}")));
        }
    }

    #[tokio::test]
    async fn test_full_queue_drops_without_blocking_others() {
        let hub = Hub::new(1);
        let (slow, _rx_slow) = hub.register(user(2)).await;
        let (fast, mut rx_fast) = hub.register(user(3)).await;
        hub.join(slow, RoomId(1)).await;
        hub.join(fast, RoomId(1)).await;

        assert_eq!(hub.publish(RoomId(1), ServerEvent::error("1")).await, 2);
        recv(&mut rx_fast).await;
        // The slow queue is still full.
        assert_eq!(hub.publish(RoomId(1), ServerEvent::error("2")).await, 1);
        assert_eq!(recv(&mut rx_fast).await, ServerEvent::error("2"));
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let hub = Hub::new(8);
        let (a, _rx) = hub.register(user(2)).await;
        hub.join(a, RoomId(1)).await;
        hub.join(a, RoomId(2)).await;

        let (identity, rooms) = hub.disconnect(a).await.unwrap();
        assert_eq!(identity.user_id, UserId(2));
        assert_eq!(rooms, vec![RoomId(1), RoomId(2)]);
        assert!(hub.disconnect(a).await.is_none());
        assert!(!hub.is_member(a, RoomId(1)).await);
        assert_eq!(hub.publish(RoomId(1), ServerEvent::error("x")).await, 0);
        assert_eq!(hub.connection_count().await, 0);
    }

    #[tokio::test]
    async fn test_leave_and_broadcast_all() {
        let hub = Hub::new(8);
        let (a, mut rx_a) = hub.register(user(2)).await;
        let (_b, mut rx_b) = hub.register(user(3)).await;
        hub.join(a, RoomId(1)).await;

        assert!(hub.leave(a, RoomId(1)).await);
        assert!(!hub.leave(a, RoomId(1)).await);
        assert_eq!(hub.publish(RoomId(1), ServerEvent::error("x")).await, 0);

        assert_eq!(hub.broadcast_all(ServerEvent::error("all")).await, 2);
        assert_eq!(recv(&mut rx_a).await, ServerEvent::error("all"));
        assert_eq!(recv(&mut rx_b).await, ServerEvent::error("all"));
    }
}
