//! Message broker: the pipeline every chat operation runs through.
//!
//! The broker owns the database handle and the three in-memory services
//! (connection hub, presence tracker, send gate). Socket frames arrive via
//! [`Broker::handle`]; HTTP handlers call the public operations directly.
//!
//! A send is validated, permission-checked, sanitized, admitted by the send
//! gate, persisted, and only then fanned out. Nothing is broadcast for a
//! send that failed to persist.

use std::sync::{Arc, Mutex};

use agora_shared::constants::{DEFAULT_HISTORY_LIMIT, MAX_CHAT_MESSAGE_CHARS, MAX_HISTORY_LIMIT};
use agora_shared::permission::{Container, PermissionLevel};
use agora_shared::protocol::{
    ChallengeAnswer, ClientEvent, MessagePayload, PresencePayload, ResolveChallenge, SendMessage,
    ServerEvent,
};
use agora_shared::sanitize::{decode_entities, sanitize};
use agora_shared::types::{Identity, MessageId, RoomId, UserId};
use agora_shared::{utc_now, UserSummary};
use agora_store::{AuthoredMessage, Database, HistoryCursor, Room, StoreError, UnreadCounts};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::ServerConfig;
use crate::error::ServerError;
use crate::hub::{ConnectionId, Hub};
use crate::presence::PresenceTracker;
use crate::rate_limit::{Admission, PendingSend, SendGate};

/// Result of a send that passed validation and permission checks.
#[derive(Debug, Clone, PartialEq)]
pub enum SendOutcome {
    /// Persisted and fanned out.
    Delivered(MessagePayload),
    /// Parked until the sender answers the challenge.
    Challenged { captcha_id: String, question: String },
}

/// A page of room history as returned over HTTP.
#[derive(Debug, Clone, Serialize)]
pub struct HistoryView {
    pub messages: Vec<MessagePayload>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_pages: Option<u32>,
}

#[derive(Clone)]
pub struct Broker {
    db: Arc<Mutex<Database>>,
    hub: Hub,
    presence: PresenceTracker,
    gate: SendGate,
    /// Held from persist through publish so room events leave in the order
    /// their writes committed.
    fanout: Arc<tokio::sync::Mutex<()>>,
}

impl Broker {
    pub fn new(db: Arc<Mutex<Database>>, config: &ServerConfig) -> Self {
        Self {
            db,
            hub: Hub::new(config.subscriber_queue_capacity),
            presence: PresenceTracker::new(config.online_timeout),
            gate: SendGate::new(config.send_interval, config.challenge_ttl),
            fanout: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    pub fn gate(&self) -> &SendGate {
        &self.gate
    }

    pub fn hub(&self) -> &Hub {
        &self.hub
    }

    /// Run `f` against the database. The lock is never held across an
    /// await point.
    pub(crate) fn with_db<T>(
        &self,
        f: impl FnOnce(&Database) -> Result<T, StoreError>,
    ) -> Result<T, ServerError> {
        let db = self
            .db
            .lock()
            .map_err(|_| ServerError::Internal("database lock poisoned".into()))?;
        f(&db).map_err(ServerError::from)
    }

    pub(crate) fn level(
        &self,
        identity: &Identity,
        container: Container,
    ) -> Result<PermissionLevel, ServerError> {
        self.with_db(|db| db.permission_for(Some(identity), Some(container)))
    }

    /// Level in an existing room; unknown rooms are `NotFound`.
    fn room_level(&self, identity: &Identity, room: RoomId) -> Result<PermissionLevel, ServerError> {
        self.with_db(|db| {
            db.get_room(room)?;
            db.permission_for(Some(identity), Some(Container::Room(room)))
        })
        .map_err(|e| e.named("room"))
    }

    fn require_view(&self, identity: &Identity, room: RoomId) -> Result<(), ServerError> {
        if self.room_level(identity, room)?.can_view() {
            Ok(())
        } else {
            Err(ServerError::PermissionDenied)
        }
    }

    fn author(&self, user: UserId) -> Result<UserSummary, ServerError> {
        self.with_db(|db| db.get_user(user))
            .map(|u| u.summary())
            .map_err(|e| e.named("user"))
    }

    /// Best-effort `last_seen` update; failures are only logged.
    fn persist_last_seen(&self, user: UserId) {
        if let Err(e) = self.with_db(|db| db.touch_user(user, utc_now())) {
            debug!(user = %user, error = %e, "failed to update last_seen");
        }
    }

    // ------------------------------------------------------------------
    // Session
    // ------------------------------------------------------------------

    /// Resolve a bearer token to the caller it was issued for.
    pub fn authenticate(&self, token: &str) -> Result<Identity, ServerError> {
        self.with_db(|db| db.identity_for_token(token))
            .map_err(|e| match e {
                ServerError::NotFound(_) => ServerError::Unauthorized,
                other => other,
            })
    }

    // ------------------------------------------------------------------
    // Connection lifecycle
    // ------------------------------------------------------------------

    pub async fn connect(&self, identity: Identity) -> (ConnectionId, mpsc::Receiver<ServerEvent>) {
        let (conn, rx) = self.hub.register(identity).await;
        self.presence.touch(identity.user_id, None).await;
        self.persist_last_seen(identity.user_id);
        info!(conn = %conn, user = %identity.user_id, "client connected");
        (conn, rx)
    }

    /// Drop a connection and announce its departure from every room it was
    /// in. Safe to call more than once.
    pub async fn disconnect(&self, conn: ConnectionId) {
        let Some((identity, rooms)) = self.hub.disconnect(conn).await else {
            return;
        };
        info!(conn = %conn, user = %identity.user_id, rooms = rooms.len(), "client disconnected");
        if rooms.is_empty() {
            return;
        }

        let summary = match self.author(identity.user_id) {
            Ok(summary) => summary,
            Err(e) => {
                warn!(user = %identity.user_id, error = %e, "no profile for departing user");
                return;
            }
        };
        for room in rooms {
            self.hub
                .publish(room, ServerEvent::UserLeave(PresencePayload::new(&summary, room)))
                .await;
            self.publish_online_users(room).await;
        }
    }

    /// Dispatch one inbound socket event. Failures go back to the sender
    /// only: `permission_denied` for room-scoped events, `error` otherwise.
    pub async fn handle(&self, conn: ConnectionId, identity: &Identity, event: ClientEvent) {
        let (result, scope) = match event {
            ClientEvent::Join(r) => (self.join(conn, identity, r.room_id).await, Some(r.room_id)),
            ClientEvent::Leave(r) => (self.leave(conn, identity, r.room_id).await, Some(r.room_id)),
            ClientEvent::SendMessage(req) => (self.send_from_socket(conn, identity, req).await, None),
            ClientEvent::ResolveChallenge(req) => {
                (self.resolve_from_socket(conn, identity, req).await, None)
            }
            ClientEvent::GetOnlineUsers(r) => {
                let result = match self.online_users(identity, r.room_id).await {
                    Ok(users) => {
                        let event = ServerEvent::OnlineUsers {
                            room_id: r.room_id,
                            users,
                        };
                        self.hub.send_to(conn, event).await;
                        Ok(())
                    }
                    Err(e) => Err(e),
                };
                (result, Some(r.room_id))
            }
            ClientEvent::GetGlobalOnlineCount => {
                let count = self.global_online_count().await;
                self.hub
                    .send_to(conn, ServerEvent::GlobalOnlineCount { count })
                    .await;
                (Ok(()), None)
            }
            ClientEvent::Heartbeat(h) => (self.heartbeat(identity, h.room_id).await, h.room_id),
        };

        if let Err(err) = result {
            debug!(conn = %conn, error = %err, "event rejected");
            let reply = match (err, scope) {
                (ServerError::PermissionDenied, Some(room_id)) => ServerEvent::PermissionDenied {
                    message: ServerError::PermissionDenied.public_message(),
                    room_id,
                },
                (err, _) => err.to_event(),
            };
            self.hub.send_to(conn, reply).await;
        }
    }

    // ------------------------------------------------------------------
    // Rooms
    // ------------------------------------------------------------------

    /// Rooms the caller may view.
    pub fn list_rooms(&self, identity: &Identity) -> Result<Vec<Room>, ServerError> {
        self.with_db(|db| {
            let mut visible = Vec::new();
            for room in db.list_rooms()? {
                if db
                    .permission_for(Some(identity), Some(Container::Room(room.id)))?
                    .can_view()
                {
                    visible.push(room);
                }
            }
            Ok(visible)
        })
    }

    /// Subscribe `conn` to `room`, mark the room read, and announce the
    /// arrival to the room.
    pub async fn join(
        &self,
        conn: ConnectionId,
        identity: &Identity,
        room: RoomId,
    ) -> Result<(), ServerError> {
        self.require_view(identity, room)?;
        let summary = self.with_db(|db| {
            db.record_room_view(identity.user_id, room, utc_now())?;
            Ok(db.get_user(identity.user_id)?.summary())
        })?;

        self.hub.join(conn, room).await;
        self.presence.touch(identity.user_id, Some(room)).await;
        info!(conn = %conn, user = %identity.user_id, room = %room, "joined room");

        self.hub
            .publish(room, ServerEvent::UserJoin(PresencePayload::new(&summary, room)))
            .await;
        self.publish_online_users(room).await;
        Ok(())
    }

    pub async fn leave(
        &self,
        conn: ConnectionId,
        identity: &Identity,
        room: RoomId,
    ) -> Result<(), ServerError> {
        self.require_view(identity, room)?;
        if !self.hub.leave(conn, room).await {
            return Ok(());
        }
        let summary = self.author(identity.user_id)?;
        info!(conn = %conn, user = %identity.user_id, room = %room, "left room");

        self.hub
            .publish(room, ServerEvent::UserLeave(PresencePayload::new(&summary, room)))
            .await;
        self.publish_online_users(room).await;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Send pipeline
    // ------------------------------------------------------------------

    /// Run a send through validation, permission, sanitization and the send
    /// gate. A request carrying a challenge token redeems that challenge
    /// instead, replaying the payload captured when it was issued.
    pub async fn submit(
        &self,
        identity: &Identity,
        req: SendMessage,
    ) -> Result<SendOutcome, ServerError> {
        let room = validate_send(&req)?;

        if let Some(captcha_id) = req.captcha_id.as_deref().filter(|id| !id.trim().is_empty()) {
            let answer = req.captcha_answer.as_ref().and_then(ChallengeAnswer::as_i64);
            return self.redeem(identity, captcha_id, answer).await;
        }

        if !self.room_level(identity, room)?.can_send() {
            return Err(ServerError::PermissionDenied);
        }

        let content = sanitize(req.message.trim());
        if content.trim().is_empty() {
            return Err(ServerError::validation("message is empty"));
        }

        let pending = PendingSend {
            room_id: room,
            content,
            client_id: req.client_id,
        };
        match self.gate.admit(identity.user_id, pending).await {
            Admission::Accepted(pending) => {
                self.commit(identity, pending).await.map(SendOutcome::Delivered)
            }
            Admission::Challenged {
                captcha_id,
                question,
            } => Ok(SendOutcome::Challenged {
                captcha_id,
                question,
            }),
        }
    }

    /// Redeem a challenge and deliver the send it was holding.
    pub async fn redeem(
        &self,
        identity: &Identity,
        captcha_id: &str,
        answer: Option<i64>,
    ) -> Result<SendOutcome, ServerError> {
        let pending = self
            .gate
            .redeem(identity.user_id, captcha_id, answer)
            .await
            .map_err(|reason| {
                debug!(user = %identity.user_id, %reason, "challenge rejected");
                ServerError::Challenge
            })?;

        // Permissions may have changed while the challenge was open.
        if !self.room_level(identity, pending.room_id)?.can_send() {
            return Err(ServerError::PermissionDenied);
        }
        self.commit(identity, pending).await.map(SendOutcome::Delivered)
    }

    /// Persist an admitted send and fan it out to the room.
    async fn commit(
        &self,
        identity: &Identity,
        pending: PendingSend,
    ) -> Result<MessagePayload, ServerError> {
        let room = pending.room_id;
        let _fanout = self.fanout.lock().await;
        let (posted, author) = self.with_db(|db| {
            let author = db.get_user(identity.user_id)?.summary();
            let posted = db.post_message(identity.user_id, room, &pending.content, utc_now())?;
            Ok((posted, author))
        })?;

        let collapsed = posted.is_collapsed();
        let message = posted.into_message();
        let payload = MessagePayload::new(
            message.id,
            message.content,
            message.timestamp,
            &author,
            pending.client_id,
        );
        let event = if collapsed {
            ServerEvent::MessageUpdated(payload.clone())
        } else {
            ServerEvent::Message(payload.clone())
        };

        let delivered = self.hub.publish(room, event).await;
        debug!(
            user = %identity.user_id,
            room = %room,
            message = %payload.id,
            collapsed,
            delivered,
            "message delivered"
        );

        self.presence.touch(identity.user_id, Some(room)).await;
        Ok(payload)
    }

    async fn send_from_socket(
        &self,
        conn: ConnectionId,
        identity: &Identity,
        req: SendMessage,
    ) -> Result<(), ServerError> {
        let outcome = self.submit(identity, req).await?;
        self.reply_to_sender(conn, outcome).await;
        Ok(())
    }

    async fn resolve_from_socket(
        &self,
        conn: ConnectionId,
        identity: &Identity,
        req: ResolveChallenge,
    ) -> Result<(), ServerError> {
        let outcome = self
            .redeem(identity, &req.captcha_id, req.answer.as_i64())
            .await?;
        self.reply_to_sender(conn, outcome).await;
        Ok(())
    }

    /// Sender-only follow-up: the challenge itself, or the id acknowledgment.
    async fn reply_to_sender(&self, conn: ConnectionId, outcome: SendOutcome) {
        let event = match outcome {
            SendOutcome::Challenged {
                captcha_id,
                question,
            } => ServerEvent::RequireCaptcha {
                captcha_id,
                question,
            },
            SendOutcome::Delivered(MessagePayload {
                id,
                client_id: Some(client_id),
                ..
            }) => ServerEvent::MessageIdResponse {
                client_id,
                server_id: id,
            },
            SendOutcome::Delivered(_) => return,
        };
        self.hub.send_to(conn, event).await;
    }

    // ------------------------------------------------------------------
    // Presence
    // ------------------------------------------------------------------

    /// Refresh the caller's liveness, globally and optionally in a room.
    pub async fn heartbeat(&self, identity: &Identity, room: Option<RoomId>) -> Result<(), ServerError> {
        self.presence.touch(identity.user_id, None).await;
        self.persist_last_seen(identity.user_id);

        let Some(room) = room else {
            return Ok(());
        };
        self.require_view(identity, room)?;
        self.presence.touch(identity.user_id, Some(room)).await;
        self.with_db(|db| db.record_room_view(identity.user_id, room, utc_now()))?;
        self.publish_online_users(room).await;
        Ok(())
    }

    pub async fn online_users(
        &self,
        identity: &Identity,
        room: RoomId,
    ) -> Result<Vec<UserSummary>, ServerError> {
        self.require_view(identity, room)?;
        self.online_summaries(room).await
    }

    pub async fn global_online_count(&self) -> usize {
        self.presence.global_online_count().await
    }

    async fn online_summaries(&self, room: RoomId) -> Result<Vec<UserSummary>, ServerError> {
        let ids = self.presence.online_in_room(room).await;
        self.with_db(|db| db.user_summaries(&ids))
    }

    async fn publish_online_users(&self, room: RoomId) {
        match self.online_summaries(room).await {
            Ok(users) => {
                self.hub
                    .publish(room, ServerEvent::OnlineUsers { room_id: room, users })
                    .await;
            }
            Err(e) => warn!(room = %room, error = %e, "failed to list online users"),
        }
    }

    // ------------------------------------------------------------------
    // History and deletion
    // ------------------------------------------------------------------

    /// A page of `room`'s history with entities decoded for display.
    pub fn history(
        &self,
        identity: &Identity,
        room: RoomId,
        limit: Option<u32>,
        cursor: HistoryCursor,
    ) -> Result<HistoryView, ServerError> {
        self.require_view(identity, room)?;
        let limit = limit
            .unwrap_or(DEFAULT_HISTORY_LIMIT)
            .clamp(1, MAX_HISTORY_LIMIT);
        let page = self.with_db(|db| db.chat_history(room, limit, cursor))?;

        Ok(HistoryView {
            messages: page.messages.into_iter().map(display_payload).collect(),
            page: page.page,
            total_pages: page.total_pages,
        })
    }

    pub fn get_message(&self, identity: &Identity, id: MessageId) -> Result<MessagePayload, ServerError> {
        let authored = self
            .with_db(|db| db.get_authored_message(id))
            .map_err(|e| e.named("message"))?;
        self.require_view(identity, authored.message.room_id)?;
        Ok(display_payload(authored))
    }

    /// Delete a chat message. Admins and `su` holders may delete anything;
    /// `777` holders only their own messages.
    pub async fn delete_message(&self, identity: &Identity, id: MessageId) -> Result<(), ServerError> {
        let message = self
            .with_db(|db| db.get_message(id))
            .map_err(|e| e.named("message"))?;
        let room = message.room_id;
        let level = self.level(identity, Container::Room(room))?;
        if !level.can_delete(message.user_id == identity.user_id) {
            return Err(ServerError::PermissionDenied);
        }

        let _fanout = self.fanout.lock().await;
        if !self.with_db(|db| db.delete_message(id))? {
            return Err(ServerError::NotFound("message"));
        }
        info!(
            target: "audit",
            actor = %identity.user_id,
            author = %message.user_id,
            room = %room,
            message = %id,
            "chat message deleted"
        );

        let delivered = self
            .hub
            .publish(
                room,
                ServerEvent::MessageDeleted {
                    id,
                    room_id: room,
                    deleted_by: identity.user_id,
                    timestamp: utc_now(),
                },
            )
            .await;
        debug!(message = %id, delivered, "deletion broadcast");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Unread tracking
    // ------------------------------------------------------------------

    /// Mark a room or section as read up to now.
    pub fn record_view(&self, identity: &Identity, container: Container) -> Result<(), ServerError> {
        let level = match container {
            Container::Room(room) => self.room_level(identity, room)?,
            Container::Section(section) => self
                .with_db(|db| {
                    db.get_section(section)?;
                    db.permission_for(Some(identity), Some(container))
                })
                .map_err(|e| e.named("section"))?,
        };
        if !level.can_view() {
            return Err(ServerError::PermissionDenied);
        }
        let now = utc_now();
        self.with_db(|db| match container {
            Container::Room(room) => db.record_room_view(identity.user_id, room, now),
            Container::Section(section) => db.record_section_view(identity.user_id, section, now),
        })
    }

    pub fn unread_counts(&self, identity: &Identity) -> Result<UnreadCounts, ServerError> {
        self.with_db(|db| db.unread_counts(identity))
    }
}

/// Structural checks on a send: a positive room id and 1..=2000 characters
/// of trimmed text.
fn validate_send(req: &SendMessage) -> Result<RoomId, ServerError> {
    let room = req
        .room_id
        .filter(|r| r.0 > 0)
        .ok_or_else(|| ServerError::validation("room_id is required"))?;
    let text = req.message.trim();
    if text.is_empty() {
        return Err(ServerError::validation("message is required"));
    }
    if text.chars().count() > MAX_CHAT_MESSAGE_CHARS {
        return Err(ServerError::validation(format!(
            "message exceeds {MAX_CHAT_MESSAGE_CHARS} characters"
        )));
    }
    Ok(room)
}

fn display_payload(authored: AuthoredMessage) -> MessagePayload {
    let AuthoredMessage { message, author } = authored;
    MessagePayload::new(
        message.id,
        decode_entities(&message.content),
        message.timestamp,
        &author,
        None,
    )
}
