//! WebSocket wire protocol.
//!
//! Every frame is a JSON text message of the form
//! `{"event": "<name>", "data": {...}}`. Inbound frames are parsed with
//! [`ClientEvent::parse`]; outbound frames are [`ServerEvent`] values.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{MessageId, ReplyId, RoomId, SectionId, ThreadId, UserId, UserSummary};

// ---------------------------------------------------------------------------
// Inbound
// ---------------------------------------------------------------------------

/// Events a client may send over its socket.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    Join(RoomRef),
    Leave(RoomRef),
    SendMessage(SendMessage),
    ResolveChallenge(ResolveChallenge),
    GetOnlineUsers(RoomRef),
    GetGlobalOnlineCount,
    Heartbeat(Heartbeat),
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RoomRef {
    #[serde(alias = "room")]
    pub room_id: RoomId,
}

/// A chat send. Fields are optional on the wire so that missing values
/// surface as validation errors rather than parse failures.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct SendMessage {
    #[serde(default)]
    pub room_id: Option<RoomId>,
    #[serde(default)]
    pub message: String,
    /// Client-generated correlation id echoed back on acknowledgment.
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub captcha_id: Option<String>,
    #[serde(default)]
    pub captcha_answer: Option<ChallengeAnswer>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ResolveChallenge {
    #[serde(alias = "challenge_id")]
    pub captcha_id: String,
    pub answer: ChallengeAnswer,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Heartbeat {
    #[serde(default)]
    pub room_id: Option<RoomId>,
}

/// A challenge answer as typed by the user: a JSON number or a string.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ChallengeAnswer {
    Number(i64),
    Text(String),
}

impl ChallengeAnswer {
    /// The numeric value, or `None` when the answer is not an integer.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            ChallengeAnswer::Number(n) => Some(*n),
            ChallengeAnswer::Text(s) => s.trim().parse().ok(),
        }
    }
}

#[derive(Deserialize)]
struct RawFrame {
    event: String,
    #[serde(default)]
    data: serde_json::Value,
}

impl ClientEvent {
    /// Parse one inbound text frame.
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        let frame: RawFrame = serde_json::from_str(text)?;
        let data = if frame.data.is_null() {
            serde_json::Value::Object(Default::default())
        } else {
            frame.data
        };

        Ok(match frame.event.as_str() {
            "join" => ClientEvent::Join(serde_json::from_value(data)?),
            "leave" => ClientEvent::Leave(serde_json::from_value(data)?),
            "send_message" => ClientEvent::SendMessage(serde_json::from_value(data)?),
            "resolve_challenge" => ClientEvent::ResolveChallenge(serde_json::from_value(data)?),
            "get_online_users" => ClientEvent::GetOnlineUsers(serde_json::from_value(data)?),
            "get_global_online_count" => ClientEvent::GetGlobalOnlineCount,
            "heartbeat" | "heartbeat_chat" => ClientEvent::Heartbeat(serde_json::from_value(data)?),
            other => {
                return Err(serde::de::Error::unknown_variant(
                    other,
                    &[
                        "join",
                        "leave",
                        "send_message",
                        "resolve_challenge",
                        "get_online_users",
                        "get_global_online_count",
                        "heartbeat",
                    ],
                ))
            }
        })
    }
}

// ---------------------------------------------------------------------------
// Outbound
// ---------------------------------------------------------------------------

/// Events the server delivers to one connection or fans out to a room.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ServerEvent {
    Message(MessagePayload),
    MessageUpdated(MessagePayload),
    /// Sender-only acknowledgment mapping the client's id to the stored id.
    MessageIdResponse {
        client_id: String,
        server_id: MessageId,
    },
    /// Sender-only.
    RequireCaptcha {
        captcha_id: String,
        question: String,
    },
    /// Sender-only.
    Error {
        message: String,
    },
    /// Sender-only.
    PermissionDenied {
        message: String,
        room_id: RoomId,
    },
    UserJoin(PresencePayload),
    UserLeave(PresencePayload),
    MessageDeleted {
        id: MessageId,
        room_id: RoomId,
        deleted_by: UserId,
        timestamp: DateTime<Utc>,
    },
    ThreadDeleted {
        id: ThreadId,
        section_id: SectionId,
        deleted_by: UserId,
        timestamp: DateTime<Utc>,
    },
    ReplyDeleted {
        id: ReplyId,
        thread_id: ThreadId,
        section_id: SectionId,
        deleted_by: UserId,
        timestamp: DateTime<Utc>,
    },
    OnlineUsers {
        room_id: RoomId,
        users: Vec<UserSummary>,
    },
    GlobalOnlineCount {
        count: usize,
    },
}

impl ServerEvent {
    pub fn error(message: impl Into<String>) -> Self {
        ServerEvent::Error {
            message: message.into(),
        }
    }

    /// Wire name, used for logging.
    pub fn name(&self) -> &'static str {
        match self {
            ServerEvent::Message(_) => "message",
            ServerEvent::MessageUpdated(_) => "message_updated",
            ServerEvent::MessageIdResponse { .. } => "message_id_response",
            ServerEvent::RequireCaptcha { .. } => "require_captcha",
            ServerEvent::Error { .. } => "error",
            ServerEvent::PermissionDenied { .. } => "permission_denied",
            ServerEvent::UserJoin(_) => "user_join",
            ServerEvent::UserLeave(_) => "user_leave",
            ServerEvent::MessageDeleted { .. } => "message_deleted",
            ServerEvent::ThreadDeleted { .. } => "thread_deleted",
            ServerEvent::ReplyDeleted { .. } => "reply_deleted",
            ServerEvent::OnlineUsers { .. } => "online_users",
            ServerEvent::GlobalOnlineCount { .. } => "global_online_count",
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// A chat message as broadcast to room subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessagePayload {
    pub id: MessageId,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub user_id: UserId,
    pub username: String,
    pub nickname: String,
    pub color: String,
    pub badge: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
}

impl MessagePayload {
    pub fn new(
        id: MessageId,
        content: String,
        timestamp: DateTime<Utc>,
        author: &UserSummary,
        client_id: Option<String>,
    ) -> Self {
        Self {
            id,
            content,
            timestamp,
            user_id: author.id,
            username: author.username.clone(),
            nickname: author.nickname.clone(),
            color: author.color.clone(),
            badge: author.badge.clone(),
            client_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresencePayload {
    pub user_id: UserId,
    pub username: String,
    pub nickname: String,
    pub room_id: RoomId,
}

impl PresencePayload {
    pub fn new(user: &UserSummary, room_id: RoomId) -> Self {
        Self {
            user_id: user.id,
            username: user.username.clone(),
            nickname: user.nickname.clone(),
            room_id,
        }
    }
}
