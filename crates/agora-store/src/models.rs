//! Domain model structs persisted in the SQLite database.
//!
//! Every struct derives `Serialize` and `Deserialize` so the HTTP layer can
//! hand it straight to `axum::Json`.

use std::collections::BTreeMap;

use agora_shared::types::{MessageId, ReplyId, RoomId, SectionId, ThreadId, UserId};
use agora_shared::{Role, UserSummary};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// User
// ---------------------------------------------------------------------------

/// A registered account.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct User {
    pub id: UserId,
    pub username: String,
    pub nickname: Option<String>,
    /// CSS colour used for the display name.
    pub color: String,
    pub badge: String,
    pub role: Role,
    /// Global last-activity instant, refreshed by heartbeats.
    pub last_seen: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl User {
    /// Nickname, falling back to the username when unset or blank.
    pub fn display_name(&self) -> &str {
        match self.nickname.as_deref() {
            Some(nick) if !nick.trim().is_empty() => nick,
            _ => &self.username,
        }
    }

    pub fn summary(&self) -> UserSummary {
        UserSummary {
            id: self.id,
            username: self.username.clone(),
            nickname: self.display_name().to_string(),
            color: self.color.clone(),
            badge: self.badge.clone(),
        }
    }
}

/// Fields supplied when creating a user.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewUser {
    pub username: String,
    pub nickname: Option<String>,
    pub color: Option<String>,
    pub badge: Option<String>,
    pub role: Role,
}

impl NewUser {
    pub fn named(username: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            ..Self::default()
        }
    }
}

// ---------------------------------------------------------------------------
// Containers
// ---------------------------------------------------------------------------

/// A chat room.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Room {
    pub id: RoomId,
    pub name: String,
    pub description: String,
    pub created_at: DateTime<Utc>,
}

/// A forum section.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Section {
    pub id: SectionId,
    pub name: String,
    pub description: String,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Chat messages
// ---------------------------------------------------------------------------

/// A single chat message. `content` is the sanitized, escaped form.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    pub id: MessageId,
    pub room_id: RoomId,
    pub user_id: UserId,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

/// A message joined with its author's public projection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthoredMessage {
    pub message: Message,
    pub author: UserSummary,
}

/// Outcome of [`Database::post_message`](crate::Database::post_message).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PostedMessage {
    /// A new row was inserted.
    Created(Message),
    /// The author's previous message was rewritten with a repeat counter.
    Collapsed(Message),
}

impl PostedMessage {
    pub fn message(&self) -> &Message {
        match self {
            PostedMessage::Created(m) | PostedMessage::Collapsed(m) => m,
        }
    }

    pub fn into_message(self) -> Message {
        match self {
            PostedMessage::Created(m) | PostedMessage::Collapsed(m) => m,
        }
    }

    pub fn is_collapsed(&self) -> bool {
        matches!(self, PostedMessage::Collapsed(_))
    }
}

/// Where a history read starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistoryCursor {
    /// Skip this many messages from the oldest.
    Offset(u32),
    /// 0-based page of `limit` messages; out-of-range pages are clamped.
    Page(u32),
    /// The final page.
    LastPage,
}

/// One slice of a room's history, oldest first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryPage {
    pub messages: Vec<AuthoredMessage>,
    pub total: u64,
    /// Set when the read was by page.
    pub page: Option<u32>,
    pub total_pages: Option<u32>,
}

// ---------------------------------------------------------------------------
// Forum
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Thread {
    pub id: ThreadId,
    pub section_id: SectionId,
    pub user_id: UserId,
    pub title: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Reply {
    pub id: ReplyId,
    pub thread_id: ThreadId,
    pub user_id: UserId,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Unread
// ---------------------------------------------------------------------------

/// Unread totals for every container the user can view.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct UnreadCounts {
    pub chat: BTreeMap<RoomId, u64>,
    pub forum: BTreeMap<SectionId, u64>,
}
