//! Last-view records and unread counts.
//!
//! A view is an upserted `(user, container) -> instant`. Unread counts are
//! entities with a timestamp strictly after that instant; a container the
//! user has never opened counts everything as unread.

use agora_shared::types::{RoomId, SectionId, UserId};
use agora_shared::{Container, Identity};
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};

use crate::database::{parse_sql_ts, to_sql_ts, Database};
use crate::error::Result;
use crate::models::UnreadCounts;

impl Database {
    pub fn record_room_view(&self, user: UserId, room: RoomId, at: DateTime<Utc>) -> Result<()> {
        self.conn().execute(
            "INSERT INTO chat_last_views (user_id, room_id, last_view) VALUES (?1, ?2, ?3)
             ON CONFLICT(user_id, room_id) DO UPDATE SET last_view = excluded.last_view",
            params![user.0, room.0, to_sql_ts(&at)],
        )?;
        Ok(())
    }

    pub fn record_section_view(
        &self,
        user: UserId,
        section: SectionId,
        at: DateTime<Utc>,
    ) -> Result<()> {
        self.conn().execute(
            "INSERT INTO forum_last_views (user_id, section_id, last_view) VALUES (?1, ?2, ?3)
             ON CONFLICT(user_id, section_id) DO UPDATE SET last_view = excluded.last_view",
            params![user.0, section.0, to_sql_ts(&at)],
        )?;
        Ok(())
    }

    pub fn last_view(&self, user: UserId, container: Container) -> Result<Option<DateTime<Utc>>> {
        let (sql, id) = match container {
            Container::Room(room) => (
                "SELECT last_view FROM chat_last_views WHERE user_id = ?1 AND room_id = ?2",
                room.0,
            ),
            Container::Section(section) => (
                "SELECT last_view FROM forum_last_views WHERE user_id = ?1 AND section_id = ?2",
                section.0,
            ),
        };
        let raw: Option<String> = self
            .conn()
            .prepare_cached(sql)?
            .query_row(params![user.0, id], |row| row.get(0))
            .optional()?;
        Ok(raw.map(|s| parse_sql_ts(0, &s)).transpose()?)
    }

    /// Messages in `room` newer than `after`, or all of them for `None`.
    pub fn count_room_messages_after(
        &self,
        room: RoomId,
        after: Option<DateTime<Utc>>,
    ) -> Result<u64> {
        let count: i64 = match after {
            Some(ts) => self.conn().query_row(
                "SELECT COUNT(*) FROM chat_messages WHERE room_id = ?1 AND timestamp > ?2",
                params![room.0, to_sql_ts(&ts)],
                |r| r.get(0),
            )?,
            None => self.conn().query_row(
                "SELECT COUNT(*) FROM chat_messages WHERE room_id = ?1",
                params![room.0],
                |r| r.get(0),
            )?,
        };
        Ok(count.max(0) as u64)
    }

    /// Threads plus replies in `section` newer than `after`, or all of them
    /// for `None`. Replies are attributed to a section through their thread.
    pub fn count_section_posts_after(
        &self,
        section: SectionId,
        after: Option<DateTime<Utc>>,
    ) -> Result<u64> {
        // An empty-string bound makes every stored timestamp qualify.
        let bound = after.map(|ts| to_sql_ts(&ts)).unwrap_or_default();

        let threads: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM forum_threads WHERE section_id = ?1 AND timestamp > ?2",
            params![section.0, bound],
            |r| r.get(0),
        )?;
        let replies: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM forum_replies r
             JOIN forum_threads t ON t.id = r.thread_id
             WHERE t.section_id = ?1 AND r.timestamp > ?2",
            params![section.0, bound],
            |r| r.get(0),
        )?;
        Ok((threads + replies).max(0) as u64)
    }

    /// Unread totals across every room and section `identity` can view.
    pub fn unread_counts(&self, identity: &Identity) -> Result<UnreadCounts> {
        let mut counts = UnreadCounts::default();

        for room in self.list_rooms()? {
            let container = Container::Room(room.id);
            if !self.permission_for(Some(identity), Some(container))?.can_view() {
                continue;
            }
            let since = self.last_view(identity.user_id, container)?;
            counts
                .chat
                .insert(room.id, self.count_room_messages_after(room.id, since)?);
        }

        for section in self.list_sections()? {
            let container = Container::Section(section.id);
            if !self.permission_for(Some(identity), Some(container))?.can_view() {
                continue;
            }
            let since = self.last_view(identity.user_id, container)?;
            counts
                .forum
                .insert(section.id, self.count_section_posts_after(section.id, since)?);
        }

        Ok(counts)
    }
}
