//! Chat message persistence, including the repeat-collapse merge.

use agora_shared::types::{MessageId, RoomId, UserId};
use agora_shared::UserSummary;
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};

use crate::database::{parse_sql_ts, to_sql_ts, Database};
use crate::error::{Result, StoreError};
use crate::models::{AuthoredMessage, HistoryCursor, HistoryPage, Message, PostedMessage};

const AUTHORED_SELECT: &str = "SELECT m.id, m.room_id, m.user_id, m.content, m.timestamp,
            u.username, u.nickname, u.color, u.badge
     FROM chat_messages m JOIN users u ON u.id = m.user_id";

impl Database {
    /// Store a chat message, or fold it into the author's previous message in
    /// the same room when the texts match.
    ///
    /// When the author's latest message in `room` reads `content` (optionally
    /// followed by `*N`), that row is rewritten to `content*N+1` (`*2` for the
    /// first repeat) and keeps its id and timestamp. Otherwise a new row is
    /// inserted with timestamp `now`. Read and write happen in one
    /// transaction.
    pub fn post_message(
        &self,
        user: UserId,
        room: RoomId,
        content: &str,
        now: DateTime<Utc>,
    ) -> Result<PostedMessage> {
        let tx = self.conn().unchecked_transaction()?;

        let previous = tx
            .query_row(
                "SELECT id, room_id, user_id, content, timestamp FROM chat_messages
                 WHERE user_id = ?1 AND room_id = ?2
                 ORDER BY id DESC LIMIT 1",
                params![user.0, room.0],
                row_to_message,
            )
            .optional()?;

        if let Some(mut previous) = previous {
            let (base, count) = split_repeat_suffix(&previous.content);
            if !previous.content.is_empty() && base == content {
                let next = count.and_then(|n| n.checked_add(1)).unwrap_or(2);
                previous.content = format!("{content}*{next}");
                tx.execute(
                    "UPDATE chat_messages SET content = ?1 WHERE id = ?2",
                    params![previous.content, previous.id.0],
                )?;
                tx.commit()?;
                return Ok(PostedMessage::Collapsed(previous));
            }
        }

        tx.execute(
            "INSERT INTO chat_messages (room_id, user_id, content, timestamp)
             VALUES (?1, ?2, ?3, ?4)",
            params![room.0, user.0, content, to_sql_ts(&now)],
        )?;
        let id = MessageId(tx.last_insert_rowid());
        tx.commit()?;

        Ok(PostedMessage::Created(Message {
            id,
            room_id: room,
            user_id: user,
            content: content.to_string(),
            timestamp: now,
        }))
    }

    pub fn get_message(&self, id: MessageId) -> Result<Message> {
        self.conn()
            .query_row(
                "SELECT id, room_id, user_id, content, timestamp FROM chat_messages WHERE id = ?1",
                params![id.0],
                row_to_message,
            )
            .map_err(StoreError::from_query)
    }

    pub fn get_authored_message(&self, id: MessageId) -> Result<AuthoredMessage> {
        self.conn()
            .query_row(
                &format!("{AUTHORED_SELECT} WHERE m.id = ?1"),
                params![id.0],
                row_to_authored,
            )
            .map_err(StoreError::from_query)
    }

    /// A slice of `room`'s history in ascending time order.
    ///
    /// `limit` is clamped to `1..=max_limit` by the caller. For page reads
    /// the page index is clamped into `0..total_pages`, and an empty room
    /// still reports one page.
    pub fn chat_history(&self, room: RoomId, limit: u32, cursor: HistoryCursor) -> Result<HistoryPage> {
        let limit = limit.max(1);
        let total = self.count_room_messages_after(room, None)?;

        let (offset, page, total_pages) = match cursor {
            HistoryCursor::Offset(offset) => (u64::from(offset), None, None),
            HistoryCursor::Page(_) | HistoryCursor::LastPage => {
                let pages = if total == 0 {
                    1
                } else {
                    total.div_ceil(u64::from(limit))
                };
                let pages = u32::try_from(pages).unwrap_or(u32::MAX);
                let page = match cursor {
                    HistoryCursor::Page(p) => p.min(pages - 1),
                    _ => pages - 1,
                };
                (u64::from(page) * u64::from(limit), Some(page), Some(pages))
            }
        };

        let mut stmt = self.conn().prepare(&format!(
            "{AUTHORED_SELECT} WHERE m.room_id = ?1
             ORDER BY m.timestamp ASC, m.id ASC
             LIMIT ?2 OFFSET ?3"
        ))?;
        let rows = stmt.query_map(
            params![room.0, limit, i64::try_from(offset).unwrap_or(i64::MAX)],
            row_to_authored,
        )?;

        let mut messages = Vec::new();
        for row in rows {
            messages.push(row?);
        }

        Ok(HistoryPage {
            messages,
            total,
            page,
            total_pages,
        })
    }

    /// Delete a message by id. Returns `true` if a row was deleted.
    pub fn delete_message(&self, id: MessageId) -> Result<bool> {
        let affected = self
            .conn()
            .execute("DELETE FROM chat_messages WHERE id = ?1", params![id.0])?;
        Ok(affected > 0)
    }
}

/// Split a trailing `*<digits>` repeat counter off `content`.
///
/// `"hi*3"` yields `("hi", Some(3))`; `"hi"` yields `("hi", None)`. A counter
/// too large for `u64` is kept as a suffix match with no count.
fn split_repeat_suffix(content: &str) -> (&str, Option<u64>) {
    let digits = content
        .bytes()
        .rev()
        .take_while(|b| b.is_ascii_digit())
        .count();
    let Some(star) = content.len().checked_sub(digits + 1) else {
        return (content, None);
    };
    if digits == 0 || content.as_bytes()[star] != b'*' {
        return (content, None);
    }
    (&content[..star], content[star + 1..].parse().ok())
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<Message> {
    let ts: String = row.get(4)?;
    Ok(Message {
        id: MessageId(row.get(0)?),
        room_id: RoomId(row.get(1)?),
        user_id: UserId(row.get(2)?),
        content: row.get(3)?,
        timestamp: parse_sql_ts(4, &ts)?,
    })
}

fn row_to_authored(row: &rusqlite::Row<'_>) -> rusqlite::Result<AuthoredMessage> {
    let message = row_to_message(row)?;
    let username: String = row.get(5)?;
    let nickname: Option<String> = row.get(6)?;
    let nickname = nickname
        .filter(|n| !n.trim().is_empty())
        .unwrap_or_else(|| username.clone());

    Ok(AuthoredMessage {
        author: UserSummary {
            id: message.user_id,
            username,
            nickname,
            color: row.get(7)?,
            badge: row.get(8)?,
        },
        message,
    })
}

#[cfg(test)]
mod tests {
    use agora_shared::utc_now;
    use chrono::Duration;

    use super::*;
    use crate::models::NewUser;

    fn setup() -> (Database, UserId, RoomId) {
        let db = Database::open_in_memory().unwrap();
        db.seed_defaults().unwrap();
        let user = db.create_user(&NewUser::named("alice")).unwrap();
        let room = db.list_rooms().unwrap()[0].id;
        (db, user.id, room)
    }

    #[test]
    fn suffix_split() {
        assert_eq!(split_repeat_suffix("hi*3"), ("hi", Some(3)));
        assert_eq!(split_repeat_suffix("hi"), ("hi", None));
        assert_eq!(split_repeat_suffix("2*"), ("2*", None));
        assert_eq!(split_repeat_suffix("12"), ("12", None));
        assert_eq!(split_repeat_suffix("*7"), ("", Some(7)));
    }

    #[test]
    fn repeats_collapse_into_one_row() {
        let (db, alice, room) = setup();
        let first = db.post_message(alice, room, "hi", utc_now()).unwrap();
        assert!(!first.is_collapsed());

        let second = db.post_message(alice, room, "hi", utc_now()).unwrap();
        let third = db.post_message(alice, room, "hi", utc_now()).unwrap();
        assert!(second.is_collapsed() && third.is_collapsed());
        assert_eq!(third.message().id, first.message().id);
        assert_eq!(third.message().content, "hi*3");
        assert_eq!(third.message().timestamp, first.message().timestamp);

        let history = db.chat_history(room, 50, HistoryCursor::Offset(0)).unwrap();
        assert_eq!(history.total, 1);
        assert_eq!(history.messages[0].message.content, "hi*3");
    }

    #[test]
    fn different_text_or_author_does_not_collapse() {
        let (db, alice, room) = setup();
        let bob = db.create_user(&NewUser::named("bob")).unwrap().id;

        db.post_message(alice, room, "hi", utc_now()).unwrap();
        assert!(!db.post_message(alice, room, "hello", utc_now()).unwrap().is_collapsed());
        assert!(!db.post_message(bob, room, "hello", utc_now()).unwrap().is_collapsed());
        // Latest message by alice is "hello", so "hi" is new again.
        assert!(!db.post_message(alice, room, "hi", utc_now()).unwrap().is_collapsed());
        assert_eq!(db.count_room_messages_after(room, None).unwrap(), 4);
    }

    #[test]
    fn paging_clamps_and_resolves_last() {
        let (db, alice, room) = setup();
        let start = utc_now();
        for i in 0..5 {
            db.post_message(alice, room, &format!("m{i}"), start + Duration::milliseconds(i))
                .unwrap();
        }

        let last = db.chat_history(room, 2, HistoryCursor::LastPage).unwrap();
        assert_eq!(last.page, Some(2));
        assert_eq!(last.total_pages, Some(3));
        assert_eq!(last.messages.len(), 1);
        assert_eq!(last.messages[0].message.content, "m4");

        let clamped = db.chat_history(room, 2, HistoryCursor::Page(99)).unwrap();
        assert_eq!(clamped.page, Some(2));

        let first = db.chat_history(room, 2, HistoryCursor::Page(0)).unwrap();
        let texts: Vec<_> = first.messages.iter().map(|m| m.message.content.as_str()).collect();
        assert_eq!(texts, vec!["m0", "m1"]);

        let offset = db.chat_history(room, 2, HistoryCursor::Offset(3)).unwrap();
        assert_eq!(offset.page, None);
        assert_eq!(offset.messages[0].message.content, "m3");
    }

    #[test]
    fn empty_room_has_one_page() {
        let (db, _, room) = setup();
        let page = db.chat_history(room, 50, HistoryCursor::LastPage).unwrap();
        assert_eq!(page.page, Some(0));
        assert_eq!(page.total_pages, Some(1));
        assert!(page.messages.is_empty());
    }

    #[test]
    fn authored_message_and_delete() {
        let (db, alice, room) = setup();
        let posted = db.post_message(alice, room, "bye", utc_now()).unwrap().into_message();
        let authored = db.get_authored_message(posted.id).unwrap();
        assert_eq!(authored.author.username, "alice");
        assert_eq!(authored.author.nickname, "alice");

        assert!(db.delete_message(posted.id).unwrap());
        assert!(!db.delete_message(posted.id).unwrap());
        assert!(matches!(db.get_message(posted.id), Err(StoreError::NotFound)));
    }

    #[test]
    fn failed_insert_leaves_nothing_behind() {
        let (db, alice, room) = setup();
        db.conn()
            .execute_batch(
                "CREATE TRIGGER refuse_insert BEFORE INSERT ON chat_messages
                 BEGIN SELECT RAISE(ABORT, 'disk full'); END;",
            )
            .unwrap();
        assert!(db.post_message(alice, room, "lost", utc_now()).is_err());
        assert_eq!(db.count_room_messages_after(room, None).unwrap(), 0);
    }
}
