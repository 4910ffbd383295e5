//! Forum threads and replies.

use agora_shared::types::{ReplyId, SectionId, ThreadId, UserId};
use chrono::{DateTime, Utc};
use rusqlite::params;

use crate::database::{parse_sql_ts, to_sql_ts, Database};
use crate::error::{Result, StoreError};
use crate::models::{Reply, Thread};

impl Database {
    // ------------------------------------------------------------------
    // Threads
    // ------------------------------------------------------------------

    pub fn create_thread(
        &self,
        user: UserId,
        section: SectionId,
        title: &str,
        content: &str,
        now: DateTime<Utc>,
    ) -> Result<Thread> {
        self.conn().execute(
            "INSERT INTO forum_threads (section_id, user_id, title, content, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![section.0, user.0, title, content, to_sql_ts(&now)],
        )?;
        Ok(Thread {
            id: ThreadId(self.conn().last_insert_rowid()),
            section_id: section,
            user_id: user,
            title: title.to_string(),
            content: content.to_string(),
            timestamp: now,
        })
    }

    pub fn get_thread(&self, id: ThreadId) -> Result<Thread> {
        self.conn()
            .query_row(
                "SELECT id, section_id, user_id, title, content, timestamp
                 FROM forum_threads WHERE id = ?1",
                params![id.0],
                row_to_thread,
            )
            .map_err(StoreError::from_query)
    }

    /// Threads of a section, newest first.
    pub fn list_threads(&self, section: SectionId) -> Result<Vec<Thread>> {
        let mut stmt = self.conn().prepare(
            "SELECT id, section_id, user_id, title, content, timestamp
             FROM forum_threads WHERE section_id = ?1
             ORDER BY timestamp DESC, id DESC",
        )?;
        let rows = stmt.query_map(params![section.0], row_to_thread)?;

        let mut threads = Vec::new();
        for row in rows {
            threads.push(row?);
        }
        Ok(threads)
    }

    /// Delete a thread together with all of its replies.
    ///
    /// Both deletes run in one transaction: if removing any reply fails the
    /// thread is left untouched. Returns the number of replies removed.
    pub fn delete_thread(&self, id: ThreadId) -> Result<usize> {
        let tx = self.conn().unchecked_transaction()?;

        let replies = tx.execute("DELETE FROM forum_replies WHERE thread_id = ?1", params![id.0])?;
        let threads = tx.execute("DELETE FROM forum_threads WHERE id = ?1", params![id.0])?;
        if threads == 0 {
            return Err(StoreError::NotFound);
        }

        tx.commit()?;
        Ok(replies)
    }

    // ------------------------------------------------------------------
    // Replies
    // ------------------------------------------------------------------

    pub fn create_reply(
        &self,
        user: UserId,
        thread: ThreadId,
        content: &str,
        now: DateTime<Utc>,
    ) -> Result<Reply> {
        self.conn().execute(
            "INSERT INTO forum_replies (thread_id, user_id, content, timestamp)
             VALUES (?1, ?2, ?3, ?4)",
            params![thread.0, user.0, content, to_sql_ts(&now)],
        )?;
        Ok(Reply {
            id: ReplyId(self.conn().last_insert_rowid()),
            thread_id: thread,
            user_id: user,
            content: content.to_string(),
            timestamp: now,
        })
    }

    pub fn get_reply(&self, id: ReplyId) -> Result<Reply> {
        self.conn()
            .query_row(
                "SELECT id, thread_id, user_id, content, timestamp
                 FROM forum_replies WHERE id = ?1",
                params![id.0],
                row_to_reply,
            )
            .map_err(StoreError::from_query)
    }

    /// Replies to a thread, oldest first.
    pub fn list_replies(&self, thread: ThreadId) -> Result<Vec<Reply>> {
        let mut stmt = self.conn().prepare(
            "SELECT id, thread_id, user_id, content, timestamp
             FROM forum_replies WHERE thread_id = ?1
             ORDER BY timestamp ASC, id ASC",
        )?;
        let rows = stmt.query_map(params![thread.0], row_to_reply)?;

        let mut replies = Vec::new();
        for row in rows {
            replies.push(row?);
        }
        Ok(replies)
    }

    pub fn delete_reply(&self, id: ReplyId) -> Result<bool> {
        let affected = self
            .conn()
            .execute("DELETE FROM forum_replies WHERE id = ?1", params![id.0])?;
        Ok(affected > 0)
    }
}

fn row_to_thread(row: &rusqlite::Row<'_>) -> rusqlite::Result<Thread> {
    let ts: String = row.get(5)?;
    Ok(Thread {
        id: ThreadId(row.get(0)?),
        section_id: SectionId(row.get(1)?),
        user_id: UserId(row.get(2)?),
        title: row.get(3)?,
        content: row.get(4)?,
        timestamp: parse_sql_ts(5, &ts)?,
    })
}

fn row_to_reply(row: &rusqlite::Row<'_>) -> rusqlite::Result<Reply> {
    let ts: String = row.get(4)?;
    Ok(Reply {
        id: ReplyId(row.get(0)?),
        thread_id: ThreadId(row.get(1)?),
        user_id: UserId(row.get(2)?),
        content: row.get(3)?,
        timestamp: parse_sql_ts(4, &ts)?,
    })
}

#[cfg(test)]
mod tests {
    use agora_shared::utc_now;
    use chrono::Duration;

    use super::*;
    use crate::models::NewUser;

    fn setup() -> (Database, UserId, SectionId) {
        let db = Database::open_in_memory().unwrap();
        db.seed_defaults().unwrap();
        let user = db.create_user(&NewUser::named("alice")).unwrap();
        let section = db.list_sections().unwrap()[0].id;
        (db, user.id, section)
    }

    #[test]
    fn threads_list_newest_first_and_replies_oldest_first() {
        let (db, alice, section) = setup();
        let t0 = utc_now();
        let older = db.create_thread(alice, section, "old", "a", t0).unwrap();
        let newer = db
            .create_thread(alice, section, "new", "b", t0 + Duration::seconds(1))
            .unwrap();
        let ids: Vec<_> = db.list_threads(section).unwrap().iter().map(|t| t.id).collect();
        assert_eq!(ids, vec![newer.id, older.id]);

        let r1 = db.create_reply(alice, older.id, "first", t0).unwrap();
        let r2 = db
            .create_reply(alice, older.id, "second", t0 + Duration::seconds(2))
            .unwrap();
        let ids: Vec<_> = db.list_replies(older.id).unwrap().iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![r1.id, r2.id]);
        assert_eq!(db.get_reply(r2.id).unwrap().content, "second");
    }

    #[test]
    fn delete_thread_cascades_replies() {
        let (db, alice, section) = setup();
        let thread = db.create_thread(alice, section, "t", "body", utc_now()).unwrap();
        let reply = db.create_reply(alice, thread.id, "r", utc_now()).unwrap();

        assert_eq!(db.delete_thread(thread.id).unwrap(), 1);
        assert!(matches!(db.get_thread(thread.id), Err(StoreError::NotFound)));
        assert!(matches!(db.get_reply(reply.id), Err(StoreError::NotFound)));
        assert!(matches!(db.delete_thread(thread.id), Err(StoreError::NotFound)));
    }

    #[test]
    fn failed_reply_delete_keeps_thread() {
        let (db, alice, section) = setup();
        let thread = db.create_thread(alice, section, "t", "body", utc_now()).unwrap();
        db.create_reply(alice, thread.id, "ok", utc_now()).unwrap();
        let stuck = db.create_reply(alice, thread.id, "stuck", utc_now()).unwrap();

        db.conn()
            .execute_batch(&format!(
                "CREATE TRIGGER pin_reply BEFORE DELETE ON forum_replies
                 WHEN OLD.id = {}
                 BEGIN SELECT RAISE(ABORT, 'pinned'); END;",
                stuck.id
            ))
            .unwrap();

        assert!(db.delete_thread(thread.id).is_err());
        assert!(db.get_thread(thread.id).is_ok());
        assert_eq!(db.list_replies(thread.id).unwrap().len(), 2);
    }

    #[test]
    fn delete_single_reply() {
        let (db, alice, section) = setup();
        let thread = db.create_thread(alice, section, "t", "body", utc_now()).unwrap();
        let reply = db.create_reply(alice, thread.id, "r", utc_now()).unwrap();
        assert!(db.delete_reply(reply.id).unwrap());
        assert!(!db.delete_reply(reply.id).unwrap());
        assert!(db.get_thread(thread.id).is_ok());
    }
}
