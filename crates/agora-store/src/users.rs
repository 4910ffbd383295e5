//! CRUD operations for [`User`] records and login sessions.

use agora_shared::types::UserId;
use agora_shared::{utc_now, Identity, Role, UserSummary};
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use uuid::Uuid;

use crate::database::{conversion_failure, parse_sql_ts, to_sql_ts, Database};
use crate::error::{Result, StoreError};
use crate::models::{NewUser, User};

const USER_COLUMNS: &str = "id, username, nickname, color, badge, role, last_seen, created_at";

impl Database {
    // ------------------------------------------------------------------
    // Create
    // ------------------------------------------------------------------

    pub fn create_user(&self, new: &NewUser) -> Result<User> {
        let now = utc_now();
        self.conn().execute(
            "INSERT INTO users (username, nickname, color, badge, role, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                new.username,
                new.nickname,
                new.color.as_deref().unwrap_or("#000000"),
                new.badge.as_deref().unwrap_or(""),
                new.role.as_str(),
                to_sql_ts(&now),
            ],
        )?;
        self.get_user(UserId(self.conn().last_insert_rowid()))
    }

    // ------------------------------------------------------------------
    // Read
    // ------------------------------------------------------------------

    pub fn get_user(&self, id: UserId) -> Result<User> {
        self.conn()
            .query_row(
                &format!("SELECT {USER_COLUMNS} FROM users WHERE id = ?1"),
                params![id.0],
                row_to_user,
            )
            .map_err(StoreError::from_query)
    }

    pub fn find_user_by_username(&self, username: &str) -> Result<Option<User>> {
        Ok(self
            .conn()
            .query_row(
                &format!("SELECT {USER_COLUMNS} FROM users WHERE username = ?1"),
                params![username],
                row_to_user,
            )
            .optional()?)
    }

    /// Public projections for a set of ids, ordered by id. Unknown ids are
    /// skipped.
    pub fn user_summaries(&self, ids: &[UserId]) -> Result<Vec<UserSummary>> {
        let mut stmt = self
            .conn()
            .prepare_cached(&format!("SELECT {USER_COLUMNS} FROM users WHERE id = ?1"))?;

        let mut sorted = ids.to_vec();
        sorted.sort();
        sorted.dedup();

        let mut out = Vec::with_capacity(sorted.len());
        for id in sorted {
            if let Some(user) = stmt.query_row(params![id.0], row_to_user).optional()? {
                out.push(user.summary());
            }
        }
        Ok(out)
    }

    // ------------------------------------------------------------------
    // Update
    // ------------------------------------------------------------------

    /// Persist the global last-activity instant.
    pub fn touch_user(&self, id: UserId, at: DateTime<Utc>) -> Result<()> {
        let affected = self.conn().execute(
            "UPDATE users SET last_seen = ?1 WHERE id = ?2",
            params![to_sql_ts(&at), id.0],
        )?;
        if affected == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Delete
    // ------------------------------------------------------------------

    /// Delete a user and everything they own in one transaction: their
    /// messages, their threads (with every reply to them), their replies,
    /// permission rows, last-view rows and sessions.
    ///
    /// The reserved administrator is refused with
    /// [`StoreError::ProtectedUser`].
    pub fn delete_user_cascade(&self, id: UserId) -> Result<()> {
        if id.is_reserved() {
            return Err(StoreError::ProtectedUser(id.0));
        }

        let tx = self.conn().unchecked_transaction()?;

        let exists: Option<i64> = tx
            .query_row("SELECT id FROM users WHERE id = ?1", params![id.0], |r| r.get(0))
            .optional()?;
        if exists.is_none() {
            return Err(StoreError::NotFound);
        }

        tx.execute("DELETE FROM chat_messages WHERE user_id = ?1", params![id.0])?;
        tx.execute(
            "DELETE FROM forum_replies
             WHERE user_id = ?1
                OR thread_id IN (SELECT id FROM forum_threads WHERE user_id = ?1)",
            params![id.0],
        )?;
        tx.execute("DELETE FROM forum_threads WHERE user_id = ?1", params![id.0])?;
        tx.execute("DELETE FROM chat_permissions WHERE user_id = ?1", params![id.0])?;
        tx.execute("DELETE FROM forum_permissions WHERE user_id = ?1", params![id.0])?;
        tx.execute("DELETE FROM chat_last_views WHERE user_id = ?1", params![id.0])?;
        tx.execute("DELETE FROM forum_last_views WHERE user_id = ?1", params![id.0])?;
        tx.execute("DELETE FROM sessions WHERE user_id = ?1", params![id.0])?;
        tx.execute("DELETE FROM users WHERE id = ?1", params![id.0])?;

        tx.commit()?;
        tracing::info!(target: "audit", user = %id, "user deleted with cascade");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Sessions
    // ------------------------------------------------------------------

    /// Issue a new opaque session token for `user`.
    pub fn create_session(&self, user: UserId) -> Result<String> {
        let token = Uuid::new_v4().simple().to_string();
        self.conn().execute(
            "INSERT INTO sessions (token, user_id, created_at) VALUES (?1, ?2, ?3)",
            params![token, user.0, to_sql_ts(&utc_now())],
        )?;
        Ok(token)
    }

    /// Resolve a session token to the caller's identity.
    pub fn identity_for_token(&self, token: &str) -> Result<Identity> {
        self.conn()
            .query_row(
                "SELECT u.id, u.role FROM sessions s JOIN users u ON u.id = s.user_id
                 WHERE s.token = ?1",
                params![token],
                |row| {
                    let id: i64 = row.get(0)?;
                    let role: String = row.get(1)?;
                    let role = role.parse::<Role>().map_err(|e| conversion_failure(1, e))?;
                    Ok(Identity::new(UserId(id), role))
                },
            )
            .map_err(StoreError::from_query)
    }

    pub fn delete_session(&self, token: &str) -> Result<bool> {
        let affected = self
            .conn()
            .execute("DELETE FROM sessions WHERE token = ?1", params![token])?;
        Ok(affected > 0)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Map a `rusqlite::Row` selected with `USER_COLUMNS` to a [`User`].
fn row_to_user(row: &rusqlite::Row<'_>) -> rusqlite::Result<User> {
    let role: String = row.get(5)?;
    let last_seen: Option<String> = row.get(6)?;
    let created: String = row.get(7)?;

    Ok(User {
        id: UserId(row.get(0)?),
        username: row.get(1)?,
        nickname: row.get(2)?,
        color: row.get(3)?,
        badge: row.get(4)?,
        role: role.parse().map_err(|e| conversion_failure(5, e))?,
        last_seen: last_seen.map(|s| parse_sql_ts(6, &s)).transpose()?,
        created_at: parse_sql_ts(7, &created)?,
    })
}

#[cfg(test)]
mod tests {
    use agora_shared::constants::RESERVED_ADMIN_ID;

    use super::*;
    use crate::models::NewUser;

    fn db() -> Database {
        let db = Database::open_in_memory().unwrap();
        db.seed_defaults().unwrap();
        db
    }

    #[test]
    fn create_and_fetch() {
        let db = db();
        let alice = db
            .create_user(&NewUser {
                nickname: Some("Ally".into()),
                ..NewUser::named("alice")
            })
            .unwrap();
        assert_eq!(alice.role, Role::User);
        assert_eq!(alice.summary().nickname, "Ally");

        let found = db.find_user_by_username("alice").unwrap().unwrap();
        assert_eq!(found.id, alice.id);
        assert!(db.find_user_by_username("nobody").unwrap().is_none());
    }

    #[test]
    fn nickname_falls_back_to_username() {
        let db = db();
        let bob = db.create_user(&NewUser::named("bob")).unwrap();
        assert_eq!(bob.summary().nickname, "bob");
    }

    #[test]
    fn sessions_resolve_to_identity() {
        let db = db();
        let token = db.create_session(UserId(RESERVED_ADMIN_ID)).unwrap();
        let identity = db.identity_for_token(&token).unwrap();
        assert!(identity.is_admin());
        assert!(matches!(db.identity_for_token("bogus"), Err(StoreError::NotFound)));
        assert!(db.delete_session(&token).unwrap());
    }

    #[test]
    fn reserved_admin_cannot_be_deleted() {
        let db = db();
        let err = db.delete_user_cascade(UserId(RESERVED_ADMIN_ID)).unwrap_err();
        assert!(matches!(err, StoreError::ProtectedUser(1)));
        assert!(db.get_user(UserId(RESERVED_ADMIN_ID)).is_ok());
    }

    #[test]
    fn delete_cascades_owned_rows() {
        let db = db();
        let room = db.list_rooms().unwrap()[0].id;
        let section = db.list_sections().unwrap()[0].id;
        let carol = db.create_user(&NewUser::named("carol")).unwrap();
        let dave = db.create_user(&NewUser::named("dave")).unwrap();

        db.post_message(carol.id, room, "hello", utc_now()).unwrap();
        let thread = db.create_thread(carol.id, section, "t", "body", utc_now()).unwrap();
        db.create_reply(dave.id, thread.id, "reply to carol", utc_now()).unwrap();
        db.create_session(carol.id).unwrap();
        db.record_room_view(carol.id, room, utc_now()).unwrap();

        db.delete_user_cascade(carol.id).unwrap();

        assert!(matches!(db.get_user(carol.id), Err(StoreError::NotFound)));
        assert!(matches!(db.get_thread(thread.id), Err(StoreError::NotFound)));
        assert_eq!(db.count_room_messages_after(room, None).unwrap(), 0);
        assert!(db.get_user(dave.id).is_ok());
    }

    #[test]
    fn touch_updates_last_seen() {
        let db = db();
        let now = utc_now();
        db.touch_user(UserId(RESERVED_ADMIN_ID), now).unwrap();
        assert_eq!(db.get_user(UserId(RESERVED_ADMIN_ID)).unwrap().last_seen, Some(now));
        assert!(matches!(db.touch_user(UserId(999), now), Err(StoreError::NotFound)));
    }
}
