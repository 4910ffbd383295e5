//! Sparse permission overlays for rooms and sections.
//!
//! A row exists only for `su`, `777` and `444`; writing `Null` deletes the
//! row. Reads go through [`PermissionLevel::resolve_for`], so admins never
//! touch these tables.

use agora_shared::types::UserId;
use agora_shared::{Container, Identity, PermissionLevel};
use rusqlite::{params, OptionalExtension};

use crate::database::Database;
use crate::error::{Result, StoreError};

impl Database {
    /// Effective level of `identity` on `container`.
    pub fn permission_for(
        &self,
        identity: Option<&Identity>,
        container: Option<Container>,
    ) -> Result<PermissionLevel> {
        PermissionLevel::resolve_for(identity, container, |who, container| {
            self.permission_row(who.user_id, container)
        })
    }

    /// The stored overlay row, if any. A malformed stored token is an error.
    pub fn permission_row(
        &self,
        user: UserId,
        container: Container,
    ) -> Result<Option<PermissionLevel>> {
        let (sql, id) = match container {
            Container::Room(room) => (
                "SELECT level FROM chat_permissions WHERE user_id = ?1 AND room_id = ?2",
                room.0,
            ),
            Container::Section(section) => (
                "SELECT level FROM forum_permissions WHERE user_id = ?1 AND section_id = ?2",
                section.0,
            ),
        };

        let token: Option<String> = self
            .conn()
            .prepare_cached(sql)?
            .query_row(params![user.0, id], |row| row.get(0))
            .optional()?;

        token
            .map(|t| PermissionLevel::parse(&t).map_err(StoreError::from))
            .transpose()
    }

    /// Write an overlay row from a submitted token.
    ///
    /// The token goes through the single [`PermissionLevel::parse`]; anything
    /// unrecognised is rejected. `Null` removes the row. Admins are refused
    /// because their level is implicit.
    pub fn set_permission(&self, user: UserId, container: Container, token: &str) -> Result<()> {
        let level = PermissionLevel::parse(token)?;

        let target = self.get_user(user)?;
        if target.role == agora_shared::Role::Admin {
            return Err(StoreError::AdminOverlay(user.0));
        }

        match container {
            Container::Room(room) => {
                self.get_room(room)?;
            }
            Container::Section(section) => {
                self.get_section(section)?;
            }
        }

        let (delete_sql, upsert_sql, id) = match container {
            Container::Room(room) => (
                "DELETE FROM chat_permissions WHERE user_id = ?1 AND room_id = ?2",
                "INSERT INTO chat_permissions (user_id, room_id, level) VALUES (?1, ?2, ?3)
                 ON CONFLICT(user_id, room_id) DO UPDATE SET level = excluded.level",
                room.0,
            ),
            Container::Section(section) => (
                "DELETE FROM forum_permissions WHERE user_id = ?1 AND section_id = ?2",
                "INSERT INTO forum_permissions (user_id, section_id, level) VALUES (?1, ?2, ?3)
                 ON CONFLICT(user_id, section_id) DO UPDATE SET level = excluded.level",
                section.0,
            ),
        };

        if level == PermissionLevel::None {
            self.conn().execute(delete_sql, params![user.0, id])?;
        } else {
            self.conn()
                .execute(upsert_sql, params![user.0, id, level.as_token()])?;
        }

        tracing::info!(
            target: "audit",
            user = %user,
            container = %container,
            level = %level,
            "permission changed"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use agora_shared::constants::RESERVED_ADMIN_ID;
    use agora_shared::types::{RoomId, SectionId};
    use agora_shared::Role;

    use super::*;
    use crate::models::NewUser;

    fn setup() -> (Database, Identity, RoomId, SectionId) {
        let db = Database::open_in_memory().unwrap();
        db.seed_defaults().unwrap();
        let user = db.create_user(&NewUser::named("alice")).unwrap();
        let room = db.list_rooms().unwrap()[0].id;
        let section = db.list_sections().unwrap()[0].id;
        (db, Identity::new(user.id, Role::User), room, section)
    }

    #[test]
    fn absent_row_is_none() {
        let (db, alice, room, _) = setup();
        let level = db.permission_for(Some(&alice), Some(Container::Room(room))).unwrap();
        assert_eq!(level, PermissionLevel::None);
    }

    #[test]
    fn set_and_clear() {
        let (db, alice, room, section) = setup();
        db.set_permission(alice.user_id, Container::Room(room), "777").unwrap();
        db.set_permission(alice.user_id, Container::Section(section), "444").unwrap();
        assert_eq!(
            db.permission_for(Some(&alice), Some(Container::Room(room))).unwrap(),
            PermissionLevel::ReadWrite
        );
        assert_eq!(
            db.permission_for(Some(&alice), Some(Container::Section(section))).unwrap(),
            PermissionLevel::ReadOnly
        );

        db.set_permission(alice.user_id, Container::Room(room), "su").unwrap();
        assert_eq!(
            db.permission_row(alice.user_id, Container::Room(room)).unwrap(),
            Some(PermissionLevel::Su)
        );

        db.set_permission(alice.user_id, Container::Room(room), "Null").unwrap();
        assert_eq!(db.permission_row(alice.user_id, Container::Room(room)).unwrap(), None);
    }

    #[test]
    fn invalid_token_rejected_at_write() {
        let (db, alice, room, _) = setup();
        let err = db
            .set_permission(alice.user_id, Container::Room(room), "755")
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidPermission(_)));
        assert_eq!(db.permission_row(alice.user_id, Container::Room(room)).unwrap(), None);
    }

    #[test]
    fn admin_is_su_and_overlay_refused() {
        let (db, _, room, _) = setup();
        let admin = Identity::new(UserId(RESERVED_ADMIN_ID), Role::Admin);
        assert_eq!(
            db.permission_for(Some(&admin), Some(Container::Room(room))).unwrap(),
            PermissionLevel::Su
        );
        assert!(matches!(
            db.set_permission(admin.user_id, Container::Room(room), "444"),
            Err(StoreError::AdminOverlay(1))
        ));
    }

    #[test]
    fn malformed_stored_token_is_an_error() {
        let (db, alice, room, _) = setup();
        db.conn()
            .execute(
                "INSERT INTO chat_permissions (user_id, room_id, level) VALUES (?1, ?2, 'rwx')",
                params![alice.user_id.0, room.0],
            )
            .unwrap();
        assert!(db.permission_for(Some(&alice), Some(Container::Room(room))).is_err());
    }

    #[test]
    fn missing_inputs_resolve_to_none() {
        let (db, alice, room, _) = setup();
        assert_eq!(
            db.permission_for(None, Some(Container::Room(room))).unwrap(),
            PermissionLevel::None
        );
        assert_eq!(db.permission_for(Some(&alice), None).unwrap(), PermissionLevel::None);
    }
}
