//! CRUD operations for the two container kinds: chat [`Room`]s and forum
//! [`Section`]s.

use agora_shared::types::{RoomId, SectionId};
use agora_shared::utc_now;
use rusqlite::params;

use crate::database::{parse_sql_ts, to_sql_ts, Database};
use crate::error::{Result, StoreError};
use crate::models::{Room, Section};

impl Database {
    // ------------------------------------------------------------------
    // Rooms
    // ------------------------------------------------------------------

    pub fn create_room(&self, name: &str, description: &str) -> Result<Room> {
        self.conn().execute(
            "INSERT INTO chat_rooms (name, description, created_at) VALUES (?1, ?2, ?3)",
            params![name, description, to_sql_ts(&utc_now())],
        )?;
        self.get_room(RoomId(self.conn().last_insert_rowid()))
    }

    pub fn get_room(&self, id: RoomId) -> Result<Room> {
        self.conn()
            .query_row(
                "SELECT id, name, description, created_at FROM chat_rooms WHERE id = ?1",
                params![id.0],
                row_to_room,
            )
            .map_err(StoreError::from_query)
    }

    /// All rooms, ordered by id.
    pub fn list_rooms(&self) -> Result<Vec<Room>> {
        let mut stmt = self
            .conn()
            .prepare("SELECT id, name, description, created_at FROM chat_rooms ORDER BY id ASC")?;
        let rows = stmt.query_map([], row_to_room)?;

        let mut rooms = Vec::new();
        for row in rows {
            rooms.push(row?);
        }
        Ok(rooms)
    }

    // ------------------------------------------------------------------
    // Sections
    // ------------------------------------------------------------------

    pub fn create_section(&self, name: &str, description: &str) -> Result<Section> {
        self.conn().execute(
            "INSERT INTO forum_sections (name, description, created_at) VALUES (?1, ?2, ?3)",
            params![name, description, to_sql_ts(&utc_now())],
        )?;
        self.get_section(SectionId(self.conn().last_insert_rowid()))
    }

    pub fn get_section(&self, id: SectionId) -> Result<Section> {
        self.conn()
            .query_row(
                "SELECT id, name, description, created_at FROM forum_sections WHERE id = ?1",
                params![id.0],
                row_to_section,
            )
            .map_err(StoreError::from_query)
    }

    /// All sections, ordered by id.
    pub fn list_sections(&self) -> Result<Vec<Section>> {
        let mut stmt = self.conn().prepare(
            "SELECT id, name, description, created_at FROM forum_sections ORDER BY id ASC",
        )?;
        let rows = stmt.query_map([], row_to_section)?;

        let mut sections = Vec::new();
        for row in rows {
            sections.push(row?);
        }
        Ok(sections)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn row_to_room(row: &rusqlite::Row<'_>) -> rusqlite::Result<Room> {
    let created: String = row.get(3)?;
    Ok(Room {
        id: RoomId(row.get(0)?),
        name: row.get(1)?,
        description: row.get(2)?,
        created_at: parse_sql_ts(3, &created)?,
    })
}

fn row_to_section(row: &rusqlite::Row<'_>) -> rusqlite::Result<Section> {
    let created: String = row.get(3)?;
    Ok(Section {
        id: SectionId(row.get(0)?),
        name: row.get(1)?,
        description: row.get(2)?,
        created_at: parse_sql_ts(3, &created)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rooms_and_sections() {
        let db = Database::open_in_memory().unwrap();
        let lobby = db.create_room("Lobby", "say hi").unwrap();
        let dev = db.create_room("Dev", "").unwrap();
        assert_eq!(db.get_room(lobby.id).unwrap().name, "Lobby");
        let ids: Vec<_> = db.list_rooms().unwrap().into_iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![lobby.id, dev.id]);

        let news = db.create_section("News", "announcements").unwrap();
        assert_eq!(db.get_section(news.id).unwrap().description, "announcements");
        assert!(matches!(db.get_room(RoomId(404)), Err(StoreError::NotFound)));
        assert!(matches!(db.get_section(SectionId(404)), Err(StoreError::NotFound)));
    }
}
