//! Database connection management.
//!
//! The [`Database`] struct owns a [`rusqlite::Connection`] and guarantees that
//! migrations are run before any other operation.

use std::path::{Path, PathBuf};

use agora_shared::constants::RESERVED_ADMIN_ID;
use agora_shared::utc_now;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection};

use crate::error::Result;
use crate::migrations;

/// Wrapper around a [`rusqlite::Connection`].
pub struct Database {
    conn: Connection,
}

impl Database {
    /// Open (or create) a database at an explicit path, creating the parent
    /// directory if needed.
    pub fn open_at(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        tracing::info!(path = %path.display(), "opening database");

        let conn = Connection::open(path)?;

        // Recommended SQLite settings.
        conn.pragma_update(None, "journal_mode", "WAL")?;
        Self::prepare(conn)
    }

    /// Open a private in-memory database. Used by tests.
    pub fn open_in_memory() -> Result<Self> {
        Self::prepare(Connection::open_in_memory()?)
    }

    fn prepare(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;

        // Run schema migrations.
        migrations::run_migrations(&conn)?;

        Ok(Self { conn })
    }

    /// Return a reference to the underlying `rusqlite::Connection`.
    ///
    /// Callers should prefer the typed CRUD helpers, but direct access is
    /// occasionally needed for transactions or ad-hoc queries.
    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Return the filesystem path of the open database (if any).
    pub fn path(&self) -> Option<PathBuf> {
        self.conn.path().map(PathBuf::from)
    }

    /// Create the reserved administrator (id 1), a default room and a
    /// default section if they do not exist yet. Safe to call on every start.
    pub fn seed_defaults(&self) -> Result<()> {
        let now = to_sql_ts(&utc_now());
        let tx = self.conn().unchecked_transaction()?;

        let admin_created = tx.execute(
            "INSERT OR IGNORE INTO users (id, username, nickname, color, badge, role, created_at)
             VALUES (?1, 'admin', 'admin', '#ff0000', 'ADMIN', 'admin', ?2)",
            params![RESERVED_ADMIN_ID, now],
        )?;

        let rooms: i64 = tx.query_row("SELECT COUNT(*) FROM chat_rooms", [], |r| r.get(0))?;
        if rooms == 0 {
            tx.execute(
                "INSERT INTO chat_rooms (name, description, created_at)
                 VALUES ('General', 'Default chat room', ?1)",
                params![now],
            )?;
        }

        let sections: i64 = tx.query_row("SELECT COUNT(*) FROM forum_sections", [], |r| r.get(0))?;
        if sections == 0 {
            tx.execute(
                "INSERT INTO forum_sections (name, description, created_at)
                 VALUES ('General', 'Default forum section', ?1)",
                params![now],
            )?;
        }

        tx.commit()?;

        tracing::info!(
            admin_created = admin_created > 0,
            room_created = rooms == 0,
            section_created = sections == 0,
            "seeded defaults"
        );
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Timestamp helpers
// ---------------------------------------------------------------------------

/// Fixed-width RFC 3339 with microseconds, so lexical order is time order.
pub(crate) fn to_sql_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse a stored timestamp in column `idx`.
pub(crate) fn parse_sql_ts(idx: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
        })
}

/// Wrap a non-sqlite parse failure for column `idx`.
pub(crate) fn conversion_failure<E>(idx: usize, e: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
}
