//! v001 -- Initial schema creation.
//!
//! Users and sessions, chat rooms and messages, forum sections with threads
//! and replies, the two sparse permission overlays and the two last-view
//! tables.

use rusqlite::Connection;

/// SQL executed when upgrading from version 0 to version 1.
const UP_SQL: &str = r#"
-- ----------------------------------------------------------------
-- Users
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS users (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    username   TEXT NOT NULL UNIQUE,
    nickname   TEXT,
    color      TEXT NOT NULL DEFAULT '#000000',
    badge      TEXT NOT NULL DEFAULT '',
    role       TEXT NOT NULL DEFAULT 'user',   -- 'user' | 'admin'
    last_seen  TEXT,                           -- RFC-3339, microseconds
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS sessions (
    token      TEXT PRIMARY KEY NOT NULL,
    user_id    INTEGER NOT NULL,
    created_at TEXT NOT NULL,

    FOREIGN KEY (user_id) REFERENCES users(id)
);

CREATE INDEX IF NOT EXISTS idx_sessions_user ON sessions(user_id);

-- ----------------------------------------------------------------
-- Chat
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS chat_rooms (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    name        TEXT NOT NULL,
    description TEXT NOT NULL DEFAULT '',
    created_at  TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS chat_messages (
    id        INTEGER PRIMARY KEY AUTOINCREMENT,
    room_id   INTEGER NOT NULL,
    user_id   INTEGER NOT NULL,
    content   TEXT NOT NULL,                   -- sanitized markup
    timestamp TEXT NOT NULL,

    FOREIGN KEY (room_id) REFERENCES chat_rooms(id),
    FOREIGN KEY (user_id) REFERENCES users(id)
);

CREATE INDEX IF NOT EXISTS idx_chat_messages_room_ts
    ON chat_messages(room_id, timestamp);
CREATE INDEX IF NOT EXISTS idx_chat_messages_room_user
    ON chat_messages(room_id, user_id, id DESC);

CREATE TABLE IF NOT EXISTS chat_permissions (
    user_id INTEGER NOT NULL,
    room_id INTEGER NOT NULL,
    level   TEXT NOT NULL,                     -- 'su' | '777' | '444'

    PRIMARY KEY (user_id, room_id),
    FOREIGN KEY (user_id) REFERENCES users(id),
    FOREIGN KEY (room_id) REFERENCES chat_rooms(id)
);

CREATE TABLE IF NOT EXISTS chat_last_views (
    user_id   INTEGER NOT NULL,
    room_id   INTEGER NOT NULL,
    last_view TEXT NOT NULL,

    PRIMARY KEY (user_id, room_id),
    FOREIGN KEY (user_id) REFERENCES users(id),
    FOREIGN KEY (room_id) REFERENCES chat_rooms(id)
);

-- ----------------------------------------------------------------
-- Forum
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS forum_sections (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    name        TEXT NOT NULL,
    description TEXT NOT NULL DEFAULT '',
    created_at  TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS forum_threads (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    section_id INTEGER NOT NULL,
    user_id    INTEGER NOT NULL,
    title      TEXT NOT NULL,
    content    TEXT NOT NULL,
    timestamp  TEXT NOT NULL,

    FOREIGN KEY (section_id) REFERENCES forum_sections(id),
    FOREIGN KEY (user_id) REFERENCES users(id)
);

CREATE INDEX IF NOT EXISTS idx_forum_threads_section_ts
    ON forum_threads(section_id, timestamp);

CREATE TABLE IF NOT EXISTS forum_replies (
    id        INTEGER PRIMARY KEY AUTOINCREMENT,
    thread_id INTEGER NOT NULL,
    user_id   INTEGER NOT NULL,
    content   TEXT NOT NULL,
    timestamp TEXT NOT NULL,

    -- No cascade: replies are removed explicitly in the same transaction.
    FOREIGN KEY (thread_id) REFERENCES forum_threads(id),
    FOREIGN KEY (user_id) REFERENCES users(id)
);

CREATE INDEX IF NOT EXISTS idx_forum_replies_thread_ts
    ON forum_replies(thread_id, timestamp);

CREATE TABLE IF NOT EXISTS forum_permissions (
    user_id    INTEGER NOT NULL,
    section_id INTEGER NOT NULL,
    level      TEXT NOT NULL,

    PRIMARY KEY (user_id, section_id),
    FOREIGN KEY (user_id) REFERENCES users(id),
    FOREIGN KEY (section_id) REFERENCES forum_sections(id)
);

CREATE TABLE IF NOT EXISTS forum_last_views (
    user_id    INTEGER NOT NULL,
    section_id INTEGER NOT NULL,
    last_view  TEXT NOT NULL,

    PRIMARY KEY (user_id, section_id),
    FOREIGN KEY (user_id) REFERENCES users(id),
    FOREIGN KEY (section_id) REFERENCES forum_sections(id)
);
"#;

/// Apply the initial migration.
pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
