//! v001 -- Initial schema creation.
//!
//! Creates `characters` and `messages`.

use rusqlite::Connection;

const UP_SQL: &str = r#"
-- ----------------------------------------------------------------
-- Characters
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS characters (
    id          TEXT PRIMARY KEY NOT NULL,
    owner_id    TEXT NOT NULL,
    name        TEXT NOT NULL,
    persona     TEXT NOT NULL,
    greeting    TEXT NOT NULL DEFAULT '',
    avatar_url  TEXT NOT NULL DEFAULT '',
    age         INTEGER NOT NULL DEFAULT 0,
    gender      TEXT NOT NULL DEFAULT '',
    tags        TEXT NOT NULL DEFAULT '[]',   -- JSON array of strings
    visibility  TEXT NOT NULL DEFAULT 'public',
    banned      INTEGER NOT NULL DEFAULT 0,   -- boolean 0/1
    verified    INTEGER NOT NULL DEFAULT 0,
    premium     INTEGER NOT NULL DEFAULT 0,
    created_at  TEXT NOT NULL,                -- RFC-3339, nanosecond precision
    updated_at  TEXT NOT NULL,
    likes       INTEGER NOT NULL DEFAULT 0,
    views       INTEGER NOT NULL DEFAULT 0,
    chats       INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_characters_listed
    ON characters(banned, visibility);

-- ----------------------------------------------------------------
-- Messages
--
-- One row per message.  The two visibility flags model the owner copy
-- (chats/<user>/<character>) and the counterpart copy
-- (chats/<character>/<user>).  A row with both flags cleared is deleted.
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS messages (
    id                  TEXT PRIMARY KEY NOT NULL,  -- UUID v7
    user_id             TEXT NOT NULL,
    character_id        TEXT NOT NULL,
    text                TEXT NOT NULL,
    sender              TEXT NOT NULL,              -- 'user' | 'persona'
    timestamp           TEXT NOT NULL,
    status              TEXT NOT NULL DEFAULT 'sent',
    reactions           TEXT NOT NULL DEFAULT '[]',
    owner_visible       INTEGER NOT NULL DEFAULT 1,
    counterpart_visible INTEGER NOT NULL DEFAULT 1
);

CREATE INDEX IF NOT EXISTS idx_messages_conversation_ts
    ON messages(user_id, character_id, timestamp);
"#;

/// Apply the initial migration.
pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
