//! v001 -- Initial schema creation.
//!
//! `kv` holds the session credentials, `conversation_cache` holds one JSON
//! encoded message list per `(self_id, peer_id)`.

use rusqlite::Connection;

const UP_SQL: &str = r#"
-- ----------------------------------------------------------------
-- Key/value settings (username, private key)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS kv (
    key        TEXT PRIMARY KEY NOT NULL,
    value      TEXT NOT NULL,
    updated_at TEXT NOT NULL                  -- RFC-3339
);

-- ----------------------------------------------------------------
-- Decrypted conversation cache
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS conversation_cache (
    self_id    TEXT NOT NULL,                 -- UUID
    peer_id    TEXT NOT NULL,                 -- UUID
    messages   TEXT NOT NULL,                 -- JSON array of resolved messages
    updated_at TEXT NOT NULL,                 -- RFC-3339

    PRIMARY KEY (self_id, peer_id)
);

CREATE INDEX IF NOT EXISTS idx_conversation_cache_updated
    ON conversation_cache(updated_at);
"#;

pub fn up(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(UP_SQL)
}
