use chrono::Utc;
use murmur_shared::models::ResolvedMessage;
use murmur_shared::types::{ConversationKey, UserId};
use rusqlite::{params, OptionalExtension};

use crate::database::Database;
use crate::error::{Result, StoreError};

impl Database {
    pub fn load_conversation(&self, key: &ConversationKey) -> Result<Option<Vec<ResolvedMessage>>> {
        let json: Option<String> = self
            .conn()
            .query_row(
                "SELECT messages FROM conversation_cache WHERE self_id = ?1 AND peer_id = ?2",
                params![key.self_id.to_string(), key.peer_id.to_string()],
                |row| row.get(0),
            )
            .optional()?;

        match json {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    pub fn save_conversation(&self, key: &ConversationKey, messages: &[ResolvedMessage]) -> Result<()> {
        let json = serde_json::to_string(messages)?;
        self.conn().execute(
            "INSERT OR REPLACE INTO conversation_cache (self_id, peer_id, messages, updated_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                key.self_id.to_string(),
                key.peer_id.to_string(),
                json,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn remove_conversation(&self, key: &ConversationKey) -> Result<bool> {
        let affected = self.conn().execute(
            "DELETE FROM conversation_cache WHERE self_id = ?1 AND peer_id = ?2",
            params![key.self_id.to_string(), key.peer_id.to_string()],
        )?;
        Ok(affected > 0)
    }

    pub fn clear_conversations(&self) -> Result<usize> {
        let affected = self.conn().execute("DELETE FROM conversation_cache", [])?;
        Ok(affected)
    }

    /// Cached conversation keys, least recently written first
    pub fn conversation_keys(&self) -> Result<Vec<ConversationKey>> {
        let mut stmt = self.conn().prepare(
            "SELECT self_id, peer_id FROM conversation_cache ORDER BY updated_at ASC, rowid ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;

        let mut keys = Vec::new();
        for row in rows {
            let (self_id, peer_id) = row.map_err(StoreError::Sqlite)?;
            keys.push(ConversationKey::new(
                UserId::parse(&self_id)?,
                UserId::parse(&peer_id)?,
            ));
        }
        Ok(keys)
    }
}
