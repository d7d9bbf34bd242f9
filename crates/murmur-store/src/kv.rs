use chrono::Utc;
use rusqlite::{params, OptionalExtension};

use crate::database::Database;
use crate::error::Result;

pub const KEY_USERNAME: &str = "username";
pub const KEY_PRIVATE_KEY: &str = "private_key";

impl Database {
    pub fn kv_get(&self, key: &str) -> Result<Option<String>> {
        let value = self
            .conn()
            .query_row("SELECT value FROM kv WHERE key = ?1", params![key], |row| {
                row.get(0)
            })
            .optional()?;
        Ok(value)
    }

    pub fn kv_set(&self, key: &str, value: &str) -> Result<()> {
        self.conn().execute(
            "INSERT INTO kv (key, value, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            params![key, value, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn kv_delete(&self, key: &str) -> Result<bool> {
        let affected = self
            .conn()
            .execute("DELETE FROM kv WHERE key = ?1", params![key])?;
        Ok(affected > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open() -> (tempfile::TempDir, Database) {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open_at(&dir.path().join("kv.db")).unwrap();
        (dir, db)
    }

    #[test]
    fn test_kv_set_overwrites() {
        let (_dir, db) = open();
        assert_eq!(db.kv_get(KEY_USERNAME).unwrap(), None);

        db.kv_set(KEY_USERNAME, "ana").unwrap();
        db.kv_set(KEY_USERNAME, "bea").unwrap();
        assert_eq!(db.kv_get(KEY_USERNAME).unwrap().as_deref(), Some("bea"));
    }

    #[test]
    fn test_kv_delete() {
        let (_dir, db) = open();
        db.kv_set(KEY_PRIVATE_KEY, "secret").unwrap();
        assert!(db.kv_delete(KEY_PRIVATE_KEY).unwrap());
        assert!(!db.kv_delete(KEY_PRIVATE_KEY).unwrap());
        assert_eq!(db.kv_get(KEY_PRIVATE_KEY).unwrap(), None);
    }
}
