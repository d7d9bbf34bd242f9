//! The SQLite file behind the [`crate::LocalStorage`] implementation.

use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use rusqlite::Connection;

use crate::error::{Result, StoreError};
use crate::migrations;

const FILE_NAME: &str = "murmur.db";

/// An open, migrated connection.
pub struct Database {
    conn: Connection,
}

/// `<platform data dir>/murmur.db`, creating the directory if needed.
fn default_path() -> Result<PathBuf> {
    let dirs = ProjectDirs::from("com", "murmur", "murmur").ok_or(StoreError::NoDataDir)?;
    let dir = dirs.data_dir();
    std::fs::create_dir_all(dir)?;
    Ok(dir.join(FILE_NAME))
}

impl Database {
    pub fn new() -> Result<Self> {
        let path = default_path()?;
        tracing::info!(path = %path.display(), "using local store");
        Self::open_at(&path)
    }

    pub fn open_at(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        migrations::run_migrations(&conn)?;
        Ok(Self { conn })
    }

    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    /// `None` for in-memory connections
    pub fn path(&self) -> Option<PathBuf> {
        self.conn.path().map(PathBuf::from)
    }
}
