//! # murmur-store
//!
//! Process-local durable storage for the Murmur client: session credentials
//! and the decrypted conversation cache, backed by SQLite.
//!
//! The engine sees storage only through the [`LocalStorage`] port.
//! [`Database`] implements it on top of `rusqlite`, [`MemoryStorage`] keeps
//! everything in memory.

pub mod cache;
pub mod conversations;
pub mod database;
pub mod kv;
pub mod migrations;
pub mod storage;

mod error;

pub use cache::{CacheLimits, ConversationCache};
pub use database::Database;
pub use error::{Result, StoreError};
pub use storage::{LocalStorage, MemoryStorage};
