//! Process-local durable storage port.
//!
//! The engine only ever talks to [`LocalStorage`]. [`Database`] is the
//! on-disk implementation; [`MemoryStorage`] backs tests and the demo.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use murmur_shared::models::ResolvedMessage;
use murmur_shared::types::ConversationKey;

use crate::database::Database;
use crate::error::Result;
use crate::kv::{KEY_PRIVATE_KEY, KEY_USERNAME};

pub trait LocalStorage: Send {
    fn username(&self) -> Result<Option<String>>;
    fn set_username(&self, username: &str) -> Result<()>;

    /// Base64 private key, `None` when not logged in
    fn private_key(&self) -> Result<Option<String>>;
    fn set_private_key(&self, private_key_b64: &str) -> Result<()>;

    /// Forget username and private key
    fn clear_credentials(&self) -> Result<()>;

    fn load_conversation(&self, key: &ConversationKey) -> Result<Option<Vec<ResolvedMessage>>>;
    fn save_conversation(&self, key: &ConversationKey, messages: &[ResolvedMessage]) -> Result<()>;
    fn remove_conversation(&self, key: &ConversationKey) -> Result<()>;
    fn clear_conversations(&self) -> Result<()>;

    /// Stored conversation keys, least recently written first
    fn conversation_keys(&self) -> Result<Vec<ConversationKey>>;
}

impl LocalStorage for Database {
    fn username(&self) -> Result<Option<String>> {
        self.kv_get(KEY_USERNAME)
    }

    fn set_username(&self, username: &str) -> Result<()> {
        self.kv_set(KEY_USERNAME, username)
    }

    fn private_key(&self) -> Result<Option<String>> {
        self.kv_get(KEY_PRIVATE_KEY)
    }

    fn set_private_key(&self, private_key_b64: &str) -> Result<()> {
        self.kv_set(KEY_PRIVATE_KEY, private_key_b64)
    }

    fn clear_credentials(&self) -> Result<()> {
        self.kv_delete(KEY_USERNAME)?;
        self.kv_delete(KEY_PRIVATE_KEY)?;
        Ok(())
    }

    fn load_conversation(&self, key: &ConversationKey) -> Result<Option<Vec<ResolvedMessage>>> {
        Database::load_conversation(self, key)
    }

    fn save_conversation(&self, key: &ConversationKey, messages: &[ResolvedMessage]) -> Result<()> {
        Database::save_conversation(self, key, messages)
    }

    fn remove_conversation(&self, key: &ConversationKey) -> Result<()> {
        Database::remove_conversation(self, key).map(|_| ())
    }

    fn clear_conversations(&self) -> Result<()> {
        let removed = Database::clear_conversations(self)?;
        tracing::debug!(removed, "cleared conversation cache");
        Ok(())
    }

    fn conversation_keys(&self) -> Result<Vec<ConversationKey>> {
        Database::conversation_keys(self)
    }
}

// ---------------------------------------------------------------------------
// In-memory implementation
// ---------------------------------------------------------------------------

#[derive(Default)]
struct MemoryInner {
    username: Option<String>,
    private_key: Option<String>,
    conversations: HashMap<ConversationKey, (u64, Vec<ResolvedMessage>)>,
    writes: u64,
}

/// Volatile [`LocalStorage`], shared between clones.
#[derive(Default, Clone)]
pub struct MemoryStorage {
    inner: Arc<Mutex<MemoryInner>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl LocalStorage for MemoryStorage {
    fn username(&self) -> Result<Option<String>> {
        Ok(self.lock().username.clone())
    }

    fn set_username(&self, username: &str) -> Result<()> {
        self.lock().username = Some(username.to_string());
        Ok(())
    }

    fn private_key(&self) -> Result<Option<String>> {
        Ok(self.lock().private_key.clone())
    }

    fn set_private_key(&self, private_key_b64: &str) -> Result<()> {
        self.lock().private_key = Some(private_key_b64.to_string());
        Ok(())
    }

    fn clear_credentials(&self) -> Result<()> {
        let mut inner = self.lock();
        inner.username = None;
        inner.private_key = None;
        Ok(())
    }

    fn load_conversation(&self, key: &ConversationKey) -> Result<Option<Vec<ResolvedMessage>>> {
        Ok(self.lock().conversations.get(key).map(|(_, list)| list.clone()))
    }

    fn save_conversation(&self, key: &ConversationKey, messages: &[ResolvedMessage]) -> Result<()> {
        let mut inner = self.lock();
        inner.writes += 1;
        let seq = inner.writes;
        inner.conversations.insert(*key, (seq, messages.to_vec()));
        Ok(())
    }

    fn remove_conversation(&self, key: &ConversationKey) -> Result<()> {
        self.lock().conversations.remove(key);
        Ok(())
    }

    fn clear_conversations(&self) -> Result<()> {
        self.lock().conversations.clear();
        Ok(())
    }

    fn conversation_keys(&self) -> Result<Vec<ConversationKey>> {
        let inner = self.lock();
        let mut keys: Vec<_> = inner
            .conversations
            .iter()
            .map(|(key, (seq, _))| (*seq, *key))
            .collect();
        keys.sort_by_key(|(seq, _)| *seq);
        Ok(keys.into_iter().map(|(_, key)| key).collect())
    }
}
