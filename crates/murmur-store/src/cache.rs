//! Bounded cache of decrypted conversations.
//!
//! Entries are loaded lazily from [`LocalStorage`] and written through on
//! every [`ConversationCache::put`]. The least recently used conversation is
//! evicted from memory and from durable storage once `max_conversations` is
//! exceeded.

use std::collections::{HashMap, VecDeque};

use murmur_shared::constants::{CACHE_MAX_CONVERSATIONS, CACHE_MAX_MESSAGES};
use murmur_shared::models::{sort_messages, ResolvedMessage};
use murmur_shared::types::ConversationKey;

use crate::error::Result;
use crate::storage::LocalStorage;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheLimits {
    pub max_conversations: usize,
    /// Only the newest messages of a conversation are kept
    pub max_messages_per_conversation: usize,
}

impl Default for CacheLimits {
    fn default() -> Self {
        Self {
            max_conversations: CACHE_MAX_CONVERSATIONS,
            max_messages_per_conversation: CACHE_MAX_MESSAGES,
        }
    }
}

pub struct ConversationCache {
    storage: Box<dyn LocalStorage>,
    limits: CacheLimits,
    // least recently used at the front
    recency: VecDeque<ConversationKey>,
    loaded: HashMap<ConversationKey, Vec<ResolvedMessage>>,
    // evicted since the last take_evicted
    evicted: Vec<ConversationKey>,
}

impl ConversationCache {
    pub fn new(storage: Box<dyn LocalStorage>, limits: CacheLimits) -> Self {
        let recency = match storage.conversation_keys() {
            Ok(keys) => keys.into(),
            Err(e) => {
                tracing::warn!(error = %e, "could not list cached conversations");
                VecDeque::new()
            }
        };

        let mut cache = Self {
            storage,
            limits: CacheLimits {
                max_conversations: limits.max_conversations.max(1),
                ..limits
            },
            recency,
            loaded: HashMap::new(),
            evicted: Vec::new(),
        };
        cache.evict_overflow();
        cache
    }

    pub fn storage(&self) -> &dyn LocalStorage {
        self.storage.as_ref()
    }

    pub fn len(&self) -> usize {
        self.recency.len()
    }

    pub fn is_empty(&self) -> bool {
        self.recency.is_empty()
    }

    /// Last stored list for `key`, empty when nothing is cached.
    ///
    /// Storage failures are logged and read as a miss.
    pub fn get(&mut self, key: &ConversationKey) -> Vec<ResolvedMessage> {
        if let Some(list) = self.loaded.get(key) {
            let list = list.clone();
            self.touch(*key);
            return list;
        }

        match self.storage.load_conversation(key) {
            Ok(Some(list)) => {
                self.loaded.insert(*key, list.clone());
                self.touch(*key);
                self.evict_overflow();
                list
            }
            Ok(None) => Vec::new(),
            Err(e) => {
                tracing::warn!(conversation = %key, error = %e, "cache read failed");
                Vec::new()
            }
        }
    }

    /// Replace the cached list for `key`.
    ///
    /// Optimistic entries are dropped since they never outlive the session.
    pub fn put(&mut self, key: ConversationKey, messages: Vec<ResolvedMessage>) -> Result<()> {
        let mut list: Vec<_> = messages
            .into_iter()
            .filter(|m| !m.id().is_temporary())
            .collect();
        sort_messages(&mut list);

        let cap = self.limits.max_messages_per_conversation;
        if list.len() > cap {
            list.drain(..list.len() - cap);
        }

        self.touch(key);
        let saved = self.storage.save_conversation(&key, &list);
        self.loaded.insert(key, list);
        self.evict_overflow();
        saved
    }

    /// Conversations evicted since the last call
    pub fn take_evicted(&mut self) -> Vec<ConversationKey> {
        std::mem::take(&mut self.evicted)
    }

    /// Drop every cached conversation, in memory and on disk
    pub fn clear(&mut self) -> Result<()> {
        self.recency.clear();
        self.loaded.clear();
        self.evicted.clear();
        self.storage.clear_conversations()
    }

    fn touch(&mut self, key: ConversationKey) {
        if let Some(pos) = self.recency.iter().position(|k| *k == key) {
            self.recency.remove(pos);
        }
        self.recency.push_back(key);
    }

    fn evict_overflow(&mut self) {
        while self.recency.len() > self.limits.max_conversations {
            let Some(evicted) = self.recency.pop_front() else {
                break;
            };
            self.loaded.remove(&evicted);
            self.evicted.push(evicted);
            if let Err(e) = self.storage.remove_conversation(&evicted) {
                tracing::warn!(conversation = %evicted, error = %e, "cache eviction failed");
            } else {
                tracing::debug!(conversation = %evicted, "evicted cached conversation");
            }
        }
    }
}
