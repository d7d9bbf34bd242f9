//! Chat state published to the UI.
//!
//! [`ChatState`] is owned by the engine actor and mutated only there. Every
//! published value is a full snapshot.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use murmur_shared::models::{Identity, ResolvedMessage};
use murmur_shared::types::{MessageId, UserId};
use serde::Serialize;

/// Online and typing status of one peer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PeerStatus {
    pub online: bool,
    pub last_seen_at: Option<DateTime<Utc>>,
    pub typing: bool,
}

/// The in-progress composition for the selected conversation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Draft {
    pub text: String,
    /// Whether a `typing = true` signal is currently outstanding
    pub typing_active: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SendState {
    Pending,
    Encrypting,
    Submitted,
    Confirmed,
    Failed,
}

impl SendState {
    pub fn is_in_flight(self) -> bool {
        matches!(
            self,
            SendState::Pending | SendState::Encrypting | SendState::Submitted
        )
    }
}

/// An optimistic send that the store has not confirmed yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PendingSend {
    pub local_id: MessageId,
    pub peer_id: UserId,
    pub plaintext: String,
    pub created_at: DateTime<Utc>,
    pub state: SendState,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatState {
    pub self_identity: Identity,
    /// Every known identity except self, ordered by display name
    pub identities: Vec<Identity>,
    pub search_query: String,
    /// `identities` filtered by `search_query`
    pub peers: Vec<Identity>,
    pub selected_peer: Option<UserId>,
    pub unread: HashMap<UserId, u32>,
    /// Merged list of the selected conversation, ordered by `(sent_at, id)`
    pub messages: Vec<ResolvedMessage>,
    /// Messages known to be read by their recipient, with the conversation
    /// peer they belong to
    pub read: HashMap<MessageId, UserId>,
    pub presence: HashMap<UserId, PeerStatus>,
    pub draft: Draft,
    pub pending: Vec<PendingSend>,
    /// True until the first peer-list fetch settles
    pub is_loading: bool,
    /// Last user-visible error, if any
    pub notice: Option<String>,

    // messages already counted towards `unread`, by sender
    #[serde(skip)]
    pub(crate) counted_unread: HashMap<MessageId, UserId>,
    // plaintext of our confirmed sends until a snapshot has carried them
    #[serde(skip)]
    pub(crate) confirmed_sends: HashMap<MessageId, String>,
    // visible messages that arrived by push or confirmation and no merged
    // snapshot has contained yet
    #[serde(skip)]
    pub(crate) unsnapshotted: HashSet<MessageId>,
}

impl ChatState {
    pub fn new(self_identity: Identity) -> Self {
        Self {
            self_identity,
            identities: Vec::new(),
            search_query: String::new(),
            peers: Vec::new(),
            selected_peer: None,
            unread: HashMap::new(),
            messages: Vec::new(),
            read: HashMap::new(),
            presence: HashMap::new(),
            draft: Draft::default(),
            pending: Vec::new(),
            is_loading: true,
            notice: None,
            counted_unread: HashMap::new(),
            confirmed_sends: HashMap::new(),
            unsnapshotted: HashSet::new(),
        }
    }

    pub fn self_id(&self) -> UserId {
        self.self_identity.id
    }

    pub fn unread_for(&self, peer: UserId) -> u32 {
        self.unread.get(&peer).copied().unwrap_or(0)
    }

    pub fn total_unread(&self) -> u32 {
        self.unread.values().sum()
    }

    pub fn status_of(&self, peer: UserId) -> PeerStatus {
        self.presence.get(&peer).cloned().unwrap_or_default()
    }

    pub fn is_read(&self, id: &MessageId) -> bool {
        self.read.contains_key(id)
    }

    pub fn is_sending(&self) -> bool {
        self.pending.iter().any(|p| p.state.is_in_flight())
    }

    pub fn identity(&self, id: UserId) -> Option<&Identity> {
        self.identities.iter().find(|i| i.id == id)
    }

    pub fn selected_identity(&self) -> Option<&Identity> {
        self.selected_peer.and_then(|peer| self.identity(peer))
    }

    pub fn message(&self, id: &MessageId) -> Option<&ResolvedMessage> {
        self.messages.iter().find(|m| m.id() == id)
    }

    /// Replace the identity list, dropping self
    pub fn set_identities(&mut self, mut identities: Vec<Identity>) {
        let self_id = self.self_id();
        if let Some(me) = identities.iter().find(|i| i.id == self_id) {
            self.self_identity = me.clone();
        }
        identities.retain(|i| i.id != self_id);
        identities.sort_by(|a, b| a.display_name.cmp(&b.display_name));
        self.identities = identities;
        self.refilter_peers();
    }

    /// Insert or replace one identity
    pub fn upsert_identity(&mut self, identity: Identity) {
        if identity.id == self.self_id() {
            self.self_identity = identity;
            return;
        }
        match self.identities.iter_mut().find(|i| i.id == identity.id) {
            Some(existing) => *existing = identity,
            None => {
                self.identities.push(identity);
                self.identities
                    .sort_by(|a, b| a.display_name.cmp(&b.display_name));
            }
        }
        self.refilter_peers();
    }

    pub fn remove_identity(&mut self, id: UserId) {
        self.identities.retain(|i| i.id != id);
        self.presence.remove(&id);
        self.clear_unread(id);
        self.forget_conversation(id);
        self.refilter_peers();
    }

    /// Reset `peer`'s unread count along with the ids that made it up
    pub fn clear_unread(&mut self, peer: UserId) {
        self.unread.remove(&peer);
        self.counted_unread.retain(|_, sender| *sender != peer);
    }

    /// Drop read markers of the conversation with `peer`.
    ///
    /// Called once its messages leave the cache. Reopening it re-derives them
    /// from the next snapshot.
    pub fn forget_conversation(&mut self, peer: UserId) {
        self.read.retain(|_, owner| *owner != peer);
    }

    /// Drop every trace of one message
    pub fn forget_message(&mut self, id: &MessageId) {
        self.read.remove(id);
        self.counted_unread.remove(id);
        self.confirmed_sends.remove(id);
        self.unsnapshotted.remove(id);
    }

    /// Drop all message history, keeping identities and presence
    pub fn clear_history(&mut self) {
        self.messages.clear();
        self.unread.clear();
        self.read.clear();
        self.counted_unread.clear();
        self.confirmed_sends.clear();
        self.unsnapshotted.clear();
    }

    pub fn set_search_query(&mut self, query: String) {
        self.search_query = query;
        self.refilter_peers();
    }

    /// Case-insensitive substring match on display name
    pub fn refilter_peers(&mut self) {
        let needle = self.search_query.trim().to_lowercase();
        self.peers = self
            .identities
            .iter()
            .filter(|i| needle.is_empty() || i.display_name.to_lowercase().contains(&needle))
            .cloned()
            .collect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn identity(name: &str) -> Identity {
        Identity {
            id: UserId::new(),
            display_name: name.to_string(),
            public_key: "key".into(),
            online: false,
            last_seen_at: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_search_filter_is_case_insensitive() {
        let me = identity("me");
        let mut state = ChatState::new(me.clone());
        state.set_identities(vec![identity("Alice"), identity("bob"), me, identity("MALLORY")]);

        assert_eq!(state.identities.len(), 3);

        state.set_search_query("AL".into());
        let names: Vec<_> = state.peers.iter().map(|p| p.display_name.as_str()).collect();
        assert_eq!(names, ["Alice", "MALLORY"]);

        state.set_search_query("   ".into());
        assert_eq!(state.peers.len(), 3);
    }

    #[test]
    fn test_upsert_identity_keeps_order_and_filter() {
        let mut state = ChatState::new(identity("me"));
        state.set_search_query("b".into());
        state.upsert_identity(identity("cob"));
        state.upsert_identity(identity("bea"));
        state.upsert_identity(identity("dan"));

        let names: Vec<_> = state.identities.iter().map(|p| p.display_name.as_str()).collect();
        assert_eq!(names, ["bea", "cob", "dan"]);
        assert_eq!(state.peers.len(), 2);
    }

    #[test]
    fn test_bookkeeping_is_pruned_per_conversation() {
        let (bea, cid) = (UserId::new(), UserId::new());
        let mut state = ChatState::new(identity("me"));
        state.read.insert(MessageId::from("b-1"), bea);
        state.read.insert(MessageId::from("c-1"), cid);
        state.counted_unread.insert(MessageId::from("b-2"), bea);
        state.counted_unread.insert(MessageId::from("c-2"), cid);
        state.unread.insert(bea, 1);
        state.unread.insert(cid, 1);

        state.forget_conversation(bea);
        assert!(!state.is_read(&MessageId::from("b-1")));
        assert!(state.is_read(&MessageId::from("c-1")));
        assert_eq!(state.unread_for(bea), 1);

        state.clear_unread(bea);
        assert_eq!(state.unread_for(bea), 0);
        assert_eq!(state.counted_unread.len(), 1);

        state.forget_message(&MessageId::from("c-1"));
        assert!(state.read.is_empty());

        state.clear_history();
        assert!(state.counted_unread.is_empty());
        assert_eq!(state.total_unread(), 0);
    }

    #[test]
    fn test_self_row_updates_self_identity() {
        let me = identity("me");
        let mut state = ChatState::new(me.clone());
        let mut updated = me;
        updated.online = true;
        state.upsert_identity(updated);
        assert!(state.self_identity.online);
        assert!(state.identities.is_empty());
    }
}
