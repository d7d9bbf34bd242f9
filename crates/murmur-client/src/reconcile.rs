//! Merge of remotely observed messages into [`ChatState`].
//!
//! Polling and push deliver overlapping data, so every operation here is
//! idempotent: applying the same input twice leaves the state as applying it
//! once.

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};

use chrono::Utc;
use murmur_shared::crypto::{decrypt_with, Decrypted};
use murmur_shared::keys::PrivateKey;
use murmur_shared::models::{sort_messages, Message, MessageContent, ReadReceipt, ResolvedMessage};
use murmur_shared::types::{ConversationKey, MessageId, UserId};
use murmur_store::ConversationCache;
use tracing::{debug, warn};

use crate::state::ChatState;

/// Result of a merge step.
#[derive(Debug, Default, PartialEq)]
pub struct Merge {
    /// Whether the published state changed
    pub changed: bool,
    /// Receipts to upsert for newly read incoming messages
    pub receipts: Vec<ReadReceipt>,
}

/// Derive the displayable content of `message`.
///
/// Self-authored messages cannot be decrypted locally (they were encrypted to
/// the peer), so their plaintext comes from `known`.
pub fn resolve(
    message: Message,
    self_id: UserId,
    private_key: &PrivateKey,
    known: &HashMap<MessageId, MessageContent>,
) -> ResolvedMessage {
    let content = if message.sender_id == self_id {
        known
            .get(&message.id)
            .cloned()
            .unwrap_or(MessageContent::Unavailable)
    } else {
        match decrypt_with(&message.ciphertext, private_key) {
            Decrypted::Plaintext(text) => MessageContent::Plain(text),
            Decrypted::Undecryptable => {
                debug!(message = %message.id, "message could not be decrypted");
                MessageContent::Undecryptable
            }
        }
    };
    ResolvedMessage::new(message, content)
}

/// Show the cached list of `peer`'s conversation, plus any echoes still in
/// flight to it.
pub fn open_conversation(state: &mut ChatState, cache: &mut ConversationCache, peer: UserId) {
    let key = ConversationKey::new(state.self_id(), peer);
    let mut list = cache.get(&key);
    for pending in state.pending.iter().filter(|p| p.peer_id == peer) {
        list.push(echo(state.self_id(), pending));
    }
    sort_messages(&mut list);
    state.messages = list;
}

/// Merge a polled snapshot of the conversation with `peer`.
///
/// The snapshot replaces the list, except for optimistic entries and entries
/// that arrived by push or send confirmation and no snapshot has carried yet.
/// A snapshot may have been taken before those entries were stored, and the
/// timestamps on either side come from different clocks.
pub fn merge_batch(
    state: &mut ChatState,
    cache: &mut ConversationCache,
    private_key: &PrivateKey,
    peer: UserId,
    batch: Vec<Message>,
) -> Merge {
    if state.selected_peer != Some(peer) {
        debug!(peer = %peer.short(), "discarding batch for unselected conversation");
        return Merge::default();
    }

    let self_id = state.self_id();
    let key = ConversationKey::new(self_id, peer);
    let known = known_contents(state, cache, &key);
    let deferring = has_send_in_flight(state, peer);

    let mut merged: Vec<ResolvedMessage> = batch
        .into_iter()
        .filter(|m| m.is_between(self_id, peer))
        .map(|m| resolve(m, self_id, private_key, &known))
        .filter(|m| !(deferring && m.content == MessageContent::Unavailable))
        .collect();

    let batch_ids: HashSet<MessageId> = merged.iter().map(|m| m.id().clone()).collect();
    for id in &batch_ids {
        state.unsnapshotted.remove(id);
        state.confirmed_sends.remove(id);
    }
    merged.extend(
        state
            .messages
            .iter()
            .filter(|m| !batch_ids.contains(m.id()))
            .filter(|m| m.id().is_temporary() || state.unsnapshotted.contains(m.id()))
            .cloned(),
    );
    sort_messages(&mut merged);

    let changed = !same_contents(&state.messages, &merged);
    if changed {
        debug!(
            conversation = %key,
            before = state.messages.len(),
            after = merged.len(),
            "conversation updated"
        );
        state.messages = merged;
        persist(cache, key, &state.messages);
    }

    let receipts = mark_incoming_read(state, peer);
    Merge {
        changed: changed || !receipts.is_empty(),
        receipts,
    }
}

/// Apply a single pushed message.
pub fn apply_pushed_message(
    state: &mut ChatState,
    cache: &mut ConversationCache,
    private_key: &PrivateKey,
    message: Message,
) -> Merge {
    let self_id = state.self_id();
    if message.sender_id != self_id && message.recipient_id != self_id {
        return Merge::default();
    }
    let peer = message.peer_of(self_id);

    if state.selected_peer == Some(peer) {
        if state.message(&message.id).is_some() {
            return Merge::default();
        }

        let key = ConversationKey::new(self_id, peer);
        let known = if message.sender_id == self_id {
            known_contents(state, cache, &key)
        } else {
            HashMap::new()
        };
        let resolved = resolve(message, self_id, private_key, &known);
        // the confirmation of our own send will carry the plaintext
        if resolved.content == MessageContent::Unavailable && has_send_in_flight(state, peer) {
            return Merge::default();
        }

        state.unsnapshotted.insert(resolved.id().clone());
        insert_sorted(&mut state.messages, resolved);
        persist(cache, key, &state.messages);

        let receipts = mark_incoming_read(state, peer);
        return Merge {
            changed: true,
            receipts,
        };
    }

    if message.recipient_id == self_id
        && message.sender_id != self_id
        && !state.is_read(&message.id)
        && state.counted_unread.insert(message.id.clone(), peer).is_none()
    {
        *state.unread.entry(peer).or_insert(0) += 1;
        debug!(peer = %peer.short(), unread = state.unread_for(peer), "unread message");
        return Merge {
            changed: true,
            receipts: Vec::new(),
        };
    }

    Merge::default()
}

/// Mark self-authored messages read from receipts written by their recipient.
pub fn apply_receipts(state: &mut ChatState, receipts: &[ReadReceipt]) -> bool {
    let self_id = state.self_id();
    let mut newly_read = Vec::new();
    for receipt in receipts {
        if state.is_read(&receipt.message_id) {
            continue;
        }
        let Some(message) = state.message(&receipt.message_id) else {
            continue;
        };
        if message.message.sender_id == self_id && message.message.recipient_id == receipt.reader_id
        {
            newly_read.push((receipt.message_id.clone(), receipt.reader_id));
        }
    }

    let changed = !newly_read.is_empty();
    state.read.extend(newly_read);
    changed
}

/// Drop a message deleted upstream from the visible list.
pub fn remove_message(state: &mut ChatState, cache: &mut ConversationCache, message: &Message) -> bool {
    state.forget_message(&message.id);
    let before = state.messages.len();
    state.messages.retain(|m| m.id() != &message.id);
    if state.messages.len() == before {
        return false;
    }
    if let Some(peer) = state.selected_peer {
        persist(cache, ConversationKey::new(state.self_id(), peer), &state.messages);
    }
    true
}

/// Ids of self-authored confirmed messages in the visible list
pub fn own_message_ids(state: &ChatState) -> Vec<MessageId> {
    let self_id = state.self_id();
    state
        .messages
        .iter()
        .filter(|m| m.message.sender_id == self_id && !m.id().is_temporary())
        .map(|m| m.id().clone())
        .collect()
}

/// Insert keeping `(sent_at, id)` order
pub(crate) fn insert_sorted(list: &mut Vec<ResolvedMessage>, message: ResolvedMessage) {
    let pos = list.partition_point(|m| m.cmp_order(&message) == Ordering::Less);
    list.insert(pos, message);
}

pub(crate) fn persist(cache: &mut ConversationCache, key: ConversationKey, list: &[ResolvedMessage]) {
    if let Err(e) = cache.put(key, list.to_vec()) {
        warn!(conversation = %key, error = %e, "failed to persist conversation cache");
    }
}

pub(crate) fn echo(self_id: UserId, pending: &crate::state::PendingSend) -> ResolvedMessage {
    ResolvedMessage::new(
        Message {
            id: pending.local_id.clone(),
            sender_id: self_id,
            recipient_id: pending.peer_id,
            ciphertext: String::new(),
            sent_at: pending.created_at,
        },
        MessageContent::Plain(pending.plaintext.clone()),
    )
}

fn known_contents(
    state: &ChatState,
    cache: &mut ConversationCache,
    key: &ConversationKey,
) -> HashMap<MessageId, MessageContent> {
    let mut known: HashMap<MessageId, MessageContent> = cache
        .get(key)
        .into_iter()
        .chain(state.messages.iter().cloned())
        .filter(|m| matches!(m.content, MessageContent::Plain(_)))
        .map(|m| (m.message.id, m.content))
        .collect();
    for (id, text) in &state.confirmed_sends {
        known
            .entry(id.clone())
            .or_insert_with(|| MessageContent::Plain(text.clone()));
    }
    known
}

fn has_send_in_flight(state: &ChatState, peer: UserId) -> bool {
    state
        .pending
        .iter()
        .any(|p| p.peer_id == peer && p.state.is_in_flight())
}

fn same_contents(a: &[ResolvedMessage], b: &[ResolvedMessage]) -> bool {
    a.len() == b.len()
        && a
            .iter()
            .zip(b)
            .all(|(x, y)| x.id() == y.id() && x.content == y.content)
}

fn mark_incoming_read(state: &mut ChatState, peer: UserId) -> Vec<ReadReceipt> {
    let self_id = state.self_id();
    let now = Utc::now();
    let mut receipts = Vec::new();
    for message in &state.messages {
        let m = &message.message;
        if m.sender_id == peer && m.recipient_id == self_id && !state.is_read(&m.id) {
            receipts.push(ReadReceipt {
                message_id: m.id.clone(),
                reader_id: self_id,
                read_at: now,
            });
        }
    }
    state
        .read
        .extend(receipts.iter().map(|r| (r.message_id.clone(), peer)));
    receipts
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outbound::confirm_send;
    use crate::state::{PendingSend, SendState};
    use chrono::{DateTime, Duration};
    use murmur_shared::crypto::encrypt_for;
    use murmur_shared::keys::KeyPair;
    use murmur_shared::models::Identity;
    use murmur_store::{CacheLimits, LocalStorage, MemoryStorage};

    struct Fixture {
        state: ChatState,
        cache: ConversationCache,
        storage: MemoryStorage,
        keys: KeyPair,
        me: UserId,
        peer: UserId,
        peer_keys: KeyPair,
    }

    fn identity(name: &str, keys: &KeyPair) -> Identity {
        Identity {
            id: UserId::new(),
            display_name: name.into(),
            public_key: keys.public_key_b64(),
            online: true,
            last_seen_at: None,
            created_at: Utc::now(),
        }
    }

    fn fixture() -> Fixture {
        let keys = KeyPair::generate();
        let peer_keys = KeyPair::generate();
        let me = identity("me", &keys);
        let peer = identity("peer", &peer_keys);
        let (me_id, peer_id) = (me.id, peer.id);

        let mut state = ChatState::new(me);
        state.set_identities(vec![peer]);
        state.selected_peer = Some(peer_id);

        let storage = MemoryStorage::new();
        let cache = ConversationCache::new(Box::new(storage.clone()), CacheLimits::default());
        Fixture {
            state,
            cache,
            storage,
            keys,
            me: me_id,
            peer: peer_id,
            peer_keys,
        }
    }

    impl Fixture {
        fn incoming(&self, text: &str, at: DateTime<Utc>) -> Message {
            Message {
                id: MessageId::new(),
                sender_id: self.peer,
                recipient_id: self.me,
                ciphertext: encrypt_for(text, &self.keys.public_key_b64()).unwrap(),
                sent_at: at,
            }
        }

        fn outgoing(&self, text: &str, at: DateTime<Utc>) -> Message {
            Message {
                id: MessageId::new(),
                sender_id: self.me,
                recipient_id: self.peer,
                ciphertext: encrypt_for(text, &self.peer_keys.public_key_b64()).unwrap(),
                sent_at: at,
            }
        }

        fn merge(&mut self, batch: Vec<Message>) -> Merge {
            let private = self.keys.private_key();
            let peer = self.peer;
            merge_batch(&mut self.state, &mut self.cache, &private, peer, batch)
        }

        fn push(&mut self, message: Message) -> Merge {
            let private = self.keys.private_key();
            apply_pushed_message(&mut self.state, &mut self.cache, &private, message)
        }

        fn texts(&self) -> Vec<&str> {
            self.state
                .messages
                .iter()
                .map(|m| m.content.display_text())
                .collect()
        }
    }

    #[test]
    fn test_merge_decrypts_and_marks_read() {
        let mut fx = fixture();
        let msg = fx.incoming("hi", Utc::now());
        let merge = fx.merge(vec![msg.clone()]);

        assert!(merge.changed);
        assert_eq!(fx.texts(), ["hi"]);
        assert_eq!(merge.receipts.len(), 1);
        assert_eq!(merge.receipts[0].message_id, msg.id);
        assert_eq!(merge.receipts[0].reader_id, fx.me);
        assert!(fx.state.is_read(&msg.id));
    }

    #[test]
    fn test_merge_is_idempotent() {
        let mut fx = fixture();
        let t = Utc::now() - Duration::seconds(10);
        let batch = vec![fx.incoming("one", t), fx.incoming("two", t + Duration::seconds(1))];

        fx.merge(batch.clone());
        let once = fx.state.clone();
        let second = fx.merge(batch);

        assert_eq!(second, Merge::default());
        assert_eq!(fx.state, once);
    }

    #[test]
    fn test_batch_for_unselected_peer_is_discarded() {
        let mut fx = fixture();
        let msg = fx.incoming("late", Utc::now());
        fx.state.selected_peer = None;

        let private = fx.keys.private_key();
        let merge = merge_batch(&mut fx.state, &mut fx.cache, &private, fx.peer, vec![msg]);
        assert_eq!(merge, Merge::default());
        assert!(fx.state.messages.is_empty());
    }

    #[test]
    fn test_own_messages_use_cached_plaintext() {
        let mut fx = fixture();
        let sent = fx.outgoing("from me", Utc::now());
        let key = ConversationKey::new(fx.me, fx.peer);
        fx.cache
            .put(
                key,
                vec![ResolvedMessage::new(sent.clone(), MessageContent::Plain("from me".into()))],
            )
            .unwrap();

        let other = fx.outgoing("elsewhere", Utc::now());
        fx.merge(vec![sent, other]);
        assert_eq!(fx.texts(), ["from me", murmur_shared::constants::UNAVAILABLE_PLACEHOLDER]);
    }

    #[test]
    fn test_wrong_key_shows_placeholder() {
        let mut fx = fixture();
        let mut msg = fx.incoming("x", Utc::now());
        msg.ciphertext = encrypt_for("x", &KeyPair::generate().public_key_b64()).unwrap();
        fx.merge(vec![msg]);
        assert_eq!(fx.state.messages[0].content, MessageContent::Undecryptable);
    }

    #[test]
    fn test_batch_replaces_but_keeps_optimistic_and_pushed() {
        let mut fx = fixture();
        let now = Utc::now();
        let old = now - Duration::seconds(60);
        let stale = fx.incoming("deleted upstream", old);
        fx.merge(vec![stale]);

        // stamped before the snapshot below, but never carried by one
        let pushed = fx.incoming("pushed", now - Duration::seconds(30));
        fx.push(pushed.clone());
        let pending = PendingSend {
            local_id: MessageId::temporary(),
            peer_id: fx.peer,
            plaintext: "sending".into(),
            created_at: now,
            state: SendState::Submitted,
        };
        fx.state.messages.push(echo(fx.me, &pending));
        fx.state.pending.push(pending);

        let fresh = fx.incoming("fresh", old + Duration::seconds(5));
        fx.merge(vec![fresh.clone()]);

        assert_eq!(fx.texts(), ["fresh", "pushed", "sending"]);
        // optimistic entries never reach the cache
        let cached = fx.storage.load_conversation(&ConversationKey::new(fx.me, fx.peer)).unwrap().unwrap();
        assert_eq!(cached.len(), 2);
    }

    #[test]
    fn test_pushed_message_dropped_once_a_snapshot_omits_it_after_carrying_it() {
        let mut fx = fixture();
        let pushed = fx.incoming("short lived", Utc::now());
        fx.push(pushed.clone());
        fx.merge(vec![pushed]);
        assert_eq!(fx.texts(), ["short lived"]);

        fx.merge(Vec::new());
        assert!(fx.state.messages.is_empty());
    }

    #[test]
    fn test_confirmed_send_survives_server_clock_behind_client() {
        let mut fx = fixture();
        let local_id = MessageId::temporary();
        let pending = PendingSend {
            local_id: local_id.clone(),
            peer_id: fx.peer,
            plaintext: "hello".into(),
            created_at: Utc::now(),
            state: SendState::Submitted,
        };
        fx.state.messages.push(echo(fx.me, &pending));
        fx.state.pending.push(pending);

        // the store stamps the row well before the client's clock
        let stored = fx.outgoing("hello", Utc::now() - Duration::seconds(5));
        assert!(confirm_send(&mut fx.state, &mut fx.cache, &local_id, stored.clone()));
        assert_eq!(fx.texts(), ["hello"]);

        // a poll that went out before the insert landed
        fx.merge(Vec::new());
        assert_eq!(fx.texts(), ["hello"]);

        fx.merge(vec![stored.clone()]);
        assert_eq!(fx.state.messages[0].content.plaintext(), Some("hello"));

        // plaintext now lives in the cache even after the list is reset
        fx.state.messages.clear();
        fx.merge(vec![stored]);
        assert_eq!(fx.state.messages[0].content.plaintext(), Some("hello"));
        assert!(fx.state.confirmed_sends.is_empty());
    }

    #[test]
    fn test_colliding_timestamps_are_totally_ordered() {
        let mut fx = fixture();
        let t = Utc::now();
        let mut a = fx.incoming("a", t);
        let mut b = fx.incoming("b", t);
        a.id = MessageId::from("m-2");
        b.id = MessageId::from("m-1");

        fx.merge(vec![a.clone(), b.clone()]);
        assert_eq!(fx.texts(), ["b", "a"]);

        // same result whatever the arrival order
        fx.state.messages.clear();
        fx.push(a);
        fx.push(b);
        assert_eq!(fx.texts(), ["b", "a"]);
    }

    #[test]
    fn test_push_duplicate_is_noop() {
        let mut fx = fixture();
        let msg = fx.incoming("once", Utc::now());
        assert!(fx.push(msg.clone()).changed);
        assert_eq!(fx.push(msg), Merge::default());
        assert_eq!(fx.state.messages.len(), 1);
    }

    #[test]
    fn test_push_for_other_conversation_counts_unread_once() {
        let mut fx = fixture();
        let msg = fx.incoming("ping", Utc::now());
        fx.state.selected_peer = None;

        let id = msg.id.clone();

        assert!(fx.push(msg.clone()).changed);
        assert_eq!(fx.push(msg), Merge::default());
        assert_eq!(fx.state.unread_for(fx.peer), 1);
        assert!(fx.state.messages.is_empty());
        assert!(!fx.state.is_read(&id));
    }

    #[test]
    fn test_own_push_deferred_while_send_in_flight() {
        let mut fx = fixture();
        fx.state.pending.push(PendingSend {
            local_id: MessageId::temporary(),
            peer_id: fx.peer,
            plaintext: "hello".into(),
            created_at: Utc::now(),
            state: SendState::Submitted,
        });
        let confirmed = fx.outgoing("hello", Utc::now());
        assert_eq!(fx.push(confirmed), Merge::default());
    }

    #[test]
    fn test_receipts_mark_own_messages_read() {
        let mut fx = fixture();
        let sent = fx.outgoing("hi", Utc::now());
        let key = ConversationKey::new(fx.me, fx.peer);
        fx.cache
            .put(key, vec![ResolvedMessage::new(sent.clone(), MessageContent::Plain("hi".into()))])
            .unwrap();
        fx.merge(vec![sent.clone()]);

        let foreign = ReadReceipt {
            message_id: sent.id.clone(),
            reader_id: UserId::new(),
            read_at: Utc::now(),
        };
        assert!(!apply_receipts(&mut fx.state, &[foreign]));

        let receipt = ReadReceipt {
            message_id: sent.id.clone(),
            reader_id: fx.peer,
            read_at: Utc::now(),
        };
        assert!(apply_receipts(&mut fx.state, &[receipt.clone()]));
        assert!(fx.state.is_read(&sent.id));
        assert!(!apply_receipts(&mut fx.state, &[receipt]));
        assert_eq!(own_message_ids(&fx.state), vec![sent.id]);
    }

    #[test]
    fn test_remove_message() {
        let mut fx = fixture();
        let msg = fx.incoming("bye", Utc::now());
        fx.push(msg.clone());
        assert!(fx.state.is_read(&msg.id));
        assert!(remove_message(&mut fx.state, &mut fx.cache, &msg));
        assert!(!fx.state.is_read(&msg.id));
        assert!(!remove_message(&mut fx.state, &mut fx.cache, &msg));
        assert!(fx.state.messages.is_empty());
    }
}
