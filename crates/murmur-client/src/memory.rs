//! In-process message store, presence channel and teardown endpoint.
//!
//! Several engines can share one [`MemoryBackend`] to talk to each other.
//! Failures and latency can be injected per call family.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use murmur_shared::models::{
    ChangeEvent, ChangeKind, Identity, IdentityPatch, Message, NewMessage, PresenceSync,
    ReadReceipt, Row, TypingSignal,
};
use murmur_shared::types::{MessageId, UserId};
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::{EngineError, EngineResult};
use crate::remote::{MessageStore, PresenceService, Remote, TeardownBeacon};

const SUBSCRIPTION_BUFFER: usize = 256;

/// Call families that failures can be injected into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Fault {
    ListIdentities,
    FetchConversation,
    InsertMessage,
    UpsertReceipts,
}

#[derive(Default)]
struct Inner {
    identities: BTreeMap<UserId, Identity>,
    messages: Vec<Message>,
    receipts: HashMap<(MessageId, UserId), ReadReceipt>,
    typing: HashMap<(UserId, UserId), TypingSignal>,
    members: HashSet<UserId>,
    subscribers: Vec<(UserId, mpsc::Sender<ChangeEvent>)>,
    presence_subscribers: Vec<mpsc::Sender<PresenceSync>>,
    faults: HashMap<Fault, u32>,
    latency: Option<Duration>,
    beacons: Vec<UserId>,
    identity_list_calls: usize,
    last_sent_at: Option<DateTime<Utc>>,
}

impl Inner {
    fn take_fault(&mut self, fault: Fault) -> EngineResult<()> {
        match self.faults.get_mut(&fault) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                match fault {
                    Fault::InsertMessage | Fault::UpsertReceipts => {
                        Err(EngineError::RemoteRejection(format!("{fault:?} refused")))
                    }
                    _ => Err(EngineError::TransientIo(format!("{fault:?} unavailable"))),
                }
            }
            _ => Ok(()),
        }
    }

    // strictly increasing, so ordering by sent_at matches insertion order
    fn next_timestamp(&mut self) -> DateTime<Utc> {
        let now = Utc::now();
        let at = match self.last_sent_at {
            Some(last) if now <= last => last + chrono::Duration::microseconds(1),
            _ => now,
        };
        self.last_sent_at = Some(at);
        at
    }

    fn broadcast(&mut self, event: ChangeEvent) {
        self.subscribers.retain(|(subscriber, tx)| {
            if !is_relevant(&event.row, *subscriber) {
                return !tx.is_closed();
            }
            match tx.try_send(event.clone()) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    debug!(subscriber = %subscriber.short(), "subscriber lagging, event dropped");
                    true
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            }
        });
    }

    fn broadcast_presence(&mut self) {
        let sync = PresenceSync {
            members: self.members.clone(),
        };
        self.presence_subscribers
            .retain(|tx| !matches!(tx.try_send(sync.clone()), Err(mpsc::error::TrySendError::Closed(_))));
    }

    fn remove_messages_for(&mut self, user: UserId) -> usize {
        let (gone, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut self.messages)
            .into_iter()
            .partition(|m| m.sender_id == user || m.recipient_id == user);
        self.messages = kept;
        for message in &gone {
            self.broadcast(ChangeEvent {
                kind: ChangeKind::Delete,
                row: Row::Message(message.clone()),
                old_row: None,
            });
        }
        gone.len()
    }

    fn remove_identity(&mut self, id: UserId) {
        if let Some(identity) = self.identities.remove(&id) {
            self.broadcast(ChangeEvent {
                kind: ChangeKind::Delete,
                row: Row::Identity(identity),
                old_row: None,
            });
        }
    }

    fn teardown(&mut self, user: UserId) -> usize {
        let removed = self.remove_messages_for(user);
        self.remove_identity(user);
        if self.members.remove(&user) {
            self.broadcast_presence();
        }
        removed
    }
}

fn is_relevant(row: &Row, subscriber: UserId) -> bool {
    match row {
        Row::Identity(_) | Row::Receipt(_) => true,
        Row::Message(m) => m.sender_id == subscriber || m.recipient_id == subscriber,
        Row::Typing(t) => t.recipient_id == subscriber,
    }
}

/// Shared in-memory backend. Clones refer to the same data.
#[derive(Clone, Default)]
pub struct MemoryBackend {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bundle this backend as every remote port
    pub fn remote(&self) -> Remote {
        Remote {
            store: Arc::new(self.clone()),
            presence: Arc::new(self.clone()),
            beacon: Arc::new(self.clone()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Make the next `count` calls of `fault`'s family fail
    pub fn fail_next(&self, fault: Fault, count: u32) {
        self.lock().faults.insert(fault, count);
    }

    /// Delay every call by `latency`
    pub fn set_latency(&self, latency: Option<Duration>) {
        self.lock().latency = latency;
    }

    pub fn messages(&self) -> Vec<Message> {
        self.lock().messages.clone()
    }

    pub fn receipts(&self) -> Vec<ReadReceipt> {
        self.lock().receipts.values().cloned().collect()
    }

    pub fn identity(&self, id: UserId) -> Option<Identity> {
        self.lock().identities.get(&id).cloned()
    }

    pub fn typing(&self, user: UserId, recipient: UserId) -> Option<TypingSignal> {
        self.lock().typing.get(&(user, recipient)).cloned()
    }

    pub fn presence_members(&self) -> HashSet<UserId> {
        self.lock().members.clone()
    }

    /// Users a teardown beacon was received for, in arrival order
    pub fn beacons(&self) -> Vec<UserId> {
        self.lock().beacons.clone()
    }

    /// Number of `list_identities` calls so far, failed ones included
    pub fn identity_list_calls(&self) -> usize {
        self.lock().identity_list_calls
    }

    async fn delay(&self) {
        let latency = self.lock().latency;
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
    }
}

#[async_trait]
impl MessageStore for MemoryBackend {
    async fn find_identity_by_name(&self, display_name: &str) -> EngineResult<Option<Identity>> {
        self.delay().await;
        Ok(self
            .lock()
            .identities
            .values()
            .find(|i| i.display_name == display_name)
            .cloned())
    }

    async fn insert_identity(&self, display_name: &str, public_key: &str) -> EngineResult<Identity> {
        self.delay().await;
        let mut inner = self.lock();
        if inner.identities.values().any(|i| i.display_name == display_name) {
            return Err(EngineError::RemoteRejection(format!(
                "display name {display_name:?} is taken"
            )));
        }

        let identity = Identity {
            id: UserId::new(),
            display_name: display_name.to_string(),
            public_key: public_key.to_string(),
            online: true,
            last_seen_at: Some(Utc::now()),
            created_at: Utc::now(),
        };
        inner.identities.insert(identity.id, identity.clone());
        inner.broadcast(ChangeEvent::insert(Row::Identity(identity.clone())));
        Ok(identity)
    }

    async fn update_identity(&self, id: UserId, patch: IdentityPatch) -> EngineResult<()> {
        self.delay().await;
        let mut inner = self.lock();
        let Some(identity) = inner.identities.get_mut(&id) else {
            return Err(EngineError::RemoteRejection(format!("no identity {id}")));
        };
        let old = identity.clone();
        patch.apply_to(identity);
        let new = identity.clone();
        inner.broadcast(ChangeEvent {
            kind: ChangeKind::Update,
            row: Row::Identity(new),
            old_row: Some(Row::Identity(old)),
        });
        Ok(())
    }

    async fn list_identities(&self) -> EngineResult<Vec<Identity>> {
        self.delay().await;
        let mut inner = self.lock();
        inner.identity_list_calls += 1;
        inner.take_fault(Fault::ListIdentities)?;
        let mut list: Vec<_> = inner.identities.values().cloned().collect();
        list.sort_by(|a, b| a.display_name.cmp(&b.display_name));
        Ok(list)
    }

    async fn fetch_conversation(&self, a: UserId, b: UserId) -> EngineResult<Vec<Message>> {
        self.delay().await;
        let mut inner = self.lock();
        inner.take_fault(Fault::FetchConversation)?;
        Ok(inner
            .messages
            .iter()
            .filter(|m| m.is_between(a, b))
            .cloned()
            .collect())
    }

    async fn insert_message(&self, message: NewMessage) -> EngineResult<Message> {
        self.delay().await;
        let mut inner = self.lock();
        inner.take_fault(Fault::InsertMessage)?;
        if !inner.identities.contains_key(&message.recipient_id) {
            return Err(EngineError::RemoteRejection("unknown recipient".into()));
        }

        let stored = Message {
            id: MessageId::new(),
            sender_id: message.sender_id,
            recipient_id: message.recipient_id,
            ciphertext: message.ciphertext,
            sent_at: inner.next_timestamp(),
        };
        inner.messages.push(stored.clone());
        inner.broadcast(ChangeEvent::insert(Row::Message(stored.clone())));
        Ok(stored)
    }

    async fn upsert_receipts(&self, receipts: Vec<ReadReceipt>) -> EngineResult<()> {
        self.delay().await;
        let mut inner = self.lock();
        inner.take_fault(Fault::UpsertReceipts)?;
        for receipt in receipts {
            let key = (receipt.message_id.clone(), receipt.reader_id);
            let old = inner.receipts.insert(key, receipt.clone());
            let kind = if old.is_some() {
                ChangeKind::Update
            } else {
                ChangeKind::Insert
            };
            inner.broadcast(ChangeEvent {
                kind,
                row: Row::Receipt(receipt),
                old_row: old.map(Row::Receipt),
            });
        }
        Ok(())
    }

    async fn fetch_receipts(&self, message_ids: Vec<MessageId>) -> EngineResult<Vec<ReadReceipt>> {
        self.delay().await;
        let wanted: HashSet<_> = message_ids.into_iter().collect();
        Ok(self
            .lock()
            .receipts
            .values()
            .filter(|r| wanted.contains(&r.message_id))
            .cloned()
            .collect())
    }

    async fn upsert_typing(&self, signal: TypingSignal) -> EngineResult<()> {
        self.delay().await;
        let mut inner = self.lock();
        let old = inner
            .typing
            .insert((signal.user_id, signal.recipient_id), signal.clone());
        let kind = if old.is_some() {
            ChangeKind::Update
        } else {
            ChangeKind::Insert
        };
        inner.broadcast(ChangeEvent {
            kind,
            row: Row::Typing(signal),
            old_row: old.map(Row::Typing),
        });
        Ok(())
    }

    async fn delete_messages_for(&self, user: UserId) -> EngineResult<usize> {
        self.delay().await;
        Ok(self.lock().remove_messages_for(user))
    }

    async fn delete_identity(&self, id: UserId) -> EngineResult<()> {
        self.delay().await;
        self.lock().remove_identity(id);
        Ok(())
    }

    async fn subscribe(&self, self_id: UserId) -> EngineResult<mpsc::Receiver<ChangeEvent>> {
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        self.lock().subscribers.push((self_id, tx));
        Ok(rx)
    }
}

#[async_trait]
impl PresenceService for MemoryBackend {
    async fn track(&self, user: UserId) -> EngineResult<()> {
        self.delay().await;
        let mut inner = self.lock();
        if inner.members.insert(user) {
            inner.broadcast_presence();
        }
        Ok(())
    }

    async fn untrack(&self, user: UserId) -> EngineResult<()> {
        self.delay().await;
        let mut inner = self.lock();
        if inner.members.remove(&user) {
            inner.broadcast_presence();
        }
        Ok(())
    }

    async fn subscribe(&self) -> EngineResult<mpsc::Receiver<PresenceSync>> {
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let mut inner = self.lock();
        let _ = tx.try_send(PresenceSync {
            members: inner.members.clone(),
        });
        inner.presence_subscribers.push(tx);
        Ok(rx)
    }
}

impl TeardownBeacon for MemoryBackend {
    fn send(&self, user: UserId) {
        let mut inner = self.lock();
        inner.beacons.push(user);
        let removed = inner.teardown(user);
        debug!(user = %user.short(), removed, "teardown beacon processed");
    }
}
