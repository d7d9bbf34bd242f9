//! Rows exchanged with the remote message store, plus the locally resolved
//! message form that carries plaintext and never leaves the device.

use std::cmp::Ordering;
use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::constants::{UNAVAILABLE_PLACEHOLDER, UNDECRYPTABLE_PLACEHOLDER};
use crate::types::{MessageId, UserId};

// ---------------------------------------------------------------------------
// Remote rows
// ---------------------------------------------------------------------------

/// A registered user.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Identity {
    pub id: UserId,
    pub display_name: String,
    /// Base64 X25519 public key. Overwritten on every login.
    pub public_key: String,
    pub online: bool,
    pub last_seen_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Partial update of an identity row. `None` fields are left unchanged.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct IdentityPatch {
    pub public_key: Option<String>,
    pub online: Option<bool>,
    pub last_seen_at: Option<DateTime<Utc>>,
}

impl IdentityPatch {
    pub fn presence(online: bool, at: DateTime<Utc>) -> Self {
        Self {
            online: Some(online),
            last_seen_at: Some(at),
            ..Default::default()
        }
    }

    pub fn heartbeat(at: DateTime<Utc>) -> Self {
        Self {
            last_seen_at: Some(at),
            ..Default::default()
        }
    }

    pub fn apply_to(&self, identity: &mut Identity) {
        if let Some(ref key) = self.public_key {
            identity.public_key = key.clone();
        }
        if let Some(online) = self.online {
            identity.online = online;
        }
        if self.last_seen_at.is_some() {
            identity.last_seen_at = self.last_seen_at;
        }
    }
}

/// A message as accepted by the remote store. Content is always ciphertext.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    pub id: MessageId,
    pub sender_id: UserId,
    pub recipient_id: UserId,
    /// Base64 output of `crypto::encrypt_for`
    pub ciphertext: String,
    pub sent_at: DateTime<Utc>,
}

impl Message {
    /// Whether this message belongs to the conversation between `a` and `b`
    pub fn is_between(&self, a: UserId, b: UserId) -> bool {
        (self.sender_id == a && self.recipient_id == b)
            || (self.sender_id == b && self.recipient_id == a)
    }

    /// The participant that is not `self_id`
    pub fn peer_of(&self, self_id: UserId) -> UserId {
        if self.sender_id == self_id {
            self.recipient_id
        } else {
            self.sender_id
        }
    }
}

/// Insert payload for a message; the store assigns `id` and `sent_at`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NewMessage {
    pub sender_id: UserId,
    pub recipient_id: UserId,
    pub ciphertext: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReadReceipt {
    pub message_id: MessageId,
    pub reader_id: UserId,
    pub read_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TypingSignal {
    pub user_id: UserId,
    pub recipient_id: UserId,
    pub is_typing: bool,
    pub updated_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Push notifications
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

/// A row of one of the store's tables. The variant names the table.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum Row {
    Identity(Identity),
    Message(Message),
    Receipt(ReadReceipt),
    Typing(TypingSignal),
}

/// Push-subscription event delivered by the message store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChangeEvent {
    pub kind: ChangeKind,
    pub row: Row,
    pub old_row: Option<Row>,
}

impl ChangeEvent {
    pub fn insert(row: Row) -> Self {
        Self {
            kind: ChangeKind::Insert,
            row,
            old_row: None,
        }
    }
}

/// Current membership of the presence channel.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PresenceSync {
    pub members: HashSet<UserId>,
}

// ---------------------------------------------------------------------------
// Locally resolved messages
// ---------------------------------------------------------------------------

/// What the UI shows for a message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", content = "text", rename_all = "snake_case")]
pub enum MessageContent {
    Plain(String),
    /// Received but could not be decrypted with the local key.
    Undecryptable,
    /// Self-authored, but the plaintext is not cached on this device.
    Unavailable,
}

impl MessageContent {
    pub fn display_text(&self) -> &str {
        match self {
            MessageContent::Plain(text) => text,
            MessageContent::Undecryptable => UNDECRYPTABLE_PLACEHOLDER,
            MessageContent::Unavailable => UNAVAILABLE_PLACEHOLDER,
        }
    }

    pub fn plaintext(&self) -> Option<&str> {
        match self {
            MessageContent::Plain(text) => Some(text),
            _ => None,
        }
    }
}

/// A message together with its locally derived content.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResolvedMessage {
    #[serde(flatten)]
    pub message: Message,
    pub content: MessageContent,
}

impl ResolvedMessage {
    pub fn new(message: Message, content: MessageContent) -> Self {
        Self { message, content }
    }

    pub fn id(&self) -> &MessageId {
        &self.message.id
    }

    /// Total order used for every displayed message list
    pub fn cmp_order(&self, other: &Self) -> Ordering {
        self.message
            .sent_at
            .cmp(&other.message.sent_at)
            .then_with(|| self.message.id.cmp(&other.message.id))
    }
}

/// Sort by `(sent_at, id)`
pub fn sort_messages(messages: &mut [ResolvedMessage]) {
    messages.sort_by(ResolvedMessage::cmp_order);
}
