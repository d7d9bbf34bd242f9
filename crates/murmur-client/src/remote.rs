//! Ports to the remote services the engine synchronizes with.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use murmur_shared::models::{
    ChangeEvent, Identity, IdentityPatch, Message, NewMessage, PresenceSync, ReadReceipt,
    TypingSignal,
};
use murmur_shared::types::{MessageId, UserId};
use tokio::sync::mpsc;

use crate::error::EngineResult;

/// Remote append-only message log plus the identity, receipt and typing
/// tables.
#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn find_identity_by_name(&self, display_name: &str) -> EngineResult<Option<Identity>>;

    /// Create an identity; the store assigns `id` and `created_at`.
    async fn insert_identity(&self, display_name: &str, public_key: &str) -> EngineResult<Identity>;

    async fn update_identity(&self, id: UserId, patch: IdentityPatch) -> EngineResult<()>;

    /// All identities, ordered by display name
    async fn list_identities(&self) -> EngineResult<Vec<Identity>>;

    /// Messages between `a` and `b` in either direction, ordered by `sent_at`
    async fn fetch_conversation(&self, a: UserId, b: UserId) -> EngineResult<Vec<Message>>;

    /// Append a message; the store assigns `id` and `sent_at`.
    async fn insert_message(&self, message: NewMessage) -> EngineResult<Message>;

    /// Idempotent on `(message_id, reader_id)`
    async fn upsert_receipts(&self, receipts: Vec<ReadReceipt>) -> EngineResult<()>;

    async fn fetch_receipts(&self, message_ids: Vec<MessageId>) -> EngineResult<Vec<ReadReceipt>>;

    /// Idempotent on `(user_id, recipient_id)`
    async fn upsert_typing(&self, signal: TypingSignal) -> EngineResult<()>;

    /// Delete every message sent or received by `user`. Returns the count.
    async fn delete_messages_for(&self, user: UserId) -> EngineResult<usize>;

    async fn delete_identity(&self, id: UserId) -> EngineResult<()>;

    /// Push stream of row changes relevant to `self_id`
    async fn subscribe(&self, self_id: UserId) -> EngineResult<mpsc::Receiver<ChangeEvent>>;
}

/// Ephemeral channel of currently connected users.
#[async_trait]
pub trait PresenceService: Send + Sync {
    async fn track(&self, user: UserId) -> EngineResult<()>;
    async fn untrack(&self, user: UserId) -> EngineResult<()>;
    async fn subscribe(&self) -> EngineResult<mpsc::Receiver<PresenceSync>>;
}

/// Fire-and-forget account teardown request, usable while the process exits.
pub trait TeardownBeacon: Send + Sync {
    fn send(&self, user: UserId);
}

/// The remote side of the engine.
#[derive(Clone)]
pub struct Remote {
    pub store: Arc<dyn MessageStore>,
    pub presence: Arc<dyn PresenceService>,
    pub beacon: Arc<dyn TeardownBeacon>,
}

/// Run `fut` with an upper bound; elapsing is a transient error.
pub async fn bounded<T, F>(limit: Duration, fut: F) -> EngineResult<T>
where
    F: Future<Output = EngineResult<T>>,
{
    tokio::time::timeout(limit, fut).await?
}
