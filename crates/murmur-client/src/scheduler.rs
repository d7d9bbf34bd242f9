//! Self-rescheduling sync loops.
//!
//! Each loop runs in its own task, owns its [`Backoff`] and reports results to
//! the actor queue. The loops keep polling while push subscriptions are
//! healthy; merge is idempotent so the overlap is harmless.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use murmur_shared::models::{Identity, IdentityPatch, Message, ReadReceipt};
use murmur_shared::types::{MessageId, UserId};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::engine::EngineEvent;
use crate::error::EngineResult;
use crate::remote::{bounded, MessageStore};

/// Multiplicative retry delay with an upper bound.
#[derive(Debug, Clone, PartialEq)]
pub struct Backoff {
    initial: Duration,
    multiplier: f64,
    cap: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, multiplier: f64, cap: Duration) -> Self {
        Self {
            initial,
            multiplier,
            cap,
            current: initial,
        }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(
            config.backoff_initial,
            config.backoff_multiplier,
            config.backoff_cap,
        )
    }

    /// Delay before the next attempt
    pub fn delay(&self) -> Duration {
        self.current
    }

    pub fn on_success(&mut self) {
        self.current = self.initial;
    }

    /// Grow the delay and return it
    pub fn on_failure(&mut self) -> Duration {
        self.current = self.current.mul_f64(self.multiplier).min(self.cap);
        self.current
    }
}

/// One polled view of a conversation.
#[derive(Debug, Clone)]
pub struct ConversationSnapshot {
    pub peer: UserId,
    pub messages: Vec<Message>,
    /// Receipts for the self-authored messages in `messages`
    pub receipts: Vec<ReadReceipt>,
}

pub async fn fetch_identities(
    store: &dyn MessageStore,
    limit: Duration,
) -> EngineResult<Vec<Identity>> {
    bounded(limit, store.list_identities()).await
}

pub async fn fetch_conversation(
    store: &dyn MessageStore,
    limit: Duration,
    self_id: UserId,
    peer: UserId,
) -> EngineResult<ConversationSnapshot> {
    let messages = bounded(limit, store.fetch_conversation(self_id, peer)).await?;

    let own: Vec<MessageId> = messages
        .iter()
        .filter(|m| m.sender_id == self_id)
        .map(|m| m.id.clone())
        .collect();
    let receipts = if own.is_empty() {
        Vec::new()
    } else {
        bounded(limit, store.fetch_receipts(own)).await?
    };

    Ok(ConversationSnapshot {
        peer,
        messages,
        receipts,
    })
}

/// Initial peer-list fetch with a fixed number of retries, then polling with
/// backoff forever.
pub async fn peer_list_loop(
    store: Arc<dyn MessageStore>,
    config: EngineConfig,
    events: mpsc::Sender<EngineEvent>,
) {
    let mut last_error = None;
    for attempt in 1..=config.initial_fetch_retries {
        match fetch_identities(store.as_ref(), config.fetch_timeout).await {
            Ok(identities) => {
                info!(count = identities.len(), "peer list loaded");
                if events.send(EngineEvent::PeersFetched(identities)).await.is_err() {
                    return;
                }
                last_error = None;
                break;
            }
            Err(e) => {
                warn!(
                    attempt,
                    max_attempts = config.initial_fetch_retries,
                    error = %e,
                    "initial peer fetch failed"
                );
                last_error = Some(e);
                if attempt < config.initial_fetch_retries {
                    tokio::time::sleep(config.initial_fetch_retry_delay).await;
                }
            }
        }
    }

    if let Some(e) = last_error {
        if events.send(EngineEvent::InitialPeersFailed(e)).await.is_err() {
            return;
        }
    }

    let mut backoff = Backoff::from_config(&config);
    loop {
        tokio::time::sleep(backoff.delay()).await;
        match fetch_identities(store.as_ref(), config.fetch_timeout).await {
            Ok(identities) => {
                backoff.on_success();
                if events.send(EngineEvent::PeersFetched(identities)).await.is_err() {
                    return;
                }
            }
            Err(e) => {
                let next = backoff.on_failure();
                warn!(error = %e, next_delay_ms = next.as_millis() as u64, "peer list poll failed");
            }
        }
    }
}

/// Poll the selected conversation. Waits at the current delay while nothing
/// is selected.
pub async fn conversation_loop(
    store: Arc<dyn MessageStore>,
    config: EngineConfig,
    self_id: UserId,
    mut selected: watch::Receiver<Option<UserId>>,
    events: mpsc::Sender<EngineEvent>,
) {
    let mut backoff = Backoff::from_config(&config);
    loop {
        tokio::time::sleep(backoff.delay()).await;
        if selected.has_changed().is_err() {
            debug!("selection channel closed, stopping conversation poll");
            return;
        }
        let current = *selected.borrow_and_update();
        let Some(peer) = current else {
            continue;
        };

        match fetch_conversation(store.as_ref(), config.fetch_timeout, self_id, peer).await {
            Ok(snapshot) => {
                backoff.on_success();
                if events
                    .send(EngineEvent::ConversationFetched(snapshot))
                    .await
                    .is_err()
                {
                    return;
                }
            }
            Err(e) => {
                let next = backoff.on_failure();
                warn!(
                    peer = %peer.short(),
                    error = %e,
                    next_delay_ms = next.as_millis() as u64,
                    "conversation poll failed"
                );
            }
        }
    }
}

/// Refresh `last_seen_at` every `config.heartbeat_interval`.
pub async fn heartbeat_loop(store: Arc<dyn MessageStore>, config: EngineConfig, self_id: UserId) {
    let mut ticker = tokio::time::interval(config.heartbeat_interval);
    // the first tick completes immediately; connect already stamped last_seen_at
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let patch = IdentityPatch::heartbeat(Utc::now());
        match bounded(config.transport_timeout, store.update_identity(self_id, patch)).await {
            Ok(()) => debug!("heartbeat sent"),
            Err(e) => warn!(error = %e, "heartbeat failed"),
        }
    }
}

/// Forced one-off fetch, used after user-list change notifications.
pub async fn refresh_peers(
    store: Arc<dyn MessageStore>,
    limit: Duration,
    events: mpsc::Sender<EngineEvent>,
) {
    match fetch_identities(store.as_ref(), limit).await {
        Ok(identities) => {
            let _ = events.send(EngineEvent::PeersFetched(identities)).await;
        }
        Err(e) => warn!(error = %e, "forced peer refresh failed"),
    }
}

/// One-off fetch right after a conversation is selected.
pub async fn refresh_conversation(
    store: Arc<dyn MessageStore>,
    limit: Duration,
    self_id: UserId,
    peer: UserId,
    events: mpsc::Sender<EngineEvent>,
) {
    match fetch_conversation(store.as_ref(), limit, self_id, peer).await {
        Ok(snapshot) => {
            let _ = events.send(EngineEvent::ConversationFetched(snapshot)).await;
        }
        Err(e) => warn!(peer = %peer.short(), error = %e, "conversation fetch failed"),
    }
}
