//! Optimistic send pipeline.
//!
//! `Pending -> Encrypting -> Submitted -> Confirmed | Failed`. The actor runs
//! [`begin_send`] synchronously, [`submit`] runs in a spawned task and reports
//! every transition back as a [`SendUpdate`].

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use murmur_shared::crypto::encrypt_for;
use murmur_shared::models::{Message, MessageContent, NewMessage, ResolvedMessage};
use murmur_shared::types::{ConversationKey, MessageId, UserId};
use murmur_store::ConversationCache;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use crate::engine::EngineEvent;
use crate::error::{EngineError, EngineResult};
use crate::reconcile::{echo, insert_sorted, persist};
use crate::remote::{bounded, MessageStore};
use crate::state::{ChatState, PendingSend, SendState};

/// Everything the send task needs; plaintext never leaves it unencrypted.
#[derive(Debug, Clone)]
pub struct SendRequest {
    pub local_id: MessageId,
    pub sender_id: UserId,
    pub recipient_id: UserId,
    pub recipient_key: String,
    pub plaintext: String,
}

#[derive(Debug, Clone)]
pub enum SendUpdate {
    Progress { local_id: MessageId, state: SendState },
    Confirmed { local_id: MessageId, message: Message },
    Failed { local_id: MessageId, error: EngineError },
}

/// Validate the draft and show the optimistic echo.
///
/// Returns `Ok(None)` when there is nothing to send.
pub fn begin_send(state: &mut ChatState) -> EngineResult<Option<SendRequest>> {
    let Some(peer) = state.selected_peer else {
        return Ok(None);
    };
    let text = state.draft.text.trim().to_string();
    if text.is_empty() {
        return Ok(None);
    }

    let recipient_key = match state.identity(peer) {
        Some(identity) if !identity.public_key.trim().is_empty() => identity.public_key.clone(),
        _ => {
            return Err(EngineError::RemoteRejection(
                "recipient has no public key".into(),
            ))
        }
    };

    let self_id = state.self_id();
    state.draft.text.clear();
    let pending = PendingSend {
        local_id: MessageId::temporary(),
        peer_id: peer,
        plaintext: text.clone(),
        created_at: Utc::now(),
        state: SendState::Pending,
    };
    insert_sorted(&mut state.messages, echo(self_id, &pending));

    let request = SendRequest {
        local_id: pending.local_id.clone(),
        sender_id: self_id,
        recipient_id: peer,
        recipient_key,
        plaintext: text,
    };
    debug!(local_id = %pending.local_id, peer = %peer.short(), "send queued");
    state.pending.push(pending);
    Ok(Some(request))
}

/// Encrypt and submit `request`, reporting each transition to the actor.
pub async fn submit(
    store: Arc<dyn MessageStore>,
    request: SendRequest,
    limit: Duration,
    events: mpsc::Sender<EngineEvent>,
) {
    let local_id = request.local_id.clone();
    let report = |update: SendUpdate| {
        let events = events.clone();
        async move {
            // actor gone means the session ended
            let _ = events.send(EngineEvent::Send(update)).await;
        }
    };

    report(SendUpdate::Progress {
        local_id: local_id.clone(),
        state: SendState::Encrypting,
    })
    .await;

    let ciphertext = match encrypt_for(&request.plaintext, &request.recipient_key) {
        Ok(ciphertext) => ciphertext,
        Err(e) => {
            report(SendUpdate::Failed {
                local_id,
                error: e.into(),
            })
            .await;
            return;
        }
    };

    report(SendUpdate::Progress {
        local_id: local_id.clone(),
        state: SendState::Submitted,
    })
    .await;

    let insert = store.insert_message(NewMessage {
        sender_id: request.sender_id,
        recipient_id: request.recipient_id,
        ciphertext,
    });
    let update = match bounded(limit, insert).await {
        Ok(message) => SendUpdate::Confirmed { local_id, message },
        Err(error) => SendUpdate::Failed { local_id, error },
    };
    report(update).await;
}

/// Apply a transition reported by [`submit`]. Returns whether state changed.
pub fn apply_update(state: &mut ChatState, cache: &mut ConversationCache, update: SendUpdate) -> bool {
    match update {
        SendUpdate::Progress { local_id, state: next } => {
            match state.pending.iter_mut().find(|p| p.local_id == local_id) {
                Some(pending) if pending.state != next => {
                    pending.state = next;
                    true
                }
                _ => false,
            }
        }
        SendUpdate::Confirmed { local_id, message } => confirm_send(state, cache, &local_id, message),
        SendUpdate::Failed { local_id, error } => fail_send(state, &local_id, &error),
    }
}

/// Replace the optimistic echo with the stored message.
pub fn confirm_send(
    state: &mut ChatState,
    cache: &mut ConversationCache,
    local_id: &MessageId,
    message: Message,
) -> bool {
    let Some(pos) = state.pending.iter().position(|p| &p.local_id == local_id) else {
        return false;
    };
    let pending = state.pending.remove(pos);

    info!(local_id = %local_id, id = %message.id, "message confirmed");

    let self_id = state.self_id();
    let key = ConversationKey::new(self_id, pending.peer_id);
    state
        .confirmed_sends
        .insert(message.id.clone(), pending.plaintext.clone());
    state.unsnapshotted.insert(message.id.clone());
    let confirmed = ResolvedMessage::new(message, MessageContent::Plain(pending.plaintext));

    if state.selected_peer == Some(pending.peer_id) {
        state
            .messages
            .retain(|m| m.id() != local_id && m.id() != confirmed.id());
        insert_sorted(&mut state.messages, confirmed);
        persist(cache, key, &state.messages);
    } else {
        let mut list = cache.get(&key);
        list.retain(|m| m.id() != confirmed.id());
        list.push(confirmed);
        persist(cache, key, &list);
    }
    true
}

/// Drop the echo, restore the draft and tell the user.
pub fn fail_send(state: &mut ChatState, local_id: &MessageId, error: &EngineError) -> bool {
    let Some(pos) = state.pending.iter().position(|p| &p.local_id == local_id) else {
        return false;
    };
    let mut pending = state.pending.remove(pos);
    pending.state = SendState::Failed;

    error!(local_id = %local_id, state = ?pending.state, error = %error, "message not sent");

    state.messages.retain(|m| m.id() != local_id);
    if state.selected_peer == Some(pending.peer_id) && state.draft.text.trim().is_empty() {
        state.draft.text = pending.plaintext;
    }
    state.notice = Some(format!("Message not sent: {error}"));
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{Fault, MemoryBackend};
    use murmur_shared::keys::KeyPair;
    use murmur_shared::models::Identity;
    use murmur_store::{CacheLimits, MemoryStorage};

    fn identity(name: &str, key: String) -> Identity {
        Identity {
            id: UserId::new(),
            display_name: name.into(),
            public_key: key,
            online: true,
            last_seen_at: None,
            created_at: Utc::now(),
        }
    }

    fn state_with_peer(peer_key: &str) -> ChatState {
        let mut state = ChatState::new(identity("me", "mine".into()));
        let peer = identity("peer", peer_key.into());
        state.selected_peer = Some(peer.id);
        state.set_identities(vec![peer]);
        state
    }

    fn cache() -> ConversationCache {
        ConversationCache::new(Box::new(MemoryStorage::new()), CacheLimits::default())
    }

    #[test]
    fn test_begin_send_shows_echo_and_clears_draft() {
        let mut state = state_with_peer(&KeyPair::generate().public_key_b64());
        state.draft.text = "  hello  ".into();

        let request = begin_send(&mut state).unwrap().unwrap();
        assert_eq!(request.plaintext, "hello");
        assert!(request.local_id.is_temporary());
        assert!(state.draft.text.is_empty());
        assert_eq!(state.messages.len(), 1);
        assert_eq!(state.messages[0].content.plaintext(), Some("hello"));
        assert!(state.is_sending());
    }

    #[test]
    fn test_begin_send_ignores_blank_draft() {
        let mut state = state_with_peer("key");
        state.draft.text = "   ".into();
        assert!(begin_send(&mut state).unwrap().is_none());
        assert!(state.messages.is_empty());
    }

    #[test]
    fn test_begin_send_rejects_peer_without_key() {
        let mut state = state_with_peer("");
        state.draft.text = "hello".into();
        assert!(matches!(
            begin_send(&mut state),
            Err(EngineError::RemoteRejection(_))
        ));
        assert_eq!(state.draft.text, "hello");
        assert!(state.pending.is_empty());
    }

    #[test]
    fn test_failed_send_restores_draft() {
        let mut state = state_with_peer("key");
        state.draft.text = "hello".into();
        let request = begin_send(&mut state).unwrap().unwrap();

        let error = EngineError::RemoteRejection("nope".into());
        assert!(fail_send(&mut state, &request.local_id, &error));

        assert_eq!(state.draft.text, "hello");
        assert!(state.messages.iter().all(|m| !m.id().is_temporary()));
        assert!(state.pending.is_empty());
        assert!(state.notice.as_deref().unwrap().contains("nope"));
    }

    #[test]
    fn test_confirm_replaces_echo() {
        let mut state = state_with_peer("key");
        let mut cache = cache();
        state.draft.text = "hello".into();
        let request = begin_send(&mut state).unwrap().unwrap();

        let stored = Message {
            id: MessageId::new(),
            sender_id: request.sender_id,
            recipient_id: request.recipient_id,
            ciphertext: "ct".into(),
            sent_at: Utc::now(),
        };
        assert!(confirm_send(&mut state, &mut cache, &request.local_id, stored.clone()));

        assert_eq!(state.messages.len(), 1);
        assert_eq!(state.messages[0].id(), &stored.id);
        assert_eq!(state.messages[0].content.plaintext(), Some("hello"));
        let key = ConversationKey::new(request.sender_id, request.recipient_id);
        assert_eq!(cache.get(&key).len(), 1);
        assert_eq!(state.confirmed_sends.get(&stored.id).map(String::as_str), Some("hello"));
        // a late failure report for the same send is ignored
        assert!(!fail_send(&mut state, &request.local_id, &EngineError::TransientIo("x".into())));
    }

    #[tokio::test]
    async fn test_submit_reports_each_transition() {
        let backend = MemoryBackend::new();
        let keys = KeyPair::generate();
        let me = backend.insert_identity("me", "k").await.unwrap();
        let peer = backend.insert_identity("peer", &keys.public_key_b64()).await.unwrap();
        let (tx, mut rx) = mpsc::channel(8);

        let request = SendRequest {
            local_id: MessageId::temporary(),
            sender_id: me.id,
            recipient_id: peer.id,
            recipient_key: keys.public_key_b64(),
            plaintext: "hi".into(),
        };
        submit(Arc::new(backend.clone()), request, Duration::from_secs(1), tx).await;

        let mut states = Vec::new();
        while let Ok(EngineEvent::Send(update)) = rx.try_recv() {
            states.push(match update {
                SendUpdate::Progress { state, .. } => state,
                SendUpdate::Confirmed { .. } => SendState::Confirmed,
                SendUpdate::Failed { .. } => SendState::Failed,
            });
        }
        assert_eq!(
            states,
            [SendState::Encrypting, SendState::Submitted, SendState::Confirmed]
        );
        assert_eq!(backend.messages().len(), 1);
    }

    #[tokio::test]
    async fn test_submit_reports_rejection() {
        let backend = MemoryBackend::new();
        backend.fail_next(Fault::InsertMessage, 1);
        let (tx, mut rx) = mpsc::channel(8);
        let request = SendRequest {
            local_id: MessageId::temporary(),
            sender_id: UserId::new(),
            recipient_id: UserId::new(),
            recipient_key: KeyPair::generate().public_key_b64(),
            plaintext: "hi".into(),
        };
        submit(Arc::new(backend), request, Duration::from_secs(1), tx).await;

        let mut last = None;
        while let Ok(EngineEvent::Send(update)) = rx.try_recv() {
            last = Some(update);
        }
        assert!(matches!(
            last,
            Some(SendUpdate::Failed {
                error: EngineError::RemoteRejection(_),
                ..
            })
        ));
    }
}
