//! Online status and typing indicators.
//!
//! Presence comes from two sources, the presence channel's membership and the
//! `online` / `last_seen_at` columns of identity rows. Whichever arrives last
//! wins.

use chrono::Utc;
use murmur_shared::models::{Identity, PresenceSync, TypingSignal};
use murmur_shared::types::UserId;

use crate::state::{ChatState, Draft};

/// Apply a membership snapshot of the presence channel.
pub fn apply_membership(state: &mut ChatState, sync: &PresenceSync) -> bool {
    let mut changed = false;
    for identity in &state.identities {
        let online = sync.members.contains(&identity.id);
        let status = state.presence.entry(identity.id).or_default();
        if status.online != online {
            status.online = online;
            changed = true;
        }
    }
    changed
}

/// Apply an identity row from a push event or a peer-list fetch.
pub fn apply_identity_row(state: &mut ChatState, identity: Identity) -> bool {
    let mut changed = false;
    if identity.id != state.self_id() {
        let status = state.presence.entry(identity.id).or_default();
        if status.online != identity.online || status.last_seen_at != identity.last_seen_at {
            status.online = identity.online;
            status.last_seen_at = identity.last_seen_at;
            changed = true;
        }
    }

    let known = if identity.id == state.self_id() {
        Some(&state.self_identity)
    } else {
        state.identity(identity.id)
    };
    if known != Some(&identity) {
        state.upsert_identity(identity);
        changed = true;
    }
    changed
}

/// Replace the peer list from a fetch.
pub fn apply_identity_list(state: &mut ChatState, identities: Vec<Identity>) -> bool {
    let before = (state.identities.clone(), state.presence.clone());
    let self_id = state.self_id();
    for identity in identities.iter().filter(|i| i.id != self_id) {
        let status = state.presence.entry(identity.id).or_default();
        status.online = identity.online;
        status.last_seen_at = identity.last_seen_at;
    }
    state.set_identities(identities);
    state
        .presence
        .retain(|id, _| state.identities.iter().any(|i| i.id == *id));
    (state.identities.clone(), state.presence.clone()) != before
}

/// What the outbound side should tell the store after a draft change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypingAction {
    /// Emit `is_typing = true` and restart the quiet timer
    Start,
    /// Emit `is_typing = false` and cancel the quiet timer
    Stop,
    Nothing,
}

pub fn on_draft_change(draft: &mut Draft, peer_selected: bool) -> TypingAction {
    if peer_selected && !draft.text.trim().is_empty() {
        draft.typing_active = true;
        TypingAction::Start
    } else if draft.typing_active {
        draft.typing_active = false;
        TypingAction::Stop
    } else {
        TypingAction::Nothing
    }
}

/// The quiet period elapsed, a send happened, or the conversation changed.
///
/// Returns whether a `false` signal needs to go out.
pub fn stop_typing(draft: &mut Draft) -> bool {
    std::mem::replace(&mut draft.typing_active, false)
}

pub fn typing_signal(self_id: UserId, peer: UserId, is_typing: bool) -> TypingSignal {
    TypingSignal {
        user_id: self_id,
        recipient_id: peer,
        is_typing,
        updated_at: Utc::now(),
    }
}

/// Project an inbound typing signal.
///
/// Returns `None` when the signal is not addressed to us, otherwise the new
/// typing value of the sender.
pub fn apply_typing(state: &mut ChatState, signal: &TypingSignal) -> Option<bool> {
    if signal.recipient_id != state.self_id() || signal.user_id == state.self_id() {
        return None;
    }
    state.presence.entry(signal.user_id).or_default().typing = signal.is_typing;
    Some(signal.is_typing)
}

/// Drop a typing indicator that was not refreshed in time.
pub fn expire_typing(state: &mut ChatState, user: UserId) -> bool {
    match state.presence.get_mut(&user) {
        Some(status) if status.typing => {
            status.typing = false;
            true
        }
        _ => false,
    }
}
