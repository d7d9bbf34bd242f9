//! The engine actor.
//!
//! [`ChatEngine`] owns the [`ChatState`] and the [`ConversationCache`] and is
//! the only code that mutates them. Everything slow (network calls, send-path
//! crypto, polling, timers) runs in spawned tasks that report back through the
//! event queue, so a handler never works from a stale read of the state.

use std::future::Future;
use std::sync::Arc;

use chrono::Utc;
use murmur_shared::keys::PrivateKey;
use murmur_shared::models::{
    ChangeEvent, ChangeKind, Identity, IdentityPatch, PresenceSync, ReadReceipt, Row,
};
use murmur_shared::types::UserId;
use murmur_store::{ConversationCache, LocalStorage};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::outbound::{apply_update, begin_send, submit, SendUpdate};
use crate::presence::{
    apply_identity_list, apply_identity_row, apply_membership, apply_typing, expire_typing,
    on_draft_change, stop_typing, typing_signal, TypingAction,
};
use crate::reconcile::{
    apply_pushed_message, apply_receipts, merge_batch, open_conversation, remove_message,
};
use crate::remote::{bounded, Remote, TeardownBeacon};
use crate::scheduler::{
    conversation_loop, heartbeat_loop, peer_list_loop, refresh_conversation, refresh_peers,
    ConversationSnapshot,
};
use crate::session::Session;
use crate::state::ChatState;
use crate::timers::{TimerKind, Timers};

const QUEUE_DEPTH: usize = 256;

// ---------------------------------------------------------------------------
// Command / event types
// ---------------------------------------------------------------------------

/// User intents sent *into* the engine.
#[derive(Debug)]
pub enum EngineCommand {
    /// Open the conversation with a peer, or close the current one.
    SelectConversation(Option<UserId>),
    /// Replace the draft of the selected conversation.
    SetDraft(String),
    /// Send the current draft to the selected peer.
    SendMessage,
    SetSearchQuery(String),
    /// Clear the user-visible notice.
    DismissNotice,
    /// Tear the account down, then reply and stop.
    Logout(oneshot::Sender<()>),
    /// Go offline and stop, keeping the account.
    Shutdown,
}

/// Results reported by the engine's own tasks.
#[derive(Debug)]
pub enum EngineEvent {
    PeersFetched(Vec<Identity>),
    /// The initial peer-list retries were exhausted.
    InitialPeersFailed(EngineError),
    ConversationFetched(ConversationSnapshot),
    /// Row change pushed by the message store.
    Change(ChangeEvent),
    /// Membership snapshot pushed by the presence channel.
    Presence(PresenceSync),
    Send(SendUpdate),
    TimerFired { kind: TimerKind, generation: u64 },
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub struct ChatEngine {
    state: ChatState,
    cache: ConversationCache,
    private_key: PrivateKey,
    remote: Remote,
    config: EngineConfig,
    commands: mpsc::Receiver<EngineCommand>,
    events: mpsc::Receiver<EngineEvent>,
    events_tx: mpsc::Sender<EngineEvent>,
    state_tx: watch::Sender<ChatState>,
    selected_tx: watch::Sender<Option<UserId>>,
    timers: Timers,
    tasks: Vec<JoinHandle<()>>,
}

impl ChatEngine {
    /// Connect `session` and run the engine in a background task.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(
        session: Session,
        remote: Remote,
        storage: Box<dyn LocalStorage>,
        config: EngineConfig,
    ) -> EngineHandle {
        let (cmd_tx, cmd_rx) = mpsc::channel(QUEUE_DEPTH);
        let (events_tx, events_rx) = mpsc::channel(QUEUE_DEPTH);
        let state = ChatState::new(session.identity.clone());
        let (state_tx, state_rx) = watch::channel(state.clone());
        let (selected_tx, selected_rx) = watch::channel(None);
        let self_id = session.identity.id;

        let mut engine = ChatEngine {
            state,
            cache: ConversationCache::new(storage, config.cache_limits),
            private_key: session.private_key(),
            remote: remote.clone(),
            config,
            commands: cmd_rx,
            events: events_rx,
            events_tx: events_tx.clone(),
            state_tx,
            selected_tx,
            timers: Timers::new(events_tx),
            tasks: Vec::new(),
        };
        engine.start(selected_rx);
        tokio::spawn(engine.run());

        EngineHandle {
            commands: cmd_tx,
            state: state_rx,
            self_id,
            beacon: remote.beacon,
        }
    }

    /// Connect and start the subscription forwarders and sync loops.
    fn start(&mut self, selected: watch::Receiver<Option<UserId>>) {
        let self_id = self.state.self_id();
        info!(user = %self_id.short(), "engine starting");

        let store = self.remote.store.clone();
        let presence = self.remote.presence.clone();
        let limit = self.config.transport_timeout;
        self.spawn_task(async move {
            let patch = IdentityPatch::presence(true, Utc::now());
            if let Err(e) = bounded(limit, store.update_identity(self_id, patch)).await {
                warn!(error = %e, "failed to mark self online");
            }
            if let Err(e) = bounded(limit, presence.track(self_id)).await {
                warn!(error = %e, "failed to track presence");
            }
        });

        let store = self.remote.store.clone();
        let tx = self.events_tx.clone();
        self.spawn_task(async move {
            let mut changes = match store.subscribe(self_id).await {
                Ok(rx) => rx,
                Err(e) => {
                    warn!(error = %e, "change subscription failed, relying on polling");
                    return;
                }
            };
            while let Some(change) = changes.recv().await {
                if tx.send(EngineEvent::Change(change)).await.is_err() {
                    break;
                }
            }
            debug!("change subscription closed");
        });

        let presence = self.remote.presence.clone();
        let tx = self.events_tx.clone();
        self.spawn_task(async move {
            let mut syncs = match presence.subscribe().await {
                Ok(rx) => rx,
                Err(e) => {
                    warn!(error = %e, "presence subscription failed");
                    return;
                }
            };
            while let Some(sync) = syncs.recv().await {
                if tx.send(EngineEvent::Presence(sync)).await.is_err() {
                    break;
                }
            }
            debug!("presence subscription closed");
        });

        let store = self.remote.store.clone();
        self.spawn_task(heartbeat_loop(store, self.config.clone(), self_id));

        let store = self.remote.store.clone();
        let tx = self.events_tx.clone();
        self.spawn_task(peer_list_loop(store, self.config.clone(), tx));

        let store = self.remote.store.clone();
        let tx = self.events_tx.clone();
        self.spawn_task(conversation_loop(store, self.config.clone(), self_id, selected, tx));
    }

    async fn run(mut self) {
        loop {
            tokio::select! {
                // --- User intents ---
                cmd = self.commands.recv() => {
                    match cmd {
                        Some(EngineCommand::Logout(reply)) => {
                            self.teardown().await;
                            let _ = reply.send(());
                            break;
                        }
                        Some(EngineCommand::Shutdown) => {
                            info!("engine shutdown requested");
                            self.disconnect().await;
                            break;
                        }
                        Some(command) => self.handle_command(command),
                        None => {
                            // every handle dropped
                            info!("command channel closed, stopping engine");
                            self.disconnect().await;
                            break;
                        }
                    }
                }

                // --- Task results and pushes ---
                Some(event) = self.events.recv() => self.handle_event(event),
            }
            self.forget_evicted();
            self.publish();
        }
        info!("engine stopped");
    }

    fn publish(&mut self) {
        let state = &self.state;
        self.state_tx.send_if_modified(|published| {
            if *published == *state {
                return false;
            }
            *published = state.clone();
            true
        });
    }

    fn forget_evicted(&mut self) {
        for key in self.cache.take_evicted() {
            if self.state.selected_peer != Some(key.peer_id) {
                self.state.forget_conversation(key.peer_id);
            }
        }
    }

    fn spawn_task<F>(&mut self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.tasks.retain(|handle| !handle.is_finished());
        self.tasks.push(tokio::spawn(task));
    }

    // -----------------------------------------------------------------------
    // Commands
    // -----------------------------------------------------------------------

    fn handle_command(&mut self, command: EngineCommand) {
        match command {
            EngineCommand::SelectConversation(peer) => self.select(peer),
            EngineCommand::SetDraft(text) => self.set_draft(text),
            EngineCommand::SendMessage => self.send(),
            EngineCommand::SetSearchQuery(query) => self.state.set_search_query(query),
            EngineCommand::DismissNotice => self.state.notice = None,
            // handled by the run loop
            EngineCommand::Logout(_) | EngineCommand::Shutdown => {}
        }
    }

    fn select(&mut self, peer: Option<UserId>) {
        if self.state.selected_peer == peer {
            return;
        }

        if let Some(previous) = self.state.selected_peer {
            if stop_typing(&mut self.state.draft) {
                self.emit_typing(previous, false);
            }
        }
        self.timers.cancel(TimerKind::TypingQuiet);
        self.state.draft.text.clear();

        self.state.selected_peer = peer;
        self.selected_tx.send_replace(peer);

        match peer {
            Some(peer) => {
                debug!(peer = %peer.short(), "conversation selected");
                self.state.clear_unread(peer);
                open_conversation(&mut self.state, &mut self.cache, peer);
                self.spawn_task(refresh_conversation(
                    self.remote.store.clone(),
                    self.config.fetch_timeout,
                    self.state.self_id(),
                    peer,
                    self.events_tx.clone(),
                ));
            }
            None => self.state.messages.clear(),
        }
    }

    fn set_draft(&mut self, text: String) {
        self.state.draft.text = text;
        let peer = self.state.selected_peer;
        match on_draft_change(&mut self.state.draft, peer.is_some()) {
            TypingAction::Start => {
                if let Some(peer) = peer {
                    self.emit_typing(peer, true);
                }
                self.timers.start(TimerKind::TypingQuiet, self.config.typing_quiet);
            }
            TypingAction::Stop => {
                if let Some(peer) = peer {
                    self.emit_typing(peer, false);
                }
                self.timers.cancel(TimerKind::TypingQuiet);
            }
            TypingAction::Nothing => {}
        }
    }

    fn send(&mut self) {
        let request = match begin_send(&mut self.state) {
            Ok(Some(request)) => request,
            Ok(None) => return,
            Err(e) => {
                error!(error = %e, "message not sent");
                self.state.notice = Some(format!("Message not sent: {e}"));
                return;
            }
        };

        if stop_typing(&mut self.state.draft) {
            self.emit_typing(request.recipient_id, false);
        }
        self.timers.cancel(TimerKind::TypingQuiet);

        self.spawn_task(submit(
            self.remote.store.clone(),
            request,
            self.config.transport_timeout,
            self.events_tx.clone(),
        ));
    }

    fn emit_typing(&mut self, peer: UserId, is_typing: bool) {
        let store = self.remote.store.clone();
        let signal = typing_signal(self.state.self_id(), peer, is_typing);
        let limit = self.config.transport_timeout;
        self.spawn_task(async move {
            if let Err(e) = bounded(limit, store.upsert_typing(signal)).await {
                warn!(error = %e, is_typing, "failed to send typing signal");
            }
        });
    }

    fn send_receipts(&mut self, receipts: Vec<ReadReceipt>) {
        if receipts.is_empty() {
            return;
        }
        debug!(count = receipts.len(), "marking messages read");
        let store = self.remote.store.clone();
        let limit = self.config.transport_timeout;
        self.spawn_task(async move {
            if let Err(e) = bounded(limit, store.upsert_receipts(receipts)).await {
                warn!(error = %e, "failed to write read receipts");
            }
        });
    }

    // -----------------------------------------------------------------------
    // Events
    // -----------------------------------------------------------------------

    fn handle_event(&mut self, event: EngineEvent) {
        match event {
            EngineEvent::PeersFetched(identities) => {
                self.state.is_loading = false;
                apply_identity_list(&mut self.state, identities);
                if let Some(peer) = self.state.selected_peer {
                    if self.state.identity(peer).is_none() {
                        self.select(None);
                    }
                }
            }
            EngineEvent::InitialPeersFailed(e) => {
                self.state.is_loading = false;
                if self.state.identities.is_empty() {
                    error!(error = %e, "could not load the peer list");
                    self.state.notice = Some(format!("Could not load contacts: {e}"));
                } else {
                    warn!(error = %e, "initial peer fetch gave up, list already filled by a refresh");
                }
            }
            EngineEvent::ConversationFetched(snapshot) => {
                let merge = merge_batch(
                    &mut self.state,
                    &mut self.cache,
                    &self.private_key,
                    snapshot.peer,
                    snapshot.messages,
                );
                apply_receipts(&mut self.state, &snapshot.receipts);
                self.send_receipts(merge.receipts);
            }
            EngineEvent::Change(change) => self.handle_change(change),
            EngineEvent::Presence(sync) => {
                apply_membership(&mut self.state, &sync);
            }
            EngineEvent::Send(update) => {
                apply_update(&mut self.state, &mut self.cache, update);
            }
            EngineEvent::TimerFired { kind, generation } => {
                if self.timers.fired(kind, generation) {
                    self.handle_timer(kind);
                }
            }
        }
    }

    fn handle_change(&mut self, change: ChangeEvent) {
        let self_id = self.state.self_id();
        match (change.kind, change.row) {
            (ChangeKind::Delete, Row::Message(message)) => {
                remove_message(&mut self.state, &mut self.cache, &message);
            }
            (_, Row::Message(message)) => {
                let merge =
                    apply_pushed_message(&mut self.state, &mut self.cache, &self.private_key, message);
                self.send_receipts(merge.receipts);
            }
            (ChangeKind::Delete, Row::Identity(identity)) => {
                if identity.id == self_id {
                    warn!("own identity was deleted upstream");
                } else {
                    if self.state.selected_peer == Some(identity.id) {
                        self.select(None);
                    }
                    self.state.remove_identity(identity.id);
                }
                self.debounce_user_list();
            }
            (_, Row::Identity(identity)) => {
                apply_identity_row(&mut self.state, identity);
                self.debounce_user_list();
            }
            (_, Row::Receipt(receipt)) => {
                apply_receipts(&mut self.state, &[receipt]);
            }
            (_, Row::Typing(signal)) => match apply_typing(&mut self.state, &signal) {
                Some(true) => {
                    self.timers
                        .start(TimerKind::TypingExpiry(signal.user_id), self.config.typing_expiry);
                }
                Some(false) => self.timers.cancel(TimerKind::TypingExpiry(signal.user_id)),
                None => {}
            },
        }
    }

    fn debounce_user_list(&mut self) {
        self.timers
            .start(TimerKind::UserListDebounce, self.config.user_list_debounce);
    }

    fn handle_timer(&mut self, kind: TimerKind) {
        match kind {
            TimerKind::TypingQuiet => {
                if stop_typing(&mut self.state.draft) {
                    if let Some(peer) = self.state.selected_peer {
                        self.emit_typing(peer, false);
                    }
                }
            }
            TimerKind::TypingExpiry(user) => {
                if expire_typing(&mut self.state, user) {
                    debug!(peer = %user.short(), "typing indicator expired");
                }
            }
            TimerKind::UserListDebounce => {
                self.spawn_task(refresh_peers(
                    self.remote.store.clone(),
                    self.config.fetch_timeout,
                    self.events_tx.clone(),
                ));
            }
        }
    }

    // -----------------------------------------------------------------------
    // Shutdown
    // -----------------------------------------------------------------------

    fn stop_tasks(&mut self) {
        self.timers.cancel_all();
        for handle in self.tasks.drain(..) {
            handle.abort();
        }
    }

    /// Stop every task and go offline.
    async fn disconnect(&mut self) {
        self.stop_tasks();
        let self_id = self.state.self_id();
        let store = self.remote.store.clone();
        let presence = self.remote.presence.clone();
        let limit = self.config.transport_timeout;

        let patch = IdentityPatch::presence(false, Utc::now());
        step("mark offline", bounded(limit, store.update_identity(self_id, patch))).await;
        step("untrack presence", bounded(limit, presence.untrack(self_id))).await;
    }

    /// Disconnect, then delete the account and every local trace of it.
    ///
    /// Each step runs even if an earlier one failed.
    async fn teardown(&mut self) {
        let self_id = self.state.self_id();
        info!(user = %self_id.short(), "logging out");
        self.disconnect().await;

        let store = self.remote.store.clone();
        let limit = self.config.transport_timeout;
        match bounded(limit, store.delete_messages_for(self_id)).await {
            Ok(removed) => info!(removed, "messages deleted"),
            Err(e) => warn!(error = %e, "failed to delete messages"),
        }
        step("delete identity", bounded(limit, store.delete_identity(self_id))).await;

        if let Err(e) = self.cache.storage().clear_credentials() {
            warn!(error = %e, "failed to clear credentials");
        }
        if let Err(e) = self.cache.clear() {
            warn!(error = %e, "failed to clear conversation cache");
        }
        self.state.clear_history();
        info!("logout complete");
    }
}

async fn step(what: &'static str, fut: impl Future<Output = EngineResult<()>>) {
    match fut.await {
        Ok(()) => debug!(step = what, "teardown step done"),
        Err(e) => warn!(step = what, error = %e, "teardown step failed"),
    }
}

// ---------------------------------------------------------------------------
// Handle
// ---------------------------------------------------------------------------

/// Cloneable front end of a running engine.
///
/// Intents sent after the engine stopped are dropped.
#[derive(Clone)]
pub struct EngineHandle {
    commands: mpsc::Sender<EngineCommand>,
    state: watch::Receiver<ChatState>,
    self_id: UserId,
    beacon: Arc<dyn TeardownBeacon>,
}

impl EngineHandle {
    pub fn self_id(&self) -> UserId {
        self.self_id
    }

    /// The latest published state
    pub fn snapshot(&self) -> ChatState {
        self.state.borrow().clone()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ChatState> {
        self.state.clone()
    }

    pub async fn select_conversation(&self, peer: Option<UserId>) {
        self.command(EngineCommand::SelectConversation(peer)).await;
    }

    pub async fn set_draft(&self, text: impl Into<String>) {
        self.command(EngineCommand::SetDraft(text.into())).await;
    }

    pub async fn send_message(&self) {
        self.command(EngineCommand::SendMessage).await;
    }

    pub async fn set_search_query(&self, query: impl Into<String>) {
        self.command(EngineCommand::SetSearchQuery(query.into())).await;
    }

    pub async fn dismiss_notice(&self) {
        self.command(EngineCommand::DismissNotice).await;
    }

    /// Delete the account and stop the engine. Always completes.
    pub async fn logout(&self) {
        let (reply, done) = oneshot::channel();
        self.command(EngineCommand::Logout(reply)).await;
        let _ = done.await;
    }

    /// Go offline and stop the engine
    pub async fn shutdown(&self) {
        self.command(EngineCommand::Shutdown).await;
    }

    /// Fire the account teardown beacon. Safe to call while the process exits.
    pub fn notify_process_exit(&self) {
        info!(user = %self.self_id.short(), "sending teardown beacon");
        self.beacon.send(self.self_id);
    }

    async fn command(&self, command: EngineCommand) {
        if self.commands.send(command).await.is_err() {
            debug!("engine stopped, intent dropped");
        }
    }
}
