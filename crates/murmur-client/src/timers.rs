//! One-shot timers owned by the engine actor.
//!
//! A timer is a spawned sleep that posts [`EngineEvent::TimerFired`] with the
//! generation it was started under. Restarting or cancelling a timer bumps the
//! generation, so a fire that raced the restart is recognized as stale.

use std::collections::HashMap;
use std::time::Duration;

use murmur_shared::types::UserId;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::engine::EngineEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    /// Outbound typing quiet period
    TypingQuiet,
    /// Inbound typing indicator of a peer
    TypingExpiry(UserId),
    /// Coalesces user-list change notifications
    UserListDebounce,
}

pub struct Timers {
    events: mpsc::Sender<EngineEvent>,
    active: HashMap<TimerKind, (u64, JoinHandle<()>)>,
    next_generation: u64,
}

impl Timers {
    pub fn new(events: mpsc::Sender<EngineEvent>) -> Self {
        Self {
            events,
            active: HashMap::new(),
            next_generation: 0,
        }
    }

    /// (Re)start `kind`, replacing any pending instance.
    pub fn start(&mut self, kind: TimerKind, after: Duration) -> u64 {
        self.cancel(kind);
        self.next_generation += 1;
        let generation = self.next_generation;

        let events = self.events.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let _ = events.send(EngineEvent::TimerFired { kind, generation }).await;
        });
        self.active.insert(kind, (generation, handle));
        generation
    }

    pub fn cancel(&mut self, kind: TimerKind) {
        if let Some((_, handle)) = self.active.remove(&kind) {
            handle.abort();
        }
    }

    pub fn cancel_all(&mut self) {
        for (_, (_, handle)) in self.active.drain() {
            handle.abort();
        }
    }

    pub fn is_pending(&self, kind: TimerKind) -> bool {
        self.active.contains_key(&kind)
    }

    /// Accept a fire if it belongs to the current generation of `kind`.
    pub fn fired(&mut self, kind: TimerKind, generation: u64) -> bool {
        match self.active.get(&kind) {
            Some((current, _)) if *current == generation => {
                self.active.remove(&kind);
                true
            }
            _ => {
                tracing::debug!(?kind, generation, "ignoring stale timer");
                false
            }
        }
    }
}

impl Drop for Timers {
    fn drop(&mut self) {
        self.cancel_all();
    }
}
