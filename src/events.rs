//! Lifecycle event bus.
//!
//! Observers subscribe for `(kind, job)` notifications and receive exactly
//! one terminal event per submission: `Finished`, `Failed` or `Dropped`.
//! Delivery is fire-and-forget; a subscriber that has gone away is
//! silently skipped.

use crate::job::Job;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Finished,
    Failed,
    Dropped,
}

#[derive(Debug, Clone)]
pub struct JobEvent {
    pub kind: EventKind,
    pub job: Job,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(u64);

/// A live subscription. Receives events until dropped or unsubscribed.
pub struct EventStream {
    id: SubscriberId,
    rx: mpsc::UnboundedReceiver<JobEvent>,
}

impl EventStream {
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// Next event, or `None` once the bus is gone and the backlog is
    /// drained.
    pub async fn recv(&mut self) -> Option<JobEvent> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<JobEvent> {
        self.rx.try_recv().ok()
    }
}

/// Multi-subscriber publish/subscribe of job lifecycle events.
///
/// Subscriber-set mutations and deliveries serialize on one lock, so a
/// publish always sees a consistent snapshot of the subscriber set.
#[derive(Clone, Default)]
pub struct EventBus {
    subscribers: Arc<RwLock<HashMap<SubscriberId, mpsc::UnboundedSender<JobEvent>>>>,
    next_id: Arc<AtomicU64>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> EventStream {
        let id = SubscriberId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::unbounded_channel();
        if let Ok(mut subs) = self.subscribers.write() {
            subs.insert(id, tx);
        }
        EventStream { id, rx }
    }

    /// Remove a subscriber. Unsubscribing an unknown or already-removed id
    /// is a no-op.
    pub fn unsubscribe(&self, id: SubscriberId) {
        if let Ok(mut subs) = self.subscribers.write() {
            subs.remove(&id);
        }
    }

    /// Deliver `event` to every current subscriber, best-effort.
    pub fn publish(&self, event: JobEvent) {
        if let Ok(subs) = self.subscribers.read() {
            for tx in subs.values() {
                let _ = tx.send(event.clone());
            }
        }
    }
}
