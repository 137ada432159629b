use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio_stream::wrappers::WatchStream;
use tracing::debug;

use crate::types::{GroupMembership, Message};

/// Immutable view of the thread at one point in time.
pub type ThreadSnapshot = Arc<Vec<Message>>;

/// Yields the current snapshot first, then one item per change. A slow
/// reader only sees the newest snapshot.
pub type ThreadSubscription = WatchStream<ThreadSnapshot>;

/// Ordered messages of the open conversation.
///
/// Every mutation is a single `send_modify`, so subscribers never see a half
/// applied change. Live connections write through a [`ThreadLease`]; only the
/// most recent lease may mutate.
pub struct ThreadStore {
    tx: watch::Sender<ThreadSnapshot>,
    active_lease: Mutex<Option<u64>>,
    next_lease: AtomicU64,
}

impl Default for ThreadStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ThreadStore {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(Arc::new(Vec::new()));
        Self {
            tx,
            active_lease: Mutex::new(None),
            next_lease: AtomicU64::new(1),
        }
    }

    pub fn current_snapshot(&self) -> ThreadSnapshot {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> ThreadSubscription {
        WatchStream::new(self.tx.subscribe())
    }

    pub fn watch(&self) -> watch::Receiver<ThreadSnapshot> {
        self.tx.subscribe()
    }

    pub fn replace_all(&self, messages: Vec<Message>) {
        self.tx.send_replace(Arc::new(messages));
    }

    pub fn append(&self, message: Message) {
        self.tx.send_modify(|thread| Arc::make_mut(thread).push(message));
    }

    /// Marks every unread message read if `peer` is present in `membership`.
    /// Returns whether the peer was present. The thread is republished even
    /// when nothing was unread.
    pub fn mark_read_if_recipient_present(&self, peer: &str, membership: &GroupMembership) -> bool {
        self.mark_read_at(peer, membership, Utc::now())
    }

    pub fn mark_read_at(
        &self,
        peer: &str,
        membership: &GroupMembership,
        at: DateTime<Utc>,
    ) -> bool {
        if !membership.contains(peer) {
            return false;
        }

        self.tx.send_modify(|thread| {
            if thread.iter().any(|m| m.read_at.is_none()) {
                for message in Arc::make_mut(thread).iter_mut() {
                    message.mark_read(at);
                }
            }
        });
        true
    }

    fn lock_lease(&self) -> MutexGuard<'_, Option<u64>> {
        self.active_lease
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Hands exclusive write access to a new owner. Any earlier lease stops
    /// applying changes, and the thread is cleared so nothing from the
    /// previous conversation remains visible.
    pub fn lease(self: &Arc<Self>, peer: &str) -> ThreadLease {
        let id = self.next_lease.fetch_add(1, Ordering::Relaxed);
        let mut active = self.lock_lease();
        if let Some(previous) = active.replace(id) {
            debug!(previous, lease = id, "superseding thread lease");
        }
        self.replace_all(Vec::new());
        drop(active);

        ThreadLease {
            store: self.clone(),
            id,
            peer: Arc::from(peer),
        }
    }
}

/// Write access to a [`ThreadStore`] for one conversation. Clones share the
/// same lease.
#[derive(Clone)]
pub struct ThreadLease {
    store: Arc<ThreadStore>,
    id: u64,
    peer: Arc<str>,
}

impl ThreadLease {
    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn is_active(&self) -> bool {
        *self.store.lock_lease() == Some(self.id)
    }

    /// Runs `f` against the store while this lease is still active. The check
    /// and the write happen under the same lock as [`revoke`](Self::revoke).
    fn apply(&self, f: impl FnOnce(&ThreadStore)) -> bool {
        let active = self.store.lock_lease();
        if *active != Some(self.id) {
            return false;
        }
        f(&*self.store);
        true
    }

    pub fn replace_all(&self, messages: Vec<Message>) -> bool {
        self.apply(|store| store.replace_all(messages))
    }

    pub fn append(&self, message: Message) -> bool {
        self.apply(|store| store.append(message))
    }

    pub fn mark_read_if_recipient_present(&self, membership: &GroupMembership) -> bool {
        let mut present = false;
        let applied = self.apply(|store| {
            present = store.mark_read_if_recipient_present(&self.peer, membership);
        });
        applied && present
    }

    pub fn revoke(&self) {
        let mut active = self.store.lock_lease();
        if *active == Some(self.id) {
            *active = None;
        }
    }
}
