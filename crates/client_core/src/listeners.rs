//! Per-conversation and global observer sets with disposable handles.

use std::{
    collections::HashMap,
    fmt,
    panic::{self, AssertUnwindSafe},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, Weak,
    },
};

use shared::domain::ConversationId;
use tracing::warn;

use crate::lock;

pub type Listener<E> = Arc<dyn Fn(&E) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

trait Detach: Send + Sync {
    fn detach(&self, id: ListenerId) -> bool;
}

/// Handle returned by every registration. Dropping it removes the listener.
#[must_use = "dropping a Subscription removes the listener immediately"]
pub struct Subscription {
    id: ListenerId,
    registry: Option<Weak<dyn Detach>>,
}

impl Subscription {
    pub fn id(&self) -> ListenerId {
        self.id
    }

    /// Removes the listener. Returns false when it was already gone.
    pub fn unsubscribe(mut self) -> bool {
        self.release()
    }

    fn release(&mut self) -> bool {
        match self.registry.take().and_then(|registry| registry.upgrade()) {
            Some(registry) => registry.detach(self.id),
            None => false,
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("active", &self.registry.is_some())
            .finish()
    }
}

struct Entries<E> {
    scoped: HashMap<ConversationId, Vec<(ListenerId, Listener<E>)>>,
    global: Vec<(ListenerId, Listener<E>)>,
}

struct RegistryInner<E> {
    next_id: AtomicU64,
    entries: Mutex<Entries<E>>,
}

impl<E: 'static> Detach for RegistryInner<E> {
    fn detach(&self, id: ListenerId) -> bool {
        let mut entries = lock(&self.entries);
        let before = entries.global.len();
        entries.global.retain(|(entry_id, _)| *entry_id != id);
        if entries.global.len() != before {
            return true;
        }

        let mut removed = false;
        entries.scoped.retain(|_, listeners| {
            let before = listeners.len();
            listeners.retain(|(entry_id, _)| *entry_id != id);
            removed |= listeners.len() != before;
            !listeners.is_empty()
        });
        removed
    }
}

pub struct ListenerRegistry<E> {
    inner: Arc<RegistryInner<E>>,
}

impl<E: 'static> Default for ListenerRegistry<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: 'static> ListenerRegistry<E> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                next_id: AtomicU64::new(1),
                entries: Mutex::new(Entries {
                    scoped: HashMap::new(),
                    global: Vec::new(),
                }),
            }),
        }
    }

    pub fn subscribe<F>(&self, conversation_id: ConversationId, listener: F) -> Subscription
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        let id = self.allocate_id();
        lock(&self.inner.entries)
            .scoped
            .entry(conversation_id)
            .or_default()
            .push((id, Arc::new(listener)));
        self.handle(id)
    }

    pub fn subscribe_global<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        let id = self.allocate_id();
        lock(&self.inner.entries)
            .global
            .push((id, Arc::new(listener)));
        self.handle(id)
    }

    /// Removes a listener by id. A second removal is a no-op returning false.
    pub fn remove(&self, id: ListenerId) -> bool {
        self.inner.detach(id)
    }

    /// Consumes a handle and removes its listener. A handle always detaches
    /// from the registry that issued it, never from another one that happens
    /// to reuse the id.
    pub fn remove_subscription(&self, subscription: Subscription) -> bool {
        subscription.unsubscribe()
    }

    pub fn listener_count(&self, conversation_id: &ConversationId) -> usize {
        lock(&self.inner.entries)
            .scoped
            .get(conversation_id)
            .map_or(0, Vec::len)
    }

    pub fn global_listener_count(&self) -> usize {
        lock(&self.inner.entries).global.len()
    }

    pub fn tracked_conversations(&self) -> usize {
        lock(&self.inner.entries).scoped.len()
    }

    /// Invokes the conversation's listeners, then the global ones.
    ///
    /// The sets are copied before any callback runs, so callbacks may
    /// register or remove listeners freely; such changes apply from the next
    /// dispatch on. A panicking listener is logged and skipped.
    pub fn dispatch(&self, conversation_id: &ConversationId, event: &E) -> usize {
        let snapshot: Vec<(ListenerId, Listener<E>)> = {
            let entries = lock(&self.inner.entries);
            entries
                .scoped
                .get(conversation_id)
                .into_iter()
                .flatten()
                .chain(entries.global.iter())
                .cloned()
                .collect()
        };

        let mut delivered = 0;
        for (id, listener) in snapshot {
            match panic::catch_unwind(AssertUnwindSafe(|| listener(event))) {
                Ok(()) => delivered += 1,
                Err(_) => warn!(
                    listener_id = %id,
                    conversation_id = %conversation_id,
                    "dispatch: listener panicked; continuing with remaining listeners"
                ),
            }
        }
        delivered
    }

    fn allocate_id(&self) -> ListenerId {
        ListenerId(self.inner.next_id.fetch_add(1, Ordering::Relaxed))
    }

    fn handle(&self, id: ListenerId) -> Subscription {
        let strong: Arc<dyn Detach> = self.inner.clone();
        Subscription {
            id,
            registry: Some(Arc::downgrade(&strong)),
        }
    }
}

#[cfg(test)]
#[path = "tests/listeners_tests.rs"]
mod tests;
