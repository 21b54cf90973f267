//! Routes validated inbound events to the listener registries.

use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::Mutex,
};

use shared::domain::{ConversationId, MessageId};
use tracing::debug;

use crate::{
    listeners::ListenerRegistry,
    lock,
    types::{InboundEvent, MessageEvent, StatusEvent},
};

/// FIFO window of message ids that already went out.
struct SeenWindow {
    order: VecDeque<MessageId>,
    ids: HashSet<MessageId>,
    capacity: usize,
}

impl SeenWindow {
    fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::with_capacity(capacity.min(4_096)),
            ids: HashSet::new(),
            capacity: capacity.max(1),
        }
    }

    fn insert(&mut self, id: &MessageId) -> bool {
        if self.ids.contains(id) {
            return false;
        }
        if self.order.len() == self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.ids.remove(&evicted);
            }
        }
        self.order.push_back(id.clone());
        self.ids.insert(id.clone());
        true
    }
}

pub struct Dispatcher {
    messages: ListenerRegistry<MessageEvent>,
    statuses: ListenerRegistry<StatusEvent>,
    seen: Mutex<SeenWindow>,
    held: Mutex<HashMap<ConversationId, VecDeque<InboundEvent>>>,
    held_limit: usize,
}

impl Dispatcher {
    pub fn new(dedup_window: usize, held_limit: usize) -> Self {
        Self {
            messages: ListenerRegistry::new(),
            statuses: ListenerRegistry::new(),
            seen: Mutex::new(SeenWindow::new(dedup_window)),
            held: Mutex::new(HashMap::new()),
            held_limit: held_limit.max(1),
        }
    }

    pub fn messages(&self) -> &ListenerRegistry<MessageEvent> {
        &self.messages
    }

    pub fn statuses(&self) -> &ListenerRegistry<StatusEvent> {
        &self.statuses
    }

    /// Records `id` as dispatched. Returns false when it already was.
    pub fn admit(&self, id: &MessageId) -> bool {
        lock(&self.seen).insert(id)
    }

    pub fn has_seen(&self, id: &MessageId) -> bool {
        lock(&self.seen).ids.contains(id)
    }

    /// Fans an admitted message out to its conversation's listeners, then
    /// to the global ones.
    pub fn deliver_message(&self, event: &MessageEvent) -> usize {
        self.messages.dispatch(event.conversation_id(), event)
    }

    pub fn dispatch_status(&self, event: &StatusEvent) -> usize {
        self.statuses.dispatch(&event.conversation_id, event)
    }

    /// Buffers an event for a room whose join is not acknowledged yet. When
    /// the buffer is full, everything held so far plus `event` is handed back
    /// for immediate processing.
    pub fn hold(&self, conversation_id: &ConversationId, event: InboundEvent) -> Option<Vec<InboundEvent>> {
        let mut held = lock(&self.held);
        let buffer = held.entry(conversation_id.clone()).or_default();
        buffer.push_back(event);
        if buffer.len() < self.held_limit {
            debug!(conversation_id = %conversation_id, held = buffer.len(), "dispatch: event held until join ack");
            return None;
        }
        debug!(conversation_id = %conversation_id, "dispatch: held buffer full; releasing");
        held.remove(conversation_id).map(Vec::from)
    }

    pub fn release(&self, conversation_id: &ConversationId) -> Vec<InboundEvent> {
        lock(&self.held)
            .remove(conversation_id)
            .map(Vec::from)
            .unwrap_or_default()
    }

    pub fn release_all(&self) -> Vec<InboundEvent> {
        let mut held = lock(&self.held);
        let mut rooms: Vec<_> = held.drain().collect();
        rooms.sort_by(|a, b| a.0.cmp(&b.0));
        rooms.into_iter().flat_map(|(_, events)| events).collect()
    }

    pub fn held_count(&self, conversation_id: &ConversationId) -> usize {
        lock(&self.held).get(conversation_id).map_or(0, VecDeque::len)
    }
}

#[cfg(test)]
#[path = "tests/dispatcher_tests.rs"]
mod tests;
