//! In-memory conversation timelines plus the table of optimistic sends that
//! are still waiting for their authoritative copy.

use std::{
    collections::HashMap,
    sync::Mutex,
    time::{Duration, Instant},
};

use chrono::{DateTime, Utc};
use shared::domain::{ConversationId, DeliveryStatus, Message, MessageId, UserId};
use tracing::debug;

use crate::lock;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    ReplacedTemporary { temp_id: String },
    Duplicate,
}

#[derive(Debug, Clone)]
struct PendingSend {
    temp_id: String,
    conversation_id: ConversationId,
    sender_id: UserId,
    text: String,
    created: Instant,
}

impl PendingSend {
    fn matches(&self, message: &Message, now: Instant, window: Duration) -> bool {
        self.conversation_id == message.conversation_id
            && self.sender_id == message.sender_id
            && self.text == message.text
            && now.saturating_duration_since(self.created) <= window
    }
}

#[derive(Default)]
struct StoreInner {
    timelines: HashMap<ConversationId, Vec<Message>>,
    pending: Vec<PendingSend>,
}

pub struct ConversationStore {
    inner: Mutex<StoreInner>,
    max_per_conversation: usize,
    reconciliation_window: Duration,
}

impl ConversationStore {
    pub fn new(max_per_conversation: usize, reconciliation_window: Duration) -> Self {
        Self {
            inner: Mutex::new(StoreInner::default()),
            max_per_conversation: max_per_conversation.max(1),
            reconciliation_window,
        }
    }

    /// Inserts a local placeholder and registers it for reconciliation.
    pub fn insert_temporary(&self, message: Message) {
        let temp_id = message
            .client_temp_id
            .clone()
            .unwrap_or_else(|| message.id.to_string());
        let mut inner = lock(&self.inner);
        inner.pending.push(PendingSend {
            temp_id,
            conversation_id: message.conversation_id.clone(),
            sender_id: message.sender_id.clone(),
            text: message.text.clone(),
            created: Instant::now(),
        });
        let timeline = inner
            .timelines
            .entry(message.conversation_id.clone())
            .or_default();
        insert_ordered(timeline, message);
        self.enforce_cap(timeline);
    }

    /// Inserts a confirmed message. A copy authored by `viewer` that matches a
    /// pending send takes the placeholder's slot.
    pub fn apply_authoritative(&self, message: Message, viewer: &UserId) -> InsertOutcome {
        let mut inner = lock(&self.inner);
        let StoreInner { timelines, pending } = &mut *inner;
        let timeline = timelines.entry(message.conversation_id.clone()).or_default();

        if timeline
            .iter()
            .any(|existing| !existing.is_temporary && existing.id == message.id)
        {
            return InsertOutcome::Duplicate;
        }

        if &message.sender_id == viewer {
            let now = Instant::now();
            let window = self.reconciliation_window;
            pending.retain(|entry| now.saturating_duration_since(entry.created) <= window);
            if let Some(index) = pending
                .iter()
                .position(|entry| entry.matches(&message, now, window))
            {
                let entry = pending.remove(index);
                if let Some(slot) = timeline
                    .iter_mut()
                    .find(|existing| existing.client_temp_id.as_deref() == Some(entry.temp_id.as_str()))
                {
                    debug!(
                        conversation_id = %message.conversation_id,
                        message_id = %message.id,
                        temp_id = %entry.temp_id,
                        "store: placeholder replaced by confirmed message"
                    );
                    *slot = message;
                    return InsertOutcome::ReplacedTemporary {
                        temp_id: entry.temp_id,
                    };
                }
            }
        }

        insert_ordered(timeline, message);
        self.enforce_cap(timeline);
        InsertOutcome::Inserted
    }

    /// Removes the placeholder if it is still present. Returns true when it
    /// was.
    pub fn remove_temporary(&self, conversation_id: &ConversationId, temp_id: &str) -> bool {
        let mut inner = lock(&self.inner);
        inner.pending.retain(|entry| entry.temp_id != temp_id);
        let Some(timeline) = inner.timelines.get_mut(conversation_id) else {
            return false;
        };
        let before = timeline.len();
        timeline.retain(|message| message.client_temp_id.as_deref() != Some(temp_id));
        before != timeline.len()
    }

    /// Merges a history page by id, keeping any placeholders. Returns the
    /// messages that were not present yet.
    pub fn load_history(&self, conversation_id: &ConversationId, history: Vec<Message>) -> Vec<Message> {
        let mut inner = lock(&self.inner);
        let timeline = inner.timelines.entry(conversation_id.clone()).or_default();
        let mut added = Vec::new();
        for message in history {
            if &message.conversation_id != conversation_id {
                continue;
            }
            if timeline.iter().any(|existing| existing.id == message.id) {
                continue;
            }
            added.push(message.clone());
            insert_ordered(timeline, message);
        }
        self.enforce_cap(timeline);
        added
    }

    /// Returns false when the message is unknown, the status would go back,
    /// or nothing changed.
    pub fn set_status(
        &self,
        conversation_id: &ConversationId,
        message_id: &MessageId,
        status: DeliveryStatus,
        read_at: Option<DateTime<Utc>>,
    ) -> bool {
        let mut inner = lock(&self.inner);
        let Some(message) = inner
            .timelines
            .get_mut(conversation_id)
            .and_then(|timeline| timeline.iter_mut().find(|message| &message.id == message_id))
        else {
            return false;
        };
        if message.status.is_some_and(|current| status < current) {
            return false;
        }
        let fills_read_at = read_at.is_some() && message.read_at != read_at;
        if message.status == Some(status) && !fills_read_at {
            return false;
        }
        message.status = Some(status);
        if read_at.is_some() {
            message.read_at = read_at;
        }
        true
    }

    pub fn messages(&self, conversation_id: &ConversationId) -> Vec<Message> {
        lock(&self.inner)
            .timelines
            .get(conversation_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn find(&self, conversation_id: &ConversationId, message_id: &MessageId) -> Option<Message> {
        lock(&self.inner)
            .timelines
            .get(conversation_id)
            .and_then(|timeline| timeline.iter().find(|message| &message.id == message_id))
            .cloned()
    }

    pub fn contains(&self, conversation_id: &ConversationId, message_id: &MessageId) -> bool {
        self.find(conversation_id, message_id).is_some()
    }

    pub fn pending_sends(&self) -> usize {
        lock(&self.inner).pending.len()
    }

    fn enforce_cap(&self, timeline: &mut Vec<Message>) {
        while timeline.len() > self.max_per_conversation {
            match timeline.iter().position(|message| !message.is_temporary) {
                Some(index) => {
                    timeline.remove(index);
                }
                None => break,
            }
        }
    }
}

fn insert_ordered(timeline: &mut Vec<Message>, message: Message) {
    let index = timeline.partition_point(|existing| existing.created_at <= message.created_at);
    timeline.insert(index, message);
}

#[cfg(test)]
#[path = "tests/store_tests.rs"]
mod tests;
