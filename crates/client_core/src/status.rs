//! Monotonic delivery-status tracking: `sent < delivered < read`.

use std::{
    collections::{HashMap, VecDeque},
    sync::Mutex,
};

use chrono::{DateTime, Utc};
use shared::domain::{DeliveryStatus, Message, MessageId};
use tracing::debug;

use crate::lock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Applied,
    /// Same status as held; nothing to re-dispatch.
    Unchanged,
    IgnoredRegression,
}

pub fn advance(current: Option<DeliveryStatus>, next: DeliveryStatus) -> Transition {
    match current {
        None => Transition::Applied,
        Some(current) if next > current => Transition::Applied,
        Some(current) if next == current => Transition::Unchanged,
        Some(_) => Transition::IgnoredRegression,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusEntry {
    pub status: DeliveryStatus,
    pub read_at: Option<DateTime<Utc>>,
}

struct Book {
    entries: HashMap<MessageId, StatusEntry>,
    order: VecDeque<MessageId>,
}

/// Latest known status per message id. Oldest entries are forgotten once
/// `capacity` ids are tracked.
pub struct StatusBook {
    book: Mutex<Book>,
    capacity: usize,
}

impl StatusBook {
    pub fn new(capacity: usize) -> Self {
        Self {
            book: Mutex::new(Book {
                entries: HashMap::new(),
                order: VecDeque::new(),
            }),
            capacity: capacity.max(1),
        }
    }

    pub fn status(&self, message_id: &MessageId) -> Option<DeliveryStatus> {
        lock(&self.book).entries.get(message_id).map(|entry| entry.status)
    }

    pub fn entry(&self, message_id: &MessageId) -> Option<StatusEntry> {
        lock(&self.book).entries.get(message_id).copied()
    }

    /// Seeds the book from a message record. A record older than what is
    /// held never lowers it.
    pub fn record(&self, message: &Message) -> Transition {
        match message.status {
            Some(status) => self.apply(&message.id, status, message.read_at, None),
            None => Transition::Unchanged,
        }
    }

    /// `known` is the status the timeline shows; it stands in for an entry
    /// the book has already evicted.
    pub fn apply_remote(
        &self,
        message_id: &MessageId,
        status: DeliveryStatus,
        read_at: Option<DateTime<Utc>>,
        known: Option<StatusEntry>,
    ) -> Transition {
        let transition = self.apply(message_id, status, read_at, known);
        if transition == Transition::IgnoredRegression {
            debug!(message_id = %message_id, next = %status, "status: regression ignored");
        }
        transition
    }

    pub fn mark_read_local(&self, message_id: &MessageId, at: DateTime<Utc>) -> Transition {
        self.apply(message_id, DeliveryStatus::Read, Some(at), None)
    }

    fn apply(
        &self,
        message_id: &MessageId,
        status: DeliveryStatus,
        read_at: Option<DateTime<Utc>>,
        known: Option<StatusEntry>,
    ) -> Transition {
        let mut book = lock(&self.book);
        let current = book.entries.get(message_id).copied();
        let held = current.or(known);
        let transition = advance(held.map(|entry| entry.status), status);
        let next = match (transition, held) {
            (Transition::Applied, _) => Some(StatusEntry {
                status,
                read_at: read_at.or(held.and_then(|entry| entry.read_at)),
            }),
            (_, Some(entry)) => Some(StatusEntry {
                read_at: entry.read_at.or(read_at),
                ..entry
            }),
            (_, None) => None,
        };
        if let Some(next) = next.filter(|next| Some(*next) != current) {
            if current.is_none() {
                if book.order.len() == self.capacity {
                    if let Some(evicted) = book.order.pop_front() {
                        book.entries.remove(&evicted);
                    }
                }
                book.order.push_back(message_id.clone());
            }
            book.entries.insert(message_id.clone(), next);
        }
        transition
    }
}

#[cfg(test)]
#[path = "tests/status_tests.rs"]
mod tests;
