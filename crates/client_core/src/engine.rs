//! Session-scoped state and the handling of everything the channel delivers.

use std::{
    collections::HashSet,
    sync::{Arc, Mutex},
    time::Instant,
};

use chrono::Utc;
use shared::{
    domain::{ConversationId, DeliveryStatus, Message, MessageId, UserId},
    protocol::{ClientFrame, MessagePayload},
};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::{
    api::ChatApi,
    config::SyncConfig,
    connection::{ChannelHandler, OutboundLink},
    dispatcher::Dispatcher,
    lock,
    rooms::RoomMembershipTracker,
    status::{StatusBook, StatusEntry, Transition},
    store::{ConversationStore, InsertOutcome},
    types::{ConnectionState, InboundEvent, MessageEvent, SessionEvent, StatusEvent},
};

pub struct SyncEngine {
    pub(crate) viewer: UserId,
    pub(crate) config: SyncConfig,
    pub(crate) api: Arc<dyn ChatApi>,
    pub(crate) link: Arc<OutboundLink>,
    pub(crate) rooms: RoomMembershipTracker,
    pub(crate) dispatcher: Dispatcher,
    pub(crate) store: ConversationStore,
    pub(crate) statuses: StatusBook,
    active: Mutex<Option<ConversationId>>,
    /// Rooms rejoined after a reconnect that still need their gap filled.
    backfill: Mutex<HashSet<ConversationId>>,
    events: broadcast::Sender<SessionEvent>,
}

impl SyncEngine {
    pub fn new(
        viewer: UserId,
        config: SyncConfig,
        api: Arc<dyn ChatApi>,
        link: Arc<OutboundLink>,
    ) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        Self {
            rooms: RoomMembershipTracker::new(Arc::clone(&link)),
            dispatcher: Dispatcher::new(config.dedup_window, config.held_event_limit),
            store: ConversationStore::new(
                config.max_messages_per_conversation,
                config.reconciliation_window(),
            ),
            statuses: StatusBook::new(config.dedup_window),
            active: Mutex::new(None),
            backfill: Mutex::new(HashSet::new()),
            viewer,
            config,
            api,
            link,
            events,
        }
    }

    pub fn viewer(&self) -> &UserId {
        &self.viewer
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub(crate) fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    pub(crate) fn notify_timeline(&self, conversation_id: &ConversationId) {
        self.emit(SessionEvent::TimelineChanged {
            conversation_id: conversation_id.clone(),
        });
    }

    pub fn active_conversation(&self) -> Option<ConversationId> {
        lock(&self.active).clone()
    }

    pub fn set_active_conversation(&self, conversation_id: Option<ConversationId>) {
        *lock(&self.active) = conversation_id;
    }

    /// Clears the active conversation only if it is still `conversation_id`.
    pub(crate) fn clear_active_if(&self, conversation_id: &ConversationId) {
        let mut active = lock(&self.active);
        if active.as_ref() == Some(conversation_id) {
            *active = None;
        }
    }

    pub(crate) fn forget_room(&self, conversation_id: &ConversationId) {
        lock(&self.backfill).remove(conversation_id);
        let dropped = self.dispatcher.release(conversation_id);
        if !dropped.is_empty() {
            debug!(
                conversation_id = %conversation_id,
                dropped = dropped.len(),
                "engine: discarded held events for left room"
            );
        }
    }

    pub fn handle_frame(&self, raw: &str) -> Option<InboundEvent> {
        match InboundEvent::parse(raw) {
            Ok(event) => Some(event),
            Err(err) => {
                warn!("engine: dropping frame: {err}");
                self.emit(SessionEvent::Error(err.to_string()));
                None
            }
        }
    }

    pub(crate) fn route(self: &Arc<Self>, event: InboundEvent) {
        match event {
            InboundEvent::JoinAcknowledged(conversation_id) => {
                if self.rooms.acknowledge(&conversation_id) {
                    debug!(conversation_id = %conversation_id, "engine: join acknowledged");
                    self.activate(&conversation_id);
                }
            }
            InboundEvent::ServerError(error) => {
                warn!(code = ?error.code, "engine: server reported error: {}", error.message);
                self.emit(SessionEvent::Error(error.message));
            }
            event @ (InboundEvent::Message(_) | InboundEvent::Status(_)) => {
                let Some(conversation_id) = event.conversation_id().cloned() else {
                    return;
                };
                if self.rooms.is_awaiting_ack(&conversation_id) {
                    if let Some(overflow) = self.dispatcher.hold(&conversation_id, event) {
                        for held in overflow {
                            self.process(held);
                        }
                    }
                } else {
                    self.process(event);
                }
            }
        }
    }

    fn process(&self, event: InboundEvent) {
        match event {
            InboundEvent::Message(event) => {
                self.ingest_message(event);
            }
            InboundEvent::Status(event) => {
                self.apply_status(event);
            }
            InboundEvent::JoinAcknowledged(_) | InboundEvent::ServerError(_) => {}
        }
    }

    /// Normal path for every authoritative message: dedup, store, seed the
    /// status book, then fan out. Returns true when listeners saw it.
    pub(crate) fn ingest_message(&self, mut event: MessageEvent) -> bool {
        if !self.dispatcher.admit(event.message_id()) {
            debug!(
                conversation_id = %event.conversation_id(),
                message_id = %event.message_id(),
                "engine: duplicate message dropped"
            );
            return false;
        }

        let outcome = self
            .store
            .apply_authoritative(event.message.clone(), &self.viewer);
        if outcome == InsertOutcome::Duplicate {
            debug!(message_id = %event.message_id(), "engine: message already in timeline");
            return false;
        }
        if let InsertOutcome::ReplacedTemporary { temp_id } = &outcome {
            debug!(
                conversation_id = %event.conversation_id(),
                message_id = %event.message_id(),
                temp_id = %temp_id,
                "engine: optimistic message reconciled by echo"
            );
        }
        self.statuses.record(&event.message);
        if let Some(entry) = self.sync_stored_status(&event.message) {
            event.message.status = Some(entry.status);
            event.message.read_at = entry.read_at.or(event.message.read_at);
        }
        self.notify_timeline(event.conversation_id());
        self.dispatcher.deliver_message(&event);
        true
    }

    /// Writes the book's status into the stored copy of `message`, which may
    /// trail an update that arrived before the message did.
    fn sync_stored_status(&self, message: &Message) -> Option<StatusEntry> {
        let entry = self.statuses.entry(&message.id)?;
        self.store
            .set_status(&message.conversation_id, &message.id, entry.status, entry.read_at);
        Some(entry)
    }

    pub(crate) fn apply_status(&self, event: StatusEvent) -> Transition {
        let shown = self
            .store
            .find(&event.conversation_id, &event.message_id)
            .and_then(|message| {
                message.status.map(|status| StatusEntry {
                    status,
                    read_at: message.read_at,
                })
            });
        let transition = self.statuses.apply_remote(
            &event.message_id,
            event.status,
            event.read_at,
            shown,
        );
        if transition == Transition::IgnoredRegression {
            return transition;
        }
        if let Some(entry) = self.statuses.entry(&event.message_id) {
            if self.store.set_status(
                &event.conversation_id,
                &event.message_id,
                entry.status,
                entry.read_at,
            ) {
                self.notify_timeline(&event.conversation_id);
            }
        }
        if transition == Transition::Applied {
            self.dispatcher.dispatch_status(&event);
        }
        transition
    }

    fn activate(self: &Arc<Self>, conversation_id: &ConversationId) {
        for event in self.dispatcher.release(conversation_id) {
            self.process(event);
        }
        if lock(&self.backfill).remove(conversation_id) {
            self.spawn_backfill(conversation_id.clone());
        }
    }

    fn spawn_backfill(self: &Arc<Self>, conversation_id: ConversationId) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(conversation_id = %conversation_id, "engine: no runtime for backfill");
            return;
        };
        let engine = Arc::downgrade(self);
        runtime.spawn(async move {
            let Some(engine) = engine.upgrade() else {
                return;
            };
            let fetched = tokio::time::timeout(
                engine.config.request_timeout(),
                engine.api.get_conversation_messages(&conversation_id),
            )
            .await;
            match fetched {
                Ok(Ok(history)) => {
                    let delivered = history
                        .into_iter()
                        .filter_map(|payload| valid_history_entry(&conversation_id, payload))
                        .filter(|event| engine.ingest_message(event.clone()))
                        .count();
                    info!(conversation_id = %conversation_id, delivered, "engine: backfill complete");
                }
                Ok(Err(err)) => {
                    warn!(conversation_id = %conversation_id, "engine: backfill failed: {err:#}")
                }
                Err(_) => warn!(conversation_id = %conversation_id, "engine: backfill timed out"),
            }
        });
    }

    /// Merges a history page without notifying message listeners.
    pub(crate) fn merge_history(&self, conversation_id: &ConversationId, history: Vec<MessagePayload>) -> Vec<Message> {
        let messages: Vec<Message> = history
            .into_iter()
            .filter_map(|payload| valid_history_entry(conversation_id, payload))
            .map(|event| event.message)
            .collect();
        let mut added = self.store.load_history(conversation_id, messages);
        for message in &mut added {
            self.dispatcher.admit(&message.id);
            self.statuses.record(message);
            if let Some(entry) = self.sync_stored_status(message) {
                message.status = Some(entry.status);
                message.read_at = entry.read_at.or(message.read_at);
            }
        }
        if !added.is_empty() {
            self.notify_timeline(conversation_id);
        }
        added
    }

    /// Local read of a message the viewer is looking at.
    pub fn mark_read(self: &Arc<Self>, conversation_id: &ConversationId, message_id: &MessageId) -> bool {
        if self.active_conversation().as_ref() != Some(conversation_id) {
            return false;
        }
        let Some(message) = self.store.find(conversation_id, message_id) else {
            return false;
        };
        if message.is_temporary || message.sender_id == self.viewer || message.is_read() {
            return false;
        }

        let read_at = Utc::now();
        if self.statuses.mark_read_local(message_id, read_at) != Transition::Applied {
            return false;
        }
        self.store.set_status(
            conversation_id,
            message_id,
            DeliveryStatus::Read,
            Some(read_at),
        );
        self.notify_timeline(conversation_id);
        self.dispatcher.dispatch_status(&StatusEvent {
            message_id: message_id.clone(),
            conversation_id: conversation_id.clone(),
            status: DeliveryStatus::Read,
            read_at: Some(read_at),
        });

        if self.link.is_connected() {
            self.link.emit(ClientFrame::MessageRead {
                message_id: message_id.clone(),
                conversation_id: conversation_id.clone(),
            });
        }
        self.spawn_read_confirmation(conversation_id.clone(), message_id.clone());
        true
    }

    pub fn mark_conversation_read(self: &Arc<Self>, conversation_id: &ConversationId) -> usize {
        if self.active_conversation().as_ref() != Some(conversation_id) {
            return 0;
        }
        self.store
            .messages(conversation_id)
            .iter()
            .filter(|message| self.mark_read(conversation_id, &message.id))
            .count()
    }

    fn spawn_read_confirmation(&self, conversation_id: ConversationId, message_id: MessageId) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(message_id = %message_id, "engine: no runtime for read confirmation");
            return;
        };
        let api = Arc::clone(&self.api);
        let timeout = self.config.request_timeout();
        runtime.spawn(async move {
            match tokio::time::timeout(timeout, api.mark_message_read(&conversation_id, &message_id)).await {
                Ok(Ok(())) => debug!(message_id = %message_id, "engine: read confirmed"),
                Ok(Err(err)) => warn!(
                    conversation_id = %conversation_id,
                    message_id = %message_id,
                    "engine: read confirmation failed: {err:#}"
                ),
                Err(_) => warn!(message_id = %message_id, "engine: read confirmation timed out"),
            }
        });
    }

    /// Rooms go back to idle and anything held is let through.
    pub(crate) fn settle_disconnected(self: &Arc<Self>) {
        self.rooms.reset();
        for event in self.dispatcher.release_all() {
            self.process(event);
        }
    }
}

fn valid_history_entry(conversation_id: &ConversationId, payload: MessagePayload) -> Option<MessageEvent> {
    if payload.id.is_empty() || payload.sender_id.is_empty() {
        warn!(conversation_id = %conversation_id, "engine: skipping history entry without ids");
        return None;
    }
    if &payload.conversation_id != conversation_id {
        debug!(
            conversation_id = %conversation_id,
            message_id = %payload.id,
            "engine: skipping history entry for another conversation"
        );
        return None;
    }
    Some(MessageEvent::from(payload))
}

impl ChannelHandler for Arc<SyncEngine> {
    fn on_connected(&self, reconnected: bool) -> Vec<ConversationId> {
        let rooms = self.rooms.begin_replay(Instant::now());
        if reconnected {
            *lock(&self.backfill) = rooms.iter().cloned().collect();
            info!(rooms = rooms.len(), "engine: reconnected; rejoining rooms");
        } else {
            info!(rooms = rooms.len(), "engine: connected");
        }
        self.emit(SessionEvent::ConnectionChanged(ConnectionState::Connected));
        rooms
    }

    fn on_frame(&self, raw: &str) {
        if let Some(event) = self.handle_frame(raw) {
            self.route(event);
        }
    }

    fn on_tick(&self, now: Instant) {
        for conversation_id in self
            .rooms
            .expire_pending(now, self.config.join_ack_timeout())
        {
            self.activate(&conversation_id);
        }
    }

    fn on_disconnected(&self, reason: &str) {
        info!(reason, "engine: disconnected");
        self.settle_disconnected();
        self.emit(SessionEvent::ConnectionChanged(ConnectionState::Disconnected));
    }

    fn on_connect_error(&self, error: &anyhow::Error, attempt: u32) {
        debug!(attempt, "engine: connect attempt failed: {error:#}");
    }
}

#[cfg(test)]
#[path = "tests/engine_tests.rs"]
mod tests;
