//! Tracks which conversations the client wants live, and where each one is
//! in the join handshake on the current connection.

use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use shared::{domain::ConversationId, protocol::ClientFrame};
use tracing::{debug, warn};

use crate::{connection::OutboundLink, lock};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoomPhase {
    /// Tracked, but no join has been emitted on the current connection.
    Idle,
    AwaitingAck { since: Instant },
    Active,
}

pub struct RoomMembershipTracker {
    rooms: Mutex<BTreeMap<ConversationId, RoomPhase>>,
    link: Arc<OutboundLink>,
}

impl RoomMembershipTracker {
    pub fn new(link: Arc<OutboundLink>) -> Self {
        Self {
            rooms: Mutex::new(BTreeMap::new()),
            link,
        }
    }

    /// Adds the room and, when connected, requests it right away. Returns
    /// true when the room was not tracked before.
    pub fn join(&self, conversation_id: ConversationId) -> bool {
        let mut rooms = lock(&self.rooms);
        let newly_tracked = !rooms.contains_key(&conversation_id);
        let phase = rooms
            .entry(conversation_id.clone())
            .or_insert(RoomPhase::Idle);

        if *phase == RoomPhase::Idle && self.link.is_connected() {
            let emitted = self.link.emit(ClientFrame::JoinConversation {
                conversation_id: conversation_id.clone(),
            });
            if emitted {
                *phase = RoomPhase::AwaitingAck {
                    since: Instant::now(),
                };
            }
        }
        debug!(conversation_id = %conversation_id, phase = ?*phase, "rooms: join");
        newly_tracked
    }

    /// Drops the room and, when connected, requests a leave. Returns true
    /// when the room was tracked.
    pub fn leave(&self, conversation_id: &ConversationId) -> bool {
        let mut rooms = lock(&self.rooms);
        if rooms.remove(conversation_id).is_none() {
            return false;
        }
        if self.link.is_connected() {
            self.link.emit(ClientFrame::LeaveConversation {
                conversation_id: conversation_id.clone(),
            });
        }
        debug!(conversation_id = %conversation_id, "rooms: leave");
        true
    }

    pub fn phase(&self, conversation_id: &ConversationId) -> Option<RoomPhase> {
        lock(&self.rooms).get(conversation_id).copied()
    }

    pub fn snapshot(&self) -> Vec<ConversationId> {
        lock(&self.rooms).keys().cloned().collect()
    }

    /// Marks every tracked room as requested and returns them in id order,
    /// for the driver to emit on a fresh connection.
    pub fn begin_replay(&self, now: Instant) -> Vec<ConversationId> {
        let mut rooms = lock(&self.rooms);
        for phase in rooms.values_mut() {
            *phase = RoomPhase::AwaitingAck { since: now };
        }
        rooms.keys().cloned().collect()
    }

    /// Returns true when the room was waiting for this acknowledgment.
    pub fn acknowledge(&self, conversation_id: &ConversationId) -> bool {
        let mut rooms = lock(&self.rooms);
        match rooms.get_mut(conversation_id) {
            Some(phase @ RoomPhase::AwaitingAck { .. }) => {
                *phase = RoomPhase::Active;
                true
            }
            Some(_) => false,
            None => {
                debug!(conversation_id = %conversation_id, "rooms: acknowledgment for untracked room ignored");
                false
            }
        }
    }

    pub fn is_awaiting_ack(&self, conversation_id: &ConversationId) -> bool {
        matches!(
            self.phase(conversation_id),
            Some(RoomPhase::AwaitingAck { .. })
        )
    }

    /// Promotes rooms whose acknowledgment is overdue and returns them.
    pub fn expire_pending(&self, now: Instant, timeout: Duration) -> Vec<ConversationId> {
        let mut rooms = lock(&self.rooms);
        let mut expired = Vec::new();
        for (conversation_id, phase) in rooms.iter_mut() {
            if let RoomPhase::AwaitingAck { since } = *phase {
                if now.saturating_duration_since(since) >= timeout {
                    warn!(
                        conversation_id = %conversation_id,
                        "rooms: join not acknowledged in time; treating as active"
                    );
                    *phase = RoomPhase::Active;
                    expired.push(conversation_id.clone());
                }
            }
        }
        expired
    }

    /// The backend forgets subscriptions with the connection.
    pub fn reset(&self) {
        for phase in lock(&self.rooms).values_mut() {
            *phase = RoomPhase::Idle;
        }
    }
}

#[cfg(test)]
#[path = "tests/rooms_tests.rs"]
mod tests;
