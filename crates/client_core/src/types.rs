use chrono::{DateTime, Utc};
use shared::{
    domain::{ConversationId, DeliveryStatus, Message, MessageId, UserId},
    error::ApiError,
    protocol::{MessagePayload, ServerFrame, StatusUpdatePayload},
};

use crate::error::SyncError;

/// Login-scoped identity carried in the channel handshake and on every
/// request/response call.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    pub user_id: UserId,
    pub token: String,
}

impl Credential {
    pub fn new(user_id: impl Into<UserId>, token: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            token: token.into(),
        }
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("user_id", &self.user_id)
            .field("token", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageEvent {
    pub message: Message,
    pub sender_email: Option<String>,
    pub sender_role: Option<String>,
}

impl MessageEvent {
    pub fn conversation_id(&self) -> &ConversationId {
        &self.message.conversation_id
    }

    pub fn message_id(&self) -> &MessageId {
        &self.message.id
    }
}

impl From<Message> for MessageEvent {
    fn from(message: Message) -> Self {
        Self {
            message,
            sender_email: None,
            sender_role: None,
        }
    }
}

impl From<MessagePayload> for MessageEvent {
    fn from(payload: MessagePayload) -> Self {
        let sender_email = payload.sender_email.clone();
        let sender_role = payload.sender_role.clone();
        Self {
            message: payload.into_message(),
            sender_email,
            sender_role,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEvent {
    pub message_id: MessageId,
    pub conversation_id: ConversationId,
    pub status: DeliveryStatus,
    pub read_at: Option<DateTime<Utc>>,
}

impl From<StatusUpdatePayload> for StatusEvent {
    fn from(payload: StatusUpdatePayload) -> Self {
        Self {
            message_id: payload.message_id,
            conversation_id: payload.conversation_id,
            status: payload.status,
            read_at: payload.read_at,
        }
    }
}

/// Validated channel event. Only these variants ever reach the dispatcher.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    Message(MessageEvent),
    Status(StatusEvent),
    JoinAcknowledged(ConversationId),
    ServerError(ApiError),
}

impl InboundEvent {
    pub fn conversation_id(&self) -> Option<&ConversationId> {
        match self {
            InboundEvent::Message(event) => Some(event.conversation_id()),
            InboundEvent::Status(event) => Some(&event.conversation_id),
            InboundEvent::JoinAcknowledged(conversation_id) => Some(conversation_id),
            InboundEvent::ServerError(_) => None,
        }
    }

    pub fn parse(raw: &str) -> Result<Self, SyncError> {
        let frame: ServerFrame = serde_json::from_str(raw)
            .map_err(|err| SyncError::InvalidEvent(format!("undecodable frame: {err}")))?;
        Self::try_from(frame)
    }
}

impl TryFrom<ServerFrame> for InboundEvent {
    type Error = SyncError;

    fn try_from(frame: ServerFrame) -> Result<Self, Self::Error> {
        match frame {
            ServerFrame::MessageReceived(payload) => {
                if payload.id.is_empty() {
                    return Err(SyncError::InvalidEvent("message_received without id".into()));
                }
                if payload.conversation_id.is_empty() {
                    return Err(SyncError::InvalidEvent(format!(
                        "message {} has no conversation_id",
                        payload.id
                    )));
                }
                if payload.sender_id.is_empty() {
                    return Err(SyncError::InvalidEvent(format!(
                        "message {} has no sender_id",
                        payload.id
                    )));
                }
                Ok(InboundEvent::Message(MessageEvent::from(payload)))
            }
            ServerFrame::MessageStatusUpdate(payload) => {
                if payload.message_id.is_empty() || payload.conversation_id.is_empty() {
                    return Err(SyncError::InvalidEvent(
                        "message_status_update requires messageId and conversationId".into(),
                    ));
                }
                Ok(InboundEvent::Status(StatusEvent::from(payload)))
            }
            ServerFrame::ConversationJoined(payload) => {
                if payload.conversation_id.is_empty() {
                    return Err(SyncError::InvalidEvent(
                        "conversation_joined without conversationId".into(),
                    ));
                }
                Ok(InboundEvent::JoinAcknowledged(payload.conversation_id))
            }
            ServerFrame::Error(error) => Ok(InboundEvent::ServerError(error)),
        }
    }
}

/// Coarse notifications for the view layer, fanned out on a broadcast channel.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    ConnectionChanged(ConnectionState),
    TimelineChanged { conversation_id: ConversationId },
    Error(String),
}

#[cfg(test)]
#[path = "tests/types_tests.rs"]
mod tests;
