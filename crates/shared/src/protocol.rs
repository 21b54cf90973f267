use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    domain::{ConversationId, DeliveryStatus, Message, MessageId, UserId},
    error::ApiError,
};

/// Message record as pushed by `message_received` and returned by the REST
/// message endpoints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessagePayload {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_role: Option<String>,
    pub message_text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivered_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<DeliveryStatus>,
}

impl MessagePayload {
    pub fn into_message(self) -> Message {
        Message {
            id: self.id,
            conversation_id: self.conversation_id,
            sender_id: self.sender_id,
            text: self.message_text,
            created_at: self.created_at.unwrap_or_else(Utc::now),
            delivered_at: self.delivered_at,
            read_at: self.read_at,
            status: self.status,
            is_temporary: false,
            client_temp_id: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusUpdatePayload {
    pub message_id: MessageId,
    pub conversation_id: ConversationId,
    pub status: DeliveryStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationJoinedPayload {
    pub conversation_id: ConversationId,
}

/// Frames pushed by the backend over the event channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ServerFrame {
    MessageReceived(MessagePayload),
    MessageStatusUpdate(StatusUpdatePayload),
    ConversationJoined(ConversationJoinedPayload),
    Error(ApiError),
}

/// Frames the client emits over the event channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ClientFrame {
    #[serde(rename_all = "camelCase")]
    JoinConversation { conversation_id: ConversationId },
    #[serde(rename_all = "camelCase")]
    LeaveConversation { conversation_id: ConversationId },
    #[serde(rename_all = "camelCase")]
    MessageRead {
        message_id: MessageId,
        conversation_id: ConversationId,
    },
}

impl ClientFrame {
    pub fn is_membership(&self) -> bool {
        matches!(
            self,
            ClientFrame::JoinConversation { .. } | ClientFrame::LeaveConversation { .. }
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendMessageRequest {
    pub message_text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarkReadRequest {
    pub conversation_id: ConversationId,
}

#[cfg(test)]
#[path = "tests/protocol_tests.rs"]
mod tests;
