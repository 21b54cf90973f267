use shared::domain::ConversationId;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("event channel is not connected")]
    NotConnected,
    #[error("message text must not be empty")]
    EmptyMessage,
    #[error("failed to send message to conversation {conversation_id}: {source}")]
    SendFailed {
        conversation_id: ConversationId,
        source: anyhow::Error,
    },
    #[error("send to conversation {conversation_id} timed out")]
    SendTimedOut { conversation_id: ConversationId },
    #[error("invalid channel event: {0}")]
    InvalidEvent(String),
    #[error("failed to load history for conversation {conversation_id}: {source}")]
    History {
        conversation_id: ConversationId,
        source: anyhow::Error,
    },
    #[error("transport setup failed: {0}")]
    Transport(String),
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl SyncError {
    /// Send failures are the only errors the view layer is expected to show
    /// next to a message.
    pub fn is_send_failure(&self) -> bool {
        matches!(
            self,
            SyncError::SendFailed { .. } | SyncError::SendTimedOut { .. } | SyncError::EmptyMessage
        )
    }
}
