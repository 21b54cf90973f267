//! Optimistic sends: a local placeholder for instant feedback, the real send
//! over the request/response path, and reconciliation once it settles.

use std::sync::Arc;

use shared::domain::{ConversationId, Message};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{engine::SyncEngine, error::SyncError, types::MessageEvent};

pub const TEMP_ID_PREFIX: &str = "temp-";

pub fn new_temp_id() -> String {
    format!("{TEMP_ID_PREFIX}{}", Uuid::new_v4())
}

impl SyncEngine {
    /// Sends `text` to `conversation_id` and returns the confirmed message.
    ///
    /// The placeholder never outlives the response: it is removed when the
    /// call succeeds, fails or times out. A confirmed send whose channel echo
    /// never shows up is inserted from the response after
    /// `reconciliation_timeout`.
    pub async fn send(
        self: &Arc<Self>,
        conversation_id: &ConversationId,
        text: &str,
    ) -> Result<Message, SyncError> {
        if text.trim().is_empty() {
            return Err(SyncError::EmptyMessage);
        }

        let temp_id = new_temp_id();
        self.store.insert_temporary(Message::temporary(
            temp_id.clone(),
            conversation_id.clone(),
            self.viewer.clone(),
            text,
        ));
        self.notify_timeline(conversation_id);
        debug!(conversation_id = %conversation_id, temp_id = %temp_id, "send: placeholder inserted");

        let response = tokio::time::timeout(
            self.config.request_timeout(),
            self.api.send_message(conversation_id, text),
        )
        .await;

        if self.store.remove_temporary(conversation_id, &temp_id) {
            self.notify_timeline(conversation_id);
        }

        match response {
            Ok(Ok(payload)) => {
                let confirmed = MessageEvent::from(payload);
                info!(
                    conversation_id = %conversation_id,
                    message_id = %confirmed.message_id(),
                    "send: confirmed"
                );
                let message = confirmed.message.clone();
                self.watch_for_echo(confirmed);
                Ok(message)
            }
            Ok(Err(source)) => {
                warn!(conversation_id = %conversation_id, "send: rejected: {source:#}");
                Err(SyncError::SendFailed {
                    conversation_id: conversation_id.clone(),
                    source,
                })
            }
            Err(_) => {
                warn!(
                    conversation_id = %conversation_id,
                    timeout_ms = self.config.request_timeout_ms,
                    "send: timed out"
                );
                Err(SyncError::SendTimedOut {
                    conversation_id: conversation_id.clone(),
                })
            }
        }
    }

    fn watch_for_echo(self: &Arc<Self>, confirmed: MessageEvent) {
        if confirmed.message_id().is_empty() || self.echo_seen(&confirmed) {
            return;
        }
        let engine = Arc::downgrade(self);
        let wait = self.config.reconciliation_timeout();
        tokio::spawn(async move {
            tokio::time::sleep(wait).await;
            let Some(engine) = engine.upgrade() else {
                return;
            };
            if engine.echo_seen(&confirmed) {
                return;
            }
            warn!(
                conversation_id = %confirmed.conversation_id(),
                message_id = %confirmed.message_id(),
                "send: no echo for confirmed message; inserting it from the response"
            );
            engine.ingest_message(confirmed);
        });
    }

    fn echo_seen(&self, confirmed: &MessageEvent) -> bool {
        self.dispatcher.has_seen(confirmed.message_id())
            || self
                .store
                .contains(confirmed.conversation_id(), confirmed.message_id())
    }
}

#[cfg(test)]
#[path = "tests/optimistic_tests.rs"]
mod tests;
