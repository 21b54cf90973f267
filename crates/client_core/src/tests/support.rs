//! Shared fixtures for the engine-level unit tests.

use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex},
    time::Duration,
};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use shared::{
    domain::{ConversationId, MessageId, UserId},
    protocol::{ClientFrame, MessagePayload},
};
use tokio::sync::{mpsc, oneshot};

use crate::{
    api::ChatApi,
    config::SyncConfig,
    connection::OutboundLink,
    engine::SyncEngine,
    types::ConnectionState,
};

pub const VIEWER: &str = "me";

pub type SendReply = oneshot::Receiver<Result<MessagePayload, String>>;

/// Scripted request/response backend. Sends wait for a reply pushed with
/// `script_send`; with nothing scripted they fail.
#[derive(Default)]
pub struct MockApi {
    pub sent: Mutex<Vec<(ConversationId, String)>>,
    pub reads: Mutex<Vec<(ConversationId, MessageId)>>,
    pub history_requests: Mutex<Vec<ConversationId>>,
    replies: Mutex<VecDeque<SendReply>>,
    history: Mutex<HashMap<ConversationId, Vec<MessagePayload>>>,
}

impl MockApi {
    pub fn script_send(&self) -> oneshot::Sender<Result<MessagePayload, String>> {
        let (tx, rx) = oneshot::channel();
        self.replies.lock().expect("replies").push_back(rx);
        tx
    }

    pub fn set_history(&self, conversation_id: &str, messages: Vec<MessagePayload>) {
        self.history
            .lock()
            .expect("history")
            .insert(ConversationId::from(conversation_id), messages);
    }
}

#[async_trait]
impl ChatApi for MockApi {
    async fn send_message(&self, conversation_id: &ConversationId, text: &str) -> Result<MessagePayload> {
        self.sent
            .lock()
            .expect("sent")
            .push((conversation_id.clone(), text.to_string()));
        let reply = self.replies.lock().expect("replies").pop_front();
        match reply {
            Some(reply) => match reply.await {
                Ok(Ok(payload)) => Ok(payload),
                Ok(Err(reason)) => Err(anyhow!(reason)),
                Err(_) => Err(anyhow!("reply dropped")),
            },
            None => Err(anyhow!("no reply scripted")),
        }
    }

    async fn get_conversation_messages(&self, conversation_id: &ConversationId) -> Result<Vec<MessagePayload>> {
        self.history_requests
            .lock()
            .expect("history requests")
            .push(conversation_id.clone());
        Ok(self
            .history
            .lock()
            .expect("history")
            .get(conversation_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn mark_message_read(&self, conversation_id: &ConversationId, message_id: &MessageId) -> Result<()> {
        self.reads
            .lock()
            .expect("reads")
            .push((conversation_id.clone(), message_id.clone()));
        Ok(())
    }
}

pub fn payload(id: &str, conversation: &str, sender: &str, text: &str) -> MessagePayload {
    MessagePayload {
        id: MessageId::from(id),
        conversation_id: ConversationId::from(conversation),
        sender_id: UserId::from(sender),
        sender_email: None,
        sender_role: None,
        message_text: text.to_string(),
        created_at: Some(chrono::Utc::now()),
        delivered_at: None,
        read_at: None,
        status: Some(shared::domain::DeliveryStatus::Sent),
    }
}

pub fn message_frame(id: &str, conversation: &str, sender: &str, text: &str) -> String {
    serde_json::json!({
        "event": "message_received",
        "data": payload(id, conversation, sender, text),
    })
    .to_string()
}

pub fn status_frame(id: &str, conversation: &str, status: &str) -> String {
    serde_json::json!({
        "event": "message_status_update",
        "data": {"messageId": id, "conversationId": conversation, "status": status},
    })
    .to_string()
}

pub fn joined_frame(conversation: &str) -> String {
    serde_json::json!({
        "event": "conversation_joined",
        "data": {"conversationId": conversation},
    })
    .to_string()
}

pub fn test_config() -> SyncConfig {
    SyncConfig {
        request_timeout_ms: 2_000,
        join_ack_timeout_ms: 200,
        reconciliation_timeout_ms: 100,
        ..SyncConfig::default()
    }
}

pub struct Fixture {
    pub api: Arc<MockApi>,
    pub link: Arc<OutboundLink>,
    pub engine: Arc<SyncEngine>,
    pub outbound: mpsc::UnboundedReceiver<ClientFrame>,
}

impl Fixture {
    pub fn new(config: SyncConfig) -> Self {
        let api = Arc::new(MockApi::default());
        let link = Arc::new(OutboundLink::new());
        let outbound = link.attach();
        let engine = Arc::new(SyncEngine::new(
            UserId::from(VIEWER),
            config,
            Arc::clone(&api) as Arc<dyn ChatApi>,
            Arc::clone(&link),
        ));
        Self {
            api,
            link,
            engine,
            outbound,
        }
    }

    pub fn go_online(&self) {
        self.link.set_state(ConnectionState::Connected);
    }

    pub fn drain_outbound(&mut self) -> Vec<ClientFrame> {
        let mut frames = Vec::new();
        while let Ok(frame) = self.outbound.try_recv() {
            frames.push(frame);
        }
        frames
    }
}

/// Polls `condition` until it holds or two seconds pass.
pub async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}
