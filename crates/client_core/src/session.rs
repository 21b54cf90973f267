//! One `ChatSession` per authenticated login. It owns the channel, the room
//! set, the listener registries and the timelines; views receive it (or an
//! `Arc` of it) instead of reaching for shared global state.

use std::{sync::Arc, time::Duration};

use shared::domain::{ConversationId, DeliveryStatus, Message, MessageId};
use tokio::sync::{broadcast, watch};
use tracing::info;

use crate::{
    api::{ChatApi, HttpChatApi},
    config::SyncConfig,
    connection::{ConnectionManager, OutboundLink, ReconnectPolicy},
    engine::SyncEngine,
    error::SyncError,
    listeners::Subscription,
    transport::{EventTransport, WebSocketTransport},
    types::{ConnectionState, Credential, MessageEvent, SessionEvent, StatusEvent},
};

pub struct ChatSession {
    credential: Credential,
    engine: Arc<SyncEngine>,
    connection: ConnectionManager,
}

impl ChatSession {
    /// Fails with `SyncError::Config` when `config` does not validate.
    pub fn new(
        config: SyncConfig,
        credential: Credential,
        transport: Arc<dyn EventTransport>,
        api: Arc<dyn ChatApi>,
    ) -> Result<Self, SyncError> {
        config.validate()?;
        Ok(Self::assemble(config, credential, transport, api))
    }

    fn assemble(
        config: SyncConfig,
        credential: Credential,
        transport: Arc<dyn EventTransport>,
        api: Arc<dyn ChatApi>,
    ) -> Self {
        let link = Arc::new(OutboundLink::new());
        let connection = ConnectionManager::new(
            transport,
            Arc::clone(&link),
            ReconnectPolicy::new(
                Duration::from_millis(config.reconnect_base_delay_ms),
                Duration::from_millis(config.reconnect_max_delay_ms),
            ),
            config.tick_interval(),
            config.shutdown_timeout(),
        );
        let engine = Arc::new(SyncEngine::new(
            credential.user_id.clone(),
            config,
            api,
            link,
        ));
        Self {
            credential,
            engine,
            connection,
        }
    }

    /// WebSocket channel plus HTTP API, both pointed at `config.server_url`.
    pub fn with_defaults(config: SyncConfig, credential: Credential) -> Result<Self, SyncError> {
        config.validate()?;
        let transport = WebSocketTransport::new(&config.server_url, &config.ws_path)
            .map_err(|err| SyncError::Transport(format!("{err:#}")))?;
        let api = HttpChatApi::new(
            &config.server_url,
            &config.api_prefix,
            credential.clone(),
            config.request_timeout(),
        )
        .map_err(|err| SyncError::Transport(format!("{err:#}")))?;
        Ok(Self::assemble(
            config,
            credential,
            Arc::new(transport),
            Arc::new(api),
        ))
    }

    pub fn credential(&self) -> &Credential {
        &self.credential
    }

    /// Starts the channel. Returns false when it is already running.
    pub fn connect(&self) -> bool {
        info!(user_id = %self.credential.user_id, "session: connecting");
        self.connection
            .connect(self.credential.clone(), Arc::clone(&self.engine))
    }

    pub async fn disconnect(&self) {
        self.connection.disconnect().await;
        self.engine.settle_disconnected();
        info!(user_id = %self.credential.user_id, "session: disconnected");
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn watch_connection(&self) -> watch::Receiver<ConnectionState> {
        self.connection.watch_state()
    }

    /// Resolves once the channel is up, or fails with `NotConnected` after
    /// `timeout`.
    pub async fn wait_connected(&self, timeout: Duration) -> Result<(), SyncError> {
        let mut state = self.connection.watch_state();
        let reached = matches!(
            tokio::time::timeout(
                timeout,
                state.wait_for(|state| *state == ConnectionState::Connected),
            )
            .await,
            Ok(Ok(_))
        );
        if reached {
            Ok(())
        } else {
            Err(SyncError::NotConnected)
        }
    }

    pub fn join(&self, conversation_id: impl Into<ConversationId>) -> bool {
        self.engine.rooms.join(conversation_id.into())
    }

    pub fn leave(&self, conversation_id: impl Into<ConversationId>) -> bool {
        let conversation_id = conversation_id.into();
        let left = self.engine.rooms.leave(&conversation_id);
        self.engine.forget_room(&conversation_id);
        left
    }

    pub fn joined_conversations(&self) -> Vec<ConversationId> {
        self.engine.rooms.snapshot()
    }

    /// Joins, makes the conversation active and loads its history.
    pub async fn open_conversation(
        &self,
        conversation_id: impl Into<ConversationId>,
    ) -> Result<Vec<Message>, SyncError> {
        let conversation_id = conversation_id.into();
        self.engine.rooms.join(conversation_id.clone());
        self.engine
            .set_active_conversation(Some(conversation_id.clone()));

        let history = tokio::time::timeout(
            self.engine.config.request_timeout(),
            self.engine.api.get_conversation_messages(&conversation_id),
        )
        .await
        .map_err(|_| SyncError::History {
            conversation_id: conversation_id.clone(),
            source: anyhow::anyhow!("request timed out"),
        })?
        .map_err(|source| SyncError::History {
            conversation_id: conversation_id.clone(),
            source,
        })?;

        self.engine.merge_history(&conversation_id, history);
        Ok(self.engine.store.messages(&conversation_id))
    }

    pub fn close_conversation(&self, conversation_id: impl Into<ConversationId>) -> bool {
        let conversation_id = conversation_id.into();
        self.engine.clear_active_if(&conversation_id);
        self.leave(conversation_id)
    }

    pub fn set_active_conversation(&self, conversation_id: Option<ConversationId>) {
        self.engine.set_active_conversation(conversation_id);
    }

    pub fn active_conversation(&self) -> Option<ConversationId> {
        self.engine.active_conversation()
    }

    pub async fn send(
        &self,
        conversation_id: impl Into<ConversationId>,
        text: &str,
    ) -> Result<Message, SyncError> {
        self.engine.send(&conversation_id.into(), text).await
    }

    pub fn mark_read(
        &self,
        conversation_id: impl Into<ConversationId>,
        message_id: impl Into<MessageId>,
    ) -> bool {
        self.engine
            .mark_read(&conversation_id.into(), &message_id.into())
    }

    pub fn mark_conversation_read(&self, conversation_id: impl Into<ConversationId>) -> usize {
        self.engine.mark_conversation_read(&conversation_id.into())
    }

    pub fn messages(&self, conversation_id: impl Into<ConversationId>) -> Vec<Message> {
        self.engine.store.messages(&conversation_id.into())
    }

    pub fn message_status(&self, message_id: impl Into<MessageId>) -> Option<DeliveryStatus> {
        self.engine.statuses.status(&message_id.into())
    }

    pub fn add_message_listener<F>(&self, conversation_id: impl Into<ConversationId>, listener: F) -> Subscription
    where
        F: Fn(&MessageEvent) + Send + Sync + 'static,
    {
        self.engine
            .dispatcher
            .messages()
            .subscribe(conversation_id.into(), listener)
    }

    pub fn remove_message_listener(&self, subscription: Subscription) -> bool {
        self.engine
            .dispatcher
            .messages()
            .remove_subscription(subscription)
    }

    pub fn add_global_message_listener<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&MessageEvent) + Send + Sync + 'static,
    {
        self.engine.dispatcher.messages().subscribe_global(listener)
    }

    pub fn remove_global_message_listener(&self, subscription: Subscription) -> bool {
        self.remove_message_listener(subscription)
    }

    pub fn add_status_listener<F>(&self, conversation_id: impl Into<ConversationId>, listener: F) -> Subscription
    where
        F: Fn(&StatusEvent) + Send + Sync + 'static,
    {
        self.engine
            .dispatcher
            .statuses()
            .subscribe(conversation_id.into(), listener)
    }

    pub fn remove_status_listener(&self, subscription: Subscription) -> bool {
        self.engine
            .dispatcher
            .statuses()
            .remove_subscription(subscription)
    }

    pub fn add_global_status_listener<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&StatusEvent) + Send + Sync + 'static,
    {
        self.engine.dispatcher.statuses().subscribe_global(listener)
    }

    pub fn remove_global_status_listener(&self, subscription: Subscription) -> bool {
        self.remove_status_listener(subscription)
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.engine.subscribe_events()
    }
}
