use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use reqwest::{Client, Response};
use shared::{
    domain::{ConversationId, MessageId},
    error::{ApiError, ApiException},
    protocol::{MarkReadRequest, MessagePayload, SendMessageRequest},
};

use crate::types::Credential;

/// Request/response calls the engine needs from the backend.
#[async_trait]
pub trait ChatApi: Send + Sync {
    async fn send_message(&self, conversation_id: &ConversationId, text: &str) -> Result<MessagePayload>;
    async fn get_conversation_messages(&self, conversation_id: &ConversationId) -> Result<Vec<MessagePayload>>;
    async fn mark_message_read(&self, conversation_id: &ConversationId, message_id: &MessageId) -> Result<()>;
}

pub struct HttpChatApi {
    http: Client,
    base_url: String,
    credential: Credential,
}

impl HttpChatApi {
    pub fn new(
        server_url: &str,
        api_prefix: &str,
        credential: Credential,
        timeout: Duration,
    ) -> Result<Self> {
        let http = Client::builder().timeout(timeout).build()?;
        let base_url = format!(
            "{}/{}",
            server_url.trim_end_matches('/'),
            api_prefix.trim_matches('/')
        );
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            credential,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

#[async_trait]
impl ChatApi for HttpChatApi {
    async fn send_message(&self, conversation_id: &ConversationId, text: &str) -> Result<MessagePayload> {
        let response = self
            .http
            .post(format!("{}/conversations/{conversation_id}/messages", self.base_url))
            .bearer_auth(&self.credential.token)
            .json(&SendMessageRequest {
                message_text: text.to_string(),
            })
            .send()
            .await?;
        Ok(check(response).await?.json().await?)
    }

    async fn get_conversation_messages(&self, conversation_id: &ConversationId) -> Result<Vec<MessagePayload>> {
        let response = self
            .http
            .get(format!("{}/conversations/{conversation_id}/messages", self.base_url))
            .bearer_auth(&self.credential.token)
            .send()
            .await?;
        Ok(check(response).await?.json().await?)
    }

    async fn mark_message_read(&self, conversation_id: &ConversationId, message_id: &MessageId) -> Result<()> {
        let response = self
            .http
            .put(format!("{}/messages/{message_id}/read", self.base_url))
            .bearer_auth(&self.credential.token)
            .json(&MarkReadRequest {
                conversation_id: conversation_id.clone(),
            })
            .send()
            .await?;
        check(response).await?;
        Ok(())
    }
}

/// Passes 2xx responses through and turns the rest into errors, using the
/// backend's `ApiError` body when it sent one.
async fn check(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    match serde_json::from_str::<ApiError>(&body) {
        Ok(error) => Err(ApiException::from(error).into()),
        Err(_) if body.trim().is_empty() => Err(anyhow!("request failed with status {status}")),
        Err(_) => Err(anyhow!("request failed with status {status}: {}", body.trim())),
    }
}

#[cfg(test)]
#[path = "tests/api_tests.rs"]
mod tests;
