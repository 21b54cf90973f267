use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{
        client::IntoClientRequest,
        http::{header::AUTHORIZATION, HeaderValue},
        Message,
    },
    MaybeTlsStream, WebSocketStream,
};
use tracing::debug;
use url::Url;

use crate::types::Credential;

/// Opens one event channel per call. Reconnect policy lives above this seam.
#[async_trait]
pub trait EventTransport: Send + Sync {
    async fn connect(&self, credential: &Credential) -> Result<Box<dyn EventChannel>>;
}

/// One live bidirectional text channel.
#[async_trait]
pub trait EventChannel: Send {
    async fn send(&mut self, frame: String) -> Result<()>;
    /// `None` once the peer has closed the channel. Must be cancel safe.
    async fn recv(&mut self) -> Option<Result<String>>;
    async fn close(&mut self) -> Result<()>;
}

pub struct WebSocketTransport {
    endpoint: Url,
}

impl WebSocketTransport {
    pub fn new(server_url: &str, ws_path: &str) -> Result<Self> {
        Ok(Self {
            endpoint: websocket_url(server_url, ws_path)?,
        })
    }
}

/// Maps `http(s)://host/base` to `ws(s)://host/<ws_path>`.
pub fn websocket_url(server_url: &str, ws_path: &str) -> Result<Url> {
    let mut url = Url::parse(server_url).with_context(|| format!("invalid server_url: {server_url}"))?;
    let scheme = match url.scheme() {
        "https" => "wss",
        "http" => "ws",
        "ws" | "wss" => return Ok(with_path(url, ws_path)),
        other => return Err(anyhow!("unsupported server_url scheme: {other}")),
    };
    url.set_scheme(scheme)
        .map_err(|_| anyhow!("failed to rewrite scheme for {server_url}"))?;
    Ok(with_path(url, ws_path))
}

fn with_path(mut url: Url, ws_path: &str) -> Url {
    let path = if ws_path.starts_with('/') {
        ws_path.to_string()
    } else {
        format!("/{ws_path}")
    };
    url.set_path(&path);
    url.set_query(None);
    url
}

#[async_trait]
impl EventTransport for WebSocketTransport {
    async fn connect(&self, credential: &Credential) -> Result<Box<dyn EventChannel>> {
        let mut url = self.endpoint.clone();
        url.query_pairs_mut()
            .append_pair("token", &credential.token)
            .append_pair("user_id", credential.user_id.as_str());

        let mut request = url
            .as_str()
            .into_client_request()
            .context("failed to build websocket handshake")?;
        let bearer = HeaderValue::from_str(&format!("Bearer {}", credential.token))
            .context("credential token is not a valid header value")?;
        request.headers_mut().insert(AUTHORIZATION, bearer);

        let (stream, _) = connect_async(request)
            .await
            .with_context(|| format!("failed to connect websocket: {}", self.endpoint))?;
        debug!(endpoint = %self.endpoint, "transport: websocket handshake complete");
        Ok(Box::new(WebSocketChannel { stream }))
    }
}

struct WebSocketChannel {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl EventChannel for WebSocketChannel {
    async fn send(&mut self, frame: String) -> Result<()> {
        self.stream
            .send(Message::Text(frame))
            .await
            .context("websocket send failed")
    }

    async fn recv(&mut self) -> Option<Result<String>> {
        loop {
            match self.stream.next().await? {
                Ok(Message::Text(text)) => return Some(Ok(text)),
                Ok(Message::Binary(bytes)) => match String::from_utf8(bytes) {
                    Ok(text) => return Some(Ok(text)),
                    Err(err) => debug!("transport: skipping non-utf8 binary frame: {err}"),
                },
                Ok(Message::Close(_)) => return None,
                Ok(_) => {}
                Err(err) => return Some(Err(anyhow!("websocket receive failed: {err}"))),
            }
        }
    }

    async fn close(&mut self) -> Result<()> {
        self.stream
            .close(None)
            .await
            .context("websocket close failed")
    }
}

#[cfg(test)]
#[path = "tests/transport_tests.rs"]
mod tests;
