//! Lifecycle of the single event channel a session owns.

use std::{
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use anyhow::Result;
use shared::{domain::ConversationId, protocol::ClientFrame};
use tokio::{
    sync::{mpsc, oneshot, watch},
    task::JoinHandle,
    time::MissedTickBehavior,
};
use tracing::{debug, info, warn};

use crate::{
    lock,
    transport::{EventChannel, EventTransport},
    types::{ConnectionState, Credential},
};

/// Exponential backoff between reconnect attempts.
#[derive(Debug, Clone, Copy)]
pub struct ReconnectPolicy {
    base_delay: Duration,
    max_delay: Duration,
}

impl ReconnectPolicy {
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
        }
    }

    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let multiplier = 1_u32 << attempt.min(16);
        self.base_delay
            .saturating_mul(multiplier)
            .min(self.max_delay)
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::new(Duration::from_millis(500), Duration::from_secs(30))
    }
}

/// Write side of the channel as seen by the rest of the session. Frames are
/// only queued while connected.
pub struct OutboundLink {
    state: watch::Sender<ConnectionState>,
    queue: Mutex<Option<mpsc::UnboundedSender<ClientFrame>>>,
}

impl Default for OutboundLink {
    fn default() -> Self {
        Self::new()
    }
}

impl OutboundLink {
    pub fn new() -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            state,
            queue: Mutex::new(None),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn watch(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Queues `frame` for the driver. Returns false when there is no live
    /// channel to carry it.
    pub fn emit(&self, frame: ClientFrame) -> bool {
        if !self.is_connected() {
            debug!(?frame, "connection: not connected; frame skipped");
            return false;
        }
        match lock(&self.queue).as_ref() {
            Some(queue) => queue.send(frame).is_ok(),
            None => false,
        }
    }

    pub(crate) fn set_state(&self, next: ConnectionState) {
        self.state.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
    }

    pub(crate) fn attach(&self) -> mpsc::UnboundedReceiver<ClientFrame> {
        let (tx, rx) = mpsc::unbounded_channel();
        *lock(&self.queue) = Some(tx);
        rx
    }

    pub(crate) fn detach(&self) {
        lock(&self.queue).take();
    }
}

/// Callbacks the driver invokes from its task. All of them run on the same
/// task, one at a time.
pub trait ChannelHandler: Send + Sync + 'static {
    /// The channel is up. Returns the rooms to join before any other frame
    /// is written.
    fn on_connected(&self, reconnected: bool) -> Vec<ConversationId>;
    fn on_frame(&self, raw: &str);
    fn on_tick(&self, now: Instant);
    fn on_disconnected(&self, reason: &str);
    fn on_connect_error(&self, error: &anyhow::Error, attempt: u32);
}

struct DriverHandle {
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

pub struct ConnectionManager {
    transport: Arc<dyn EventTransport>,
    link: Arc<OutboundLink>,
    policy: ReconnectPolicy,
    tick_interval: Duration,
    shutdown_timeout: Duration,
    driver: Mutex<Option<DriverHandle>>,
}

impl ConnectionManager {
    pub fn new(
        transport: Arc<dyn EventTransport>,
        link: Arc<OutboundLink>,
        policy: ReconnectPolicy,
        tick_interval: Duration,
        shutdown_timeout: Duration,
    ) -> Self {
        Self {
            transport,
            link,
            policy,
            tick_interval,
            shutdown_timeout,
            driver: Mutex::new(None),
        }
    }

    /// Starts the driver task. Returns false when one is already running.
    pub fn connect<H: ChannelHandler>(&self, credential: Credential, handler: H) -> bool {
        let mut driver = lock(&self.driver);
        if driver
            .as_ref()
            .is_some_and(|active| !active.task.is_finished())
        {
            debug!("connection: driver already running");
            return false;
        }

        let outbound = self.link.attach();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        self.link.set_state(ConnectionState::Connecting);
        let task = tokio::spawn(
            Driver {
                transport: Arc::clone(&self.transport),
                credential,
                link: Arc::clone(&self.link),
                handler,
                policy: self.policy,
                tick_interval: self.tick_interval,
            }
            .run(outbound, shutdown_rx),
        );
        *driver = Some(DriverHandle {
            shutdown: shutdown_tx,
            task,
        });
        true
    }

    pub async fn disconnect(&self) {
        let active = lock(&self.driver).take();
        if let Some(active) = active {
            let _ = active.shutdown.send(());
            let mut task = active.task;
            if tokio::time::timeout(self.shutdown_timeout, &mut task)
                .await
                .is_err()
            {
                warn!("connection: driver did not stop in time; aborting");
                task.abort();
            }
        }
        self.link.detach();
        self.link.set_state(ConnectionState::Disconnected);
    }

    pub fn is_connected(&self) -> bool {
        self.link.is_connected()
    }

    pub fn state(&self) -> ConnectionState {
        self.link.state()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.link.watch()
    }

    pub fn link(&self) -> Arc<OutboundLink> {
        Arc::clone(&self.link)
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        if let Some(active) = lock(&self.driver).take() {
            active.task.abort();
        }
    }
}

enum SessionEnd {
    Shutdown,
    Lost(String),
}

struct Driver<H> {
    transport: Arc<dyn EventTransport>,
    credential: Credential,
    link: Arc<OutboundLink>,
    handler: H,
    policy: ReconnectPolicy,
    tick_interval: Duration,
}

impl<H: ChannelHandler> Driver<H> {
    async fn run(
        self,
        mut outbound: mpsc::UnboundedReceiver<ClientFrame>,
        mut shutdown: oneshot::Receiver<()>,
    ) {
        let mut attempt: u32 = 0;
        let mut established_before = false;

        loop {
            self.link.set_state(ConnectionState::Connecting);
            let connected = tokio::select! {
                result = self.transport.connect(&self.credential) => result,
                _ = &mut shutdown => break,
            };

            match connected {
                Ok(channel) => {
                    attempt = 0;
                    let reconnected = established_before;
                    established_before = true;
                    info!(reconnected, "connection: channel established");
                    let end = self
                        .serve(channel, reconnected, &mut outbound, &mut shutdown)
                        .await;
                    self.link.set_state(ConnectionState::Disconnected);
                    match end {
                        SessionEnd::Shutdown => {
                            info!("connection: closed by client");
                            self.handler.on_disconnected("client shut down");
                            break;
                        }
                        SessionEnd::Lost(reason) => {
                            warn!("connection: lost: {reason}");
                            self.handler.on_disconnected(&reason);
                        }
                    }
                }
                Err(err) => {
                    self.link.set_state(ConnectionState::Disconnected);
                    warn!(attempt, "connection: connect_error: {err:#}");
                    self.handler.on_connect_error(&err, attempt);
                }
            }

            let delay = self.policy.delay_for_attempt(attempt);
            attempt = attempt.saturating_add(1);
            debug!(delay_ms = delay.as_millis() as u64, "connection: retry scheduled");
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = &mut shutdown => break,
            }
        }

        self.link.set_state(ConnectionState::Disconnected);
    }

    async fn serve(
        &self,
        mut channel: Box<dyn EventChannel>,
        reconnected: bool,
        outbound: &mut mpsc::UnboundedReceiver<ClientFrame>,
        shutdown: &mut oneshot::Receiver<()>,
    ) -> SessionEnd {
        self.link.set_state(ConnectionState::Connected);

        // Membership frames queued before this channel went live are
        // superseded by the replay below.
        let mut deferred = Vec::new();
        while let Ok(frame) = outbound.try_recv() {
            if frame.is_membership() {
                debug!(?frame, "connection: dropping stale membership frame");
            } else {
                deferred.push(frame);
            }
        }

        let rooms = self.handler.on_connected(reconnected);
        debug!(rooms = rooms.len(), reconnected, "connection: replaying room membership");
        for conversation_id in rooms {
            let frame = ClientFrame::JoinConversation { conversation_id };
            if let Err(err) = send_frame(channel.as_mut(), &frame).await {
                return SessionEnd::Lost(format!("{err:#}"));
            }
        }
        for frame in deferred {
            if let Err(err) = send_frame(channel.as_mut(), &frame).await {
                return SessionEnd::Lost(format!("{err:#}"));
            }
        }

        let mut ticker = tokio::time::interval(self.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                incoming = channel.recv() => match incoming {
                    Some(Ok(raw)) => self.handler.on_frame(&raw),
                    Some(Err(err)) => return SessionEnd::Lost(format!("transport receive error: {err:#}")),
                    None => return SessionEnd::Lost("channel closed by server".into()),
                },
                frame = outbound.recv() => match frame {
                    Some(frame) => {
                        if let Err(err) = send_frame(channel.as_mut(), &frame).await {
                            return SessionEnd::Lost(format!("{err:#}"));
                        }
                    }
                    None => {
                        let _ = channel.close().await;
                        return SessionEnd::Shutdown;
                    }
                },
                _ = ticker.tick() => self.handler.on_tick(Instant::now()),
                _ = &mut *shutdown => {
                    let _ = channel.close().await;
                    return SessionEnd::Shutdown;
                }
            }
        }
    }
}

async fn send_frame(channel: &mut dyn EventChannel, frame: &ClientFrame) -> Result<()> {
    let text = match serde_json::to_string(frame) {
        Ok(text) => text,
        Err(err) => {
            warn!(?frame, "connection: failed to encode frame: {err}");
            return Ok(());
        }
    };
    channel.send(text).await
}

#[cfg(test)]
#[path = "tests/connection_tests.rs"]
mod tests;
