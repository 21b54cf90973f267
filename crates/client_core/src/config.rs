use std::{fmt::Display, fs, path::Path, str::FromStr, time::Duration};

use serde::{Deserialize, Serialize};
use tracing::warn;
use url::Url;

use crate::error::SyncError;

const ENV_PREFIX: &str = "CHAT_SYNC__";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub server_url: String,
    pub ws_path: String,
    pub api_prefix: String,
    pub request_timeout_ms: u64,
    pub reconnect_base_delay_ms: u64,
    pub reconnect_max_delay_ms: u64,
    pub shutdown_timeout_ms: u64,
    pub tick_interval_ms: u64,
    /// How long a rejoined room may wait for `conversation_joined` before it is
    /// treated as active anyway.
    pub join_ack_timeout_ms: u64,
    /// How long after a confirmed send the engine waits for the channel echo
    /// before inserting the confirmed copy itself.
    pub reconciliation_timeout_ms: u64,
    /// Maximum age of a pending placeholder that an echo may still replace.
    pub reconciliation_window_ms: u64,
    pub dedup_window: usize,
    pub held_event_limit: usize,
    pub max_messages_per_conversation: usize,
    pub event_capacity: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            server_url: "http://127.0.0.1:8080".into(),
            ws_path: "/ws".into(),
            api_prefix: "/api".into(),
            request_timeout_ms: 15_000,
            reconnect_base_delay_ms: 500,
            reconnect_max_delay_ms: 30_000,
            shutdown_timeout_ms: 1_000,
            tick_interval_ms: 250,
            join_ack_timeout_ms: 2_000,
            reconciliation_timeout_ms: 10_000,
            reconciliation_window_ms: 60_000,
            dedup_window: 2_048,
            held_event_limit: 256,
            max_messages_per_conversation: 500,
            event_capacity: 1_024,
        }
    }
}

impl SyncConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn join_ack_timeout(&self) -> Duration {
        Duration::from_millis(self.join_ack_timeout_ms)
    }

    pub fn reconciliation_timeout(&self) -> Duration {
        Duration::from_millis(self.reconciliation_timeout_ms)
    }

    pub fn reconciliation_window(&self) -> Duration {
        Duration::from_millis(self.reconciliation_window_ms)
    }

    pub fn validate(&self) -> Result<(), SyncError> {
        let url = Url::parse(&self.server_url)
            .map_err(|err| SyncError::Config(format!("server_url '{}': {err}", self.server_url)))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(SyncError::Config(
                "server_url must start with http:// or https://".into(),
            ));
        }
        if self.tick_interval_ms == 0 || self.request_timeout_ms == 0 {
            return Err(SyncError::Config(
                "tick_interval_ms and request_timeout_ms must be positive".into(),
            ));
        }
        if self.dedup_window == 0
            || self.held_event_limit == 0
            || self.max_messages_per_conversation == 0
            || self.event_capacity == 0
        {
            return Err(SyncError::Config(
                "dedup_window, held_event_limit, max_messages_per_conversation and event_capacity must be positive"
                    .into(),
            ));
        }
        if self.reconnect_base_delay_ms > self.reconnect_max_delay_ms {
            return Err(SyncError::Config(
                "reconnect_base_delay_ms must not exceed reconnect_max_delay_ms".into(),
            ));
        }
        Ok(())
    }
}

/// Defaults, then the TOML file at `path` (if readable), then `CHAT_SYNC__*`
/// environment variables.
pub fn load_settings(path: Option<&Path>) -> SyncConfig {
    let mut settings = SyncConfig::default();

    if let Some(path) = path {
        match fs::read_to_string(path) {
            Ok(raw) => match toml::from_str::<SyncConfig>(&raw) {
                Ok(file_cfg) => settings = file_cfg,
                Err(err) => warn!(path = %path.display(), "config: ignoring invalid file: {err}"),
            },
            Err(err) => warn!(path = %path.display(), "config: file not readable: {err}"),
        }
    }

    apply_env_overrides(&mut settings, |key| std::env::var(key).ok());
    settings
}

fn apply_env_overrides(settings: &mut SyncConfig, lookup: impl Fn(&str) -> Option<String>) {
    let var = |name: &str| lookup(&format!("{ENV_PREFIX}{name}"));

    if let Some(v) = var("SERVER_URL") {
        settings.server_url = v;
    }
    if let Some(v) = var("WS_PATH") {
        settings.ws_path = v;
    }
    if let Some(v) = var("API_PREFIX") {
        settings.api_prefix = v;
    }

    numeric(&var, "REQUEST_TIMEOUT_MS", &mut settings.request_timeout_ms);
    numeric(&var, "RECONNECT_BASE_DELAY_MS", &mut settings.reconnect_base_delay_ms);
    numeric(&var, "RECONNECT_MAX_DELAY_MS", &mut settings.reconnect_max_delay_ms);
    numeric(&var, "SHUTDOWN_TIMEOUT_MS", &mut settings.shutdown_timeout_ms);
    numeric(&var, "TICK_INTERVAL_MS", &mut settings.tick_interval_ms);
    numeric(&var, "JOIN_ACK_TIMEOUT_MS", &mut settings.join_ack_timeout_ms);
    numeric(&var, "RECONCILIATION_TIMEOUT_MS", &mut settings.reconciliation_timeout_ms);
    numeric(&var, "RECONCILIATION_WINDOW_MS", &mut settings.reconciliation_window_ms);
    numeric(&var, "DEDUP_WINDOW", &mut settings.dedup_window);
    numeric(&var, "HELD_EVENT_LIMIT", &mut settings.held_event_limit);
    numeric(
        &var,
        "MAX_MESSAGES_PER_CONVERSATION",
        &mut settings.max_messages_per_conversation,
    );
    numeric(&var, "EVENT_CAPACITY", &mut settings.event_capacity);
}

fn numeric<T>(var: impl Fn(&str) -> Option<String>, name: &str, target: &mut T)
where
    T: FromStr,
    T::Err: Display,
{
    if let Some(v) = var(name) {
        match v.parse::<T>() {
            Ok(parsed) => *target = parsed,
            Err(err) => warn!(variable = name, "config: ignoring non-numeric override: {err}"),
        }
    }
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
