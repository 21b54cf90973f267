use std::sync::{Mutex, MutexGuard, PoisonError};

pub mod api;
pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod listeners;
pub mod optimistic;
pub mod rooms;
pub mod session;
pub mod status;
pub mod store;
pub mod transport;
pub mod types;

pub use api::{ChatApi, HttpChatApi};
pub use config::{load_settings, SyncConfig};
pub use error::SyncError;
pub use listeners::{ListenerId, Subscription};
pub use session::ChatSession;
pub use transport::{EventChannel, EventTransport, WebSocketTransport};
pub use types::{
    ConnectionState, Credential, InboundEvent, MessageEvent, SessionEvent, StatusEvent,
};

#[cfg(test)]
#[path = "tests/support.rs"]
pub(crate) mod test_support;

/// Locks `mutex`, recovering the data if a listener panicked while it was
/// held.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
