//! Feedback delivery channels
//!
//! Two redundant paths feed the same [`LatestFeedback`](crate::feedback::LatestFeedback):
//! a persistent push connection ([`PushChannel`]) and a polling loop
//! ([`PullChannel`]). Timestamp comparison is the only arbitration.

mod backoff;
mod pull;
mod push;
mod transport;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

pub use backoff::{DEFAULT_BASE_DELAY, DEFAULT_MAX_ATTEMPTS, ReconnectPolicy};
pub use pull::{PullChannel, StatusResponse};
pub use push::PushChannel;
pub use transport::{
    ABNORMAL_CLOSE, Connection, Connector, Frame, NORMAL_CLOSE, WsConnector,
};

use crate::feedback::{ChannelMessage, FeedbackEvent, MessageKind};

/// Connection lifecycle of the push channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChannelState {
    /// Not connected; terminal after reconnects are exhausted
    #[default]
    Disconnected,
    /// Opening a connection
    Connecting,
    /// Connection open
    Connected,
    /// Waiting before the next reconnect attempt
    Reconnecting,
}

impl std::fmt::Display for ChannelState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
            Self::Reconnecting => write!(f, "reconnecting"),
        }
    }
}

/// Callback invoked with accepted feedback
pub type FeedbackCallback = Arc<dyn Fn(&FeedbackEvent) + Send + Sync>;

/// Callback invoked with a push-channel message
pub type MessageCallback = Arc<dyn Fn(&ChannelMessage) + Send + Sync>;

/// Handle identifying a registered listener
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Type-keyed subscriber registry
///
/// Removal is by [`ListenerId`], never by position. Dispatch works on a
/// snapshot, so callbacks may add or remove listeners without deadlocking.
#[derive(Default)]
pub struct Listeners {
    next_id: AtomicU64,
    by_kind: Mutex<HashMap<MessageKind, Vec<(ListenerId, MessageCallback)>>>,
}

impl Listeners {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a callback for `kind`; callbacks fire in registration order
    pub fn add(&self, kind: MessageKind, callback: MessageCallback) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.by_kind
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(kind)
            .or_default()
            .push((id, callback));
        id
    }

    /// Remove a listener; returns `false` if it was not registered
    pub fn remove(&self, id: ListenerId) -> bool {
        let mut map = self.by_kind.lock().unwrap_or_else(PoisonError::into_inner);
        for list in map.values_mut() {
            if let Some(pos) = list.iter().position(|(lid, _)| *lid == id) {
                list.remove(pos);
                return true;
            }
        }
        false
    }

    /// Remove every listener
    pub fn clear(&self) {
        self.by_kind
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Number of listeners registered for `kind`
    #[must_use]
    pub fn count(&self, kind: MessageKind) -> usize {
        self.by_kind
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&kind)
            .map_or(0, Vec::len)
    }

    /// Deliver `message` to every listener of its kind
    pub fn dispatch(&self, message: &ChannelMessage) {
        let snapshot: Vec<MessageCallback> = self
            .by_kind
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&message.kind)
            .map(|list| list.iter().map(|(_, cb)| Arc::clone(cb)).collect())
            .unwrap_or_default();

        for callback in snapshot {
            callback(message);
        }
    }
}

impl std::fmt::Debug for Listeners {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let map = self.by_kind.lock().unwrap_or_else(PoisonError::into_inner);
        let counts: HashMap<_, _> = map.iter().map(|(k, v)| (*k, v.len())).collect();
        f.debug_struct("Listeners").field("counts", &counts).finish()
    }
}
