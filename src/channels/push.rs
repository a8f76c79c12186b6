//! Push feedback channel: persistent connection with bounded reconnects
//!
//! ```text
//! Connected --(close != 1000)--> Reconnecting --(attempt <= max)--> Connecting
//! Connecting --(ok)--> Connected
//! Connecting --(err)--> Reconnecting (attempt + 1)
//! Reconnecting --(attempt > max)--> Disconnected (terminal)
//! ```

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::backoff::ReconnectPolicy;
use super::transport::{Connection, Connector, Frame, NORMAL_CLOSE};
use super::{ChannelState, ListenerId, Listeners, MessageCallback};
use crate::feedback::{self, ChannelMessage, LatestFeedback, MessageKind};
use crate::{Error, Result};

/// How long `disconnect` waits for the close handshake before aborting
const CLOSE_GRACE: Duration = Duration::from_secs(2);

/// Outbound work for the connection task
#[derive(Debug)]
enum Outbound {
    Text(String),
    Close,
}

/// How a driven connection ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Ended {
    Graceful,
    Abnormal(Option<u16>),
}

#[derive(Debug, Default)]
struct Status {
    state: ChannelState,
    attempts: u32,
}

/// State shared between the channel handle and its connection task
struct Core {
    url: String,
    connector: Arc<dyn Connector>,
    policy: ReconnectPolicy,
    latest: LatestFeedback,
    listeners: Listeners,
    status: Mutex<Status>,
    outbound: Mutex<Option<mpsc::UnboundedSender<Outbound>>>,
}

impl Core {
    fn set_state(&self, state: ChannelState) {
        let mut status = self.status.lock().unwrap_or_else(PoisonError::into_inner);
        if status.state != state {
            tracing::debug!(from = %status.state, to = %state, url = %self.url, "push channel state");
        }
        status.state = state;
    }

    fn mark_connected(&self) {
        let mut status = self.status.lock().unwrap_or_else(PoisonError::into_inner);
        status.state = ChannelState::Connected;
        status.attempts = 0;
    }

    /// Claim the next reconnect attempt number, if the policy allows one
    fn next_attempt(&self) -> Option<u32> {
        let mut status = self.status.lock().unwrap_or_else(PoisonError::into_inner);
        let attempt = status.attempts + 1;
        if !self.policy.allows(attempt) {
            return None;
        }
        status.attempts = attempt;
        Some(attempt)
    }

    fn reset(&self) {
        let mut status = self.status.lock().unwrap_or_else(PoisonError::into_inner);
        status.state = ChannelState::Disconnected;
        status.attempts = 0;
    }

    fn set_outbound(&self, tx: Option<mpsc::UnboundedSender<Outbound>>) {
        *self.outbound.lock().unwrap_or_else(PoisonError::into_inner) = tx;
    }

    fn take_outbound(&self) -> Option<mpsc::UnboundedSender<Outbound>> {
        self.outbound
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// Screen, parse and dispatch one text frame. Never fails.
    fn handle_text(&self, payload: &str) {
        if feedback::is_out_of_band(payload) {
            tracing::trace!(len = payload.len(), "dropping out-of-band frame");
            return;
        }

        let message = match feedback::parse_message(payload) {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!(error = %e, "dropping unparsable push message");
                return;
            }
        };

        self.handle_message(&message);
    }

    fn handle_message(&self, message: &ChannelMessage) {
        match message.kind {
            MessageKind::Feedback => {
                let Some(event) = message.to_feedback_event() else {
                    tracing::debug!("feedback message without text");
                    return;
                };
                if self.latest.offer(event) {
                    self.listeners.dispatch(message);
                }
            }
            MessageKind::Analysis => self.listeners.dispatch(message),
            MessageKind::Error => {
                tracing::warn!(data = %message.data, "feedback source reported an error");
                self.listeners.dispatch(message);
            }
            MessageKind::Unknown => {
                tracing::trace!("ignoring push message of unknown type");
            }
        }
    }

    /// Pump frames and outbound messages until the connection ends
    async fn drive(&self, mut conn: Box<dyn Connection>) -> Ended {
        let (tx, mut rx) = mpsc::unbounded_channel();
        self.set_outbound(Some(tx));

        let ended = loop {
            tokio::select! {
                frame = conn.recv() => match frame {
                    Some(Ok(Frame::Text(text))) => self.handle_text(&text),
                    Some(Ok(Frame::Binary(data))) => {
                        tracing::trace!(len = data.len(), "dropping binary frame");
                    }
                    Some(Ok(Frame::Close(code))) => {
                        break if code == Some(NORMAL_CLOSE) {
                            Ended::Graceful
                        } else {
                            Ended::Abnormal(code)
                        };
                    }
                    Some(Err(e)) => {
                        tracing::warn!(error = %e, "push connection error");
                        break Ended::Abnormal(None);
                    }
                    None => break Ended::Abnormal(None),
                },
                Some(out) = rx.recv() => match out {
                    Outbound::Text(text) => {
                        if let Err(e) = conn.send_text(text).await {
                            tracing::warn!(error = %e, "failed to send push message");
                        }
                    }
                    Outbound::Close => {
                        if let Err(e) = conn.close(NORMAL_CLOSE).await {
                            tracing::debug!(error = %e, "close handshake failed");
                        }
                        break Ended::Graceful;
                    }
                },
            }
        };

        self.set_outbound(None);
        ended
    }

    /// Retry with exponential backoff; `None` once attempts are exhausted
    async fn reconnect(&self) -> Option<Box<dyn Connection>> {
        loop {
            let Some(attempt) = self.next_attempt() else {
                tracing::error!(
                    url = %self.url,
                    max_attempts = self.policy.max_attempts,
                    "giving up on push channel"
                );
                self.set_state(ChannelState::Disconnected);
                return None;
            };

            let delay = self.policy.delay_for_attempt(attempt);
            self.set_state(ChannelState::Reconnecting);
            tracing::info!(
                attempt,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                "reconnecting push channel"
            );
            tokio::time::sleep(delay).await;

            self.set_state(ChannelState::Connecting);
            match self.connector.connect(&self.url).await {
                Ok(conn) => {
                    tracing::info!(url = %self.url, attempt, "push channel reconnected");
                    self.mark_connected();
                    return Some(conn);
                }
                Err(e) => tracing::warn!(attempt, error = %e, "reconnect attempt failed"),
            }
        }
    }

    /// Connection task body: drive, reconnect on abnormal close, repeat
    async fn run(self: Arc<Self>, mut conn: Option<Box<dyn Connection>>) {
        loop {
            let current = match conn.take() {
                Some(c) => c,
                None => match self.reconnect().await {
                    Some(c) => c,
                    None => return,
                },
            };

            match self.drive(current).await {
                Ended::Graceful => {
                    tracing::info!(url = %self.url, "push channel closed");
                    self.reset();
                    return;
                }
                Ended::Abnormal(code) => {
                    tracing::warn!(url = %self.url, ?code, "push channel closed abnormally");
                }
            }
        }
    }
}

/// Push feedback channel over a persistent connection
pub struct PushChannel {
    core: Arc<Core>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl PushChannel {
    /// Create a channel that feeds `latest`
    #[must_use]
    pub fn new(
        url: impl Into<String>,
        connector: Arc<dyn Connector>,
        policy: ReconnectPolicy,
        latest: LatestFeedback,
    ) -> Self {
        Self {
            core: Arc::new(Core {
                url: url.into(),
                connector,
                policy,
                latest,
                listeners: Listeners::new(),
                status: Mutex::new(Status::default()),
                outbound: Mutex::new(None),
            }),
            task: Mutex::new(None),
        }
    }

    /// Endpoint URL
    #[must_use]
    pub fn url(&self) -> &str {
        &self.core.url
    }

    /// Current connection state
    #[must_use]
    pub fn state(&self) -> ChannelState {
        self.core
            .status
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .state
    }

    /// Reconnect attempts made since the last successful open
    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.core
            .status
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .attempts
    }

    /// Open the connection.
    ///
    /// On failure the error is returned and the reconnect loop takes over
    /// in the background, as after any abnormal close.
    ///
    /// # Errors
    ///
    /// Returns `Error::Transport` if the initial connection fails
    pub async fn connect(&self) -> Result<()> {
        if self.is_running() {
            tracing::debug!(state = %self.state(), "push channel already active");
            return Ok(());
        }

        self.core.set_state(ChannelState::Connecting);
        tracing::info!(url = %self.core.url, "connecting push channel");

        match self.core.connector.connect(&self.core.url).await {
            Ok(conn) => {
                self.core.mark_connected();
                self.spawn(Some(conn));
                tracing::info!(url = %self.core.url, "push channel connected");
                Ok(())
            }
            Err(e) => {
                tracing::warn!(url = %self.core.url, error = %e, "push channel connect failed");
                self.spawn(None);
                Err(match e {
                    Error::Transport(_) => e,
                    other => Error::Transport(other.to_string()),
                })
            }
        }
    }

    /// Register a listener for a message type
    pub fn add_listener<F>(&self, kind: MessageKind, callback: F) -> ListenerId
    where
        F: Fn(&ChannelMessage) + Send + Sync + 'static,
    {
        let callback: MessageCallback = Arc::new(callback);
        self.core.listeners.add(kind, callback)
    }

    /// Remove a previously registered listener
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.core.listeners.remove(id)
    }

    /// Number of listeners for a message type
    #[must_use]
    pub fn listener_count(&self, kind: MessageKind) -> usize {
        self.core.listeners.count(kind)
    }

    /// Send a JSON payload; a no-op with a warning when not connected
    ///
    /// # Errors
    ///
    /// Returns error if the payload cannot be serialized
    pub fn send<T: Serialize + ?Sized>(&self, payload: &T) -> Result<()> {
        let text = serde_json::to_string(payload)?;

        if self.state() != ChannelState::Connected {
            tracing::warn!(state = %self.state(), "push channel not connected, dropping send");
            return Ok(());
        }

        let outbound = self
            .core
            .outbound
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        match outbound {
            Some(tx) if tx.send(Outbound::Text(text)).is_ok() => {}
            _ => tracing::warn!("push channel not connected, dropping send"),
        }
        Ok(())
    }

    /// Close gracefully, stop reconnecting and clear all listeners
    pub async fn disconnect(&self) {
        let closing = self
            .core
            .take_outbound()
            .is_some_and(|tx| tx.send(Outbound::Close).is_ok());

        let task = self.task.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(mut handle) = task {
            // Only an open connection has a handshake worth waiting for
            if closing && tokio::time::timeout(CLOSE_GRACE, &mut handle).await.is_err() {
                tracing::debug!("close handshake timed out");
            }
            handle.abort();
        }

        self.core.reset();
        self.core.listeners.clear();
        tracing::info!(url = %self.core.url, "push channel disconnected");
    }

    fn is_running(&self) -> bool {
        self.task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }

    fn spawn(&self, conn: Option<Box<dyn Connection>>) {
        let core = Arc::clone(&self.core);
        let handle = tokio::spawn(core.run(conn));
        if let Some(old) = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(handle)
        {
            old.abort();
        }
    }
}

impl Drop for PushChannel {
    fn drop(&mut self) {
        if let Some(handle) = self.task.lock().unwrap_or_else(PoisonError::into_inner).take() {
            handle.abort();
        }
    }
}

impl std::fmt::Debug for PushChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PushChannel")
            .field("url", &self.core.url)
            .field("state", &self.state())
            .field("listeners", &self.core.listeners)
            .finish_non_exhaustive()
    }
}
