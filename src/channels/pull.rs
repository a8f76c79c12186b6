//! Pull feedback channel: periodic status polling
//!
//! Runs alongside the push channel as a redundant path. Stopping clears a
//! liveness flag; the loop notices on its next iteration boundary.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::Deserialize;
use serde_json::Number;
use tokio::task::JoinHandle;

use super::FeedbackCallback;
use crate::feedback::{FeedbackEvent, LatestFeedback, now_millis, number_to_millis};
use crate::{Error, Result};

/// Status endpoint response, in either the wrapped or the flat shape
///
/// Wrapped: `{ success, data: { feedback, timestamp, frameNumber } }`.
/// Flat: `{ feedback, timestamp, is_new }`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StatusResponse {
    /// Wrapped-shape success flag
    #[serde(default)]
    pub success: Option<bool>,

    /// Wrapped-shape payload
    #[serde(default)]
    pub data: Option<StatusData>,

    /// Flat-shape feedback text
    #[serde(default)]
    pub feedback: Option<String>,

    /// Flat-shape analysis text
    #[serde(default)]
    pub analysis: Option<String>,

    /// Flat-shape timestamp
    #[serde(default)]
    pub timestamp: Option<Number>,

    /// Server hint that this feedback has not been served before
    #[serde(default)]
    pub is_new: Option<bool>,
}

/// Payload of the wrapped response shape
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusData {
    #[serde(default)]
    pub feedback: Option<String>,
    #[serde(default)]
    pub analysis: Option<String>,
    #[serde(default)]
    pub timestamp: Option<Number>,
    #[serde(default)]
    pub frame_number: Option<u64>,
}

impl StatusResponse {
    /// Extract a candidate event.
    ///
    /// `is_new: false` and `success: false` short-circuit to `None`. The
    /// timestamp check against already-seen feedback happens in
    /// [`LatestFeedback::offer`].
    #[must_use]
    pub fn into_event(self) -> Option<FeedbackEvent> {
        if self.success == Some(false) || self.is_new == Some(false) {
            return None;
        }

        let (text, analysis, timestamp) = match self.data {
            Some(data) => {
                if let Some(frame) = data.frame_number {
                    tracing::trace!(frame, "status poll frame");
                }
                (data.feedback, data.analysis, data.timestamp)
            }
            None => (self.feedback, self.analysis, self.timestamp),
        };

        let timestamp = match timestamp.as_ref().and_then(number_to_millis) {
            Some(ts) => ts,
            None if self.is_new == Some(true) => now_millis(),
            None => return None,
        };

        Some(FeedbackEvent {
            text: text?,
            source_analysis: analysis,
            timestamp,
        })
    }
}

struct Inner {
    client: reqwest::Client,
    url: String,
    latest: LatestFeedback,
    on_feedback: Option<FeedbackCallback>,
}

impl Inner {
    async fn poll_once(&self) -> Result<Option<FeedbackEvent>> {
        let response = self
            .client
            .get(&self.url)
            .query(&[("ts", now_millis())])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::Transport(format!("status poll returned {status}")));
        }

        let body = response.text().await?;
        let parsed: StatusResponse = serde_json::from_str(&body)
            .map_err(|e| Error::Parse(format!("invalid status response: {e}")))?;

        let Some(event) = parsed.into_event() else {
            return Ok(None);
        };

        if !self.latest.offer(event.clone()) {
            return Ok(None);
        }

        if let Some(callback) = &self.on_feedback {
            callback(&event);
        }
        Ok(Some(event))
    }

    async fn run(self: Arc<Self>, alive: Arc<AtomicBool>, interval: Duration) {
        tracing::info!(url = %self.url, ?interval, "status polling started");

        while alive.load(Ordering::SeqCst) {
            match self.poll_once().await {
                Ok(Some(event)) => {
                    tracing::debug!(timestamp = event.timestamp, "new feedback from status poll");
                }
                Ok(None) => {}
                Err(e) => tracing::warn!(error = %e, "status poll failed"),
            }
            tokio::time::sleep(interval).await;
        }

        tracing::info!(url = %self.url, "status polling stopped");
    }
}

/// Pull feedback channel
pub struct PullChannel {
    inner: Arc<Inner>,
    /// Liveness flag of the current loop; each `start` gets a fresh one
    alive: Mutex<Option<Arc<AtomicBool>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl PullChannel {
    /// Create a channel polling `url` and feeding `latest`
    #[must_use]
    pub fn new(client: reqwest::Client, url: impl Into<String>, latest: LatestFeedback) -> Self {
        Self::build(client, url.into(), latest, None)
    }

    /// Create a channel that also invokes `on_feedback` for each accepted event
    #[must_use]
    pub fn with_callback(
        client: reqwest::Client,
        url: impl Into<String>,
        latest: LatestFeedback,
        on_feedback: FeedbackCallback,
    ) -> Self {
        Self::build(client, url.into(), latest, Some(on_feedback))
    }

    fn build(
        client: reqwest::Client,
        url: String,
        latest: LatestFeedback,
        on_feedback: Option<FeedbackCallback>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                client,
                url,
                latest,
                on_feedback,
            }),
            alive: Mutex::new(None),
            task: Mutex::new(None),
        }
    }

    /// Status endpoint URL
    #[must_use]
    pub fn url(&self) -> &str {
        &self.inner.url
    }

    /// Whether the polling loop is armed
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.alive
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|flag| flag.load(Ordering::SeqCst))
    }

    /// Begin polling every `interval` until [`stop`](Self::stop)
    pub fn start(&self, interval: Duration) {
        let flag = {
            let mut alive = self.alive.lock().unwrap_or_else(PoisonError::into_inner);
            if alive.as_ref().is_some_and(|f| f.load(Ordering::SeqCst)) {
                tracing::debug!("status polling already running");
                return;
            }
            let flag = Arc::new(AtomicBool::new(true));
            *alive = Some(Arc::clone(&flag));
            flag
        };

        let handle = tokio::spawn(Arc::clone(&self.inner).run(flag, interval));

        // A loop stopped but still inside its last iteration exits on its own
        let _previous = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(handle);
    }

    /// Clear the liveness flag; the loop exits at its next boundary
    pub fn stop(&self) {
        if let Some(flag) = self.alive.lock().unwrap_or_else(PoisonError::into_inner).take() {
            flag.store(false, Ordering::SeqCst);
        }
    }

    /// Perform one fetch-and-process step
    ///
    /// Returns the event if it was accepted as new.
    ///
    /// # Errors
    ///
    /// Returns error on network failure, non-success status or malformed body
    pub async fn poll_once(&self) -> Result<Option<FeedbackEvent>> {
        self.inner.poll_once().await
    }
}

impl Drop for PullChannel {
    fn drop(&mut self) {
        self.stop();
        if let Some(handle) = self.task.lock().unwrap_or_else(PoisonError::into_inner).take() {
            handle.abort();
        }
    }
}
