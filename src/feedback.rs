//! Feedback events and the shared latest-feedback state
//!
//! Both delivery channels funnel into a single [`LatestFeedback`] value.
//! The only way to change it is [`LatestFeedback::offer`], which accepts an
//! event only when its timestamp is strictly newer than the one held.

use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use serde_json::{Number, Value};

use crate::{Error, Result};

/// Frames longer than this are treated as out-of-band camera traffic
pub const MAX_FEEDBACK_FRAME_LEN: usize = 16 * 1024;

/// Camera frames are pushed as data URLs on the same socket
const IMAGE_DATA_PREFIX: &str = "data:image/";

/// A short piece of feedback about observed activity
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FeedbackEvent {
    /// Feedback text to (possibly) speak
    pub text: String,

    /// Activity description the feedback was derived from
    pub source_analysis: Option<String>,

    /// Ordering key in milliseconds
    pub timestamp: i64,
}

impl FeedbackEvent {
    /// Create an event without analysis text
    #[must_use]
    pub fn new(text: impl Into<String>, timestamp: i64) -> Self {
        Self {
            text: text.into(),
            source_analysis: None,
            timestamp,
        }
    }

    /// Attach the analysis text this feedback came from
    #[must_use]
    pub fn with_analysis(mut self, analysis: impl Into<String>) -> Self {
        self.source_analysis = Some(analysis.into());
        self
    }
}

/// Latest accepted feedback, shared by both channels and the phrase selector
#[derive(Debug, Clone, Default)]
pub struct LatestFeedback {
    inner: Arc<Mutex<Option<FeedbackEvent>>>,
}

impl LatestFeedback {
    /// Create an empty state
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Offer an event; returns `true` if it replaced the current one.
    ///
    /// Equal or older timestamps are discarded as duplicates or stale.
    pub fn offer(&self, event: FeedbackEvent) -> bool {
        let mut current = self.inner.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(held) = current.as_ref() {
            if event.timestamp <= held.timestamp {
                tracing::trace!(
                    offered = event.timestamp,
                    held = held.timestamp,
                    "discarding stale feedback"
                );
                return false;
            }
        }

        tracing::debug!(timestamp = event.timestamp, text = %event.text, "accepted feedback");
        *current = Some(event);
        true
    }

    /// Snapshot of the current event
    #[must_use]
    pub fn current(&self) -> Option<FeedbackEvent> {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Timestamp of the current event
    #[must_use]
    pub fn last_timestamp(&self) -> Option<i64> {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|e| e.timestamp)
    }

    /// Whether `timestamp` would be accepted by [`offer`](Self::offer)
    #[must_use]
    pub fn is_newer(&self, timestamp: i64) -> bool {
        self.last_timestamp().is_none_or(|held| timestamp > held)
    }
}

/// Type tag of a push-channel message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    /// Spoken feedback
    Feedback,
    /// Raw activity analysis
    Analysis,
    /// Server-side error report
    Error,
    /// Any other tag; ignored
    #[serde(other)]
    Unknown,
}

/// A JSON text frame on the push channel
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelMessage {
    /// Message type tag
    #[serde(rename = "type")]
    pub kind: MessageKind,

    /// Payload; a string or an object with `feedback` / `analysis` fields
    #[serde(default)]
    pub data: Value,

    /// Server timestamp (integer or fractional)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<Number>,
}

impl ChannelMessage {
    /// Message timestamp, falling back to one embedded in `data`
    #[must_use]
    pub fn timestamp_millis(&self) -> Option<i64> {
        self.timestamp
            .as_ref()
            .and_then(number_to_millis)
            .or_else(|| match self.data.get("timestamp") {
                Some(Value::Number(n)) => number_to_millis(n),
                _ => None,
            })
    }

    /// Convert a `feedback` message into an event.
    ///
    /// Returns `None` for other kinds or when `data` carries no text.
    #[must_use]
    pub fn to_feedback_event(&self) -> Option<FeedbackEvent> {
        if self.kind != MessageKind::Feedback {
            return None;
        }

        let (text, analysis) = match &self.data {
            Value::String(s) => (s.clone(), None),
            Value::Object(map) => {
                let text = ["feedback", "text", "message"]
                    .iter()
                    .find_map(|k| map.get(*k).and_then(Value::as_str))?;
                let analysis = map
                    .get("analysis")
                    .and_then(Value::as_str)
                    .map(ToString::to_string);
                (text.to_string(), analysis)
            }
            _ => return None,
        };

        let timestamp = self.timestamp_millis().unwrap_or_else(now_millis);

        Some(FeedbackEvent {
            text,
            source_analysis: analysis,
            timestamp,
        })
    }
}

/// Whether a text frame is camera traffic rather than feedback
#[must_use]
pub fn is_out_of_band(payload: &str) -> bool {
    payload.len() > MAX_FEEDBACK_FRAME_LEN || payload.trim_start().starts_with(IMAGE_DATA_PREFIX)
}

/// Parse a text frame into a [`ChannelMessage`]
///
/// # Errors
///
/// Returns `Error::Parse` if the frame is not a valid message
pub fn parse_message(payload: &str) -> Result<ChannelMessage> {
    serde_json::from_str(payload).map_err(|e| Error::Parse(format!("invalid channel message: {e}")))
}

/// Convert a JSON number to integer milliseconds, truncating fractions
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn number_to_millis(n: &Number) -> Option<i64> {
    n.as_i64()
        .or_else(|| n.as_u64().and_then(|u| i64::try_from(u).ok()))
        .or_else(|| n.as_f64().filter(|f| f.is_finite()).map(|f| f as i64))
}

/// Wall-clock milliseconds since the Unix epoch
#[must_use]
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
