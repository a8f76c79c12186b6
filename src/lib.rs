//! Lock In - spoken productivity feedback
//!
//! A remote analysis process periodically produces short feedback about
//! what the user is doing. This library delivers the latest feedback over
//! two redundant channels and speaks it, one utterance at a time:
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐   ┌──────────────┐
//! │ Push channel │   │ Pull channel │
//! │  (websocket) │   │   (polling)  │
//! └──────┬───────┘   └──────┬───────┘
//!        └───── offer ──────┘
//!                 │
//!        ┌────────▼────────┐
//!        │ LatestFeedback  │  newest timestamp wins
//!        └────────┬────────┘
//!                 │ new feedback
//!        ┌────────▼────────┐     ┌─────────────────┐
//!        │ SpeechScheduler ├────►│ PhraseSelector  │
//!        └────────┬────────┘     └─────────────────┘
//!                 │ phrase
//!        ┌────────▼────────┐
//!        │  SpeechPlayer   │  TTS + single playback
//!        └─────────────────┘
//! ```

pub mod channels;
pub mod config;
pub mod daemon;
pub mod error;
pub mod feedback;
pub mod phrases;
pub mod session;
pub mod voice;

pub use channels::{ChannelState, PullChannel, PushChannel, ReconnectPolicy};
pub use config::Config;
pub use daemon::Daemon;
pub use error::{Error, Result};
pub use feedback::{FeedbackEvent, LatestFeedback};
pub use phrases::{PhraseSelector, PhraseTable};
pub use session::{SessionController, SessionState, SpeechScheduler};
pub use voice::{PlaybackHandle, Speaker, SpeechPlayer};
