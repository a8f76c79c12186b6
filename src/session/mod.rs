//! Session control
//!
//! A session gates whether scheduled speech may fire. Stopping the session
//! or disabling speech cancels the pending timer before anything else, then
//! silences the player.

mod scheduler;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::Serialize;

pub use scheduler::{
    DEFAULT_INITIAL_DELAY, DEFAULT_MAX_DELAY, DEFAULT_MIN_DELAY, SchedulerConfig, SpeechScheduler,
};

use crate::channels::FeedbackCallback;
use crate::feedback::FeedbackEvent;
use crate::phrases::PhraseSelector;
use crate::voice::Speaker;

/// Session flags shared with the scheduler
#[derive(Debug, Default)]
pub struct SessionState {
    running: AtomicBool,
    speech_enabled: AtomicBool,
}

impl SessionState {
    /// Create a stopped session
    #[must_use]
    pub const fn new(speech_enabled: bool) -> Self {
        Self {
            running: AtomicBool::new(false),
            speech_enabled: AtomicBool::new(speech_enabled),
        }
    }

    /// Whether the session is armed
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Whether speech may be produced at all
    #[must_use]
    pub fn is_speech_enabled(&self) -> bool {
        self.speech_enabled.load(Ordering::SeqCst)
    }

    /// Arm or disarm the session flag; does not touch timers
    pub fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::SeqCst);
    }

    /// Toggle the speech flag; does not touch timers or playback
    pub fn set_speech_enabled(&self, enabled: bool) {
        self.speech_enabled.store(enabled, Ordering::SeqCst);
    }

    /// Point-in-time copy of both flags
    #[must_use]
    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            running: self.is_running(),
            speech_enabled: self.is_speech_enabled(),
        }
    }
}

/// Copy of the session flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SessionSnapshot {
    pub running: bool,
    pub speech_enabled: bool,
}

/// Top-level owner of the session flags, scheduler and player
pub struct SessionController {
    state: Arc<SessionState>,
    scheduler: SpeechScheduler,
    speaker: Option<Arc<dyn Speaker>>,
}

impl SessionController {
    /// Create a stopped session.
    ///
    /// `speaker` is `None` when the player could not be initialized; the
    /// session still runs but every cycle is skipped.
    #[must_use]
    pub fn new(
        config: SchedulerConfig,
        selector: PhraseSelector,
        speaker: Option<Arc<dyn Speaker>>,
        speech_enabled: bool,
    ) -> Self {
        let state = Arc::new(SessionState::new(speech_enabled));
        let scheduler = SpeechScheduler::new(
            config,
            Arc::clone(&state),
            selector,
            speaker.clone(),
        );

        Self {
            state,
            scheduler,
            speaker,
        }
    }

    /// Current session flags
    #[must_use]
    pub fn state(&self) -> SessionSnapshot {
        self.state.snapshot()
    }

    /// Whether a speech player is available
    #[must_use]
    pub fn has_speaker(&self) -> bool {
        self.speaker.is_some()
    }

    /// The speech scheduler
    #[must_use]
    pub const fn scheduler(&self) -> &SpeechScheduler {
        &self.scheduler
    }

    /// Arm repeated speaking
    pub fn start_session(&self) {
        if self.state.is_running() {
            return;
        }
        self.state.set_running(true);
        tracing::info!(speech_enabled = self.state.is_speech_enabled(), "session started");

        if self.state.is_speech_enabled() {
            self.scheduler.arm_initial();
        }
    }

    /// Disarm, cancel the pending timer and silence the player
    pub async fn stop_session(&self) {
        self.state.set_running(false);
        self.scheduler.cancel_and_wait().await;

        if let Some(speaker) = &self.speaker {
            speaker.stop().await;
        }
        tracing::info!("session stopped");
    }

    /// Toggle speech globally
    ///
    /// Disabling cancels the pending timer and stops playback. Enabling
    /// while running arms the initial timer.
    pub async fn set_speech_enabled(&self, enabled: bool) {
        self.state.set_speech_enabled(enabled);

        if enabled {
            if self.state.is_running() {
                self.scheduler.arm_initial();
            }
        } else {
            self.scheduler.cancel_and_wait().await;
            if let Some(speaker) = &self.speaker {
                speaker.stop().await;
            }
        }
        tracing::info!(enabled, "speech toggled");
    }

    /// React to newly accepted feedback
    pub fn on_feedback(&self, event: &FeedbackEvent) {
        if !(self.state.is_running() && self.state.is_speech_enabled()) {
            tracing::trace!(timestamp = event.timestamp, "feedback while session idle");
            return;
        }
        tracing::debug!(timestamp = event.timestamp, "scheduling speech for new feedback");
        self.scheduler.arm_initial();
    }

    /// Callback that forwards accepted feedback to [`on_feedback`](Self::on_feedback)
    #[must_use]
    pub fn feedback_callback(self: &Arc<Self>) -> FeedbackCallback {
        let controller = Arc::downgrade(self);
        Arc::new(move |event| {
            if let Some(controller) = controller.upgrade() {
                controller.on_feedback(event);
            }
        })
    }
}

impl std::fmt::Debug for SessionController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionController")
            .field("state", &self.state())
            .field("scheduler", &self.scheduler)
            .field("has_speaker", &self.has_speaker())
            .finish()
    }
}
