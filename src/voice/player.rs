//! Speech player: text in, one exclusive playback out
//!
//! ```text
//! Idle --speak--> Loading --started--> Playing --completed--> Idle
//! Loading/Playing --stop--> Idle
//! Loading --error--> Idle (error returned to caller)
//! ```
//!
//! Every `speak` and `stop` bumps a generation counter. Work belonging to
//! an older generation is abandoned at its next suspension point, so the
//! most recent call wins without queueing.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;

use super::playback::{AudioOutput, PlaybackHandle};
use super::tts::Synthesizer;
use crate::Result;

/// Playback lifecycle of the speech player
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PlaybackState {
    #[default]
    Idle,
    Loading,
    Playing,
}

impl std::fmt::Display for PlaybackState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Loading => write!(f, "loading"),
            Self::Playing => write!(f, "playing"),
        }
    }
}

/// Something that can say a phrase out loud
#[async_trait]
pub trait Speaker: Send + Sync {
    /// Speak `text`, resolving once playback has started
    async fn speak(&self, text: &str) -> Result<()>;

    /// Stop any active playback; safe to call repeatedly
    async fn stop(&self);
}

struct Shared {
    generation: AtomicU64,
    state: Mutex<PlaybackState>,
    /// The single live playback. Held across release and start so no two
    /// handles ever coexist.
    active: tokio::sync::Mutex<Option<PlaybackHandle>>,
}

impl Shared {
    fn set_state(&self, state: PlaybackState) {
        let mut current = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if *current != state {
            tracing::trace!(from = %*current, to = %state, "speech player state");
        }
        *current = state;
    }

    /// Set `state` only if no newer call has started since `generation`
    fn set_state_if_current(&self, generation: u64, state: PlaybackState) {
        if self.is_current(generation) {
            self.set_state(state);
        }
    }

    fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == generation
    }

    fn next_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::SeqCst) + 1
    }
}

/// Synthesizes and plays utterances, one at a time
pub struct SpeechPlayer {
    synthesizer: Arc<dyn Synthesizer>,
    output: Arc<dyn AudioOutput>,
    shared: Arc<Shared>,
}

impl SpeechPlayer {
    /// Create a player from a synthesizer and an audio output
    #[must_use]
    pub fn new(synthesizer: Arc<dyn Synthesizer>, output: Arc<dyn AudioOutput>) -> Self {
        Self {
            synthesizer,
            output,
            shared: Arc::new(Shared {
                generation: AtomicU64::new(0),
                state: Mutex::new(PlaybackState::Idle),
                active: tokio::sync::Mutex::new(None),
            }),
        }
    }

    /// Current playback state
    #[must_use]
    pub fn state(&self) -> PlaybackState {
        *self.shared.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Id of the live playback handle, if any
    pub async fn active_playback(&self) -> Option<u64> {
        self.shared.active.lock().await.as_ref().map(PlaybackHandle::id)
    }

    /// Wait until the live utterance, if any, has ended
    pub async fn wait_finished(&self) {
        let finished = self
            .shared
            .active
            .lock()
            .await
            .as_ref()
            .map(PlaybackHandle::finished);
        if let Some(finished) = finished {
            finished.await;
        }
    }

    /// Speak `text`, stopping whatever is playing first
    ///
    /// Resolves once playback has started. A call superseded by a newer
    /// `speak` or `stop` resolves `Ok` without playing.
    ///
    /// # Errors
    ///
    /// Returns `Error::Synthesis` or `Error::Playback` if the utterance could
    /// not be produced
    pub async fn speak(&self, text: &str) -> Result<()> {
        if let Err(e) = self.output.configure_output() {
            tracing::warn!(error = %e, "could not configure audio output, continuing");
        }

        let generation = self.shared.next_generation();
        self.shared.set_state(PlaybackState::Loading);

        let previous = self.shared.active.lock().await.take();
        if let Some(handle) = previous {
            tracing::debug!(id = handle.id(), "stopping previous utterance");
            handle.release().await;
        }

        let audio = match self.synthesizer.synthesize(text).await {
            Ok(audio) => audio,
            Err(e) => {
                self.shared
                    .set_state_if_current(generation, PlaybackState::Idle);
                return Err(e);
            }
        };

        let mut active = self.shared.active.lock().await;
        if !self.shared.is_current(generation) {
            tracing::debug!("utterance superseded before playback");
            return Ok(());
        }

        if let Some(stale) = active.take() {
            stale.release().await;
        }

        let handle = match self.output.start(audio).await {
            Ok(handle) => handle,
            Err(e) => {
                self.shared
                    .set_state_if_current(generation, PlaybackState::Idle);
                return Err(e);
            }
        };

        if !self.shared.is_current(generation) {
            // stop() ran while the device was starting
            handle.release().await;
            return Ok(());
        }

        tracing::info!(id = handle.id(), text, "speaking");
        self.watch_completion(&handle, generation);
        *active = Some(handle);
        self.shared.set_state(PlaybackState::Playing);
        Ok(())
    }

    /// Release any active playback; idempotent
    pub async fn stop(&self) {
        let generation = self.shared.next_generation();

        let previous = self.shared.active.lock().await.take();
        if let Some(handle) = previous {
            tracing::debug!(id = handle.id(), "stopping utterance");
            handle.release().await;
        }

        self.shared
            .set_state_if_current(generation, PlaybackState::Idle);
    }

    /// Clear the slot when this playback ends on its own
    fn watch_completion(&self, handle: &PlaybackHandle, generation: u64) {
        let shared = Arc::clone(&self.shared);
        let id = handle.id();
        let finished = handle.finished();

        tokio::spawn(async move {
            finished.await;

            let mut active = shared.active.lock().await;
            if active.as_ref().is_some_and(|h| h.id() == id) {
                *active = None;
                shared.set_state_if_current(generation, PlaybackState::Idle);
                tracing::debug!(id, "utterance finished");
            }
        });
    }
}

#[async_trait]
impl Speaker for SpeechPlayer {
    async fn speak(&self, text: &str) -> Result<()> {
        Self::speak(self, text).await
    }

    async fn stop(&self) {
        Self::stop(self).await;
    }
}

impl std::fmt::Debug for SpeechPlayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpeechPlayer")
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;

    use super::*;
    use crate::Error;
    use crate::voice::playback::playback_pair;

    struct FixedSynth;

    #[async_trait]
    impl Synthesizer for FixedSynth {
        async fn synthesize(&self, text: &str) -> Result<Vec<u8>> {
            if text == "fail" {
                return Err(Error::Synthesis("ElevenLabs TTS error 500".to_string()));
            }
            Ok(text.as_bytes().to_vec())
        }
    }

    /// Plays until cancelled or until `complete` is set
    #[derive(Default)]
    struct FakeDevice {
        complete: Arc<AtomicBool>,
    }

    #[async_trait]
    impl AudioOutput for FakeDevice {
        fn configure_output(&self) -> Result<()> {
            Err(Error::Playback("silent mode".to_string()))
        }

        async fn start(&self, _audio: Vec<u8>) -> Result<PlaybackHandle> {
            let (handle, worker) = playback_pair();
            let complete = Arc::clone(&self.complete);
            tokio::spawn(async move {
                while !worker.is_cancelled() && !complete.load(Ordering::SeqCst) {
                    tokio::time::sleep(Duration::from_millis(1)).await;
                }
                worker.finish();
            });
            Ok(handle)
        }
    }

    fn player(output: Arc<FakeDevice>) -> SpeechPlayer {
        SpeechPlayer::new(Arc::new(FixedSynth), output)
    }

    #[tokio::test]
    async fn speak_reaches_playing_despite_configure_failure() {
        let player = player(Arc::new(FakeDevice::default()));
        player.speak("hello").await.unwrap();
        assert_eq!(player.state(), PlaybackState::Playing);
        assert!(player.active_playback().await.is_some());
    }

    #[tokio::test]
    async fn synthesis_error_leaves_idle() {
        let player = player(Arc::new(FakeDevice::default()));
        let err = player.speak("fail").await.unwrap_err();
        assert!(err.to_string().contains("500"));
        assert_eq!(player.state(), PlaybackState::Idle);
    }

    #[tokio::test]
    async fn second_speak_replaces_first() {
        let player = player(Arc::new(FakeDevice::default()));
        player.speak("first").await.unwrap();
        let first = player.active_playback().await.unwrap();

        player.speak("second").await.unwrap();
        let second = player.active_playback().await.unwrap();

        assert_ne!(first, second);
        assert_eq!(player.state(), PlaybackState::Playing);
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let player = player(Arc::new(FakeDevice::default()));
        player.stop().await;
        player.speak("hello").await.unwrap();
        player.stop().await;
        player.stop().await;
        assert_eq!(player.state(), PlaybackState::Idle);
        assert!(player.active_playback().await.is_none());
    }

    #[tokio::test]
    async fn natural_completion_returns_to_idle() {
        let output = Arc::new(FakeDevice::default());
        let player = player(Arc::clone(&output));
        player.speak("hello").await.unwrap();

        output.complete.store(true, Ordering::SeqCst);

        for _ in 0..200 {
            if player.state() == PlaybackState::Idle {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(player.state(), PlaybackState::Idle);
        assert!(player.active_playback().await.is_none());
    }

    #[tokio::test]
    async fn wait_finished_resolves_on_completion() {
        let output = Arc::new(FakeDevice::default());
        let player = player(Arc::clone(&output));

        // Nothing playing
        tokio::time::timeout(Duration::from_millis(100), player.wait_finished())
            .await
            .unwrap();

        player.speak("hello").await.unwrap();
        let pending = tokio::time::timeout(Duration::from_millis(20), player.wait_finished()).await;
        assert!(pending.is_err());

        output.complete.store(true, Ordering::SeqCst);
        tokio::time::timeout(Duration::from_secs(2), player.wait_finished())
            .await
            .unwrap();
    }
}
