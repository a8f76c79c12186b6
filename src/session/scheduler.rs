//! Speech scheduler: one pending timer, self-rescheduling
//!
//! ```text
//! Idle --arm(d)--> Pending --elapsed--> Firing --done--> Pending (random d)
//! Pending --arm(d)--> Pending (old timer aborted)
//! Pending --cancel--> Idle
//! ```
//!
//! Each arm or cancel bumps the slot generation. A firing cycle detaches
//! itself from the slot, so cancelling never aborts an utterance midway;
//! it only prevents the cycle from re-arming afterwards. Re-arming compares
//! the generation and installs the next timer under one slot lock.
//!
//! The gate check and the start of speech run under the cycle lock.
//! [`SpeechScheduler::cancel_and_wait`] takes that lock after cancelling, so
//! once it returns no cycle can pass the gate on stale session flags.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use rand::Rng;
use tokio::task::JoinHandle;

use super::SessionState;
use crate::phrases::PhraseSelector;
use crate::voice::Speaker;

/// Delay before the first utterance after new feedback
pub const DEFAULT_INITIAL_DELAY: Duration = Duration::from_secs(5);

/// Lower bound of the delay between utterances
pub const DEFAULT_MIN_DELAY: Duration = Duration::from_secs(7);

/// Upper bound of the delay between utterances
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(15);

/// Timing of the speech loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerConfig {
    pub initial_delay: Duration,
    pub min_delay: Duration,
    pub max_delay: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            initial_delay: DEFAULT_INITIAL_DELAY,
            min_delay: DEFAULT_MIN_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
        }
    }
}

impl SchedulerConfig {
    /// Uniformly random delay in `[min_delay, max_delay]`, at millisecond
    /// resolution
    pub fn next_delay<R: Rng + ?Sized>(&self, rng: &mut R) -> Duration {
        let min = millis(self.min_delay);
        let max = millis(self.max_delay);
        if min >= max {
            return self.min_delay;
        }
        Duration::from_millis(rng.gen_range(min..=max))
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

#[derive(Debug, Default)]
struct TimerSlot {
    generation: u64,
    pending: Option<JoinHandle<()>>,
}

/// Why a cycle did not speak
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Skip {
    NotRunning,
    SpeechDisabled,
    NoPlayer,
    NoPhrase,
}

struct Inner {
    config: SchedulerConfig,
    session: Arc<SessionState>,
    selector: PhraseSelector,
    speaker: Option<Arc<dyn Speaker>>,
    slot: Mutex<TimerSlot>,
    /// Held from the gate check until speech has started
    cycle: tokio::sync::Mutex<()>,
}

impl Inner {
    fn arm(self: &Arc<Self>, delay: Duration) {
        let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        self.install(&mut slot, delay);
    }

    /// Arm only if nothing armed or cancelled since `generation`
    fn arm_if_current(self: &Arc<Self>, generation: u64, delay: Duration) -> bool {
        let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.generation != generation || !self.session.is_running() {
            return false;
        }
        self.install(&mut slot, delay);
        true
    }

    fn install(self: &Arc<Self>, slot: &mut TimerSlot, delay: Duration) {
        slot.generation += 1;
        let generation = slot.generation;

        if let Some(previous) = slot.pending.take() {
            previous.abort();
        }

        let inner = Arc::clone(self);
        slot.pending = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            inner.fire(generation).await;
        }));

        tracing::debug!(
            delay_ms = millis(delay),
            generation,
            "speech timer armed"
        );
    }

    fn cancel(&self) -> bool {
        let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        slot.generation += 1;
        let had_pending = slot.pending.take().is_some_and(|handle| {
            handle.abort();
            true
        });
        if had_pending {
            tracing::debug!("speech timer cancelled");
        }
        had_pending
    }

    /// Detach the firing timer from the slot; `false` if it was superseded
    fn claim(&self, generation: u64) -> bool {
        let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.generation != generation {
            return false;
        }
        // Dropping the handle detaches; the task keeps running
        drop(slot.pending.take());
        true
    }

    fn gate(&self) -> Result<String, Skip> {
        if !self.session.is_running() {
            return Err(Skip::NotRunning);
        }
        if !self.session.is_speech_enabled() {
            return Err(Skip::SpeechDisabled);
        }
        if self.speaker.is_none() {
            return Err(Skip::NoPlayer);
        }
        self.selector
            .choose_phrase()
            .filter(|p| !p.trim().is_empty())
            .ok_or(Skip::NoPhrase)
    }

    fn is_current(&self, generation: u64) -> bool {
        self.slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .generation
            == generation
    }

    async fn fire(self: Arc<Self>, generation: u64) {
        if !self.claim(generation) {
            return;
        }

        {
            let _cycle = self.cycle.lock().await;
            if !self.is_current(generation) {
                tracing::debug!(generation, "cycle cancelled before speaking");
                return;
            }

            match self.gate() {
                Ok(phrase) => {
                    if let Some(speaker) = &self.speaker {
                        if let Err(e) = speaker.speak(&phrase).await {
                            tracing::warn!(error = %e, "scheduled utterance failed");
                        }
                    }
                }
                Err(reason) => tracing::debug!(?reason, "skipping scheduled utterance"),
            }
        }

        // Re-arm unless someone armed or cancelled while we were speaking
        let delay = self.config.next_delay(&mut rand::thread_rng());
        self.arm_if_current(generation, delay);
    }
}

/// Timer-driven speech loop with a single pending-timer slot
pub struct SpeechScheduler {
    inner: Arc<Inner>,
}

impl SpeechScheduler {
    /// Create a scheduler; nothing is armed until [`arm_initial`](Self::arm_initial)
    #[must_use]
    pub fn new(
        config: SchedulerConfig,
        session: Arc<SessionState>,
        selector: PhraseSelector,
        speaker: Option<Arc<dyn Speaker>>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                session,
                selector,
                speaker,
                slot: Mutex::new(TimerSlot::default()),
                cycle: tokio::sync::Mutex::new(()),
            }),
        }
    }

    /// Timing configuration
    #[must_use]
    pub fn config(&self) -> SchedulerConfig {
        self.inner.config
    }

    /// Arm the one-shot timer used after new feedback
    pub fn arm_initial(&self) {
        self.inner.arm(self.inner.config.initial_delay);
    }

    /// Arm the timer with an explicit delay, replacing any pending one
    pub fn arm(&self, delay: Duration) {
        self.inner.arm(delay);
    }

    /// Cancel the pending timer; returns `true` if one was pending
    pub fn cancel(&self) -> bool {
        self.inner.cancel()
    }

    /// Cancel the pending timer and wait for a cycle that already passed
    /// the gate to finish starting its utterance
    ///
    /// Session flags changed before this call are seen by every later
    /// cycle, so nothing speaks on stale flags once it returns.
    pub async fn cancel_and_wait(&self) -> bool {
        let had_pending = self.inner.cancel();
        drop(self.inner.cycle.lock().await);
        had_pending
    }

    /// Whether a timer is waiting to fire
    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.inner
            .slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pending
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }
}

impl Drop for SpeechScheduler {
    fn drop(&mut self) {
        self.inner.cancel();
    }
}

impl std::fmt::Debug for SpeechScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpeechScheduler")
            .field("config", &self.inner.config)
            .field("pending", &self.is_pending())
            .finish_non_exhaustive()
    }
}
