//! Daemon - the feedback-to-speech service
//!
//! Wires both feedback channels into the shared latest-feedback state and
//! the session controller, then runs until Ctrl-C.

use std::sync::Arc;

use crate::channels::{Connector, PullChannel, PushChannel, WsConnector};
use crate::config::{Config, VoiceConfig};
use crate::feedback::{LatestFeedback, MessageKind};
use crate::phrases::{PhraseSelector, PhraseTable};
use crate::session::{SessionController, SessionSnapshot};
use crate::voice::{ElevenLabsSynthesizer, SpeakerOutput, Speaker, SpeechPlayer};
use crate::{Error, Result};

/// The Lock In daemon - delivers feedback and speaks it
pub struct Daemon {
    config: Config,
    latest: LatestFeedback,
    session: Arc<SessionController>,
    push: PushChannel,
    pull: PullChannel,
}

impl Daemon {
    /// Create a daemon with the real transport, synthesizer and speakers
    #[must_use]
    pub fn new(config: Config) -> Self {
        let client = reqwest::Client::new();
        let speaker = init_speaker(&config.voice, client.clone());
        let table = load_phrases(&config);
        Self::with_components(config, client, Arc::new(WsConnector), speaker, table)
    }

    /// Create a daemon from explicit components
    #[must_use]
    pub fn with_components(
        config: Config,
        client: reqwest::Client,
        connector: Arc<dyn Connector>,
        speaker: Option<Arc<dyn Speaker>>,
        table: PhraseTable,
    ) -> Self {
        let latest = LatestFeedback::new();
        let selector = PhraseSelector::new(Arc::new(table), latest.clone());

        let session = Arc::new(SessionController::new(
            config.speech.scheduler,
            selector,
            speaker,
            config.speech.enabled,
        ));

        let push = PushChannel::new(
            config.backend.push_url.clone(),
            connector,
            config.backend.reconnect,
            latest.clone(),
        );

        let pull = PullChannel::with_callback(
            client,
            config.backend.poll_url.clone(),
            latest.clone(),
            session.feedback_callback(),
        );

        Self {
            config,
            latest,
            session,
            push,
            pull,
        }
    }

    /// Shared latest-feedback state
    #[must_use]
    pub const fn latest(&self) -> &LatestFeedback {
        &self.latest
    }

    /// Session controller
    #[must_use]
    pub const fn session(&self) -> &Arc<SessionController> {
        &self.session
    }

    /// Push feedback channel
    #[must_use]
    pub const fn push(&self) -> &PushChannel {
        &self.push
    }

    /// Pull feedback channel
    #[must_use]
    pub const fn pull(&self) -> &PullChannel {
        &self.pull
    }

    /// Session flags
    #[must_use]
    pub fn status(&self) -> SessionSnapshot {
        self.session.state()
    }

    /// Subscribe to both channels and start the session if configured
    ///
    /// A failed initial push connection is logged; reconnecting continues in
    /// the background and the pull channel covers delivery meanwhile.
    pub async fn start(&self) {
        let on_feedback = self.session.feedback_callback();
        self.push.add_listener(MessageKind::Feedback, move |message| {
            if let Some(event) = message.to_feedback_event() {
                on_feedback(&event);
            }
        });
        self.push.add_listener(MessageKind::Analysis, |message| {
            tracing::debug!(data = %message.data, "analysis update");
        });

        if let Err(e) = self.push.connect().await {
            tracing::warn!(error = %e, "push channel unavailable, relying on polling");
        }

        self.pull.start(self.config.backend.poll_interval);

        if self.config.session.autostart {
            self.session.start_session();
        }

        tracing::info!(
            push_url = %self.config.backend.push_url,
            poll_url = %self.config.backend.poll_url,
            speaker = self.session.has_speaker(),
            "lockin started"
        );
    }

    /// Stop speaking, stop polling and close the push channel
    pub async fn shutdown(&self) {
        self.session.stop_session().await;
        self.pull.stop();
        self.push.disconnect().await;
        tracing::info!("lockin stopped");
    }

    /// Run until Ctrl-C
    ///
    /// # Errors
    ///
    /// Returns error if the shutdown signal cannot be installed
    pub async fn run(self) -> Result<()> {
        self.start().await;

        let signal = tokio::signal::ctrl_c().await;
        tracing::info!("shutdown requested");
        self.shutdown().await;

        signal.map_err(Error::Io)
    }
}

impl std::fmt::Debug for Daemon {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Daemon")
            .field("push", &self.push)
            .field("session", &self.session)
            .finish_non_exhaustive()
    }
}

/// Build the speech player, or `None` with a one-time notice when the
/// synthesis API key is missing or invalid
#[must_use]
pub fn init_speaker(voice: &VoiceConfig, client: reqwest::Client) -> Option<Arc<dyn Speaker>> {
    let Some(api_key) = voice.api_key.as_deref() else {
        let notice = Error::Config("ELEVENLABS_API_KEY is not set".to_string());
        tracing::warn!(error = %notice, "speech output disabled");
        return None;
    };

    match ElevenLabsSynthesizer::new(api_key, voice.voice_id.as_str()) {
        Ok(synthesizer) => {
            let synthesizer = synthesizer
                .with_base_url(voice.base_url.as_str())
                .with_model(voice.model_id.as_str())
                .with_settings(voice.settings)
                .with_client(client);
            let player = SpeechPlayer::new(Arc::new(synthesizer), Arc::new(SpeakerOutput::new()));
            Some(Arc::new(player))
        }
        Err(e) => {
            tracing::warn!(error = %e, "speech output disabled");
            None
        }
    }
}

/// Load the configured phrase table, falling back to the bundled one
#[must_use]
pub fn load_phrases(config: &Config) -> PhraseTable {
    let Some(path) = config.speech.phrases_path.as_deref() else {
        return PhraseTable::bundled();
    };

    match PhraseTable::load(path) {
        Ok(table) if !table.is_empty() => table,
        Ok(_) => {
            tracing::warn!(path = %path.display(), "phrase table is empty, using bundled phrases");
            PhraseTable::bundled()
        }
        Err(e) => {
            tracing::warn!(error = %e, "using bundled phrases");
            PhraseTable::bundled()
        }
    }
}
