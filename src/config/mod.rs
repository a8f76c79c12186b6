//! Configuration management for the Lock In voice client
//!
//! Every setting resolves as environment variable > TOML file > default.

pub mod file;

use std::path::{Path, PathBuf};
use std::time::Duration;

use url::Url;

use crate::channels::{DEFAULT_BASE_DELAY, DEFAULT_MAX_ATTEMPTS, ReconnectPolicy};
use crate::session::{
    DEFAULT_INITIAL_DELAY, DEFAULT_MAX_DELAY, DEFAULT_MIN_DELAY, SchedulerConfig,
};
use crate::voice::{DEFAULT_MODEL_ID, DEFAULT_TTS_URL, DEFAULT_VOICE_ID, VoiceSettings};
use crate::{Error, Result};

use self::file::LockinConfigFile;

/// Default feedback backend
pub const DEFAULT_BACKEND_URL: &str = "http://localhost:8000";

/// Default status endpoint path
pub const DEFAULT_POLL_PATH: &str = "/feedback/latest";

/// Push endpoint path on the backend
pub const PUSH_PATH: &str = "/ws/feedback";

/// Default pull-channel interval
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(2000);

/// Lock In client configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Feedback backend endpoints
    pub backend: BackendConfig,

    /// Speech synthesis
    pub voice: VoiceConfig,

    /// Speech scheduling
    pub speech: SpeechConfig,

    /// Session behaviour
    pub session: SessionConfig,
}

/// Feedback backend configuration
#[derive(Debug, Clone)]
pub struct BackendConfig {
    /// Base HTTP URL
    pub url: String,

    /// Push channel URL
    pub push_url: String,

    /// Full status endpoint URL
    pub poll_url: String,

    /// Pull-channel interval
    pub poll_interval: Duration,

    /// Push-channel reconnect policy
    pub reconnect: ReconnectPolicy,
}

/// Speech synthesis configuration
#[derive(Clone)]
pub struct VoiceConfig {
    /// ElevenLabs API key; `None` leaves the player uninitialized
    pub api_key: Option<String>,

    pub base_url: String,
    pub voice_id: String,
    pub model_id: String,
    pub settings: VoiceSettings,
}

impl std::fmt::Debug for VoiceConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VoiceConfig")
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("base_url", &self.base_url)
            .field("voice_id", &self.voice_id)
            .field("model_id", &self.model_id)
            .field("settings", &self.settings)
            .finish()
    }
}

/// Speech scheduling configuration
#[derive(Debug, Clone)]
pub struct SpeechConfig {
    /// Speak at all
    pub enabled: bool,

    /// Timer configuration
    pub scheduler: SchedulerConfig,

    /// Phrase table path; `None` uses the bundled table
    pub phrases_path: Option<PathBuf>,
}

/// Session configuration
#[derive(Debug, Clone, Copy)]
pub struct SessionConfig {
    /// Start the session when the daemon starts
    pub autostart: bool,
}

impl Config {
    /// Load configuration from the environment and the TOML file
    ///
    /// `path` overrides the standard config file location.
    ///
    /// # Errors
    ///
    /// Returns error if the resolved configuration is invalid
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let fc = file::load_config_file(path);
        Self::resolve(fc, |key| std::env::var(key).ok())
    }

    /// Resolve configuration from a parsed file and an environment lookup
    ///
    /// # Errors
    ///
    /// Returns error if the resolved configuration is invalid
    pub fn resolve<F>(fc: LockinConfigFile, env: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = |key: &str| env(key).filter(|v| !v.trim().is_empty());

        // Backend (env > toml > default)
        let url = env("LOCKIN_BACKEND_URL")
            .or(fc.backend.url)
            .unwrap_or_else(|| DEFAULT_BACKEND_URL.to_string());
        let push_url = match env("LOCKIN_PUSH_URL").or(fc.backend.push_url) {
            Some(push_url) => push_url,
            None => push_url_for(&url)?,
        };
        let poll_path = env("LOCKIN_POLL_PATH")
            .or(fc.backend.poll_path)
            .unwrap_or_else(|| DEFAULT_POLL_PATH.to_string());
        let poll_interval = parse_env::<u64>(&env, "LOCKIN_POLL_INTERVAL_MS")
            .or(fc.backend.poll_interval_ms)
            .map_or(DEFAULT_POLL_INTERVAL, Duration::from_millis);

        let backend = BackendConfig {
            poll_url: join_url(&url, &poll_path),
            url,
            push_url,
            poll_interval,
            reconnect: ReconnectPolicy {
                max_attempts: fc
                    .backend
                    .max_reconnect_attempts
                    .unwrap_or(DEFAULT_MAX_ATTEMPTS),
                base_delay: fc
                    .backend
                    .reconnect_base_ms
                    .map_or(DEFAULT_BASE_DELAY, Duration::from_millis),
            },
        };

        // Voice (env > toml > default)
        let defaults = VoiceSettings::default();
        let voice = VoiceConfig {
            api_key: env("ELEVENLABS_API_KEY").or(fc.voice.api_key.filter(|k| !k.trim().is_empty())),
            base_url: env("LOCKIN_TTS_URL")
                .or(fc.voice.base_url)
                .unwrap_or_else(|| DEFAULT_TTS_URL.to_string()),
            voice_id: env("LOCKIN_VOICE_ID")
                .or(fc.voice.voice_id)
                .unwrap_or_else(|| DEFAULT_VOICE_ID.to_string()),
            model_id: env("LOCKIN_TTS_MODEL")
                .or(fc.voice.model_id)
                .unwrap_or_else(|| DEFAULT_MODEL_ID.to_string()),
            settings: VoiceSettings {
                stability: fc.voice.stability.unwrap_or(defaults.stability),
                similarity_boost: fc
                    .voice
                    .similarity_boost
                    .unwrap_or(defaults.similarity_boost),
                style: fc.voice.style,
                use_speaker_boost: fc.voice.use_speaker_boost,
            },
        };

        // Speech (env > toml > default)
        let speech = SpeechConfig {
            enabled: env("LOCKIN_SPEECH_ENABLED")
                .and_then(|v| parse_bool(&v))
                .or(fc.speech.enabled)
                .unwrap_or(true),
            scheduler: SchedulerConfig {
                initial_delay: fc
                    .speech
                    .initial_delay_ms
                    .map_or(DEFAULT_INITIAL_DELAY, Duration::from_millis),
                min_delay: fc
                    .speech
                    .min_delay_ms
                    .map_or(DEFAULT_MIN_DELAY, Duration::from_millis),
                max_delay: fc
                    .speech
                    .max_delay_ms
                    .map_or(DEFAULT_MAX_DELAY, Duration::from_millis),
            },
            phrases_path: env("LOCKIN_PHRASES")
                .or(fc.speech.phrases_path)
                .map(PathBuf::from),
        };

        let session = SessionConfig {
            autostart: fc.session.autostart.unwrap_or(true),
        };

        let config = Self {
            backend,
            voice,
            speech,
            session,
        };
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` on the first violated constraint
    pub fn validate(&self) -> Result<()> {
        let scheduler = &self.speech.scheduler;
        if scheduler.min_delay > scheduler.max_delay {
            return Err(Error::Config(format!(
                "speech.min_delay_ms ({}) exceeds speech.max_delay_ms ({})",
                scheduler.min_delay.as_millis(),
                scheduler.max_delay.as_millis()
            )));
        }

        if self.backend.poll_interval.is_zero() {
            return Err(Error::Config(
                "backend.poll_interval_ms must be positive".to_string(),
            ));
        }

        check_url(&self.backend.url, &["http", "https"], "backend.url")?;
        check_url(&self.backend.push_url, &["ws", "wss"], "backend.push_url")?;
        check_url(&self.backend.poll_url, &["http", "https"], "backend.poll_path")?;
        check_url(&self.voice.base_url, &["http", "https"], "voice.base_url")?;

        Ok(())
    }

    /// Turn speech off regardless of file or environment
    pub fn disable_speech(&mut self) {
        self.speech.enabled = false;
        tracing::info!("speech explicitly disabled via --no-speech");
    }
}

/// Derive the push URL from the backend URL: `http(s)` becomes `ws(s)`
///
/// # Errors
///
/// Returns `Error::Config` if `backend` is not an http(s) URL
pub fn push_url_for(backend: &str) -> Result<String> {
    let mut url = Url::parse(backend)
        .map_err(|e| Error::Config(format!("invalid backend.url {backend:?}: {e}")))?;

    let scheme = match url.scheme() {
        "http" => "ws",
        "https" => "wss",
        other => {
            return Err(Error::Config(format!(
                "backend.url must be http or https, got {other}"
            )));
        }
    };
    url.set_scheme(scheme)
        .map_err(|()| Error::Config(format!("cannot derive push URL from {backend}")))?;

    let path = format!("{}{PUSH_PATH}", url.path().trim_end_matches('/'));
    url.set_path(&path);
    Ok(url.to_string())
}

fn join_url(base: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

fn check_url(value: &str, schemes: &[&str], key: &str) -> Result<()> {
    let url = Url::parse(value).map_err(|e| Error::Config(format!("invalid {key} {value:?}: {e}")))?;
    if !schemes.contains(&url.scheme()) {
        return Err(Error::Config(format!(
            "{key} must use one of {schemes:?}, got {}",
            url.scheme()
        )));
    }
    Ok(())
}

fn parse_env<T: std::str::FromStr>(env: impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = env(key)?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(key, value = %raw, "ignoring unparsable environment value");
            None
        }
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        other => {
            tracing::warn!(value = other, "ignoring unparsable boolean");
            None
        }
    }
}
