//! TOML configuration file loading
//!
//! Supports `~/.config/lockin/config.toml` as a persistent config source.
//! All fields are optional; the file is a partial overlay on top of defaults.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::Result;

/// Top-level TOML configuration file schema
#[derive(Debug, Default, Deserialize)]
pub struct LockinConfigFile {
    /// Feedback backend endpoints
    #[serde(default)]
    pub backend: BackendFileConfig,

    /// Speech synthesis settings
    #[serde(default)]
    pub voice: VoiceFileConfig,

    /// Speech scheduling
    #[serde(default)]
    pub speech: SpeechFileConfig,

    /// Session behaviour
    #[serde(default)]
    pub session: SessionFileConfig,
}

/// Feedback backend configuration
#[derive(Debug, Default, Deserialize)]
pub struct BackendFileConfig {
    /// Base HTTP URL (e.g. "http://localhost:8000")
    pub url: Option<String>,

    /// Push channel URL; derived from `url` when unset
    pub push_url: Option<String>,

    /// Status endpoint path appended to `url`
    pub poll_path: Option<String>,

    pub poll_interval_ms: Option<u64>,
    pub max_reconnect_attempts: Option<u32>,
    pub reconnect_base_ms: Option<u64>,
}

/// Speech synthesis configuration
#[derive(Debug, Default, Deserialize)]
pub struct VoiceFileConfig {
    /// ElevenLabs API key
    pub api_key: Option<String>,

    /// Synthesis API base URL
    pub base_url: Option<String>,

    pub voice_id: Option<String>,
    pub model_id: Option<String>,
    pub stability: Option<f32>,
    pub similarity_boost: Option<f32>,
    pub style: Option<f32>,
    pub use_speaker_boost: Option<bool>,
}

/// Speech scheduling configuration
#[derive(Debug, Default, Deserialize)]
pub struct SpeechFileConfig {
    /// Speak at all
    pub enabled: Option<bool>,

    /// Delay before the first utterance after new feedback
    pub initial_delay_ms: Option<u64>,

    pub min_delay_ms: Option<u64>,
    pub max_delay_ms: Option<u64>,

    /// Phrase table replacing the bundled one
    pub phrases_path: Option<String>,
}

/// Session configuration
#[derive(Debug, Default, Deserialize)]
pub struct SessionFileConfig {
    /// Start the session as soon as the daemon runs
    pub autostart: Option<bool>,
}

/// Parse config file contents
///
/// # Errors
///
/// Returns error if the contents are not valid TOML for this schema
pub fn parse_config_file(content: &str) -> Result<LockinConfigFile> {
    Ok(toml::from_str(content)?)
}

/// Load the TOML config file from `path`, or the standard path when `None`
///
/// Returns `LockinConfigFile::default()` if the file doesn't exist or can't be parsed.
pub fn load_config_file(path: Option<&Path>) -> LockinConfigFile {
    let Some(path) = path.map(Path::to_path_buf).or_else(config_file_path) else {
        return LockinConfigFile::default();
    };

    if !path.exists() {
        tracing::debug!(path = %path.display(), "no config file");
        return LockinConfigFile::default();
    }

    match std::fs::read_to_string(&path) {
        Ok(content) => match parse_config_file(&content) {
            Ok(config) => {
                tracing::info!(path = %path.display(), "loaded config file");
                config
            }
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "failed to parse config file, using defaults"
                );
                LockinConfigFile::default()
            }
        },
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "failed to read config file"
            );
            LockinConfigFile::default()
        }
    }
}

/// Return the config file path: `~/.config/lockin/config.toml`
pub fn config_file_path() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| d.config_dir().join("lockin").join("config.toml"))
}
