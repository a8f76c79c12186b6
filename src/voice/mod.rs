//! Voice output
//!
//! Synthesis goes through the ElevenLabs HTTP API, decoded audio plays on
//! the default output device, and [`SpeechPlayer`] ties the two together
//! with single-playback ownership.

mod playback;
mod player;
mod tts;

pub use playback::{
    AudioOutput, PlaybackHandle, PlaybackWorker, SpeakerOutput, decode_mp3, playback_pair,
};
pub use player::{PlaybackState, Speaker, SpeechPlayer};
pub use tts::{
    DEFAULT_MODEL_ID, DEFAULT_TTS_URL, DEFAULT_VOICE_ID, ElevenLabsSynthesizer, Synthesizer,
    VoiceSettings,
};
