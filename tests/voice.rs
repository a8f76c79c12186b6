//! Voice pipeline integration tests
//!
//! Tests synthesis and playback ownership without requiring audio hardware

use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::Json;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::post;
use lockin_voice::Error;
use lockin_voice::voice::{
    ElevenLabsSynthesizer, PlaybackState, SpeechPlayer, Synthesizer, VoiceSettings,
};
use serde_json::Value;

mod common;
use common::{MockOutput, RecordingSynthesizer, spawn_server};

#[derive(Default)]
struct Captured {
    voice: Option<String>,
    api_key: Option<String>,
    body: Option<Value>,
}

/// Mock synthesis API answering with `status`
async fn tts_server(status: StatusCode) -> (String, Arc<Mutex<Captured>>) {
    let captured = Arc::new(Mutex::new(Captured::default()));

    let router = axum::Router::new()
        .route(
            "/v1/text-to-speech/{voice_id}",
            post(
                move |State(captured): State<Arc<Mutex<Captured>>>,
                      Path(voice_id): Path<String>,
                      headers: HeaderMap,
                      Json(body): Json<Value>| async move {
                    let mut c = captured.lock().unwrap();
                    c.voice = Some(voice_id);
                    c.api_key = headers
                        .get("xi-api-key")
                        .and_then(|v| v.to_str().ok())
                        .map(ToString::to_string);
                    c.body = Some(body);
                    (status, vec![0xff_u8, 0xfb, 0x90, 0x00])
                },
            ),
        )
        .with_state(Arc::clone(&captured));

    let addr = spawn_server(router).await;
    (format!("http://{addr}"), captured)
}

#[tokio::test]
async fn test_elevenlabs_request_shape() {
    let (base, captured) = tts_server(StatusCode::OK).await;
    let tts = ElevenLabsSynthesizer::new("test-key", "voice-1")
        .unwrap()
        .with_base_url(base)
        .with_settings(VoiceSettings {
            style: Some(0.2),
            ..VoiceSettings::default()
        });

    let audio = tts.synthesize("Lock in!").await.unwrap();
    assert_eq!(audio, vec![0xff, 0xfb, 0x90, 0x00]);

    let c = captured.lock().unwrap();
    assert_eq!(c.voice.as_deref(), Some("voice-1"));
    assert_eq!(c.api_key.as_deref(), Some("test-key"));

    let body = c.body.as_ref().unwrap();
    assert_eq!(body["text"], "Lock in!");
    assert_eq!(body["model_id"], "eleven_monolingual_v1");
    assert_eq!(body["voice_settings"]["stability"], 0.5);
    assert_eq!(body["voice_settings"]["similarity_boost"], 0.75);
    assert!(body["voice_settings"]["style"].as_f64().is_some());
    assert!(body["voice_settings"].get("use_speaker_boost").is_none());
}

#[tokio::test]
async fn test_synthesis_error_includes_status_code() {
    let (base, _) = tts_server(StatusCode::UNAUTHORIZED).await;
    let tts = ElevenLabsSynthesizer::new("bad-key", "voice-1")
        .unwrap()
        .with_base_url(base);

    let err = tts.synthesize("hello").await.unwrap_err();
    assert!(matches!(err, Error::Synthesis(ref msg) if msg.contains("401")), "{err}");
}

#[tokio::test]
async fn test_player_surfaces_http_failure_and_stays_idle() {
    let (base, _) = tts_server(StatusCode::TOO_MANY_REQUESTS).await;
    let tts = ElevenLabsSynthesizer::new("key", "voice-1")
        .unwrap()
        .with_base_url(base);
    let output = MockOutput::new();
    let player = SpeechPlayer::new(Arc::new(tts), output.clone());

    let err = player.speak("hello").await.unwrap_err();
    assert!(err.to_string().contains("429"), "{err}");
    assert_eq!(player.state(), PlaybackState::Idle);
    assert_eq!(output.started(), 0);
}

#[tokio::test]
async fn test_speak_replaces_previous_playback() {
    let synth = RecordingSynthesizer::new();
    let output = MockOutput::new();
    let player = SpeechPlayer::new(synth.clone(), output.clone());

    player.speak("A").await.unwrap();
    let a = player.active_playback().await.unwrap();
    player.speak("B").await.unwrap();
    let b = player.active_playback().await.unwrap();

    assert_ne!(a, b);
    assert_eq!(output.live(), 1);
    assert_eq!(output.max_live(), 1);
    assert_eq!(synth.requests(), vec!["A", "B"]);
    assert_eq!(player.state(), PlaybackState::Playing);
}

#[tokio::test]
async fn test_concurrent_speaks_never_overlap() {
    let synth = RecordingSynthesizer::new();
    let output = MockOutput::new();
    let player = Arc::new(SpeechPlayer::new(synth.clone(), output.clone()));

    let (a, b, c) = tokio::join!(player.speak("A"), player.speak("B"), player.speak("C"));
    a.unwrap();
    b.unwrap();
    c.unwrap();

    assert!(output.max_live() <= 1);
    assert!(player.active_playback().await.is_some());
    assert_eq!(output.live(), 1);
}

#[tokio::test]
async fn test_stop_releases_and_completion_clears() {
    let synth = RecordingSynthesizer::new();
    let output = MockOutput::new();
    let player = SpeechPlayer::new(synth, output.clone());

    player.speak("A").await.unwrap();
    player.stop().await;
    assert_eq!(output.live(), 0);
    assert_eq!(player.state(), PlaybackState::Idle);
    assert!(player.active_playback().await.is_none());

    player.speak("B").await.unwrap();
    output.complete_all();
    tokio::time::timeout(Duration::from_secs(2), async {
        while player.state() != PlaybackState::Idle {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("playback never completed");

    assert!(player.active_playback().await.is_none());
    assert_eq!(output.live(), 0);
}
