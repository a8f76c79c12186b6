//! Session and speech-loop integration tests
//!
//! Feedback flows from a channel through the scheduler into the player.
//! Cadence tests run on a paused clock; the daemon test runs in real time
//! against an in-process status endpoint.

use std::sync::Arc;
use std::time::Duration;

use axum::Json;
use axum::routing::get;
use lockin_voice::channels::{ChannelState, PullChannel, PushChannel, ReconnectPolicy};
use lockin_voice::config::Config;
use lockin_voice::config::file::LockinConfigFile;
use lockin_voice::feedback::{FeedbackEvent, LatestFeedback, MessageKind};
use lockin_voice::phrases::{PhraseSelector, PhraseTable};
use lockin_voice::session::{SchedulerConfig, SessionController};
use lockin_voice::voice::{Speaker, SpeechPlayer};
use lockin_voice::Daemon;
use serde_json::json;
use tokio_test::assert_ok;

mod common;
use common::{MockConnector, MockOutput, RecordingSynthesizer, settle, spawn_server};

struct Harness {
    latest: LatestFeedback,
    synth: Arc<RecordingSynthesizer>,
    output: Arc<MockOutput>,
    session: Arc<SessionController>,
}

fn harness(synth: Arc<RecordingSynthesizer>, config: SchedulerConfig) -> Harness {
    let latest = LatestFeedback::new();
    let output = MockOutput::new();
    let speaker: Arc<dyn Speaker> = Arc::new(SpeechPlayer::new(synth.clone(), output.clone()));
    let selector = PhraseSelector::new(Arc::new(PhraseTable::bundled()), latest.clone());
    let session = Arc::new(SessionController::new(config, selector, Some(speaker), true));

    Harness {
        latest,
        synth,
        output,
        session,
    }
}

#[tokio::test(start_paused = true)]
async fn test_pushed_feedback_spoken_after_initial_delay() {
    let h = harness(RecordingSynthesizer::new(), SchedulerConfig::default());

    let connector = MockConnector::refusing();
    let peer = connector.accept_next();
    let push = PushChannel::new(
        "ws://test/ws/feedback",
        connector.clone(),
        ReconnectPolicy::default(),
        h.latest.clone(),
    );
    let on_feedback = h.session.feedback_callback();
    push.add_listener(MessageKind::Feedback, move |message| {
        if let Some(event) = message.to_feedback_event() {
            on_feedback(&event);
        }
    });
    assert_ok!(push.connect().await);

    h.session.start_session();
    peer.send_text(
        r#"{"type":"feedback","data":{"feedback":"Lock in!","analysis":"typing"},"timestamp":1000}"#,
    );
    settle().await;
    assert!(h.session.scheduler().is_pending());

    tokio::time::sleep(Duration::from_millis(4999)).await;
    settle().await;
    assert_eq!(h.synth.request_count(), 0);

    tokio::time::sleep(Duration::from_millis(1)).await;
    settle().await;
    let requests = h.synth.requests();
    assert_eq!(requests.len(), 1);

    let table = PhraseTable::bundled();
    assert!(
        table.phrases("productive").contains(&requests[0]),
        "{:?} is not a productive phrase",
        requests[0]
    );
    assert_eq!(h.output.live(), 1);

    // Re-armed within the jitter window
    assert!(h.session.scheduler().is_pending());
    tokio::time::sleep(Duration::from_secs(15)).await;
    settle().await;
    assert_eq!(h.synth.request_count(), 2);
    assert_eq!(h.output.max_live(), 1);

    push.disconnect().await;
    h.session.stop_session().await;
}

#[tokio::test(start_paused = true)]
async fn test_new_feedback_restarts_initial_delay() {
    let h = harness(RecordingSynthesizer::new(), SchedulerConfig::default());
    let on_feedback = h.session.feedback_callback();
    h.session.start_session();

    tokio::time::sleep(Duration::from_secs(3)).await;
    let event = FeedbackEvent::new("Get back to work!", 10);
    assert!(h.latest.offer(event.clone()));
    on_feedback(&event);

    // The original timer would have fired at 5s
    tokio::time::sleep(Duration::from_millis(4900)).await;
    settle().await;
    assert_eq!(h.synth.request_count(), 0);

    tokio::time::sleep(Duration::from_millis(100)).await;
    settle().await;
    assert_eq!(h.synth.requests(), vec!["Get back to work!"]);
}

#[tokio::test(start_paused = true)]
async fn test_disabling_speech_cancels_pending_timer() {
    let h = harness(RecordingSynthesizer::new(), SchedulerConfig::default());
    h.latest.offer(FeedbackEvent::new("Lock in!", 1));

    h.session.start_session();
    assert!(h.session.scheduler().is_pending());

    h.session.set_speech_enabled(false).await;
    assert!(!h.session.scheduler().is_pending());

    tokio::time::sleep(Duration::from_secs(60)).await;
    settle().await;
    assert_eq!(h.synth.request_count(), 0);
    assert!(h.session.state().running);
    assert!(!h.session.state().speech_enabled);

    // Feedback while disabled does not arm
    h.session.on_feedback(&FeedbackEvent::new("Lock in!", 2));
    assert!(!h.session.scheduler().is_pending());

    h.session.set_speech_enabled(true).await;
    assert!(h.session.scheduler().is_pending());
}

#[tokio::test(start_paused = true)]
async fn test_stop_session_silences_and_disarms() {
    let h = harness(RecordingSynthesizer::new(), SchedulerConfig::default());
    h.latest.offer(FeedbackEvent::new("Lock in!", 1));
    h.session.start_session();

    tokio::time::sleep(Duration::from_secs(5)).await;
    settle().await;
    assert_eq!(h.synth.request_count(), 1);
    assert_eq!(h.output.live(), 1);

    h.session.stop_session().await;
    assert!(!h.session.scheduler().is_pending());
    assert_eq!(h.output.live(), 0);

    tokio::time::sleep(Duration::from_secs(60)).await;
    settle().await;
    assert_eq!(h.synth.request_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_synthesis_failure_keeps_loop_alive() {
    let h = harness(RecordingSynthesizer::failing(401), SchedulerConfig::default());
    h.latest.offer(FeedbackEvent::new("Lock in!", 1));
    h.session.start_session();

    tokio::time::sleep(Duration::from_secs(5)).await;
    settle().await;
    assert_eq!(h.synth.request_count(), 1);
    assert!(h.session.scheduler().is_pending());

    tokio::time::sleep(Duration::from_secs(15)).await;
    settle().await;
    assert_eq!(h.synth.request_count(), 2);
    assert_eq!(h.output.started(), 0);
    assert!(h.session.state().running);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_toggling_speech_under_load_leaves_nothing_armed() {
    let immediate = SchedulerConfig {
        initial_delay: Duration::ZERO,
        min_delay: Duration::ZERO,
        max_delay: Duration::ZERO,
    };
    let h = harness(RecordingSynthesizer::new(), immediate);
    h.latest.offer(FeedbackEvent::new("Lock in!", 1));
    h.session.start_session();

    for _ in 0..200 {
        h.session.set_speech_enabled(true).await;
        tokio::task::yield_now().await;
        h.session.set_speech_enabled(false).await;

        assert!(!h.session.scheduler().is_pending());
        let spoken = h.synth.request_count();
        tokio::time::sleep(Duration::from_millis(2)).await;
        assert_eq!(h.synth.request_count(), spoken, "spoke after disable");
        assert!(!h.session.scheduler().is_pending());
    }

    assert_eq!(h.output.live(), 0);
    assert!(h.output.max_live() <= 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_stop_session_under_load_stays_silent() {
    let immediate = SchedulerConfig {
        initial_delay: Duration::ZERO,
        min_delay: Duration::ZERO,
        max_delay: Duration::ZERO,
    };
    let h = harness(RecordingSynthesizer::new(), immediate);
    h.latest.offer(FeedbackEvent::new("Lock in!", 1));

    for _ in 0..200 {
        h.session.start_session();
        tokio::task::yield_now().await;
        h.session.stop_session().await;

        let spoken = h.synth.request_count();
        tokio::time::sleep(Duration::from_millis(2)).await;
        assert_eq!(h.synth.request_count(), spoken, "spoke after stop");
        assert!(!h.session.scheduler().is_pending());
        assert_eq!(h.output.live(), 0);
    }
}

#[tokio::test]
async fn test_empty_polled_feedback_is_not_spoken() {
    let router = axum::Router::new().route(
        "/feedback/latest",
        get(|| async { Json(json!({ "feedback": "", "timestamp": 2000, "is_new": true })) }),
    );
    let addr = spawn_server(router).await;

    let fast = SchedulerConfig {
        initial_delay: Duration::from_millis(30),
        min_delay: Duration::from_millis(30),
        max_delay: Duration::from_millis(30),
    };
    let h = harness(RecordingSynthesizer::new(), fast);
    let pull = PullChannel::with_callback(
        reqwest::Client::new(),
        format!("http://{addr}/feedback/latest"),
        h.latest.clone(),
        h.session.feedback_callback(),
    );

    h.session.start_session();
    assert_ok!(pull.poll_once().await);
    assert_eq!(h.latest.last_timestamp(), Some(2000));

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(h.synth.request_count(), 0);
    assert_eq!(h.output.started(), 0);
}

#[tokio::test]
async fn test_daemon_speaks_polled_feedback() {
    let router = axum::Router::new().route(
        "/feedback/latest",
        get(|| async {
            Json(json!({
                "success": true,
                "data": { "feedback": "Stop slacking off!", "analysis": "", "timestamp": 5000 }
            }))
        }),
    );
    let addr = spawn_server(router).await;

    let mut config = assert_ok!(Config::resolve(LockinConfigFile::default(), |_| None));
    config.backend.poll_url = format!("http://{addr}/feedback/latest");
    config.backend.poll_interval = Duration::from_millis(20);
    config.speech.scheduler = SchedulerConfig {
        initial_delay: Duration::from_millis(50),
        min_delay: Duration::from_millis(30),
        max_delay: Duration::from_millis(60),
    };
    config.session.autostart = true;

    let synth = RecordingSynthesizer::new();
    let output = MockOutput::new();
    let speaker: Arc<dyn Speaker> = Arc::new(SpeechPlayer::new(synth.clone(), output.clone()));

    let daemon = Daemon::with_components(
        config,
        reqwest::Client::new(),
        MockConnector::refusing(),
        Some(speaker),
        PhraseTable::bundled(),
    );
    daemon.start().await;
    assert!(daemon.status().running);
    assert!(daemon.pull().is_running());

    tokio::time::timeout(Duration::from_secs(5), async {
        while synth.request_count() < 2 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("daemon never spoke twice");

    assert_eq!(daemon.latest().last_timestamp(), Some(5000));
    assert!(synth.requests().iter().all(|text| text == "Stop slacking off!"));
    assert_eq!(output.max_live(), 1);

    daemon.shutdown().await;
    assert!(!daemon.status().running);
    assert!(!daemon.pull().is_running());
    assert_eq!(daemon.push().state(), ChannelState::Disconnected);
    assert_eq!(output.live(), 0);
}
