//! Shared test utilities
#![allow(dead_code)]

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::Instant;

use lockin_voice::channels::{Connection, Connector, Frame};
use lockin_voice::voice::{AudioOutput, PlaybackHandle, Synthesizer, playback_pair};
use lockin_voice::{Error, Result};

/// Let spawned tasks run without advancing the clock
pub async fn settle() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
}

/// Serve `router` on an ephemeral local port
pub async fn spawn_server(router: axum::Router) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("failed to bind test server");
    let addr = listener.local_addr().expect("no local addr");
    tokio::spawn(async move {
        axum::serve(listener, router).await.expect("test server failed");
    });
    addr
}

/// Server side of a [`MockConnection`]
pub struct MockPeer {
    frames: mpsc::UnboundedSender<Frame>,
    pub sent: Arc<Mutex<Vec<String>>>,
    pub closed_with: Arc<Mutex<Option<u16>>>,
}

impl MockPeer {
    /// Push a text frame to the client
    pub fn send_text(&self, text: &str) {
        let _ = self.frames.send(Frame::Text(text.to_string()));
    }

    /// Push a binary frame to the client
    pub fn send_binary(&self, data: Vec<u8>) {
        let _ = self.frames.send(Frame::Binary(data));
    }

    /// Close with a code
    pub fn close(&self, code: u16) {
        let _ = self.frames.send(Frame::Close(Some(code)));
    }

    /// Drop the connection without a close frame
    pub fn drop_connection(self) {}

    /// Text frames the client sent
    pub fn sent(&self) -> Vec<String> {
        self.sent.lock().unwrap().clone()
    }

    /// Close code the client sent, if it closed
    pub fn closed_with(&self) -> Option<u16> {
        *self.closed_with.lock().unwrap()
    }
}

/// Client side of an in-memory connection
pub struct MockConnection {
    frames: mpsc::UnboundedReceiver<Frame>,
    sent: Arc<Mutex<Vec<String>>>,
    closed_with: Arc<Mutex<Option<u16>>>,
}

/// Create a connected client/peer pair
pub fn mock_connection() -> (MockConnection, MockPeer) {
    let (tx, rx) = mpsc::unbounded_channel();
    let sent = Arc::new(Mutex::new(Vec::new()));
    let closed_with = Arc::new(Mutex::new(None));
    (
        MockConnection {
            frames: rx,
            sent: Arc::clone(&sent),
            closed_with: Arc::clone(&closed_with),
        },
        MockPeer {
            frames: tx,
            sent,
            closed_with,
        },
    )
}

#[async_trait]
impl Connection for MockConnection {
    async fn recv(&mut self) -> Option<Result<Frame>> {
        self.frames.recv().await.map(Ok)
    }

    async fn send_text(&mut self, text: String) -> Result<()> {
        self.sent.lock().unwrap().push(text);
        Ok(())
    }

    async fn close(&mut self, code: u16) -> Result<()> {
        *self.closed_with.lock().unwrap() = Some(code);
        Ok(())
    }
}

/// Connector that hands out scripted connections, then refuses
#[derive(Default)]
pub struct MockConnector {
    script: Mutex<VecDeque<MockConnection>>,
    attempts: Mutex<Vec<Instant>>,
}

impl MockConnector {
    /// A connector that never connects
    pub fn refusing() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Queue a connection for the next successful connect
    pub fn push(&self, connection: MockConnection) {
        self.script.lock().unwrap().push_back(connection);
    }

    /// Queue a fresh connection and return its peer
    pub fn accept_next(&self) -> MockPeer {
        let (conn, peer) = mock_connection();
        self.push(conn);
        peer
    }

    /// When each connect attempt happened
    pub fn attempts(&self) -> Vec<Instant> {
        self.attempts.lock().unwrap().clone()
    }

    pub fn attempt_count(&self) -> usize {
        self.attempts.lock().unwrap().len()
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, _url: &str) -> Result<Box<dyn Connection>> {
        self.attempts.lock().unwrap().push(Instant::now());
        match self.script.lock().unwrap().pop_front() {
            Some(conn) => Ok(Box::new(conn)),
            None => Err(Error::Transport("connection refused".to_string())),
        }
    }
}

/// Synthesizer that records requested text
#[derive(Default)]
pub struct RecordingSynthesizer {
    requests: Mutex<Vec<String>>,
    fail_with: Option<u16>,
}

impl RecordingSynthesizer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// A synthesizer that answers every request with an HTTP error status
    pub fn failing(status: u16) -> Arc<Self> {
        Arc::new(Self {
            requests: Mutex::new(Vec::new()),
            fail_with: Some(status),
        })
    }

    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().unwrap().clone()
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

#[async_trait]
impl Synthesizer for RecordingSynthesizer {
    async fn synthesize(&self, text: &str) -> Result<Vec<u8>> {
        self.requests.lock().unwrap().push(text.to_string());
        match self.fail_with {
            Some(status) => Err(Error::Synthesis(format!("TTS error {status}"))),
            None => Ok(text.as_bytes().to_vec()),
        }
    }
}

/// Audio output that plays until cancelled or completed, tracking how many
/// playbacks are alive at once
#[derive(Default)]
pub struct MockOutput {
    live: Arc<AtomicUsize>,
    max_live: Arc<AtomicUsize>,
    started: AtomicUsize,
    complete: Arc<AtomicBool>,
}

impl MockOutput {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Playbacks currently holding a resource
    pub fn live(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    /// Highest number of simultaneously live playbacks seen
    pub fn max_live(&self) -> usize {
        self.max_live.load(Ordering::SeqCst)
    }

    pub fn started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }

    /// Let every current and future playback end naturally
    pub fn complete_all(&self) {
        self.complete.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl AudioOutput for MockOutput {
    fn configure_output(&self) -> Result<()> {
        Ok(())
    }

    async fn start(&self, _audio: Vec<u8>) -> Result<PlaybackHandle> {
        let (handle, worker) = playback_pair();
        self.started.fetch_add(1, Ordering::SeqCst);
        let now_live = self.live.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_live.fetch_max(now_live, Ordering::SeqCst);

        let live = Arc::clone(&self.live);
        let complete = Arc::clone(&self.complete);
        tokio::spawn(async move {
            while !worker.is_cancelled() && !complete.load(Ordering::SeqCst) {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
            live.fetch_sub(1, Ordering::SeqCst);
            worker.finish();
        });

        Ok(handle)
    }
}
