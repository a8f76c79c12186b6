//! Audio playback to speakers
//!
//! A started utterance is represented by a [`PlaybackHandle`] on the async
//! side and a [`PlaybackWorker`] on whichever thread drives the device.
//! Dropping the worker marks the handle finished, so every exit path of a
//! playback thread (natural end, cancellation, device error) releases it.

use std::future::Future;
use std::io::Cursor;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleRate, StreamConfig};
use tokio::sync::{oneshot, watch};

use crate::{Error, Result};

/// Extra time allowed past the computed clip length before giving up
const PLAYBACK_SLACK: Duration = Duration::from_millis(500);

/// How often the playback thread checks for completion or cancellation
const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Fallback when a decoded frame reports no usable sample rate
const DEFAULT_SAMPLE_RATE: u32 = 44_100;

static NEXT_HANDLE_ID: AtomicU64 = AtomicU64::new(1);

/// The single live audio resource of an utterance
#[derive(Debug)]
pub struct PlaybackHandle {
    id: u64,
    cancel: Arc<AtomicBool>,
    done: watch::Receiver<bool>,
}

impl PlaybackHandle {
    /// Unique id of this playback
    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    /// Whether playback has ended and the resource is released
    #[must_use]
    pub fn is_finished(&self) -> bool {
        *self.done.borrow()
    }

    /// Future resolving once playback ends, independent of this handle
    pub fn finished(&self) -> impl Future<Output = ()> + Send + 'static {
        let mut done = self.done.clone();
        async move {
            // A closed channel also means the worker is gone
            let _ = done.wait_for(|finished| *finished).await;
        }
    }

    /// Ask the worker to stop early
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    /// Stop playback and wait until the resource is released
    pub async fn release(mut self) {
        self.cancel();
        let _ = self.done.wait_for(|finished| *finished).await;
        tracing::trace!(id = self.id, "playback released");
    }
}

/// Device-side half of a playback; signals completion when dropped
#[derive(Debug)]
pub struct PlaybackWorker {
    cancel: Arc<AtomicBool>,
    done: watch::Sender<bool>,
}

impl PlaybackWorker {
    /// Whether the handle asked for playback to stop
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    /// Mark playback finished
    pub fn finish(self) {}
}

impl Drop for PlaybackWorker {
    fn drop(&mut self) {
        self.done.send_replace(true);
    }
}

/// Create a connected handle/worker pair
#[must_use]
pub fn playback_pair() -> (PlaybackHandle, PlaybackWorker) {
    let cancel = Arc::new(AtomicBool::new(false));
    let (tx, rx) = watch::channel(false);
    let id = NEXT_HANDLE_ID.fetch_add(1, Ordering::Relaxed);

    (
        PlaybackHandle {
            id,
            cancel: Arc::clone(&cancel),
            done: rx,
        },
        PlaybackWorker { cancel, done: tx },
    )
}

/// An audio sink that plays encoded clips
#[async_trait]
pub trait AudioOutput: Send + Sync {
    /// Make sure output will be audible.
    ///
    /// Failure is reported but callers continue regardless.
    fn configure_output(&self) -> Result<()>;

    /// Decode `audio` and begin playing it; resolves once playback started
    async fn start(&self, audio: Vec<u8>) -> Result<PlaybackHandle>;
}

/// Plays MP3 clips on the default output device
#[derive(Debug, Clone, Copy, Default)]
pub struct SpeakerOutput;

impl SpeakerOutput {
    /// Create a speaker output
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

#[async_trait]
impl AudioOutput for SpeakerOutput {
    fn configure_output(&self) -> Result<()> {
        let device = cpal::default_host()
            .default_output_device()
            .ok_or_else(|| Error::Playback("no output device available".to_string()))?;

        tracing::debug!(
            device = device.name().unwrap_or_default(),
            "audio output configured"
        );
        Ok(())
    }

    async fn start(&self, audio: Vec<u8>) -> Result<PlaybackHandle> {
        let (samples, sample_rate) =
            tokio::task::spawn_blocking(move || decode_mp3(&audio))
                .await
                .map_err(|e| Error::Playback(format!("decode task failed: {e}")))??;

        if samples.is_empty() {
            return Err(Error::Playback("no audio decoded".to_string()));
        }

        let (handle, worker) = playback_pair();
        let (started_tx, started_rx) = oneshot::channel();

        // cpal streams are not Send; the stream lives and dies on this thread
        std::thread::Builder::new()
            .name("lockin-playback".to_string())
            .spawn(move || play_blocking(samples, sample_rate, worker, started_tx))
            .map_err(|e| Error::Playback(format!("failed to spawn playback thread: {e}")))?;

        started_rx
            .await
            .map_err(|_| Error::Playback("playback thread exited early".to_string()))??;

        tracing::debug!(id = handle.id(), sample_rate, "playback started");
        Ok(handle)
    }
}

/// Drive one clip to completion on the current thread
fn play_blocking(
    samples: Vec<f32>,
    sample_rate: u32,
    worker: PlaybackWorker,
    started: oneshot::Sender<Result<()>>,
) {
    let sample_count = samples.len();
    let finished = Arc::new(AtomicBool::new(false));

    let stream = match open_stream(samples, sample_rate, Arc::clone(&finished)) {
        Ok(stream) => stream,
        Err(e) => {
            let _ = started.send(Err(e));
            return;
        }
    };

    if let Err(e) = stream.play() {
        let _ = started.send(Err(Error::Playback(e.to_string())));
        return;
    }
    let _ = started.send(Ok(()));

    let clip = Duration::from_millis(
        u64::try_from(sample_count)
            .unwrap_or(u64::MAX)
            .saturating_mul(1000)
            / u64::from(sample_rate.max(1)),
    );
    let deadline = Instant::now() + clip + PLAYBACK_SLACK;

    while !finished.load(Ordering::SeqCst) && !worker.is_cancelled() {
        if Instant::now() > deadline {
            tracing::debug!("playback timed out waiting for device");
            break;
        }
        std::thread::sleep(POLL_INTERVAL);
    }

    drop(stream);
    tracing::debug!(
        samples = sample_count,
        cancelled = worker.is_cancelled(),
        "playback complete"
    );
    worker.finish();
}

fn open_stream(
    samples: Vec<f32>,
    sample_rate: u32,
    finished: Arc<AtomicBool>,
) -> Result<cpal::Stream> {
    let device = cpal::default_host()
        .default_output_device()
        .ok_or_else(|| Error::Playback("no output device".to_string()))?;

    let config = output_config(&device, sample_rate)?;
    let channels = usize::from(config.channels);
    let mut pos = 0usize;

    device
        .build_output_stream(
            &config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                for frame in data.chunks_mut(channels) {
                    let sample = samples.get(pos).copied().unwrap_or_else(|| {
                        finished.store(true, Ordering::SeqCst);
                        0.0
                    });
                    frame.fill(sample);
                    if pos < samples.len() {
                        pos += 1;
                    }
                }
            },
            |err| {
                tracing::error!(error = %err, "audio playback error");
            },
            None,
        )
        .map_err(|e| Error::Playback(e.to_string()))
}

/// Pick a mono config at `sample_rate`, falling back to stereo
fn output_config(device: &cpal::Device, sample_rate: u32) -> Result<StreamConfig> {
    let rate = SampleRate(sample_rate);
    let supports = |c: &cpal::SupportedStreamConfigRange, channels: u16| {
        c.channels() == channels && c.min_sample_rate() <= rate && c.max_sample_rate() >= rate
    };

    let supported = device
        .supported_output_configs()
        .map_err(|e| Error::Playback(e.to_string()))?
        .find(|c| supports(c, 1))
        .or_else(|| {
            device
                .supported_output_configs()
                .ok()?
                .find(|c| supports(c, 2))
        })
        .ok_or_else(|| {
            Error::Playback(format!("no output config for {sample_rate} Hz"))
        })?;

    Ok(supported.with_sample_rate(rate).config())
}

/// Decode MP3 bytes to mono f32 samples and their sample rate
///
/// # Errors
///
/// Returns `Error::Playback` if the stream is corrupt
pub fn decode_mp3(mp3_data: &[u8]) -> Result<(Vec<f32>, u32)> {
    let mut decoder = minimp3::Decoder::new(Cursor::new(mp3_data));
    let mut samples = Vec::new();
    let mut sample_rate = None;

    loop {
        match decoder.next_frame() {
            Ok(frame) => {
                if sample_rate.is_none() {
                    sample_rate = u32::try_from(frame.sample_rate).ok().filter(|r| *r > 0);
                }

                if frame.channels == 2 {
                    samples.extend(frame.data.chunks(2).map(|chunk| {
                        let left = f32::from(chunk[0]) / 32768.0;
                        let right = f32::from(chunk.get(1).copied().unwrap_or(chunk[0])) / 32768.0;
                        f32::midpoint(left, right)
                    }));
                } else {
                    samples.extend(frame.data.iter().map(|&s| f32::from(s) / 32768.0));
                }
            }
            Err(minimp3::Error::Eof) => break,
            Err(e) => return Err(Error::Playback(format!("MP3 decode error: {e}"))),
        }
    }

    Ok((samples, sample_rate.unwrap_or(DEFAULT_SAMPLE_RATE)))
}
