//! Concurrent pipeline tasks: capture, playback, mouth actuation, idle wag
//! and the inactivity monitor.
//!
//! Every task takes a cancellation token checked at each suspension point
//! and runs its cleanup (close the content block, release the device, zero
//! the motor) on every exit path. Restart policy lives in the supervisor,
//! not here.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use bigmouth_motion::{MouthController, MouthDrive, TorsoDriver, TorsoState};
use bigmouth_sonic::{AudioChunk, PlaybackConsumer, SonicSession, INPUT_SAMPLE_RATE, OUTPUT_SAMPLE_RATE};
use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::audio::{i16_samples, resample_linear, AudioBackend};

/// Capture tuning. The frame size matches what the session protocol expects
/// per `audioInput` event.
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    pub sample_rate: u32,
    pub frame_size: usize,
    pub device_index: Option<usize>,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            sample_rate: INPUT_SAMPLE_RATE,
            frame_size: 1024,
            device_index: None,
        }
    }
}

/// Playback tuning. Fallback rates are tried in order when the device
/// refuses the canonical rate.
#[derive(Debug, Clone)]
pub struct PlaybackConfig {
    pub canonical_rate: u32,
    pub fallback_rates: Vec<u32>,
    pub device_index: Option<usize>,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            canonical_rate: OUTPUT_SAMPLE_RATE,
            fallback_rates: vec![48_000, 44_100],
            device_index: None,
        }
    }
}

/// Shared activity signals. Pipelines report here; only the supervisor
/// interprets them (torso transitions, inactivity timeout).
pub struct ActivitySignals {
    last_chunk: StdMutex<Option<Instant>>,
    last_activity: StdMutex<Instant>,
    capture_active: AtomicBool,
}

impl ActivitySignals {
    pub fn new() -> Self {
        Self {
            last_chunk: StdMutex::new(None),
            last_activity: StdMutex::new(Instant::now()),
            capture_active: AtomicBool::new(true),
        }
    }

    /// A playback chunk was delivered to the output device.
    pub fn note_chunk(&self) {
        let now = Instant::now();
        *self.last_chunk.lock().unwrap() = Some(now);
        *self.last_activity.lock().unwrap() = now;
    }

    /// Some other meaningful activity happened (e.g. a transcript arrived).
    pub fn note_activity(&self) {
        *self.last_activity.lock().unwrap() = Instant::now();
    }

    pub fn last_chunk(&self) -> Option<Instant> {
        *self.last_chunk.lock().unwrap()
    }

    pub fn idle_for(&self, now: Instant) -> Duration {
        now.duration_since(*self.last_activity.lock().unwrap())
    }

    /// The listening gate: false once capture has been deactivated.
    pub fn capture_active(&self) -> bool {
        self.capture_active.load(Ordering::SeqCst)
    }

    pub fn set_capture_active(&self, active: bool) {
        self.capture_active.store(active, Ordering::SeqCst);
    }
}

impl Default for ActivitySignals {
    fn default() -> Self {
        Self::new()
    }
}

/// Microphone → engine. Opens the audio input content block, streams frames
/// until cancelled or the device dies, then closes the block and releases
/// the device, on every exit path.
pub async fn run_capture(
    session: Arc<SonicSession>,
    backend: Arc<dyn AudioBackend>,
    config: CaptureConfig,
    cancel: CancellationToken,
) {
    let mut input = match backend.open_input(
        config.sample_rate,
        config.frame_size,
        config.device_index,
    ) {
        Ok(input) => input,
        Err(e) => {
            error!(error = %e, "could not open input device");
            return;
        }
    };

    if let Err(e) = session.open_audio_input().await {
        error!(error = %e, "could not open audio input block");
        input.close();
        return;
    }
    info!("listening");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("capture cancelled");
                break;
            }
            frame = input.read_frame() => match frame {
                Some(pcm) => {
                    if let Err(e) = session.send_audio_frame(&pcm).await {
                        warn!(error = %e, "audio frame send failed; stopping capture");
                        break;
                    }
                    if !session.is_active() {
                        break;
                    }
                }
                None => {
                    warn!("input stream ended");
                    break;
                }
            }
        }
    }

    if let Err(e) = session.close_audio_input().await {
        debug!(error = %e, "audio input block close failed during teardown");
    }
    input.close();
    info!("capture stopped");
}

/// Engine → output device (+ mouth). Chunks play in strict arrival order;
/// each canonical-rate chunk is offered to the mouth worker only after its
/// device write, over a bounded channel so a slow actuation computation can
/// never stall the audio cadence.
pub async fn run_playback(
    queue: Arc<Mutex<PlaybackConsumer>>,
    backend: Arc<dyn AudioBackend>,
    config: PlaybackConfig,
    mouth_tx: mpsc::Sender<AudioChunk>,
    signals: Arc<ActivitySignals>,
    cancel: CancellationToken,
) {
    let mut output = None;
    for &rate in std::iter::once(&config.canonical_rate).chain(config.fallback_rates.iter()) {
        match backend.open_output(rate, config.device_index) {
            Ok(handle) => {
                output = Some(handle);
                break;
            }
            Err(e) => warn!(rate, error = %e, "output device rejected rate"),
        }
    }
    let Some(mut output) = output else {
        error!("could not open output device at any candidate rate");
        return;
    };
    let device_rate = output.sample_rate();
    info!(device_rate, "playback ready");

    let mut queue = queue.lock().await;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("playback cancelled");
                break;
            }
            chunk = queue.pop() => match chunk {
                Some(chunk) => {
                    let samples = i16_samples(&chunk.pcm);
                    let for_device = if device_rate != config.canonical_rate {
                        resample_linear(&samples, config.canonical_rate, device_rate)
                    } else {
                        samples
                    };
                    if let Err(e) = output.write(for_device).await {
                        error!(error = %e, "device write failed; stopping playback");
                        break;
                    }
                    signals.note_chunk();
                    // Offered, not awaited: if the mouth worker is behind we
                    // drop rather than stall the next write.
                    if let Err(mpsc::error::TrySendError::Full(chunk)) = mouth_tx.try_send(chunk) {
                        debug!(seq = chunk.seq, "mouth worker behind; dropping actuation chunk");
                    }
                }
                None => {
                    info!("playback queue closed");
                    break;
                }
            }
        }
    }
    output.close();
    info!("playback stopped");
}

/// Mouth actuation worker: the single place the amplitude state and the
/// motor drive are touched. Pulse writes are tens of milliseconds and
/// happen only here, decoupled from playback by the bounded channel.
pub async fn run_mouth(
    chunks: Arc<Mutex<mpsc::Receiver<AudioChunk>>>,
    controller: Arc<StdMutex<MouthController>>,
    drive: Arc<Mutex<MouthDrive>>,
    cancel: CancellationToken,
) {
    let mut chunks = chunks.lock().await;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("mouth worker cancelled");
                break;
            }
            chunk = chunks.recv() => match chunk {
                Some(chunk) => {
                    let opening = controller.lock().unwrap().process_chunk(&chunk.pcm);
                    drive.lock().await.apply_opening(opening).await;
                }
                None => break,
            }
        }
    }
    drive.lock().await.stop();
}

/// Periodic idle oscillation while the figure is at rest and the listening
/// gate is enabled.
pub async fn run_idle_wag(
    torso: Arc<TorsoDriver>,
    signals: Arc<ActivitySignals>,
    cancel: CancellationToken,
) {
    let period = torso.config().idle_period;
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    interval.tick().await; // immediate first tick
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {
                if !signals.capture_active() {
                    continue;
                }
                if torso.state() == TorsoState::Rest {
                    torso.wag().await;
                }
            }
        }
    }
}

/// Watches the activity signals and fires once when the inactivity timeout
/// elapses while capture is still enabled. The expiry is a scripted state
/// transition, not an error; the supervisor handles it on its tick.
pub async fn run_inactivity_monitor(
    signals: Arc<ActivitySignals>,
    timeout: Duration,
    expired_tx: mpsc::Sender<()>,
    cancel: CancellationToken,
) {
    let mut interval = tokio::time::interval(Duration::from_secs(1));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = interval.tick() => {
                if signals.capture_active() && signals.idle_for(Instant::now()) >= timeout {
                    info!(timeout_secs = timeout.as_secs(), "inactivity timeout expired");
                    let _ = expired_tx.send(()).await;
                    return;
                }
            }
        }
    }
}
