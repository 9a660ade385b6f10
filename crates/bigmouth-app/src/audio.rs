//! Audio device access.
//!
//! cpal streams are not `Send` on every platform, so each stream lives on a
//! dedicated thread and is bridged to the async world over channels: input
//! frames arrive on an unbounded channel, output chunks leave through a
//! small bounded channel whose backpressure paces the playback task to the
//! device's real-time consumption.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{BufferSize, SampleRate, StreamConfig};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::{AppError, AppResult};

/// Chunks of lead the playback task may build up ahead of the device.
const OUTPUT_CHANNEL_CAPACITY: usize = 4;

/// Device access used by the pipelines. Concrete hardware hides behind this
/// so tests can feed and drain PCM without a sound card.
pub trait AudioBackend: Send + Sync {
    /// Open the input device and start delivering `frame_size`-sample frames
    /// of 16-bit little-endian mono PCM.
    fn open_input(
        &self,
        sample_rate: u32,
        frame_size: usize,
        device_index: Option<usize>,
    ) -> AppResult<InputHandle>;

    /// Open the output device at the requested rate. Callers are expected to
    /// walk their fallback rates when this fails.
    fn open_output(&self, sample_rate: u32, device_index: Option<usize>)
        -> AppResult<OutputHandle>;
}

/// Live input stream. Dropping (or closing) releases the device.
pub struct InputHandle {
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
    stop: Arc<AtomicBool>,
    join: Option<thread::JoinHandle<()>>,
}

impl InputHandle {
    /// Await the next captured frame; `None` once the stream has ended.
    pub async fn read_frame(&mut self) -> Option<Vec<u8>> {
        self.rx.recv().await
    }

    /// Stop the stream and release the device. Safe to call twice.
    pub fn close(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
        self.rx.close();
    }

    #[cfg(test)]
    pub(crate) fn from_channel(rx: mpsc::UnboundedReceiver<Vec<u8>>) -> Self {
        Self {
            rx,
            stop: Arc::new(AtomicBool::new(false)),
            join: None,
        }
    }
}

impl Drop for InputHandle {
    fn drop(&mut self) {
        self.close();
    }
}

/// Live output stream. `write` suspends once the device is far enough
/// behind, which is what keeps playback (and everything downstream of it)
/// on the device's clock.
pub struct OutputHandle {
    tx: mpsc::Sender<Vec<i16>>,
    sample_rate: u32,
    stop: Arc<AtomicBool>,
    join: Option<thread::JoinHandle<()>>,
}

impl OutputHandle {
    /// The rate the device actually opened at.
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub async fn write(&self, samples: Vec<i16>) -> AppResult<()> {
        self.tx
            .send(samples)
            .await
            .map_err(|_| AppError::StreamClosed)
    }

    pub fn close(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }

    #[cfg(test)]
    pub(crate) fn from_channel(tx: mpsc::Sender<Vec<i16>>, sample_rate: u32) -> Self {
        Self {
            tx,
            sample_rate,
            stop: Arc::new(AtomicBool::new(false)),
            join: None,
        }
    }
}

impl Drop for OutputHandle {
    fn drop(&mut self) {
        self.close();
    }
}

/// The real cpal-backed implementation.
pub struct CpalBackend;

impl AudioBackend for CpalBackend {
    fn open_input(
        &self,
        sample_rate: u32,
        frame_size: usize,
        device_index: Option<usize>,
    ) -> AppResult<InputHandle> {
        let (frame_tx, frame_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let (ready_tx, ready_rx) = std::sync::mpsc::channel::<Result<String, AppError>>();
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = Arc::clone(&stop);

        let join = thread::spawn(move || {
            let built: Result<(cpal::Stream, String), AppError> = (|| {
                let device = select_device(device_index, true)?;
                let name = device.name().unwrap_or_else(|_| "unknown".to_string());
                let config = StreamConfig {
                    channels: 1,
                    sample_rate: SampleRate(sample_rate),
                    buffer_size: BufferSize::Default,
                };
                let mut pending: Vec<f32> = Vec::with_capacity(frame_size);
                let stream = device
                    .build_input_stream(
                        &config,
                        move |data: &[f32], _: &cpal::InputCallbackInfo| {
                            for &sample in data {
                                pending.push(sample);
                                if pending.len() >= frame_size {
                                    let frame = f32_to_i16le_bytes(&pending);
                                    pending.clear();
                                    if frame_tx.send(frame).is_err() {
                                        return;
                                    }
                                }
                            }
                        },
                        |err| warn!(error = %err, "input stream error"),
                        None,
                    )
                    .map_err(|e| AppError::AudioDevice(e.to_string()))?;
                stream.play().map_err(|e| AppError::AudioDevice(e.to_string()))?;
                Ok((stream, name))
            })();
            match built {
                Ok((stream, name)) => {
                    let _ = ready_tx.send(Ok(name));
                    while !thread_stop.load(Ordering::SeqCst) {
                        thread::sleep(Duration::from_millis(50));
                    }
                    drop(stream);
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                }
            }
        });

        match ready_rx.recv() {
            Ok(Ok(name)) => {
                info!(device = %name, rate = sample_rate, "input device opened");
                Ok(InputHandle {
                    rx: frame_rx,
                    stop,
                    join: Some(join),
                })
            }
            Ok(Err(e)) => {
                let _ = join.join();
                Err(e)
            }
            Err(_) => Err(AppError::AudioDevice("input thread died".to_string())),
        }
    }

    fn open_output(
        &self,
        sample_rate: u32,
        device_index: Option<usize>,
    ) -> AppResult<OutputHandle> {
        let (chunk_tx, mut chunk_rx) = mpsc::channel::<Vec<i16>>(OUTPUT_CHANNEL_CAPACITY);
        let (ready_tx, ready_rx) = std::sync::mpsc::channel::<Result<String, AppError>>();
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = Arc::clone(&stop);

        let join = thread::spawn(move || {
            let built: Result<(cpal::Stream, String), AppError> = (|| {
                let device = select_device(device_index, false)?;
                let name = device.name().unwrap_or_else(|_| "unknown".to_string());
                let config = StreamConfig {
                    channels: 1,
                    sample_rate: SampleRate(sample_rate),
                    buffer_size: BufferSize::Default,
                };
                let mut pending: std::collections::VecDeque<i16> = std::collections::VecDeque::new();
                let stream = device
                    .build_output_stream(
                        &config,
                        move |out: &mut [f32], _: &cpal::OutputCallbackInfo| {
                            for slot in out.iter_mut() {
                                if pending.is_empty() {
                                    if let Ok(chunk) = chunk_rx.try_recv() {
                                        pending.extend(chunk);
                                    }
                                }
                                // Underruns play silence rather than stale data.
                                *slot = match pending.pop_front() {
                                    Some(s) => s as f32 / 32_768.0,
                                    None => 0.0,
                                };
                            }
                        },
                        |err| warn!(error = %err, "output stream error"),
                        None,
                    )
                    .map_err(|e| AppError::AudioDevice(e.to_string()))?;
                stream.play().map_err(|e| AppError::AudioDevice(e.to_string()))?;
                Ok((stream, name))
            })();
            match built {
                Ok((stream, name)) => {
                    let _ = ready_tx.send(Ok(name));
                    while !thread_stop.load(Ordering::SeqCst) {
                        thread::sleep(Duration::from_millis(50));
                    }
                    drop(stream);
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                }
            }
        });

        match ready_rx.recv() {
            Ok(Ok(name)) => {
                debug!(device = %name, rate = sample_rate, "output device opened");
                Ok(OutputHandle {
                    tx: chunk_tx,
                    sample_rate,
                    stop,
                    join: Some(join),
                })
            }
            Ok(Err(e)) => {
                let _ = join.join();
                Err(e)
            }
            Err(_) => Err(AppError::AudioDevice("output thread died".to_string())),
        }
    }
}

fn select_device(index: Option<usize>, input: bool) -> AppResult<cpal::Device> {
    let host = cpal::default_host();
    let direction = if input { "input" } else { "output" };
    match index {
        Some(i) => {
            let devices = if input {
                host.input_devices()
            } else {
                host.output_devices()
            }
            .map_err(|e| AppError::AudioDevice(e.to_string()))?;
            devices
                .into_iter()
                .nth(i)
                .ok_or_else(|| AppError::AudioDevice(format!("no {direction} device at index {i}")))
        }
        None => {
            let device = if input {
                host.default_input_device()
            } else {
                host.default_output_device()
            };
            device.ok_or_else(|| AppError::AudioDevice(format!("no default {direction} device")))
        }
    }
}

/// Convert normalized f32 samples to 16-bit little-endian bytes.
pub fn f32_to_i16le_bytes(samples: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * 2);
    for &s in samples {
        let clamped = (s * 32_767.0).clamp(-32_768.0, 32_767.0) as i16;
        out.extend_from_slice(&clamped.to_le_bytes());
    }
    out
}

/// Reinterpret 16-bit little-endian bytes as samples; a trailing odd byte is
/// dropped.
pub fn i16_samples(pcm: &[u8]) -> Vec<i16> {
    pcm.chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect()
}

/// Linear-interpolation resampler. Exactness is not required here, only
/// continuity; speech survives this fine for the rate pairs we negotiate.
pub fn resample_linear(input: &[i16], from_rate: u32, to_rate: u32) -> Vec<i16> {
    if input.is_empty() || from_rate == to_rate || from_rate == 0 {
        return input.to_vec();
    }
    let ratio = to_rate as f32 / from_rate as f32;
    let output_len = (input.len() as f32 * ratio).round() as usize;
    let mut output = Vec::with_capacity(output_len);
    for i in 0..output_len {
        let src = i as f32 / ratio;
        let idx = src.floor() as usize;
        let frac = src - idx as f32;
        let sample = if idx + 1 < input.len() {
            input[idx] as f32 * (1.0 - frac) + input[idx + 1] as f32 * frac
        } else if idx < input.len() {
            input[idx] as f32
        } else {
            *input.last().unwrap() as f32
        };
        output.push(sample as i16);
    }
    output
}
