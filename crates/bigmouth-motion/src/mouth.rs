//! Amplitude-to-opening mapping for the mouth.
//!
//! Converts raw 16-bit PCM into a smoothed 0–100 "opening" percentage with
//! asymmetric attack/release so the mouth snaps shut faster than it opens,
//! and a hard mute after sustained near-silence to kill residual twitch.

use std::collections::VecDeque;

/// Tuning for [`MouthController`]. Defaults match the calibrated animatronic.
#[derive(Debug, Clone)]
pub struct MouthConfig {
    /// Sliding-window length for amplitude smoothing.
    pub smoothing_window: usize,
    /// Smoothed amplitudes below this are treated as silence.
    pub min_threshold: f32,
    /// Smoothed amplitude mapped to a fully open mouth.
    pub max_threshold: f32,
    /// Fraction of the gap closed per frame while opening (slow attack).
    pub open_rate: f32,
    /// Fraction of the gap closed per frame while closing (fast release).
    pub close_rate: f32,
}

impl Default for MouthConfig {
    fn default() -> Self {
        Self {
            smoothing_window: 3,
            min_threshold: 0.015,
            max_threshold: 0.25,
            open_rate: 0.4,
            close_rate: 0.7,
        }
    }
}

/// Sliding-window amplitude state. Owned exclusively by the actuation task;
/// reset on utterance boundaries so turns do not bleed into each other.
pub struct MouthController {
    config: MouthConfig,
    window: VecDeque<f32>,
    current: f32,
    target: f32,
    silence_frames: u32,
    speaking: bool,
}

impl MouthController {
    pub fn new(config: MouthConfig) -> Self {
        let capacity = config.smoothing_window;
        Self {
            config,
            window: VecDeque::with_capacity(capacity),
            current: 0.0,
            target: 0.0,
            silence_frames: 0,
            speaking: false,
        }
    }

    /// Feed one PCM chunk, returning the opening percentage in `[0, 100]`.
    pub fn process_chunk(&mut self, pcm: &[u8]) -> f32 {
        if pcm.len() < 2 {
            return 0.0;
        }

        let amplitude = normalized_rms(pcm);
        if self.window.len() == self.config.smoothing_window {
            self.window.pop_front();
        }
        self.window.push_back(amplitude);
        let smoothed = self.window.iter().sum::<f32>() / self.window.len() as f32;

        if smoothed < self.config.min_threshold {
            self.target = 0.0;
            self.silence_frames += 1;
            self.speaking = false;
        } else {
            let span = self.config.max_threshold - self.config.min_threshold;
            let norm = ((smoothed - self.config.min_threshold) / span).clamp(0.0, 1.0);
            // Perceptual curve: sub-linear exponent keeps quiet speech visible.
            self.target = norm.powf(0.8) * 100.0;
            self.silence_frames = 0;
            self.speaking = self.target > 3.0;
        }

        if self.target < self.current {
            let step = (self.current - self.target) * self.config.close_rate;
            self.current = (self.current - step).max(self.target);
        } else {
            let step = (self.target - self.current) * self.config.open_rate;
            self.current = (self.current + step).min(self.target);
        }

        // Three consecutive near-silent frames force a hard close.
        if self.silence_frames > 2 {
            self.current = 0.0;
        }

        self.current
    }

    /// Clear all state. Call on utterance boundaries.
    pub fn reset(&mut self) {
        self.window.clear();
        self.current = 0.0;
        self.target = 0.0;
        self.silence_frames = 0;
        self.speaking = false;
    }

    /// Whether the smoothed target classifies as speech. The check runs on
    /// the target, not the lagging `current` value.
    pub fn is_speaking(&self) -> bool {
        self.speaking
    }

    pub fn target_opening(&self) -> f32 {
        self.target
    }

    pub fn current_opening(&self) -> f32 {
        self.current
    }
}

/// RMS of 16-bit little-endian samples, normalized to `[0, 1]`.
fn normalized_rms(pcm: &[u8]) -> f32 {
    let mut sum_squares = 0.0f64;
    let mut count = 0usize;
    for pair in pcm.chunks_exact(2) {
        let sample = i16::from_le_bytes([pair[0], pair[1]]) as f64;
        sum_squares += sample * sample;
        count += 1;
    }
    if count == 0 {
        return 0.0;
    }
    ((sum_squares / count as f64).sqrt() / 32_768.0) as f32
}
