//! Motor pulse mapping and duty-cycle safety.
//!
//! An [`Actuator`] is anything with a throttle in `[-1, 1]`; which driver is
//! physically present is decided by the caller at construction time, never
//! by runtime detection. The [`MouthDrive`] converts opening percentages
//! into short throttle pulses and refuses to energize the motor once the
//! trailing duty window is saturated.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::error::{MotionError, MotionResult};

/// A motor channel with a signed throttle. Implementations must be cheap to
/// call; writes are expected to take effect immediately.
pub trait Actuator: Send + Sync {
    fn set_throttle(&self, value: f32) -> MotionResult<()>;
}

/// Stand-in for absent hardware: every write succeeds and does nothing.
pub struct NullActuator;

impl Actuator for NullActuator {
    fn set_throttle(&self, _value: f32) -> MotionResult<()> {
        Ok(())
    }
}

/// Stand-in that logs non-zero throttle writes, useful on a dev machine
/// without the motor kit attached.
pub struct LoggingActuator {
    name: &'static str,
}

impl LoggingActuator {
    pub fn new(name: &'static str) -> Self {
        Self { name }
    }
}

impl Actuator for LoggingActuator {
    fn set_throttle(&self, value: f32) -> MotionResult<()> {
        if value != 0.0 {
            debug!(motor = self.name, throttle = value, "throttle");
        }
        Ok(())
    }
}

/// Trailing window of issued pulse durations, pruned on every access, used
/// to cap the fraction of time the motor may be energized.
pub struct DutyWindow {
    window: Duration,
    samples: VecDeque<(Instant, Duration)>,
}

impl DutyWindow {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            samples: VecDeque::new(),
        }
    }

    fn prune(&mut self, now: Instant) {
        while let Some(&(t, _)) = self.samples.front() {
            if now.duration_since(t) > self.window {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }

    /// Total on-time recorded within the trailing window.
    pub fn used(&mut self, now: Instant) -> Duration {
        self.prune(now);
        self.samples.iter().map(|&(_, d)| d).sum()
    }

    /// Record an issued pulse. Only call after the pulse was actually sent.
    pub fn record(&mut self, now: Instant, on_duration: Duration) {
        self.prune(now);
        self.samples.push_back((now, on_duration));
    }

    /// Whether issuing another pulse is allowed under the given cap.
    pub fn allows(&mut self, now: Instant, max_fraction: f32) -> bool {
        let budget = self.window.as_secs_f32() * max_fraction;
        self.used(now).as_secs_f32() < budget
    }
}

/// Tuning for the mouth motor pulses.
#[derive(Debug, Clone)]
pub struct MouthDriveConfig {
    /// Openings below this percentage get an anti-chatter close pulse.
    pub deadband_pct: f32,
    /// Pulse intensity bounds, interpolated over opening.
    pub intensity_min: f32,
    pub intensity_max: f32,
    /// Pulse duration bounds, interpolated over opening.
    pub pulse_min: Duration,
    pub pulse_max: Duration,
    /// Fixed close pulse used inside the deadband.
    pub close_intensity: f32,
    pub close_pulse: Duration,
    /// Trailing window and cap for motor on-time.
    pub duty_window: Duration,
    pub max_duty_fraction: f32,
    /// 1.0 for normal wiring, -1.0 to invert.
    pub direction: f32,
}

impl Default for MouthDriveConfig {
    fn default() -> Self {
        Self {
            deadband_pct: 12.0,
            intensity_min: 0.2,
            intensity_max: 0.9,
            pulse_min: Duration::from_millis(25),
            pulse_max: Duration::from_millis(80),
            close_intensity: 0.35,
            close_pulse: Duration::from_millis(30),
            duty_window: Duration::from_secs(3),
            max_duty_fraction: 0.45,
            direction: 1.0,
        }
    }
}

/// Maps opening percentages onto safe throttle pulses.
pub struct MouthDrive {
    actuator: Arc<dyn Actuator>,
    config: MouthDriveConfig,
    duty: DutyWindow,
}

impl MouthDrive {
    pub fn new(actuator: Arc<dyn Actuator>, config: MouthDriveConfig) -> Self {
        let duty = DutyWindow::new(config.duty_window);
        Self {
            actuator,
            config,
            duty,
        }
    }

    /// Drive one opening sample. Below the deadband the jaw gets a minimal
    /// close pulse; otherwise intensity and duration scale with the opening.
    pub async fn apply_opening(&mut self, opening: f32) {
        if opening < self.config.deadband_pct {
            let throttle = self.config.close_intensity * self.config.direction;
            self.pulse(throttle, self.config.close_pulse).await;
            return;
        }

        let frac = (opening / 100.0).clamp(0.0, 1.0);
        let intensity = (self.config.intensity_min
            + frac * (self.config.intensity_max - self.config.intensity_min))
            .clamp(0.1, 1.0);
        let duration = self.config.pulse_min
            + Duration::from_secs_f32(
                frac * (self.config.pulse_max - self.config.pulse_min).as_secs_f32(),
            );
        // Opening pulses run against the wiring direction.
        self.pulse(-intensity * self.config.direction, duration).await;
    }

    async fn pulse(&mut self, throttle: f32, duration: Duration) {
        let now = Instant::now();
        if !self.duty.allows(now, self.config.max_duty_fraction) {
            trace!("duty cap reached; skipping pulse");
            return;
        }
        if let Err(e) = self.actuator.set_throttle(throttle) {
            warn!(error = %e, "mouth write failed; continuing silently");
            return;
        }
        tokio::time::sleep(duration).await;
        if let Err(e) = self.actuator.set_throttle(0.0) {
            warn!(error = %e, "mouth zeroing failed");
        }
        self.duty.record(Instant::now(), duration);
    }

    /// Zero the throttle, e.g. during shutdown.
    pub fn stop(&self) {
        if let Err(e) = self.actuator.set_throttle(0.0) {
            warn!(error = %e, "mouth stop failed");
        }
    }
}
