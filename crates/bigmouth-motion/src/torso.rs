//! Torso posture state machine: lean forward while speaking, return to rest
//! after a debounced quiet period, and occasionally wag while idle.
//!
//! State is owned here but all transitions are driven by the supervisor,
//! which reports playback signals (chunk arrived, queue empty) on its tick.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, warn};

use crate::drive::Actuator;

/// Posture of the secondary actuator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TorsoState {
    /// Upright, motor off. Idle wag may fire from here.
    Rest,
    /// Leaning forward while speech is playing.
    Active,
    /// Driving in reverse for a fixed duration on the way back to rest.
    Returning,
}

/// Tuning for [`TorsoDriver`]. Defaults match the calibrated animatronic.
#[derive(Debug, Clone)]
pub struct TorsoConfig {
    pub forward_throttle: f32,
    pub return_throttle: f32,
    /// How long to drive in reverse before stopping at rest.
    pub return_duration: Duration,
    /// Quiet period tolerated before leaving Active; brief playback gaps
    /// must not flap the torso.
    pub grace: Duration,
    /// Period of the idle wag timer.
    pub idle_period: Duration,
    pub idle_throttle: f32,
    /// Duration of each half of the idle oscillation.
    pub idle_pulse: Duration,
    /// 1.0 for normal wiring, -1.0 to invert.
    pub direction: f32,
}

impl Default for TorsoConfig {
    fn default() -> Self {
        Self {
            forward_throttle: 0.55,
            return_throttle: -0.55,
            return_duration: Duration::from_millis(450),
            grace: Duration::from_secs(1),
            idle_period: Duration::from_secs(3),
            idle_throttle: 0.3,
            idle_pulse: Duration::from_millis(150),
            direction: 1.0,
        }
    }
}

struct TorsoInner {
    state: TorsoState,
    last_audio: Option<Instant>,
    return_started: Option<Instant>,
    wagging: bool,
}

/// Drives the torso actuator from playback signals.
pub struct TorsoDriver {
    actuator: Arc<dyn Actuator>,
    config: TorsoConfig,
    inner: Mutex<TorsoInner>,
}

impl TorsoDriver {
    pub fn new(actuator: Arc<dyn Actuator>, config: TorsoConfig) -> Self {
        Self {
            actuator,
            config,
            inner: Mutex::new(TorsoInner {
                state: TorsoState::Rest,
                last_audio: None,
                return_started: None,
                wagging: false,
            }),
        }
    }

    pub fn state(&self) -> TorsoState {
        self.inner.lock().unwrap().state
    }

    pub fn config(&self) -> &TorsoConfig {
        &self.config
    }

    fn set(&self, throttle: f32) {
        if let Err(e) = self.actuator.set_throttle(throttle) {
            warn!(error = %e, "torso write failed; continuing silently");
        }
    }

    /// Report that a playback chunk was delivered. The first chunk after
    /// rest leans the torso forward.
    pub fn note_audio(&self, now: Instant) {
        let mut inner = self.inner.lock().unwrap();
        inner.last_audio = Some(now);
        if inner.state == TorsoState::Rest {
            debug!("torso leaning forward");
            inner.state = TorsoState::Active;
            drop(inner);
            self.set(self.config.forward_throttle * self.config.direction);
        }
    }

    /// Evaluate debounced transitions. Called from the supervisor tick.
    pub fn tick(&self, now: Instant, queue_empty: bool) {
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            TorsoState::Rest => {}
            TorsoState::Active => {
                if !queue_empty {
                    inner.last_audio = Some(now);
                    return;
                }
                let quiet_for = inner
                    .last_audio
                    .map(|t| now.duration_since(t))
                    .unwrap_or(Duration::ZERO);
                if quiet_for >= self.config.grace {
                    debug!("torso returning to rest");
                    inner.state = TorsoState::Returning;
                    inner.return_started = Some(now);
                    drop(inner);
                    self.set(self.config.return_throttle * self.config.direction);
                }
            }
            TorsoState::Returning => {
                let returning_for = inner
                    .return_started
                    .map(|t| now.duration_since(t))
                    .unwrap_or(Duration::ZERO);
                if returning_for >= self.config.return_duration {
                    debug!("torso at rest");
                    inner.state = TorsoState::Rest;
                    inner.return_started = None;
                    drop(inner);
                    self.set(0.0);
                }
            }
        }
    }

    /// One two-direction idle oscillation. Only fires from Rest; if speech
    /// starts mid-wag the forward throttle wins and the wag bows out
    /// without zeroing it.
    pub async fn wag(&self) {
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.state != TorsoState::Rest || inner.wagging {
                return;
            }
            inner.wagging = true;
        }
        let throttle = self.config.idle_throttle * self.config.direction;

        self.set(throttle);
        tokio::time::sleep(self.config.idle_pulse).await;
        if self.state() == TorsoState::Rest {
            self.set(-throttle);
            tokio::time::sleep(self.config.idle_pulse).await;
        }
        if self.state() == TorsoState::Rest {
            self.set(0.0);
        }
        self.inner.lock().unwrap().wagging = false;
    }

    /// Zero the throttle and settle at rest, e.g. during shutdown.
    pub fn stop(&self) {
        {
            let mut inner = self.inner.lock().unwrap();
            inner.state = TorsoState::Rest;
            inner.return_started = None;
            inner.last_audio = None;
        }
        self.set(0.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::MotionResult;
    use std::sync::Mutex as StdMutex;

    struct RecordingActuator {
        writes: StdMutex<Vec<f32>>,
    }

    impl RecordingActuator {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                writes: StdMutex::new(Vec::new()),
            })
        }

        fn writes(&self) -> Vec<f32> {
            self.writes.lock().unwrap().clone()
        }
    }

    impl Actuator for RecordingActuator {
        fn set_throttle(&self, value: f32) -> MotionResult<()> {
            self.writes.lock().unwrap().push(value);
            Ok(())
        }
    }

    fn driver() -> (TorsoDriver, Arc<RecordingActuator>) {
        let actuator = RecordingActuator::new();
        (
            TorsoDriver::new(actuator.clone(), TorsoConfig::default()),
            actuator,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn first_chunk_leans_forward() {
        let (torso, actuator) = driver();
        assert_eq!(torso.state(), TorsoState::Rest);
        torso.note_audio(Instant::now());
        assert_eq!(torso.state(), TorsoState::Active);
        assert_eq!(actuator.writes(), vec![0.55]);

        // Further chunks do not re-drive the motor.
        torso.note_audio(Instant::now());
        assert_eq!(actuator.writes(), vec![0.55]);
    }

    #[tokio::test(start_paused = true)]
    async fn empty_queue_debounces_through_grace_then_returns() {
        let (torso, actuator) = driver();
        let start = Instant::now();
        torso.note_audio(start);

        // Queue empty but still inside the grace period: no transition.
        torso.tick(start + Duration::from_millis(500), true);
        assert_eq!(torso.state(), TorsoState::Active);

        // A non-empty queue refreshes the quiet timer.
        torso.tick(start + Duration::from_millis(900), false);
        torso.tick(start + Duration::from_millis(1_500), true);
        assert_eq!(torso.state(), TorsoState::Active);

        // Sustained emptiness past the grace period: reverse drive.
        let quiet_start = start + Duration::from_millis(1_800);
        torso.tick(quiet_start, false);
        torso.tick(quiet_start + Duration::from_millis(1_100), true);
        assert_eq!(torso.state(), TorsoState::Returning);
        assert_eq!(actuator.writes(), vec![0.55, -0.55]);

        // After the fixed return duration the motor stops at rest.
        torso.tick(quiet_start + Duration::from_millis(1_600), true);
        assert_eq!(torso.state(), TorsoState::Rest);
        assert_eq!(actuator.writes(), vec![0.55, -0.55, 0.0]);
    }

    #[tokio::test(start_paused = true)]
    async fn wag_only_fires_from_rest() {
        let (torso, actuator) = driver();
        torso.note_audio(Instant::now());
        torso.wag().await;
        // Active: the wag must not have touched the motor.
        assert_eq!(actuator.writes(), vec![0.55]);

        // Returning must suppress the wag as well.
        let now = Instant::now();
        torso.tick(now + Duration::from_secs(2), true);
        assert_eq!(torso.state(), TorsoState::Returning);
        torso.wag().await;
        assert_eq!(actuator.writes(), vec![0.55, -0.55]);
    }

    #[tokio::test(start_paused = true)]
    async fn wag_oscillates_both_directions() {
        let (torso, actuator) = driver();
        torso.wag().await;
        assert_eq!(actuator.writes(), vec![0.3, -0.3, 0.0]);
        assert_eq!(torso.state(), TorsoState::Rest);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_zeroes_and_rests() {
        let (torso, actuator) = driver();
        torso.note_audio(Instant::now());
        torso.stop();
        assert_eq!(torso.state(), TorsoState::Rest);
        assert_eq!(actuator.writes(), vec![0.55, 0.0]);
    }

    #[tokio::test(start_paused = true)]
    async fn direction_inversion_flips_all_throttles() {
        let actuator = RecordingActuator::new();
        let torso = TorsoDriver::new(
            actuator.clone(),
            TorsoConfig {
                direction: -1.0,
                ..TorsoConfig::default()
            },
        );
        torso.note_audio(Instant::now());
        assert_eq!(actuator.writes(), vec![-0.55]);
    }
}
