//! Environment-backed configuration.
//!
//! Everything a deployment needs to tweak (endpoint, persona, device
//! indices, motor wiring) comes from env vars (usually via `.env`) so the
//! figure can be re-tuned without code edits. The core never reads globals;
//! this module is the only place that touches the environment.

use std::time::Duration;

use bigmouth_motion::{
    Actuator, LoggingActuator, MouthConfig, MouthDriveConfig, NullActuator, TorsoConfig,
};
use bigmouth_sonic::SessionConfig;
use std::sync::Arc;
use tracing::warn;

use crate::pipeline::{CaptureConfig, PlaybackConfig};
use crate::supervisor::{MotionParts, SupervisorConfig};

const DEFAULT_SYSTEM_PROMPT: &str = "You are a talking fish mounted on a wall. You are helpful \
     and conversational, but keep responses brief - one or two sentences. You know you are a \
     fish, but only mention it when it is relevant. Be natural and friendly.";

const DEFAULT_GOODBYE: &str =
    "Nobody has spoken for a while. Say a short, friendly goodbye and go quiet.";

/// Which actuator implementation to wire in. An injected capability: the
/// supervisor never inspects the environment or probes hardware at runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MotorMode {
    /// No motors attached; writes vanish.
    Disabled,
    /// Log throttle writes, useful on a dev machine.
    Logging,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub endpoint: Option<String>,
    pub voice_id: String,
    pub system_prompt: String,
    pub greeting: Option<String>,
    pub goodbye: String,
    pub input_device_index: Option<usize>,
    pub output_device_index: Option<usize>,
    pub mouth_direction: f32,
    pub torso_direction: f32,
    pub torso_forward: f32,
    pub torso_back: f32,
    pub torso_back_sec: f32,
    pub inactivity_secs: u64,
    pub tick_ms: u64,
    pub motors: MotorMode,
}

impl AppConfig {
    pub fn from_env() -> Self {
        Self {
            endpoint: env_string("BIGMOUTH_ENDPOINT"),
            voice_id: env_string("BIGMOUTH_VOICE_ID").unwrap_or_else(|| "matthew".to_string()),
            system_prompt: env_string("BIGMOUTH_SYSTEM_PROMPT")
                .unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_string()),
            greeting: env_string("BIGMOUTH_GREETING"),
            goodbye: env_string("BIGMOUTH_GOODBYE").unwrap_or_else(|| DEFAULT_GOODBYE.to_string()),
            input_device_index: env_parse("AUDIO_INPUT_INDEX"),
            output_device_index: env_parse("AUDIO_OUTPUT_INDEX"),
            mouth_direction: parse_direction(env_string("MOUTH_DIR").as_deref()),
            torso_direction: parse_direction(env_string("TORSO_DIR").as_deref()),
            torso_forward: env_parse("TORSO_THROTTLE_FWD").unwrap_or(0.55),
            torso_back: env_parse("TORSO_THROTTLE_BACK").unwrap_or(-0.55),
            torso_back_sec: env_parse("TORSO_BACK_SEC").unwrap_or(0.45),
            inactivity_secs: env_parse("BIGMOUTH_INACTIVITY_SECS").unwrap_or(30),
            tick_ms: env_parse("BIGMOUTH_TICK_MS").unwrap_or(100),
            motors: parse_motor_mode(env_string("BIGMOUTH_MOTORS").as_deref()),
        }
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            voice_id: self.voice_id.clone(),
            system_prompt: self.system_prompt.clone(),
            ..SessionConfig::default()
        }
    }

    pub fn supervisor_config(&self) -> SupervisorConfig {
        SupervisorConfig {
            tick: Duration::from_millis(self.tick_ms.max(10)),
            inactivity_timeout: Duration::from_secs(self.inactivity_secs),
            greeting: self.greeting.clone(),
            goodbye: self.goodbye.clone(),
            capture: CaptureConfig {
                device_index: self.input_device_index,
                ..CaptureConfig::default()
            },
            playback: PlaybackConfig {
                device_index: self.output_device_index,
                ..PlaybackConfig::default()
            },
        }
    }

    pub fn motion_parts(&self) -> MotionParts {
        MotionParts {
            mouth_actuator: self.actuator("mouth"),
            torso_actuator: self.actuator("torso"),
            mouth: MouthConfig::default(),
            mouth_drive: MouthDriveConfig {
                direction: self.mouth_direction,
                ..MouthDriveConfig::default()
            },
            torso: TorsoConfig {
                forward_throttle: self.torso_forward,
                return_throttle: self.torso_back,
                return_duration: Duration::from_secs_f32(self.torso_back_sec.max(0.0)),
                direction: self.torso_direction,
                ..TorsoConfig::default()
            },
        }
    }

    fn actuator(&self, name: &'static str) -> Arc<dyn Actuator> {
        match self.motors {
            MotorMode::Disabled => Arc::new(NullActuator),
            MotorMode::Logging => Arc::new(LoggingActuator::new(name)),
        }
    }
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    let raw = env_string(key)?;
    match raw.parse() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!(key, value = %raw, "unparseable value; using default");
            None
        }
    }
}

/// "-1" (or anything negative) inverts; everything else is normal wiring.
fn parse_direction(raw: Option<&str>) -> f32 {
    match raw.and_then(|v| v.trim().parse::<f32>().ok()) {
        Some(v) if v < 0.0 => -1.0,
        _ => 1.0,
    }
}

fn parse_motor_mode(raw: Option<&str>) -> MotorMode {
    match raw.map(|v| v.trim().to_ascii_lowercase()).as_deref() {
        Some("off") | Some("none") | Some("disabled") => MotorMode::Disabled,
        _ => MotorMode::Logging,
    }
}
