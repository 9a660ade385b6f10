//! # bigmouth-motion: audio-driven actuation
//!
//! Turns synthesized speech into physically safe motor commands:
//!
//! ```text
//! PCM chunk ──► MouthController ──► opening % ──► MouthDrive ──► mouth motor
//!                                                    │
//!                                              DutyWindow (on-time cap)
//!
//! playback signals ──► TorsoDriver (Rest → Active → Returning) ──► torso motor
//! ```
//!
//! Hardware sits behind the [`Actuator`] trait; which implementation is
//! used is an injected decision, made once at construction time.

pub mod drive;
pub mod error;
pub mod mouth;
pub mod torso;

pub use drive::{Actuator, DutyWindow, LoggingActuator, MouthDrive, MouthDriveConfig, NullActuator};
pub use error::{MotionError, MotionResult};
pub use mouth::{MouthConfig, MouthController};
pub use torso::{TorsoConfig, TorsoDriver, TorsoState};
