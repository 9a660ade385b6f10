//! Application-level error types.

use thiserror::Error;

pub type AppResult<T> = Result<T, AppError>;

#[derive(Error, Debug)]
pub enum AppError {
    /// Opening or configuring an audio device failed.
    #[error("audio device error: {0}")]
    AudioDevice(String),

    /// The device stream went away underneath us.
    #[error("audio stream closed")]
    StreamClosed,
}
