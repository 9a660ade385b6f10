//! Error types for the actuation layer.

use thiserror::Error;

/// Result type alias for actuation operations.
pub type MotionResult<T> = Result<T, MotionError>;

/// Errors raised at the hardware boundary. These never escape the component
/// that touches the hardware: callers log them and keep running in a
/// degraded (silent) mode.
#[derive(Error, Debug)]
pub enum MotionError {
    #[error("hardware write failed: {0}")]
    Hardware(String),
}
