//! # bigmouth-sonic: bidirectional speech-session protocol engine
//!
//! Sequences one streaming voice conversation over a raw duplex byte
//! stream: session/prompt/content lifecycle on the way out, demultiplexed
//! text and audio on the way back.
//!
//! ```text
//! mic frames ──► SonicSession ──► transport ──► voice model
//!                     │                             │
//!                     ◄── events (JSON lines) ◄─────┘
//!                     │
//!          ┌──────────┴───────────┐
//!          ▼                      ▼
//!   SessionEvent (text)    PlaybackQueue (PCM)
//! ```

pub mod error;
pub mod events;
pub mod queue;
pub mod session;
pub mod transport;

pub use error::{SonicError, SonicResult};
pub use events::{OutboundEvent, Role};
pub use queue::{playback_queue, AudioChunk, PlaybackConsumer, PlaybackProducer, QueueDepth};
pub use session::{
    SessionConfig, SessionEvent, SessionState, SonicSession, INPUT_SAMPLE_RATE, OUTPUT_SAMPLE_RATE,
};
pub use transport::{Connector, EventSink, EventSource, TcpConnector};
