//! Streaming transcription: the provider transport boundary and the
//! self-healing bridge that owns the session state machine.

pub mod bridge;
pub mod transport;

pub use bridge::{BridgeEvent, StartOutcome, StreamState, TranscriptionBridge};
pub use transport::{
    StreamConfig, TranscriptionSink, TranscriptionSource, TranscriptionTransport,
    WebSocketTransport,
};
