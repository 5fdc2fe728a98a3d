//! Prompter core: real-time turn detection and streaming-transcription
//! coordination for a two-party conversation assistant.
//!
//! The crate listens to two live audio sources, the local microphone
//! ("candidate") and a loopback/system-audio device ("other party"),
//! segments each into speech turns, streams finished turns to a cloud
//! transcription gateway, and generates response suggestions keyed to
//! completed other-party turns.
//!
//! Construct one [`ConversationSession`] per conversation, subscribe to
//! its event channel, and drive it with start/stop/pause/resume.

pub mod audio_toolkit;
pub mod error;
pub mod events;
pub mod llm_client;
pub mod managers;
pub mod session;
pub mod settings;
pub mod streaming;
pub mod suggestions;

pub use audio_toolkit::device::{list_input_devices, CpalDeviceInfo};
pub use error::{DeviceError, SessionError, StreamError, SuggestionError};
pub use events::{Role, SessionEvent, SessionState, TranscriptEvent, WordTiming};
pub use llm_client::{ChatCompletionProvider, PromptContext, SuggestionProvider};
pub use session::ConversationSession;
pub use settings::{SessionConfig, SuggestionProviderConfig};
pub use streaming::{StreamState, TranscriptionBridge, TranscriptionTransport, WebSocketTransport};
pub use suggestions::{PartialSuggestion, SuggestionCoordinator};
