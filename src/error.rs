//! Error types for the conversation session and its collaborators.

use thiserror::Error;

/// Errors raised while acquiring or opening a capture device.
///
/// A device error aborts session start. A missing device is never
/// silently replaced with another one; the caller asked for a specific
/// source and gets told when it is not there.
#[derive(Error, Debug)]
pub enum DeviceError {
    /// The named device was not present in the host's input list.
    #[error("audio input device '{0}' not found")]
    NotFound(String),

    /// No device name was given and the host has no default input.
    #[error("no default audio input device available")]
    NoDefaultDevice,

    /// The device exists but refused to report a usable configuration.
    #[error("device '{name}' has no usable input configuration: {reason}")]
    Unsupported { name: String, reason: String },

    /// Building or starting the capture stream failed (often a
    /// permission problem on macOS).
    #[error("failed to open capture stream on '{name}': {reason}")]
    Stream { name: String, reason: String },
}

/// Errors raised by the streaming transcription connection.
#[derive(Error, Debug, Clone)]
pub enum StreamError {
    /// Could not reach or handshake with the transcription gateway.
    #[error("failed to connect to transcription gateway: {0}")]
    Connect(String),

    /// The gateway rejected our credentials.
    #[error("transcription gateway rejected credentials: {0}")]
    Auth(String),

    /// The gateway told us to slow down.
    #[error("transcription gateway rate limited the stream: {0}")]
    RateLimited(String),

    /// The provider closed or errored the stream while we considered
    /// it healthy.
    #[error("transcription stream lost: {0}")]
    ConnectionLost(String),

    /// The stream dropped twice within the restart window. One
    /// automatic restart is attempted; after that the failure is
    /// surfaced instead of retried.
    #[error("transcription stream failed again within {window_ms}ms, giving up")]
    Terminal { window_ms: u64 },

    /// Operation attempted on a session that has already been stopped.
    #[error("transcription session already terminated")]
    Terminated,
}

impl StreamError {
    /// True when the failure points at bad credentials rather than a
    /// transient network condition.
    pub fn is_credential_error(&self) -> bool {
        matches!(self, StreamError::Auth(_))
    }
}

/// Errors raised while generating a response suggestion.
///
/// Auth and rate-limit failures carry their own variants so the host
/// can surface a "credentials invalid" signal instead of a generic
/// network error.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SuggestionError {
    #[error("suggestion provider rejected credentials (status {status})")]
    Auth { status: u16 },

    #[error("suggestion provider rate limited the request (status {status})")]
    RateLimited { status: u16 },

    #[error("suggestion request failed with status {status}: {message}")]
    Http { status: u16, message: String },

    #[error("suggestion request failed: {0}")]
    Network(String),

    /// The response parsed but contained no usable text.
    #[error("suggestion response contained no content")]
    Empty,

    /// The generation was superseded or the session shut down. Not an
    /// error to the caller; the result is simply dropped.
    #[error("suggestion generation cancelled")]
    Cancelled,
}

impl SuggestionError {
    pub fn is_credential_error(&self) -> bool {
        matches!(
            self,
            SuggestionError::Auth { .. } | SuggestionError::RateLimited { .. }
        )
    }
}

/// Top-level failures crossing the session boundary.
#[derive(Error, Debug)]
pub enum SessionError {
    #[error(transparent)]
    Device(#[from] DeviceError),

    #[error(transparent)]
    Stream(#[from] StreamError),

    #[error("session is already running")]
    AlreadyRunning,
}
