//! Typed events crossing the session's boundaries.
//!
//! Transcripts, suggestions and status changes are messages on
//! channels rather than callback fan-out: the host subscribes to a
//! broadcast receiver and the internal pipelines talk over mpsc.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Which conversation participant an audio frame or transcript belongs
/// to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// The local microphone: the person running the app.
    Candidate,
    /// The loopback / system-audio source: whoever is on the other end
    /// of the call.
    OtherParty,
}

impl Role {
    /// The opposite participant.
    pub fn other(self) -> Role {
        match self {
            Role::Candidate => Role::OtherParty,
            Role::OtherParty => Role::Candidate,
        }
    }

    /// Wire channel index used by the gateway protocol.
    pub fn channel_index(self) -> u8 {
        match self {
            Role::Candidate => 0,
            Role::OtherParty => 1,
        }
    }

    pub fn from_channel_index(index: u8) -> Option<Role> {
        match index {
            0 => Some(Role::Candidate),
            1 => Some(Role::OtherParty),
            _ => None,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Role::Candidate => "candidate",
            Role::OtherParty => "other_party",
        }
    }
}

/// Word-level timing attached to a final transcript when the provider
/// reports it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WordTiming {
    pub word: String,
    pub start_ms: u32,
    pub end_ms: u32,
}

/// One transcription result from the streaming connection.
#[derive(Debug, Clone, Serialize)]
pub struct TranscriptEvent {
    pub role: Role,
    pub text: String,
    pub is_final: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub words: Option<Vec<WordTiming>>,
    pub timestamp: DateTime<Utc>,
}

/// Lifecycle state reported to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Running,
    Paused,
    Stopped,
}

/// Events emitted to the host over the session's broadcast channel.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "data")]
pub enum SessionEvent {
    /// Transcription progress for one role.
    TranscriptUpdate {
        role: Role,
        text: String,
        is_final: bool,
    },
    /// A full response suggestion finished generating.
    SuggestionReady { role: Role, text: String },
    /// A failure the host should show. `credentials_invalid` is set
    /// for auth/rate-limit failures so the host can point at the API
    /// key instead of the network.
    Error {
        message: String,
        credentials_invalid: bool,
    },
    /// Session lifecycle transition.
    Status { state: SessionState },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_other_flips() {
        assert_eq!(Role::Candidate.other(), Role::OtherParty);
        assert_eq!(Role::OtherParty.other(), Role::Candidate);
    }

    #[test]
    fn role_channel_round_trip() {
        for role in [Role::Candidate, Role::OtherParty] {
            assert_eq!(Role::from_channel_index(role.channel_index()), Some(role));
        }
        assert_eq!(Role::from_channel_index(7), None);
    }
}
