//! Session configuration.
//!
//! One explicit struct with named, typed fields and documented
//! defaults. Storage is the host's problem; this crate only consumes
//! the values.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::audio_toolkit::vad::VadConfig;
use crate::events::Role;

/// Sample rate the transcription gateway expects (mono, linear PCM).
pub const TRANSCRIPTION_SAMPLE_RATE: u32 = 16_000;

/// Configuration for the suggestion provider (an OpenAI-compatible
/// chat-completions endpoint).
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct SuggestionProviderConfig {
    #[serde(default = "default_llm_base_url")]
    pub base_url: String,
    #[serde(default = "default_llm_model")]
    pub model: String,
    #[serde(default)]
    pub api_key: String,
}

impl Default for SuggestionProviderConfig {
    fn default() -> Self {
        Self {
            base_url: default_llm_base_url(),
            model: default_llm_model(),
            api_key: String::new(),
        }
    }
}

/// Everything a conversation session needs to run.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct SessionConfig {
    /// Microphone device name; `None` picks the host default.
    #[serde(default)]
    pub candidate_device: Option<String>,
    /// Loopback / system-audio device name (e.g. BlackHole, Stereo
    /// Mix); `None` picks the host default input.
    #[serde(default)]
    pub other_party_device: Option<String>,

    /// Language code forwarded to the transcription gateway.
    #[serde(default = "default_language")]
    pub language: String,
    /// Ask the gateway for interim (non-final) transcripts.
    #[serde(default = "default_interim_results")]
    pub interim_results: bool,
    /// WebSocket endpoint of the transcription gateway.
    #[serde(default = "default_gateway_url")]
    pub gateway_url: String,
    #[serde(default)]
    pub gateway_api_key: String,
    /// A stream drop within this many milliseconds of the previous one
    /// is terminal instead of triggering another restart.
    #[serde(default = "default_restart_window_ms")]
    pub restart_window_ms: u64,

    /// Silence to wait after an interim transcript before generating a
    /// suggestion anyway.
    #[serde(default = "default_suggestion_debounce_ms")]
    pub suggestion_debounce_ms: u64,
    /// Upper bound on waiting for a prefetched partial suggestion.
    #[serde(default = "default_partial_timeout_ms")]
    pub partial_timeout_ms: u64,
    /// Partial text shorter than this is not worth a prefetch.
    #[serde(default = "default_min_partial_chars")]
    pub min_partial_chars: usize,

    /// Speech probability above this counts a frame as speech.
    #[serde(default = "default_speech_threshold")]
    pub vad_speech_threshold: f32,
    /// Speech regions shorter than this are misfires.
    #[serde(default = "default_min_speech_ms")]
    pub vad_min_speech_ms: u64,
    /// Silence run that closes a turn.
    #[serde(default = "default_min_silence_ms")]
    pub vad_min_silence_ms: u64,

    /// When set, every closed speech segment is dumped as a WAV file
    /// into this directory.
    #[serde(default)]
    pub debug_dump_dir: Option<PathBuf>,

    #[serde(default)]
    pub llm: SuggestionProviderConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            candidate_device: None,
            other_party_device: None,
            language: default_language(),
            interim_results: default_interim_results(),
            gateway_url: default_gateway_url(),
            gateway_api_key: String::new(),
            restart_window_ms: default_restart_window_ms(),
            suggestion_debounce_ms: default_suggestion_debounce_ms(),
            partial_timeout_ms: default_partial_timeout_ms(),
            min_partial_chars: default_min_partial_chars(),
            vad_speech_threshold: default_speech_threshold(),
            vad_min_speech_ms: default_min_speech_ms(),
            vad_min_silence_ms: default_min_silence_ms(),
            debug_dump_dir: None,
            llm: SuggestionProviderConfig::default(),
        }
    }
}

impl SessionConfig {
    pub fn vad_config(&self) -> VadConfig {
        VadConfig {
            speech_threshold: self.vad_speech_threshold,
            min_speech_ms: self.vad_min_speech_ms,
            min_silence_ms: self.vad_min_silence_ms,
            ..VadConfig::default()
        }
    }

    pub fn suggestion_debounce(&self) -> Duration {
        Duration::from_millis(self.suggestion_debounce_ms)
    }

    pub fn partial_timeout(&self) -> Duration {
        Duration::from_millis(self.partial_timeout_ms)
    }

    pub fn restart_window(&self) -> Duration {
        Duration::from_millis(self.restart_window_ms)
    }

    pub fn device_for(&self, role: Role) -> Option<&str> {
        match role {
            Role::Candidate => self.candidate_device.as_deref(),
            Role::OtherParty => self.other_party_device.as_deref(),
        }
    }
}

fn default_language() -> String {
    "en".to_string()
}

fn default_interim_results() -> bool {
    true
}

fn default_gateway_url() -> String {
    "wss://gateway.prompter.dev/v1/stream".to_string()
}

fn default_restart_window_ms() -> u64 {
    15_000
}

fn default_suggestion_debounce_ms() -> u64 {
    2_000
}

fn default_partial_timeout_ms() -> u64 {
    5_000
}

fn default_min_partial_chars() -> usize {
    24
}

fn default_speech_threshold() -> f32 {
    0.6
}

fn default_min_speech_ms() -> u64 {
    300
}

fn default_min_silence_ms() -> u64 {
    800
}

fn default_llm_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_llm_model() -> String {
    "gpt-4o-mini".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fill_missing_fields() {
        let cfg: SessionConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.language, "en");
        assert!(cfg.interim_results);
        assert_eq!(cfg.suggestion_debounce_ms, 2_000);
        assert_eq!(cfg.partial_timeout_ms, 5_000);
        assert!(cfg.candidate_device.is_none());
    }

    #[test]
    fn vad_config_takes_session_thresholds() {
        let cfg = SessionConfig {
            vad_min_silence_ms: 2_000,
            ..SessionConfig::default()
        };
        let vad = cfg.vad_config();
        assert_eq!(vad.min_silence_ms, 2_000);
        assert_eq!(vad.sample_rate, TRANSCRIPTION_SAMPLE_RATE);
    }
}
