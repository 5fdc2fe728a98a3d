//! Voice activity detection and per-role turn segmentation.
//!
//! A `VadEngine` turns one audio frame into a speech probability; the
//! `TurnDetector` layers hysteresis on top of that and cuts the frame
//! stream into speech turns. Each role gets its own detector instance;
//! nothing here is shared across roles.

use log::debug;
use std::collections::VecDeque;

/// Frame duration the detector operates on.
pub const VAD_FRAME_MS: u64 = 30;

/// Configuration for turn detection.
#[derive(Debug, Clone)]
pub struct VadConfig {
    pub sample_rate: u32,
    pub frame_ms: u64,
    /// Speech probability at or above this counts the frame as speech.
    pub speech_threshold: f32,
    /// A speech region shorter than this is a misfire and is dropped.
    pub min_speech_ms: u64,
    /// Silence run that ends a turn.
    pub min_silence_ms: u64,
    /// Consecutive speech frames required before a turn opens.
    pub onset_frames: u32,
    /// Majority-vote window for smoothing raw frame decisions.
    pub smoothing_frames: usize,
    /// Frames of audio kept from just before the detected onset, so a
    /// soft first syllable is not clipped off.
    pub pre_roll_frames: usize,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16_000,
            frame_ms: VAD_FRAME_MS,
            speech_threshold: 0.6,
            min_speech_ms: 300,
            min_silence_ms: 800,
            onset_frames: 2,
            smoothing_frames: 3,
            pre_roll_frames: 5,
        }
    }
}

impl VadConfig {
    /// Samples per frame at the configured rate.
    pub fn frame_samples(&self) -> usize {
        ((self.sample_rate as u64 * self.frame_ms) / 1000) as usize
    }
}

/// Turns one frame of mono samples into a speech probability in 0..=1.
pub trait VadEngine: Send {
    fn speech_probability(&mut self, frame: &[f32]) -> f32;
    fn reset(&mut self);
    fn name(&self) -> &'static str {
        "unknown_vad"
    }
}

/// RMS-energy engine, always available. Maps the frame's dBFS level
/// onto 0..=1 between a noise floor and a speech ceiling.
#[derive(Debug, Clone)]
pub struct EnergyVad {
    floor_db: f32,
    ceiling_db: f32,
}

impl EnergyVad {
    pub fn new(floor_db: f32, ceiling_db: f32) -> Self {
        Self {
            floor_db,
            ceiling_db: ceiling_db.max(floor_db + 1.0),
        }
    }
}

impl Default for EnergyVad {
    fn default() -> Self {
        // -55 dBFS is quiet-room noise, -25 dBFS is close speech.
        Self::new(-55.0, -25.0)
    }
}

impl VadEngine for EnergyVad {
    fn speech_probability(&mut self, frame: &[f32]) -> f32 {
        if frame.is_empty() {
            return 0.0;
        }
        let energy: f32 = frame.iter().map(|s| s * s).sum::<f32>() / frame.len() as f32;
        let rms = energy.sqrt().max(1e-6);
        let db = 20.0 * rms.log10();
        ((db - self.floor_db) / (self.ceiling_db - self.floor_db)).clamp(0.0, 1.0)
    }

    fn reset(&mut self) {}

    fn name(&self) -> &'static str {
        "energy_vad"
    }
}

/// WebRTC-style engine backed by `earshot`. Binary decision, reported
/// as probability 0.0 or 1.0.
#[cfg(feature = "vad_earshot")]
pub struct EarshotVad {
    detector: earshot::VoiceActivityDetector,
    frame_samples: usize,
    scratch: Vec<i16>,
}

#[cfg(feature = "vad_earshot")]
impl EarshotVad {
    pub fn new(cfg: &VadConfig) -> Self {
        Self {
            detector: earshot::VoiceActivityDetector::new(
                earshot::VoiceActivityProfile::AGGRESSIVE,
            ),
            frame_samples: cfg.frame_samples().max(160),
            scratch: Vec::new(),
        }
    }
}

#[cfg(feature = "vad_earshot")]
impl VadEngine for EarshotVad {
    fn speech_probability(&mut self, frame: &[f32]) -> f32 {
        if frame.is_empty() {
            return 0.0;
        }
        self.scratch.clear();
        self.scratch.reserve(self.frame_samples);
        for sample in frame.iter().copied() {
            self.scratch.push((sample.clamp(-1.0, 1.0) * 32_767.0) as i16);
        }
        self.scratch.resize(self.frame_samples, 0);
        match self.detector.predict_16khz(&self.scratch) {
            Ok(true) => 1.0,
            Ok(false) => 0.0,
            Err(_) => 0.0,
        }
    }

    fn reset(&mut self) {
        self.detector.reset();
    }

    fn name(&self) -> &'static str {
        "earshot_vad"
    }
}

/// Build the default engine for a config: earshot when compiled in,
/// energy otherwise.
pub fn default_engine(cfg: &VadConfig) -> Box<dyn VadEngine> {
    #[cfg(feature = "vad_earshot")]
    {
        Box::new(EarshotVad::new(cfg))
    }
    #[cfg(not(feature = "vad_earshot"))]
    {
        let _ = cfg;
        Box::<EnergyVad>::default()
    }
}

/// What one consumed frame produced. At most one event per frame.
#[derive(Debug, Clone, PartialEq)]
pub enum VadEvent {
    /// A turn opened on this frame.
    SpeechStart,
    /// A turn closed; carries the accumulated turn audio.
    SpeechEnd(Vec<f32>),
    /// A speech region ended but was shorter than `min_speech_ms`.
    /// Nothing is delivered downstream.
    Misfire,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FrameLabel {
    Speech,
    Silence,
}

/// Majority vote over the last `window_size` frame labels. Keeps brief
/// noise spikes and glottal gaps from flapping the turn state.
struct VadSmoother {
    window: VecDeque<FrameLabel>,
    window_size: usize,
}

impl VadSmoother {
    fn new(window_size: usize) -> Self {
        Self {
            window: VecDeque::new(),
            window_size: window_size.max(1),
        }
    }

    fn smooth(&mut self, label: FrameLabel) -> FrameLabel {
        if self.window_size <= 1 {
            return label;
        }
        self.window.push_back(label);
        if self.window.len() > self.window_size {
            self.window.pop_front();
        }
        let speech = self
            .window
            .iter()
            .filter(|l| **l == FrameLabel::Speech)
            .count();
        let silence = self.window.len() - speech;
        match speech.cmp(&silence) {
            std::cmp::Ordering::Greater => FrameLabel::Speech,
            std::cmp::Ordering::Less => FrameLabel::Silence,
            std::cmp::Ordering::Equal => label,
        }
    }

    fn reset(&mut self) {
        self.window.clear();
    }
}

/// Segments a continuous frame stream into speech turns.
///
/// Invariants:
/// - a `SpeechStart` always strictly precedes its matching `SpeechEnd`
///   or `Misfire`;
/// - two `SpeechStart`s never occur without an intervening end event.
pub struct TurnDetector {
    engine: Box<dyn VadEngine>,
    cfg: VadConfig,
    smoother: VadSmoother,
    in_speech: bool,
    onset_run: u32,
    speech_frames: u64,
    silence_frames: u64,
    pre_roll: VecDeque<Vec<f32>>,
    accumulated: Vec<f32>,
}

impl TurnDetector {
    pub fn new(engine: Box<dyn VadEngine>, cfg: VadConfig) -> Self {
        debug!(
            "turn detector using {} (threshold {:.2}, min speech {}ms, min silence {}ms)",
            engine.name(),
            cfg.speech_threshold,
            cfg.min_speech_ms,
            cfg.min_silence_ms
        );
        Self {
            smoother: VadSmoother::new(cfg.smoothing_frames),
            engine,
            cfg,
            in_speech: false,
            onset_run: 0,
            speech_frames: 0,
            silence_frames: 0,
            pre_roll: VecDeque::new(),
            accumulated: Vec::new(),
        }
    }

    pub fn with_default_engine(cfg: VadConfig) -> Self {
        let engine = default_engine(&cfg);
        Self::new(engine, cfg)
    }

    pub fn in_speech(&self) -> bool {
        self.in_speech
    }

    /// Consume one frame of mono samples at the configured rate.
    /// Returns at most one event; most frames return `None`.
    pub fn consume(&mut self, frame: &[f32]) -> Option<VadEvent> {
        let prob = self.engine.speech_probability(frame);
        let raw = if prob >= self.cfg.speech_threshold {
            FrameLabel::Speech
        } else {
            FrameLabel::Silence
        };
        let label = self.smoother.smooth(raw);

        if self.in_speech {
            self.consume_in_speech(frame, label)
        } else {
            self.consume_idle(frame, label)
        }
    }

    fn consume_idle(&mut self, frame: &[f32], label: FrameLabel) -> Option<VadEvent> {
        self.pre_roll.push_back(frame.to_vec());
        while self.pre_roll.len() > self.cfg.pre_roll_frames.max(1) {
            self.pre_roll.pop_front();
        }

        match label {
            FrameLabel::Speech => {
                self.onset_run += 1;
                if self.onset_run >= self.cfg.onset_frames.max(1) {
                    self.in_speech = true;
                    self.onset_run = 0;
                    self.speech_frames = 0;
                    self.silence_frames = 0;
                    self.accumulated.clear();
                    // The pre-roll already holds this frame and the
                    // onset run leading up to it.
                    for buffered in self.pre_roll.drain(..) {
                        self.accumulated.extend_from_slice(&buffered);
                    }
                    return Some(VadEvent::SpeechStart);
                }
                None
            }
            FrameLabel::Silence => {
                self.onset_run = 0;
                None
            }
        }
    }

    fn consume_in_speech(&mut self, frame: &[f32], label: FrameLabel) -> Option<VadEvent> {
        self.accumulated.extend_from_slice(frame);
        match label {
            FrameLabel::Speech => {
                self.speech_frames += 1;
                self.silence_frames = 0;
                None
            }
            FrameLabel::Silence => {
                self.silence_frames += 1;
                if self.silence_frames * self.cfg.frame_ms < self.cfg.min_silence_ms {
                    return None;
                }

                let speech_ms = self.speech_frames * self.cfg.frame_ms;
                let audio = std::mem::take(&mut self.accumulated);
                let trailing_silence = self.silence_frames;
                self.in_speech = false;
                self.speech_frames = 0;
                self.silence_frames = 0;
                self.smoother.reset();
                self.engine.reset();

                if speech_ms < self.cfg.min_speech_ms {
                    debug!("speech region of {}ms below minimum, misfire", speech_ms);
                    return Some(VadEvent::Misfire);
                }

                Some(VadEvent::SpeechEnd(self.trim_tail(audio, trailing_silence)))
            }
        }
    }

    /// Drop most of the trailing silence, keeping one frame of tail so
    /// the last word is not cut mid-release.
    fn trim_tail(&self, mut audio: Vec<f32>, trailing_silence_frames: u64) -> Vec<f32> {
        let frame_samples = self.cfg.frame_samples();
        let keep_tail = 1u64;
        let drop_frames = trailing_silence_frames.saturating_sub(keep_tail) as usize;
        let drop_samples = drop_frames * frame_samples;
        if drop_samples > 0 && drop_samples < audio.len() {
            audio.truncate(audio.len() - drop_samples);
        }
        audio
    }

    pub fn reset(&mut self) {
        self.in_speech = false;
        self.onset_run = 0;
        self.speech_frames = 0;
        self.silence_frames = 0;
        self.pre_roll.clear();
        self.accumulated.clear();
        self.smoother.reset();
        self.engine.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Engine scripted by the test: probability 1.0 for "speech"
    /// frames, 0.0 otherwise, keyed off the first sample.
    struct ScriptedEngine;

    impl VadEngine for ScriptedEngine {
        fn speech_probability(&mut self, frame: &[f32]) -> f32 {
            if frame.first().copied().unwrap_or(0.0) > 0.5 {
                1.0
            } else {
                0.0
            }
        }
        fn reset(&mut self) {}
    }

    fn test_config() -> VadConfig {
        VadConfig {
            sample_rate: 16_000,
            frame_ms: 30,
            speech_threshold: 0.6,
            min_speech_ms: 90,  // 3 frames
            min_silence_ms: 90, // 3 frames
            onset_frames: 1,
            smoothing_frames: 1,
            pre_roll_frames: 2,
        }
    }

    fn detector() -> TurnDetector {
        TurnDetector::new(Box::new(ScriptedEngine), test_config())
    }

    fn speech_frame() -> Vec<f32> {
        vec![0.9; 480]
    }

    fn silence_frame() -> Vec<f32> {
        vec![0.0; 480]
    }

    fn run(det: &mut TurnDetector, speech: usize, silence: usize) -> Vec<VadEvent> {
        let mut events = Vec::new();
        for _ in 0..speech {
            events.extend(det.consume(&speech_frame()));
        }
        for _ in 0..silence {
            events.extend(det.consume(&silence_frame()));
        }
        events
    }

    #[test]
    fn start_precedes_end_and_never_doubles() {
        let mut det = detector();
        let events = run(&mut det, 5, 4);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0], VadEvent::SpeechStart);
        assert!(matches!(events[1], VadEvent::SpeechEnd(_)));

        // A second turn starts cleanly after the first closed.
        let events = run(&mut det, 5, 4);
        assert_eq!(events[0], VadEvent::SpeechStart);
        assert!(matches!(events[1], VadEvent::SpeechEnd(_)));
    }

    #[test]
    fn no_events_on_pure_silence() {
        let mut det = detector();
        assert!(run(&mut det, 0, 50).is_empty());
    }

    #[test]
    fn short_region_is_a_misfire_with_no_audio() {
        let mut det = detector();
        // 2 speech frames = 60ms < 90ms minimum.
        let events = run(&mut det, 2, 4);
        assert_eq!(events[0], VadEvent::SpeechStart);
        assert_eq!(events[1], VadEvent::Misfire);
    }

    #[test]
    fn sub_threshold_pause_keeps_the_turn_open() {
        let mut det = detector();
        let mut events = run(&mut det, 5, 2); // pause below 3-frame silence
        events.extend(run(&mut det, 5, 4)); // resume, then real silence
        let starts = events
            .iter()
            .filter(|e| **e == VadEvent::SpeechStart)
            .count();
        let ends = events
            .iter()
            .filter(|e| matches!(e, VadEvent::SpeechEnd(_)))
            .count();
        assert_eq!(starts, 1, "consolidated turn must not restart");
        assert_eq!(ends, 1);
    }

    #[test]
    fn end_audio_contains_pre_roll_and_speech() {
        let mut det = detector();
        let mut events = Vec::new();
        // Two silence frames land in the pre-roll buffer.
        events.extend(det.consume(&silence_frame()));
        events.extend(det.consume(&silence_frame()));
        events.extend(run(&mut det, 5, 4));
        let audio = events
            .iter()
            .find_map(|e| match e {
                VadEvent::SpeechEnd(a) => Some(a.clone()),
                _ => None,
            })
            .expect("turn should close");
        // Pre-roll (2 frames incl. onset) + 4 more speech frames +
        // kept silence tail; exact count depends on the trimmed tail,
        // but it must at least cover the speech region.
        assert!(audio.len() >= 5 * 480);
    }

    #[test]
    fn energy_vad_maps_level_to_probability() {
        let mut vad = EnergyVad::default();
        let loud: Vec<f32> = vec![0.5; 480];
        let quiet: Vec<f32> = vec![0.0005; 480];
        assert!(vad.speech_probability(&loud) > 0.9);
        assert!(vad.speech_probability(&quiet) < 0.1);
    }

    #[test]
    fn detectors_are_isolated_per_instance() {
        let mut a = detector();
        let mut b = detector();
        run(&mut a, 5, 0);
        assert!(a.in_speech());
        assert!(!b.in_speech(), "no shared state between role detectors");
    }
}
