//! Per-role turn management.
//!
//! Bridges VAD events to recorded audio: opens one speech segment per
//! role on speech-start, accumulates the turn, and hands the finished
//! buffer downstream on speech-end. Misfires discard the open segment
//! without delivering anything. The turn-taking interruption rule
//! lives here too: a speech-start on one role is reported so the
//! coordinator can cancel the other role's pending silence wake.

use chrono::{DateTime, Utc};
use log::{debug, warn};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::audio_toolkit::capture::AudioFrame;
use crate::audio_toolkit::resampler::FrameResampler;
use crate::audio_toolkit::utils::save_wav_file;
use crate::audio_toolkit::vad::{default_engine, TurnDetector, VadConfig, VadEngine, VadEvent};
use crate::events::Role;
use crate::settings::TRANSCRIPTION_SAMPLE_RATE;

/// Builds the VAD engine for each role pipeline. Injectable so tests
/// (and hosts with their own detector) can swap the engine out.
pub type EngineFactory = Arc<dyn Fn(&VadConfig) -> Box<dyn VadEngine> + Send + Sync>;

/// One speech turn in progress or just closed. At most one open
/// segment exists per role.
#[derive(Debug, Clone)]
pub struct SpeechSegment {
    pub role: Role,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub audio: Vec<f32>,
}

/// What a processed frame produced, for the session driver to route.
#[derive(Debug, Clone)]
pub enum TurnEvent {
    /// A turn opened; the other role's pending suggestion wake must be
    /// cancelled.
    SpeechStart { role: Role },
    /// A turn closed; the audio is ready for transcription.
    TurnCompleted { role: Role, segment: SpeechSegment },
    /// A too-short speech region was suppressed.
    Misfire { role: Role },
}

struct RolePipeline {
    input_rate: u32,
    resampler: FrameResampler,
    detector: TurnDetector,
    segment: Option<SpeechSegment>,
}

impl RolePipeline {
    fn new(input_rate: u32, vad: VadConfig, engines: &EngineFactory) -> Self {
        let engine = engines(&vad);
        Self {
            input_rate,
            resampler: FrameResampler::new(
                input_rate as usize,
                TRANSCRIPTION_SAMPLE_RATE as usize,
                std::time::Duration::from_millis(vad.frame_ms),
            ),
            detector: TurnDetector::new(engine, vad),
            segment: None,
        }
    }
}

/// Owns both role pipelines. Fed from the capture channel by a single
/// driver task; per-role frame order is preserved by the channel,
/// cross-role ordering is not guaranteed and not needed.
pub struct TurnManager {
    vad: VadConfig,
    active: Arc<AtomicBool>,
    debug_dump_dir: Option<PathBuf>,
    engines: EngineFactory,
    pipelines: HashMap<Role, RolePipeline>,
}

impl TurnManager {
    pub fn new(vad: VadConfig, active: Arc<AtomicBool>, debug_dump_dir: Option<PathBuf>) -> Self {
        Self::with_engine_factory(vad, active, debug_dump_dir, Arc::new(default_engine))
    }

    pub fn with_engine_factory(
        vad: VadConfig,
        active: Arc<AtomicBool>,
        debug_dump_dir: Option<PathBuf>,
        engines: EngineFactory,
    ) -> Self {
        Self {
            vad,
            active,
            debug_dump_dir,
            engines,
            pipelines: HashMap::new(),
        }
    }

    /// Process one captured frame. Frames arriving while the session
    /// is not active are dropped, not buffered.
    pub fn handle_frame(&mut self, frame: &AudioFrame) -> Vec<TurnEvent> {
        if !self.active.load(Ordering::Relaxed) {
            return Vec::new();
        }

        let Self {
            vad,
            debug_dump_dir,
            engines,
            pipelines,
            ..
        } = self;

        let pipeline = pipelines
            .entry(frame.role)
            .or_insert_with(|| RolePipeline::new(frame.sample_rate, vad.clone(), engines));

        // Devices can renegotiate their rate (e.g. a default-device
        // switch); rebuild the pipeline rather than feed it garbage.
        if pipeline.input_rate != frame.sample_rate {
            warn!(
                "{} input rate changed {} -> {}, resetting pipeline",
                frame.role.label(),
                pipeline.input_rate,
                frame.sample_rate
            );
            *pipeline = RolePipeline::new(frame.sample_rate, vad.clone(), engines);
        }

        let RolePipeline {
            resampler,
            detector,
            segment,
            ..
        } = &mut *pipeline;

        let mut vad_events = Vec::new();
        resampler.push(&frame.samples, |converted| {
            if let Some(event) = detector.consume(converted) {
                vad_events.push(event);
            }
        });

        let mut events = Vec::new();
        for vad_event in vad_events {
            match vad_event {
                VadEvent::SpeechStart => {
                    if segment.is_some() {
                        // The detector guarantees start/end pairing;
                        // an open slot here would be a bug upstream.
                        warn!("{} segment already open, replacing", frame.role.label());
                    }
                    *segment = Some(SpeechSegment {
                        role: frame.role,
                        started_at: Utc::now(),
                        ended_at: None,
                        audio: Vec::new(),
                    });
                    debug!("speech started for {}", frame.role.label());
                    events.push(TurnEvent::SpeechStart { role: frame.role });
                }
                VadEvent::SpeechEnd(audio) => {
                    let mut closed = match segment.take() {
                        Some(s) => s,
                        None => {
                            warn!("{} speech end without open segment", frame.role.label());
                            continue;
                        }
                    };
                    closed.ended_at = Some(Utc::now());
                    closed.audio = audio;
                    debug!(
                        "turn completed for {} ({} samples)",
                        frame.role.label(),
                        closed.audio.len()
                    );
                    dump_segment(debug_dump_dir.as_ref(), &closed);
                    events.push(TurnEvent::TurnCompleted {
                        role: frame.role,
                        segment: closed,
                    });
                }
                VadEvent::Misfire => {
                    // Too short to be speech: drop the open segment,
                    // deliver nothing downstream.
                    *segment = None;
                    debug!("misfire for {}", frame.role.label());
                    events.push(TurnEvent::Misfire { role: frame.role });
                }
            }
        }
        events
    }

    /// True while a segment is open for the role.
    pub fn segment_open(&self, role: Role) -> bool {
        self.pipelines
            .get(&role)
            .map(|p| p.segment.is_some())
            .unwrap_or(false)
    }

    /// Drop all per-role state, discarding any open segment.
    pub fn reset(&mut self) {
        self.pipelines.clear();
    }
}

fn dump_segment(dir: Option<&PathBuf>, segment: &SpeechSegment) {
    let Some(dir) = dir else {
        return;
    };
    let path = dir.join(format!(
        "{}-{}.wav",
        segment.role.label(),
        segment.started_at.format("%Y%m%d-%H%M%S%.3f")
    ));
    if let Err(e) = save_wav_file(&path, &segment.audio) {
        warn!("failed to dump segment wav: {}", e);
    }
}
