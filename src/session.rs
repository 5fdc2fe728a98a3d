//! The per-conversation session object.
//!
//! One `ConversationSession` is constructed per active conversation
//! and owns its own capture pipelines, transcription bridge and
//! suggestion coordinator. Collaborators are injected; nothing is a
//! process-wide singleton. The host drives it with start/stop/pause/
//! resume and listens on the broadcast event channel.

use anyhow::anyhow;
use log::{debug, info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use crate::audio_toolkit::capture::{start_capture, CaptureHandle};
use crate::error::SessionError;
use crate::events::{Role, SessionEvent, SessionState};
use crate::llm_client::{ChatCompletionProvider, SuggestionProvider};
use crate::managers::turns::{TurnEvent, TurnManager};
use crate::settings::{SessionConfig, TRANSCRIPTION_SAMPLE_RATE};
use crate::streaming::bridge::{BridgeEvent, TranscriptionBridge};
use crate::streaming::transport::{StreamConfig, TranscriptionTransport, WebSocketTransport};
use crate::suggestions::{CoordinatorConfig, PartialSuggestion, SuggestionCoordinator};

pub struct ConversationSession {
    config: SessionConfig,
    events: broadcast::Sender<SessionEvent>,
    bridge: Arc<TranscriptionBridge>,
    coordinator: SuggestionCoordinator,
    active: Arc<AtomicBool>,
    state: Mutex<SessionState>,
    captures: Mutex<Vec<CaptureHandle>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ConversationSession {
    /// Build a session against the real collaborators named in the
    /// config.
    pub fn new(config: SessionConfig) -> anyhow::Result<Self> {
        let transport: Arc<dyn TranscriptionTransport> = Arc::new(WebSocketTransport::new(
            config.gateway_url.clone(),
            config.gateway_api_key.clone(),
        ));
        let provider: Arc<dyn SuggestionProvider> =
            Arc::new(ChatCompletionProvider::new(config.llm.clone()).map_err(|e| anyhow!(e))?);
        Ok(Self::with_collaborators(config, transport, provider))
    }

    /// Build a session with injected collaborators.
    pub fn with_collaborators(
        config: SessionConfig,
        transport: Arc<dyn TranscriptionTransport>,
        provider: Arc<dyn SuggestionProvider>,
    ) -> Self {
        let (events, _) = broadcast::channel(256);
        let bridge = Arc::new(TranscriptionBridge::new(transport, config.restart_window()));
        let coordinator = SuggestionCoordinator::new(
            provider,
            events.clone(),
            CoordinatorConfig::from_session(&config),
        );
        Self {
            config,
            events,
            bridge,
            coordinator,
            active: Arc::new(AtomicBool::new(false)),
            state: Mutex::new(SessionState::Idle),
            captures: Mutex::new(Vec::new()),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock().unwrap()
    }

    /// Acquire both capture devices, open the streaming connection and
    /// start the pipelines. Device failures abort the start and are
    /// reported immediately.
    pub async fn start(&self) -> Result<(), SessionError> {
        {
            let state = self.state.lock().unwrap();
            match *state {
                SessionState::Idle => {}
                SessionState::Running | SessionState::Paused => {
                    return Err(SessionError::AlreadyRunning)
                }
                SessionState::Stopped => {
                    // One session per conversation; build a new one.
                    return Err(SessionError::Stream(crate::error::StreamError::Terminated));
                }
            }
        }

        let (frame_tx, frame_rx) = mpsc::channel(256);

        // Devices first: a missing device fails fast, before any
        // network traffic.
        let candidate = start_capture(
            Role::Candidate,
            self.config.candidate_device.clone(),
            self.active.clone(),
            frame_tx.clone(),
        )?;
        let other_party = start_capture(
            Role::OtherParty,
            self.config.other_party_device.clone(),
            self.active.clone(),
            frame_tx,
        )?;

        self.bridge
            .start(StreamConfig {
                language: self.config.language.clone(),
                interim_results: self.config.interim_results,
                sample_rate: TRANSCRIPTION_SAMPLE_RATE,
            })
            .await?;

        *self.captures.lock().unwrap() = vec![candidate, other_party];

        let pipeline_task = self.spawn_frame_pipeline(frame_rx);
        let transcript_task = self.spawn_transcript_pump();
        *self.tasks.lock().unwrap() = vec![pipeline_task, transcript_task];

        self.active.store(true, Ordering::SeqCst);
        self.set_state(SessionState::Running);
        info!("conversation session started");
        Ok(())
    }

    /// Stop forwarding audio without tearing the connection down.
    pub fn pause(&self) {
        let mut state = self.state.lock().unwrap();
        if *state != SessionState::Running {
            return;
        }
        *state = SessionState::Paused;
        drop(state);

        self.active.store(false, Ordering::SeqCst);
        self.bridge.pause();
        let _ = self.events.send(SessionEvent::Status {
            state: SessionState::Paused,
        });
        debug!("session paused");
    }

    pub fn resume(&self) {
        let mut state = self.state.lock().unwrap();
        if *state != SessionState::Paused {
            return;
        }
        *state = SessionState::Running;
        drop(state);

        self.active.store(true, Ordering::SeqCst);
        self.bridge.resume();
        let _ = self.events.send(SessionEvent::Status {
            state: SessionState::Running,
        });
        debug!("session resumed");
    }

    /// Tear the session down in dependency order: suggestion wakes,
    /// then the VAD/capture pipelines, then the streaming bridge, and
    /// the audio device handles last, so producers are released only
    /// after their consumers stopped reading. Idempotent.
    pub async fn stop(&self) {
        {
            let mut state = self.state.lock().unwrap();
            if *state == SessionState::Stopped {
                return;
            }
            *state = SessionState::Stopped;
        }

        self.coordinator.shutdown();

        self.active.store(false, Ordering::SeqCst);
        for task in self.tasks.lock().unwrap().drain(..) {
            task.abort();
        }

        self.bridge.stop();

        let handles: Vec<CaptureHandle> = self.captures.lock().unwrap().drain(..).collect();
        if !handles.is_empty() {
            // Joining the capture threads blocks briefly; keep it off
            // the async workers.
            let _ = tokio::task::spawn_blocking(move || drop(handles)).await;
        }

        let _ = self.events.send(SessionEvent::Status {
            state: SessionState::Stopped,
        });
        info!("conversation session stopped");
    }

    /// Fire-and-forget prefetch of a suggestion for partial text.
    pub fn begin_partial_suggestion(&self, context_id: &str, partial_text: &str) {
        self.coordinator
            .begin_partial_generation(context_id, partial_text);
    }

    /// Bounded-wait retrieval of a prefetched suggestion.
    pub async fn partial_suggestion(&self, context_id: &str) -> PartialSuggestion {
        self.coordinator.partial_suggestion(context_id).await
    }

    fn set_state(&self, state: SessionState) {
        *self.state.lock().unwrap() = state;
        let _ = self.events.send(SessionEvent::Status { state });
    }

    fn spawn_frame_pipeline(
        &self,
        mut frame_rx: mpsc::Receiver<crate::audio_toolkit::capture::AudioFrame>,
    ) -> JoinHandle<()> {
        let mut turns = TurnManager::new(
            self.config.vad_config(),
            self.active.clone(),
            self.config.debug_dump_dir.clone(),
        );
        let bridge = self.bridge.clone();
        let coordinator = self.coordinator.clone();

        tokio::spawn(async move {
            while let Some(frame) = frame_rx.recv().await {
                for event in turns.handle_frame(&frame) {
                    match event {
                        TurnEvent::SpeechStart { role } => {
                            // Interruption rule: a turn opening on one
                            // role kills the other role's pending
                            // silence wake.
                            coordinator.on_speech_start(role);
                        }
                        TurnEvent::TurnCompleted { role, segment } => {
                            bridge.send(role, segment.audio);
                        }
                        TurnEvent::Misfire { .. } => {}
                    }
                }
            }
            debug!("frame pipeline exited");
        })
    }

    fn spawn_transcript_pump(&self) -> JoinHandle<()> {
        let mut bridge_events = self.bridge.subscribe();
        let events = self.events.clone();
        let coordinator = self.coordinator.clone();

        tokio::spawn(async move {
            loop {
                match bridge_events.recv().await {
                    Ok(BridgeEvent::Transcript(transcript)) => {
                        let _ = events.send(SessionEvent::TranscriptUpdate {
                            role: transcript.role,
                            text: transcript.text.clone(),
                            is_final: transcript.is_final,
                        });
                        coordinator.on_transcript(&transcript);
                    }
                    Ok(BridgeEvent::Restarted) => {
                        info!("transcription stream self-healed");
                    }
                    Ok(BridgeEvent::Failed(e)) => {
                        let _ = events.send(SessionEvent::Error {
                            message: e.to_string(),
                            credentials_invalid: e.is_credential_error(),
                        });
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("transcript pump lagged by {} events", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            debug!("transcript pump exited");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{StreamError, SuggestionError};
    use crate::llm_client::PromptContext;
    use crate::streaming::transport::{TranscriptionSink, TranscriptionSource};
    use async_trait::async_trait;
    use tokio_util::sync::CancellationToken;

    struct NoopTransport;

    #[async_trait]
    impl TranscriptionTransport for NoopTransport {
        async fn open(
            &self,
            _config: &StreamConfig,
        ) -> Result<(Box<dyn TranscriptionSink>, Box<dyn TranscriptionSource>), StreamError>
        {
            Err(StreamError::Connect("no gateway in tests".into()))
        }
    }

    struct NoopProvider;

    #[async_trait]
    impl SuggestionProvider for NoopProvider {
        async fn generate(
            &self,
            _context: &PromptContext,
            _cancel: &CancellationToken,
        ) -> Result<String, SuggestionError> {
            Ok("noop".into())
        }
    }

    fn session() -> ConversationSession {
        ConversationSession::with_collaborators(
            SessionConfig::default(),
            Arc::new(NoopTransport),
            Arc::new(NoopProvider),
        )
    }

    #[tokio::test]
    async fn pause_and_resume_are_noops_before_start() {
        let session = session();
        session.pause();
        assert_eq!(session.state(), SessionState::Idle);
        session.resume();
        assert_eq!(session.state(), SessionState::Idle);
    }

    #[tokio::test]
    async fn stop_is_idempotent_and_emits_status() {
        let session = session();
        let mut events = session.subscribe();

        session.stop().await;
        session.stop().await;
        assert_eq!(session.state(), SessionState::Stopped);

        match events.try_recv().unwrap() {
            SessionEvent::Status { state } => assert_eq!(state, SessionState::Stopped),
            other => panic!("unexpected event {:?}", other),
        }
        // The second stop emitted nothing.
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn stopped_session_cannot_be_restarted() {
        let session = session();
        session.stop().await;
        assert!(session.start().await.is_err());
    }
}
