//! Streaming transcription session lifecycle.
//!
//! Owns the single StreamSession per conversation and its state
//! machine: idle → starting → active, active ⇄ paused, anything →
//! terminated on stop. Provider-initiated drops get exactly one
//! automatic restart with the last known configuration; a second drop
//! inside the restart window is surfaced as a terminal failure instead
//! of a retry storm.

use log::{debug, info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::transport::{StreamConfig, TranscriptionSink, TranscriptionSource, TranscriptionTransport};
use crate::error::StreamError;
use crate::events::{Role, TranscriptEvent};

/// StreamSession state. Transitions only along the documented edges.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Idle,
    Starting,
    Active,
    Paused,
    Terminated,
}

/// Result of `start()`. `started: false` means a session was already
/// starting or active and no second connection was opened.
#[derive(Debug, Clone, Copy)]
pub struct StartOutcome {
    pub started: bool,
}

/// Events published by the bridge to its subscribers.
#[derive(Debug, Clone)]
pub enum BridgeEvent {
    Transcript(TranscriptEvent),
    /// The connection dropped and the automatic restart succeeded.
    Restarted,
    /// The stream is gone for good; the session keeps running without
    /// transcription until the host intervenes.
    Failed(StreamError),
}

pub struct TranscriptionBridge {
    transport: Arc<dyn TranscriptionTransport>,
    restart_window: Duration,
    state: Arc<Mutex<StreamState>>,
    forwarding: Arc<AtomicBool>,
    audio_tx: Mutex<Option<mpsc::Sender<(Role, Vec<f32>)>>>,
    events_tx: broadcast::Sender<BridgeEvent>,
    cancel: Mutex<Option<CancellationToken>>,
}

impl TranscriptionBridge {
    pub fn new(transport: Arc<dyn TranscriptionTransport>, restart_window: Duration) -> Self {
        let (events_tx, _) = broadcast::channel(256);
        Self {
            transport,
            restart_window,
            state: Arc::new(Mutex::new(StreamState::Idle)),
            forwarding: Arc::new(AtomicBool::new(false)),
            audio_tx: Mutex::new(None),
            events_tx,
            cancel: Mutex::new(None),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BridgeEvent> {
        self.events_tx.subscribe()
    }

    pub fn state(&self) -> StreamState {
        *self.state.lock().unwrap()
    }

    /// Open the streaming connection. A no-op returning
    /// `started: false` when a session is already starting or active.
    pub async fn start(&self, config: StreamConfig) -> Result<StartOutcome, StreamError> {
        {
            let mut state = self.state.lock().unwrap();
            match *state {
                StreamState::Starting | StreamState::Active | StreamState::Paused => {
                    debug!("bridge start ignored, session already {:?}", *state);
                    return Ok(StartOutcome { started: false });
                }
                StreamState::Terminated => return Err(StreamError::Terminated),
                StreamState::Idle => *state = StreamState::Starting,
            }
        }

        let (sink, source) = match self.transport.open(&config).await {
            Ok(pair) => pair,
            Err(e) => {
                *self.state.lock().unwrap() = StreamState::Idle;
                return Err(e);
            }
        };

        // stop() may have raced the connect; honor it.
        {
            let mut state = self.state.lock().unwrap();
            if *state == StreamState::Terminated {
                let mut sink = sink;
                tokio::spawn(async move { sink.close().await });
                return Err(StreamError::Terminated);
            }
            *state = StreamState::Active;
        }

        let (audio_tx, audio_rx) = mpsc::channel(64);
        *self.audio_tx.lock().unwrap() = Some(audio_tx);
        self.forwarding.store(true, Ordering::SeqCst);

        let cancel = CancellationToken::new();
        *self.cancel.lock().unwrap() = Some(cancel.clone());

        let driver = Driver {
            transport: self.transport.clone(),
            config,
            restart_window: self.restart_window,
            state: self.state.clone(),
            forwarding: self.forwarding.clone(),
            events_tx: self.events_tx.clone(),
            cancel,
        };
        tokio::spawn(driver.run(sink, source, audio_rx));

        info!("transcription bridge active");
        Ok(StartOutcome { started: true })
    }

    /// Queue audio for the stream. Dropped (returning false) unless the
    /// session is active and forwarding. In particular, nothing is
    /// forwarded after `stop()` even while callbacks are still
    /// draining.
    pub fn send(&self, role: Role, samples: Vec<f32>) -> bool {
        if self.state() != StreamState::Active || !self.forwarding.load(Ordering::SeqCst) {
            debug!("dropping {} samples for {}, stream not forwarding", samples.len(), role.label());
            return false;
        }
        match self.audio_tx.lock().unwrap().as_ref() {
            Some(tx) => match tx.try_send((role, samples)) {
                Ok(()) => true,
                Err(e) => {
                    warn!("bridge audio queue full, dropping turn: {}", e);
                    false
                }
            },
            None => false,
        }
    }

    /// Stop forwarding audio; the underlying connection stays open.
    pub fn pause(&self) {
        let mut state = self.state.lock().unwrap();
        if *state == StreamState::Active {
            *state = StreamState::Paused;
            self.forwarding.store(false, Ordering::SeqCst);
            debug!("bridge paused");
        }
    }

    pub fn resume(&self) {
        let mut state = self.state.lock().unwrap();
        if *state == StreamState::Paused {
            *state = StreamState::Active;
            self.forwarding.store(true, Ordering::SeqCst);
            debug!("bridge resumed");
        }
    }

    /// Terminate the session and release the connection. Idempotent;
    /// valid from every state.
    pub fn stop(&self) {
        let previous = {
            let mut state = self.state.lock().unwrap();
            std::mem::replace(&mut *state, StreamState::Terminated)
        };
        self.forwarding.store(false, Ordering::SeqCst);
        *self.audio_tx.lock().unwrap() = None;
        if let Some(cancel) = self.cancel.lock().unwrap().take() {
            cancel.cancel();
        }
        if previous != StreamState::Terminated {
            info!("transcription bridge stopped (was {:?})", previous);
        }
    }
}

/* ---------------- driver task ---------------- */

struct Driver {
    transport: Arc<dyn TranscriptionTransport>,
    config: StreamConfig,
    restart_window: Duration,
    state: Arc<Mutex<StreamState>>,
    forwarding: Arc<AtomicBool>,
    events_tx: broadcast::Sender<BridgeEvent>,
    cancel: CancellationToken,
}

impl Driver {
    async fn run(
        self,
        mut sink: Box<dyn TranscriptionSink>,
        source: Box<dyn TranscriptionSource>,
        mut audio_rx: mpsc::Receiver<(Role, Vec<f32>)>,
    ) {
        let (mut event_rx, mut reader) = spawn_reader(source);
        let mut last_drop: Option<Instant> = None;

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    reader.abort();
                    sink.close().await;
                    break;
                }
                chunk = audio_rx.recv() => match chunk {
                    Some((role, samples)) => {
                        if !self.forwarding.load(Ordering::SeqCst) {
                            continue;
                        }
                        if let Err(e) = sink.send_audio(role, &samples).await {
                            warn!("audio send failed: {}", e);
                            match self.heal(e, &mut last_drop, &mut reader).await {
                                Some(next) => (sink, event_rx, reader) = next,
                                None => break,
                            }
                        }
                    }
                    None => {
                        // stop() dropped the sender.
                        reader.abort();
                        sink.close().await;
                        break;
                    }
                },
                event = event_rx.recv() => {
                    let error = match event {
                        Some(Ok(transcript)) => {
                            let _ = self.events_tx.send(BridgeEvent::Transcript(transcript));
                            continue;
                        }
                        Some(Err(e)) => e,
                        None => StreamError::ConnectionLost("provider closed the stream".into()),
                    };
                    match self.heal(error, &mut last_drop, &mut reader).await {
                        Some(next) => (sink, event_rx, reader) = next,
                        None => break,
                    }
                }
            }
        }
        debug!("bridge driver exited");
    }

    /// Handle an unexpected termination: one automatic restart with
    /// the last known configuration, terminal failure when drops come
    /// back to back.
    async fn heal(
        &self,
        error: StreamError,
        last_drop: &mut Option<Instant>,
        reader: &mut JoinHandle<()>,
    ) -> Option<(
        Box<dyn TranscriptionSink>,
        mpsc::Receiver<Result<TranscriptEvent, StreamError>>,
        JoinHandle<()>,
    )> {
        reader.abort();

        if self.cancel.is_cancelled() || self.state() == StreamState::Terminated {
            return None;
        }

        if let Some(previous) = *last_drop {
            if previous.elapsed() < self.restart_window {
                warn!(
                    "stream dropped again {}ms after the last restart, giving up",
                    previous.elapsed().as_millis()
                );
                self.fail(StreamError::Terminal {
                    window_ms: self.restart_window.as_millis() as u64,
                });
                return None;
            }
        }
        *last_drop = Some(Instant::now());

        info!("stream lost ({}), attempting one automatic restart", error);
        match self.transport.open(&self.config).await {
            Ok((sink, source)) => {
                if self.cancel.is_cancelled() {
                    let mut sink = sink;
                    sink.close().await;
                    return None;
                }
                let (event_rx, reader) = spawn_reader(source);
                let _ = self.events_tx.send(BridgeEvent::Restarted);
                info!("stream restarted");
                Some((sink, event_rx, reader))
            }
            Err(e) => {
                warn!("automatic restart failed: {}", e);
                self.fail(e);
                None
            }
        }
    }

    fn fail(&self, error: StreamError) {
        *self.state.lock().unwrap() = StreamState::Terminated;
        self.forwarding.store(false, Ordering::SeqCst);
        let _ = self.events_tx.send(BridgeEvent::Failed(error));
    }

    fn state(&self) -> StreamState {
        *self.state.lock().unwrap()
    }
}

fn spawn_reader(
    mut source: Box<dyn TranscriptionSource>,
) -> (
    mpsc::Receiver<Result<TranscriptEvent, StreamError>>,
    JoinHandle<()>,
) {
    let (tx, rx) = mpsc::channel(64);
    let handle = tokio::spawn(async move {
        while let Some(event) = source.next_event().await {
            let is_err = event.is_err();
            if tx.send(event).await.is_err() || is_err {
                break;
            }
        }
        // Dropping tx tells the driver the stream ended.
    });
    (rx, handle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::Utc;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;

    fn transcript(role: Role, text: &str, is_final: bool) -> TranscriptEvent {
        TranscriptEvent {
            role,
            text: text.to_string(),
            is_final,
            words: None,
            timestamp: Utc::now(),
        }
    }

    struct FakeSink {
        sent: Arc<Mutex<Vec<(Role, usize)>>>,
    }

    #[async_trait]
    impl TranscriptionSink for FakeSink {
        async fn send_audio(&mut self, role: Role, samples: &[f32]) -> Result<(), StreamError> {
            self.sent.lock().unwrap().push((role, samples.len()));
            Ok(())
        }
        async fn close(&mut self) {}
    }

    struct FakeSource {
        rx: mpsc::Receiver<Result<TranscriptEvent, StreamError>>,
    }

    #[async_trait]
    impl TranscriptionSource for FakeSource {
        async fn next_event(&mut self) -> Option<Result<TranscriptEvent, StreamError>> {
            self.rx.recv().await
        }
    }

    /// One scripted connection the test can feed or drop.
    struct ScriptedConn {
        feed: mpsc::Sender<Result<TranscriptEvent, StreamError>>,
        sent: Arc<Mutex<Vec<(Role, usize)>>>,
    }

    struct FakeTransport {
        conns: Mutex<VecDeque<(FakeSink, FakeSource)>>,
        opens: AtomicUsize,
    }

    impl FakeTransport {
        /// Script `n` connections; returns handles for each.
        fn with_connections(n: usize) -> (Arc<Self>, Vec<ScriptedConn>) {
            let mut conns = VecDeque::new();
            let mut handles = Vec::new();
            for _ in 0..n {
                let (feed, rx) = mpsc::channel(16);
                let sent = Arc::new(Mutex::new(Vec::new()));
                conns.push_back((FakeSink { sent: sent.clone() }, FakeSource { rx }));
                handles.push(ScriptedConn { feed, sent });
            }
            (
                Arc::new(Self {
                    conns: Mutex::new(conns),
                    opens: AtomicUsize::new(0),
                }),
                handles,
            )
        }

        fn open_count(&self) -> usize {
            self.opens.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl TranscriptionTransport for FakeTransport {
        async fn open(
            &self,
            _config: &StreamConfig,
        ) -> Result<(Box<dyn TranscriptionSink>, Box<dyn TranscriptionSource>), StreamError>
        {
            self.opens.fetch_add(1, Ordering::SeqCst);
            match self.conns.lock().unwrap().pop_front() {
                Some((sink, source)) => Ok((Box::new(sink), Box::new(source))),
                None => Err(StreamError::Connect("no more scripted connections".into())),
            }
        }
    }

    fn config() -> StreamConfig {
        StreamConfig {
            language: "en".into(),
            interim_results: true,
            sample_rate: 16_000,
        }
    }

    async fn recv_event(rx: &mut broadcast::Receiver<BridgeEvent>) -> BridgeEvent {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for bridge event")
            .expect("bridge event channel closed")
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn start_while_active_opens_no_second_connection() {
        let (transport, _conns) = FakeTransport::with_connections(1);
        let bridge = TranscriptionBridge::new(transport.clone(), Duration::from_secs(15));

        let first = bridge.start(config()).await.unwrap();
        assert!(first.started);
        assert_eq!(bridge.state(), StreamState::Active);

        let second = bridge.start(config()).await.unwrap();
        assert!(!second.started);
        assert_eq!(transport.open_count(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn unexpected_close_restarts_exactly_once() {
        let (transport, conns) = FakeTransport::with_connections(2);
        let bridge = TranscriptionBridge::new(transport.clone(), Duration::from_secs(15));
        let mut events = bridge.subscribe();

        bridge.start(config()).await.unwrap();

        let mut iter = conns.into_iter();
        let first = iter.next().unwrap();
        let second = iter.next().unwrap();

        // Provider drops the first connection.
        drop(first.feed);

        match recv_event(&mut events).await {
            BridgeEvent::Restarted => {}
            other => panic!("expected restart, got {:?}", other),
        }
        assert_eq!(transport.open_count(), 2);

        // The restarted stream keeps delivering transcripts.
        second
            .feed
            .send(Ok(transcript(Role::OtherParty, "still here", true)))
            .await
            .unwrap();
        match recv_event(&mut events).await {
            BridgeEvent::Transcript(t) => assert_eq!(t.text, "still here"),
            other => panic!("expected transcript, got {:?}", other),
        }

        // Forwarding resumed without caller intervention.
        assert_eq!(bridge.state(), StreamState::Active);
        assert!(bridge.send(Role::Candidate, vec![0.0; 480]));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn second_quick_drop_is_terminal() {
        let (transport, conns) = FakeTransport::with_connections(3);
        let bridge = TranscriptionBridge::new(transport.clone(), Duration::from_secs(15));
        let mut events = bridge.subscribe();

        bridge.start(config()).await.unwrap();

        let mut iter = conns.into_iter();
        let first = iter.next().unwrap();
        let second = iter.next().unwrap();

        drop(first.feed);
        match recv_event(&mut events).await {
            BridgeEvent::Restarted => {}
            other => panic!("expected restart, got {:?}", other),
        }

        drop(second.feed);
        match recv_event(&mut events).await {
            BridgeEvent::Failed(StreamError::Terminal { .. }) => {}
            other => panic!("expected terminal failure, got {:?}", other),
        }

        assert_eq!(bridge.state(), StreamState::Terminated);
        // Two opens total: the original and the single restart.
        assert_eq!(transport.open_count(), 2);
        assert!(!bridge.send(Role::Candidate, vec![0.0; 480]));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn pause_gates_forwarding_without_reconnecting() {
        let (transport, conns) = FakeTransport::with_connections(1);
        let bridge = TranscriptionBridge::new(transport.clone(), Duration::from_secs(15));

        bridge.start(config()).await.unwrap();
        bridge.pause();
        assert_eq!(bridge.state(), StreamState::Paused);
        assert!(!bridge.send(Role::Candidate, vec![0.0; 480]));

        bridge.resume();
        assert!(bridge.send(Role::Candidate, vec![0.0; 480]));

        // Give the driver a moment to drain the queue.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(conns[0].sent.lock().unwrap().len(), 1);
        assert_eq!(transport.open_count(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn stop_is_idempotent_and_blocks_late_sends() {
        let (transport, conns) = FakeTransport::with_connections(1);
        let bridge = TranscriptionBridge::new(transport, Duration::from_secs(15));

        bridge.start(config()).await.unwrap();
        bridge.stop();
        bridge.stop();
        assert_eq!(bridge.state(), StreamState::Terminated);

        // An in-flight callback draining after stop() must not reach
        // the wire.
        assert!(!bridge.send(Role::OtherParty, vec![0.0; 480]));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(conns[0].sent.lock().unwrap().is_empty());

        // A stopped session cannot be restarted.
        assert!(matches!(
            bridge.start(config()).await,
            Err(StreamError::Terminated)
        ));
    }
}
