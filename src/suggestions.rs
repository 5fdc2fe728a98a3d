//! Continuous suggestion coordination.
//!
//! Consumes role-tagged transcript events and decides when a response
//! suggestion gets generated: immediately on a final transcript for
//! the eligible role, after a silence debounce on interim ones. Each
//! role has a single "scheduled wake" slot that is replaced atomically
//! on every transition, so there is never more than one live timer per
//! role to reason about. Generations are cancellable tasks; a newer
//! trigger supersedes an outstanding one instead of queuing behind it.

use log::{debug, info, warn};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::SuggestionError;
use crate::events::{Role, SessionEvent, TranscriptEvent};
use crate::llm_client::{PromptContext, SuggestionProvider};
use crate::settings::SessionConfig;

/// Tuning knobs for the coordinator.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Only this role's speech triggers full suggestions; the
    /// candidate's own speech never does.
    pub eligible_role: Role,
    /// Silence to wait after an interim transcript before generating
    /// from it anyway.
    pub debounce: Duration,
    /// Bound on waiting for a prefetched partial suggestion.
    pub partial_timeout: Duration,
    /// Partial text shorter than this is not worth a prefetch.
    pub min_partial_chars: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            eligible_role: Role::OtherParty,
            debounce: Duration::from_millis(2_000),
            partial_timeout: Duration::from_millis(5_000),
            min_partial_chars: 24,
        }
    }
}

impl CoordinatorConfig {
    pub fn from_session(config: &SessionConfig) -> Self {
        Self {
            eligible_role: Role::OtherParty,
            debounce: config.suggestion_debounce(),
            partial_timeout: config.partial_timeout(),
            min_partial_chars: config.min_partial_chars,
        }
    }
}

/// Result of a bounded-wait partial retrieval. `is_complete: false`
/// covers timeout and failure alike; a timed-out generation keeps
/// running in the background and cleans itself up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartialSuggestion {
    pub suggestion: Option<String>,
    pub is_complete: bool,
}

impl PartialSuggestion {
    fn incomplete() -> Self {
        Self {
            suggestion: None,
            is_complete: false,
        }
    }
}

/// The single replaceable timer slot for one role.
struct ScheduledWake {
    handle: JoinHandle<()>,
    armed_at: Instant,
}

struct Inflight {
    id: u64,
    cancel: CancellationToken,
}

#[derive(Default)]
struct RoleState {
    wake: Option<ScheduledWake>,
    latest_interim: String,
    inflight: Option<Inflight>,
}

struct PendingPartial {
    rx: Option<oneshot::Receiver<Result<String, SuggestionError>>>,
    created_at: Instant,
}

#[derive(Clone)]
pub struct SuggestionCoordinator {
    inner: Arc<Inner>,
}

struct Inner {
    provider: Arc<dyn SuggestionProvider>,
    events: broadcast::Sender<SessionEvent>,
    config: CoordinatorConfig,
    roles: Mutex<HashMap<Role, RoleState>>,
    partials: Mutex<HashMap<String, PendingPartial>>,
    seq: AtomicU64,
    shutdown: CancellationToken,
}

impl SuggestionCoordinator {
    pub fn new(
        provider: Arc<dyn SuggestionProvider>,
        events: broadcast::Sender<SessionEvent>,
        config: CoordinatorConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                provider,
                events,
                config,
                roles: Mutex::new(HashMap::new()),
                partials: Mutex::new(HashMap::new()),
                seq: AtomicU64::new(0),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Feed one transcript event through the trigger rules.
    pub fn on_transcript(&self, event: &TranscriptEvent) {
        if event.role != self.inner.config.eligible_role {
            return;
        }
        if event.text.trim().is_empty() {
            return;
        }

        if event.is_final {
            // Final text wins outright: drop the pending wake and
            // generate now.
            self.inner.cancel_wake(event.role);
            {
                let mut roles = self.inner.roles.lock().unwrap();
                roles.entry(event.role).or_default().latest_interim.clear();
            }
            Inner::spawn_generation(&self.inner, event.role, event.text.clone());
        } else {
            {
                let mut roles = self.inner.roles.lock().unwrap();
                roles.entry(event.role).or_default().latest_interim = event.text.clone();
            }
            Inner::arm_wake(&self.inner, event.role);
        }
    }

    /// Turn-taking interruption: speech starting on one role cancels
    /// the other role's pending silence wake, so an interruption never
    /// fires a stale suggestion mid-overlap.
    pub fn on_speech_start(&self, role: Role) {
        self.inner.cancel_wake(role.other());
    }

    /// Fire-and-forget prefetch keyed by an opaque context id. Ignored
    /// when the text is too short or a generation for this id is
    /// already pending.
    pub fn begin_partial_generation(&self, context_id: &str, partial_text: &str) {
        let text = partial_text.trim();
        if text.chars().count() < self.inner.config.min_partial_chars {
            debug!(
                "ignoring partial prefetch for '{}', text below {} chars",
                context_id, self.inner.config.min_partial_chars
            );
            return;
        }

        let (tx, rx) = oneshot::channel();
        {
            let mut partials = self.inner.partials.lock().unwrap();
            if partials.contains_key(context_id) {
                debug!("partial prefetch already pending for '{}'", context_id);
                return;
            }
            partials.insert(
                context_id.to_string(),
                PendingPartial {
                    rx: Some(rx),
                    created_at: Instant::now(),
                },
            );
        }

        let inner = self.inner.clone();
        let id = context_id.to_string();
        let text = text.to_string();
        let token = self.inner.shutdown.child_token();
        tokio::spawn(async move {
            let context = PromptContext {
                role: inner.config.eligible_role,
                transcript: text,
            };
            let result = inner.provider.generate(&context, &token).await;
            if result.is_err() {
                // Failed prefetches clean their own entry; successful
                // ones wait for the retrieval race to remove it.
                inner.partials.lock().unwrap().remove(&id);
            }
            let _ = tx.send(result);
        });
    }

    /// Race the stored generation against the configured timeout. The
    /// map entry is removed once the race resolves, whatever the
    /// outcome.
    pub async fn partial_suggestion(&self, context_id: &str) -> PartialSuggestion {
        let (rx, created_at) = {
            let mut partials = self.inner.partials.lock().unwrap();
            match partials.get_mut(context_id) {
                None => {
                    debug!("no pending partial for '{}'", context_id);
                    return PartialSuggestion::incomplete();
                }
                Some(pending) => (pending.rx.take(), pending.created_at),
            }
        };

        let outcome = match rx {
            // Another retrieval already claimed this generation.
            None => PartialSuggestion::incomplete(),
            Some(rx) => {
                match tokio::time::timeout(self.inner.config.partial_timeout, rx).await {
                    Ok(Ok(Ok(text))) => PartialSuggestion {
                        suggestion: Some(text),
                        is_complete: true,
                    },
                    Ok(Ok(Err(e))) => {
                        debug!("partial generation for '{}' failed: {}", context_id, e);
                        PartialSuggestion::incomplete()
                    }
                    Ok(Err(_)) => PartialSuggestion::incomplete(),
                    Err(_) => {
                        debug!(
                            "partial retrieval for '{}' timed out, leaving generation to finish",
                            context_id
                        );
                        PartialSuggestion::incomplete()
                    }
                }
            }
        };

        self.inner.partials.lock().unwrap().remove(context_id);
        debug!(
            "partial '{}' resolved {}ms after begin (complete: {})",
            context_id,
            created_at.elapsed().as_millis(),
            outcome.is_complete
        );
        outcome
    }

    /// Cancel all wakes and in-flight generations. First step of
    /// session teardown; idempotent.
    pub fn shutdown(&self) {
        {
            let mut roles = self.inner.roles.lock().unwrap();
            for state in roles.values_mut() {
                if let Some(wake) = state.wake.take() {
                    wake.handle.abort();
                }
                state.inflight = None;
            }
        }
        self.inner.shutdown.cancel();
        debug!("suggestion coordinator shut down");
    }

    #[cfg(test)]
    fn has_wake(&self, role: Role) -> bool {
        self.inner
            .roles
            .lock()
            .unwrap()
            .get(&role)
            .map(|s| s.wake.is_some())
            .unwrap_or(false)
    }

    #[cfg(test)]
    fn pending_partials(&self) -> usize {
        self.inner.partials.lock().unwrap().len()
    }
}

impl Inner {
    fn cancel_wake(&self, role: Role) {
        let mut roles = self.roles.lock().unwrap();
        if let Some(state) = roles.get_mut(&role) {
            if let Some(wake) = state.wake.take() {
                wake.handle.abort();
                debug!(
                    "cancelled {} wake armed {}ms ago",
                    role.label(),
                    wake.armed_at.elapsed().as_millis()
                );
            }
        }
    }

    /// Arm (or re-arm) the role's silence wake. The slot is replaced
    /// atomically; the previous timer is aborted.
    fn arm_wake(inner: &Arc<Inner>, role: Role) {
        let task_inner = inner.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(task_inner.config.debounce).await;
            if task_inner.shutdown.is_cancelled() {
                return;
            }
            Inner::fire_debounced(&task_inner, role);
        });

        let mut roles = inner.roles.lock().unwrap();
        let state = roles.entry(role).or_default();
        if let Some(previous) = state.wake.replace(ScheduledWake {
            handle,
            armed_at: Instant::now(),
        }) {
            previous.handle.abort();
        }
    }

    /// The debounce elapsed with no further update: generate from the
    /// latest interim text available now.
    fn fire_debounced(inner: &Arc<Inner>, role: Role) {
        let text = {
            let mut roles = inner.roles.lock().unwrap();
            let state = roles.entry(role).or_default();
            state.wake = None;
            state.latest_interim.clone()
        };
        if text.trim().is_empty() {
            return;
        }
        debug!("debounce elapsed for {}, generating from interim text", role.label());
        Inner::spawn_generation(inner, role, text);
    }

    /// Start one generation, superseding any outstanding one for the
    /// role. At most one generation is in flight per role.
    fn spawn_generation(inner: &Arc<Inner>, role: Role, transcript: String) {
        let id = inner.seq.fetch_add(1, Ordering::SeqCst) + 1;
        let token = inner.shutdown.child_token();
        {
            let mut roles = inner.roles.lock().unwrap();
            let state = roles.entry(role).or_default();
            if let Some(previous) = state.inflight.replace(Inflight {
                id,
                cancel: token.clone(),
            }) {
                debug!("superseding in-flight generation #{}", previous.id);
                previous.cancel.cancel();
            }
        }

        let inner = inner.clone();
        tokio::spawn(async move {
            let context = PromptContext { role, transcript };
            let result = inner.provider.generate(&context, &token).await;

            // A superseded generation's late result is discarded, not
            // delivered; the check has to come before anything is
            // applied.
            if token.is_cancelled() {
                debug!("discarding result of superseded generation #{}", id);
                inner.clear_inflight(role, id);
                return;
            }
            inner.clear_inflight(role, id);

            match result {
                Ok(text) => {
                    info!("suggestion ready for {} ({} chars)", role.label(), text.len());
                    let _ = inner
                        .events
                        .send(SessionEvent::SuggestionReady { role, text });
                }
                Err(SuggestionError::Cancelled) => {
                    debug!("generation #{} cancelled", id);
                }
                Err(e) => {
                    warn!("suggestion generation failed: {}", e);
                    let _ = inner.events.send(SessionEvent::Error {
                        message: e.to_string(),
                        credentials_invalid: e.is_credential_error(),
                    });
                }
            }
        });
    }

    fn clear_inflight(&self, role: Role, id: u64) {
        let mut roles = self.roles.lock().unwrap();
        if let Some(state) = roles.get_mut(&role) {
            if state.inflight.as_ref().map(|i| i.id) == Some(id) {
                state.inflight = None;
            }
        }
    }
}
