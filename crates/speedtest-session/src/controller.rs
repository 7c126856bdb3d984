//! Session lifecycle controller.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use speedtest_core::{
    ClientMessage, MessageDispatcher, PushChannel, SessionUpdate, TestConfig, TestStarter,
    protocol::{Completion, Progress, StartInfo, TargetResult},
    traits::{StartError, TaskId},
};
use tokio::{
    sync::{broadcast, watch},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;

/// Controller error.
#[derive(Debug, thiserror::Error)]
pub enum ControllerError {
    #[error("WebSocket not connected")]
    NotConnected,
    #[error("No targets selected")]
    NoTargets,
    #[error("A test session is already running")]
    AlreadyRunning,
    #[error("Previous session has not been reset")]
    NotReset,
    #[error("Failed to start test: {0}")]
    Start(#[from] StartError),
    #[error("Test start was aborted")]
    Aborted,
}

/// Lifecycle phase of the current session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SessionPhase {
    #[default]
    Idle,
    Starting,
    Running,
    Completed,
    Cancelled,
    /// Stopped locally; the runner's confirmation is not awaited.
    Aborted,
}

impl SessionPhase {
    /// Whether a session is in flight.
    #[must_use]
    pub const fn is_active(self) -> bool {
        matches!(self, Self::Starting | Self::Running)
    }

    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Aborted)
    }
}

/// Result of [`SessionController::stop`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// No session was in flight.
    NotRunning,
    /// The session was aborted locally.
    Aborted {
        /// Whether a cancel request reached an open push channel.
        cancel_sent: bool,
    },
}

/// Data of a completed session, ready to be saved.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletedSession {
    pub start: StartInfo,
    pub results: Vec<TargetResult>,
    pub completion: Completion,
}

struct Attempt {
    id: u64,
    token: CancellationToken,
}

#[derive(Default)]
struct ControlState {
    phase: SessionPhase,
    task_id: Option<TaskId>,
    /// In-flight start call, if any.
    attempt: Option<Attempt>,
    attempts: u64,
    config: Option<TestConfig>,
    last_error: Option<String>,
}

/// Drives one test session at a time.
///
/// Session data is written only by the [`MessageDispatcher`]; the controller
/// reads it to decide when a running session has ended.
pub struct SessionController<S, C>
where
    S: TestStarter,
    C: PushChannel,
{
    starter: S,
    channel: C,
    dispatcher: Arc<MessageDispatcher>,
    state: Mutex<ControlState>,
    phase_tx: watch::Sender<SessionPhase>,
}

impl<S, C> SessionController<S, C>
where
    S: TestStarter,
    C: PushChannel,
{
    #[must_use]
    pub fn new(starter: S, channel: C, dispatcher: Arc<MessageDispatcher>) -> Self {
        let (phase_tx, _) = watch::channel(SessionPhase::Idle);
        Self {
            starter,
            channel,
            dispatcher,
            state: Mutex::new(ControlState::default()),
            phase_tx,
        }
    }

    fn lock(&self) -> MutexGuard<'_, ControlState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_phase(&self, st: &mut ControlState, phase: SessionPhase) {
        if st.phase != phase {
            tracing::info!(from = ?st.phase, to = ?phase, "Session phase changed");
        }
        st.phase = phase;
        self.phase_tx.send_replace(phase);
    }

    /// Start a session for `config`.
    ///
    /// Resolves once the runner has accepted the task. Push frames may
    /// arrive before that and are applied as usual.
    ///
    /// # Errors
    /// - [`ControllerError::NotConnected`] if the push channel is down; a
    ///   connection is requested and no call is made.
    /// - [`ControllerError::NoTargets`] if nothing is selected.
    /// - [`ControllerError::AlreadyRunning`] if a session is in flight.
    /// - [`ControllerError::NotReset`] if the last session completed or was
    ///   cancelled and [`reset`](Self::reset) has not been called.
    /// - [`ControllerError::Start`] if the runner refused or was unreachable.
    /// - [`ControllerError::Aborted`] if [`stop`](Self::stop) ran first.
    pub async fn start(&self, config: TestConfig) -> Result<TaskId, ControllerError> {
        if !self.channel.is_connected() {
            tracing::warn!("Push channel not connected, requesting connection");
            self.channel.connect();
            self.lock().last_error = Some(ControllerError::NotConnected.to_string());
            return Err(ControllerError::NotConnected);
        }
        if config.target_count() == 0 {
            self.lock().last_error = Some(ControllerError::NoTargets.to_string());
            return Err(ControllerError::NoTargets);
        }

        let (attempt_id, token) = {
            let mut st = self.lock();
            match st.phase {
                SessionPhase::Starting | SessionPhase::Running => {
                    return Err(ControllerError::AlreadyRunning);
                }
                SessionPhase::Completed | SessionPhase::Cancelled => {
                    return Err(ControllerError::NotReset);
                }
                SessionPhase::Idle | SessionPhase::Aborted => {}
            }
            st.attempts += 1;
            let token = CancellationToken::new();
            st.attempt = Some(Attempt {
                id: st.attempts,
                token: token.clone(),
            });
            st.task_id = None;
            st.last_error = None;
            st.config = Some(config.clone());
            self.set_phase(&mut st, SessionPhase::Starting);
            (st.attempts, token)
        };

        let total = u32::try_from(config.target_count()).unwrap_or(u32::MAX);
        self.dispatcher.clear();
        self.dispatcher.seed_progress(Progress {
            current_target: String::new(),
            completed_count: 0,
            total_count: total,
            progress_percent: 0.0,
            status: "starting".to_string(),
            current_stage: Some(config.test_mode.initial_stage().to_string()),
        });
        tracing::info!(targets = total, mode = ?config.test_mode, "Starting test session");

        let result = tokio::select! {
            biased;
            () = token.cancelled() => Err(ControllerError::Aborted),
            res = self.starter.start(&config) => res.map_err(ControllerError::from),
        };

        let mut st = self.lock();
        if st.attempt.as_ref().is_none_or(|a| a.id != attempt_id) {
            drop(st);
            if let Ok(task_id) = result {
                tracing::warn!(%task_id, "Task accepted after local abort, cancelling it");
                self.channel.send(&ClientMessage::stop_test(task_id));
            }
            return Err(ControllerError::Aborted);
        }
        st.attempt = None;

        match result {
            Ok(task_id) => {
                tracing::info!(%task_id, "Test session running");
                st.task_id = Some(task_id.clone());
                self.set_phase(&mut st, SessionPhase::Running);
                drop(st);
                self.reconcile();
                Ok(task_id)
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to start test session");
                st.task_id = None;
                st.last_error = Some(e.to_string());
                self.set_phase(&mut st, SessionPhase::Idle);
                Err(e)
            }
        }
    }

    /// Abort the current session locally.
    ///
    /// While starting, cancels the start call and returns to `Idle` with an
    /// error. While running, sends one best-effort cancel request for the
    /// task and moves to `Aborted` whether or not it was delivered.
    pub fn stop(&self) -> StopOutcome {
        let task_id = {
            let mut st = self.lock();
            if !st.phase.is_active() {
                return StopOutcome::NotRunning;
            }
            if let Some(attempt) = st.attempt.take() {
                attempt.token.cancel();
                st.task_id = None;
                st.last_error = Some(ControllerError::Aborted.to_string());
                self.set_phase(&mut st, SessionPhase::Idle);
                tracing::info!("Start call aborted");
                return StopOutcome::Aborted { cancel_sent: false };
            }
            let task_id = st.task_id.take();
            self.set_phase(&mut st, SessionPhase::Aborted);
            task_id
        };

        let cancel_sent = task_id.is_some_and(|id| {
            tracing::info!(task_id = %id, "Requesting task cancellation");
            self.channel.send(&ClientMessage::stop_test(id))
        });
        if !cancel_sent {
            tracing::debug!("Cancel request not delivered");
        }
        StopOutcome::Aborted { cancel_sent }
    }

    /// Move a running session to its terminal phase if the runner has
    /// reported one. Returns the phase afterwards.
    pub fn reconcile(&self) -> SessionPhase {
        let mut st = self.lock();
        if st.phase != SessionPhase::Running {
            return st.phase;
        }

        let snapshot = self.dispatcher.snapshot();
        let next = if snapshot.completion().is_some() {
            SessionPhase::Completed
        } else if snapshot.cancellation().is_some() {
            SessionPhase::Cancelled
        } else {
            return st.phase;
        };

        st.task_id = None;
        self.set_phase(&mut st, next);
        next
    }

    /// Return a terminal session to `Idle`. Returns `false` while a session
    /// is in flight.
    pub fn reset(&self) -> bool {
        let mut st = self.lock();
        if st.phase.is_active() {
            return false;
        }
        st.last_error = None;
        self.set_phase(&mut st, SessionPhase::Idle);
        true
    }

    /// Data of the session if it completed normally.
    ///
    /// When the runner never sent a start message, the start info is built
    /// from the submitted configuration.
    #[must_use]
    pub fn completed_session(&self) -> Option<CompletedSession> {
        let config = {
            let st = self.lock();
            if st.phase != SessionPhase::Completed {
                return None;
            }
            st.config.clone()
        };

        let snapshot = self.dispatcher.snapshot();
        let completion = snapshot.completion()?.clone();
        let start = match snapshot.start_info() {
            Some(start) => start.clone(),
            None => {
                let config = config?;
                StartInfo {
                    total_targets: u32::try_from(config.target_count()).unwrap_or(u32::MAX),
                    config: config.request_body(),
                }
            }
        };

        Some(CompletedSession {
            start,
            results: snapshot.results().to_vec(),
            completion,
        })
    }

    #[must_use]
    pub fn phase(&self) -> SessionPhase {
        self.lock().phase
    }

    /// Receiver of phase changes.
    #[must_use]
    pub fn subscribe_phase(&self) -> watch::Receiver<SessionPhase> {
        self.phase_tx.subscribe()
    }

    /// Task the runner is working on, if any.
    #[must_use]
    pub fn task_id(&self) -> Option<TaskId> {
        self.lock().task_id.clone()
    }

    #[must_use]
    pub fn last_error(&self) -> Option<String> {
        self.lock().last_error.clone()
    }

    #[must_use]
    pub const fn dispatcher(&self) -> &Arc<MessageDispatcher> {
        &self.dispatcher
    }

    #[must_use]
    pub const fn channel(&self) -> &C {
        &self.channel
    }
}

impl<S, C> SessionController<S, C>
where
    S: TestStarter + 'static,
    C: PushChannel + 'static,
{
    /// Spawn a task that reconciles the phase whenever a terminal event is
    /// applied. The task ends when the dispatcher is dropped.
    #[must_use]
    pub fn spawn_watcher(self: &Arc<Self>) -> JoinHandle<()> {
        let mut rx = self.dispatcher.subscribe();
        let controller = Arc::downgrade(self);

        tokio::spawn(async move {
            loop {
                let check = match rx.recv().await {
                    Ok(SessionUpdate::Applied(event)) => event.is_terminal(),
                    Ok(SessionUpdate::Cleared) => false,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Session watcher lagged");
                        true
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                if !check {
                    continue;
                }
                let Some(controller) = controller.upgrade() else {
                    break;
                };
                controller.reconcile();
            }
        })
    }
}
