//! Push-frame dispatcher with broadcast + replay for subscribers.

use std::{
    collections::VecDeque,
    sync::{PoisonError, RwLock},
};

use futures::StreamExt;
use tokio::sync::broadcast;
use tokio_stream::wrappers::{BroadcastStream, errors::BroadcastStreamRecvError};

use crate::{
    protocol::{DecodeError, ErrorInfo, Progress, SessionEvent},
    state::SessionState,
};

/// Capacity of the live update channel.
const UPDATE_CHANNEL_CAPACITY: usize = 10_000;
/// Updates kept for replay; the oldest are dropped first.
const HISTORY_CAPACITY: usize = 10_000;

/// Change applied to the session state.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionUpdate {
    /// An event was applied.
    Applied(SessionEvent),
    /// The state was reset locally.
    Cleared,
}

struct Inner {
    state: SessionState,
    /// Updates since the current session began.
    history: VecDeque<SessionUpdate>,
}

/// Sole writer of [`SessionState`].
///
/// Decodes raw frames, reduces them into the state, and fans the applied
/// updates out to subscribers. A subscriber that joins mid-session can
/// replay the current session's updates before switching to live ones.
pub struct MessageDispatcher {
    inner: RwLock<Inner>,
    sender: broadcast::Sender<SessionUpdate>,
}

impl Default for MessageDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageDispatcher {
    #[must_use]
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(UPDATE_CHANNEL_CAPACITY);
        Self {
            inner: RwLock::new(Inner {
                state: SessionState::default(),
                history: VecDeque::with_capacity(32),
            }),
            sender,
        }
    }

    /// Decode and apply one raw frame.
    ///
    /// Malformed frames and unknown types are logged and dropped.
    pub fn dispatch(&self, raw: &str) -> Option<SessionEvent> {
        let event = match SessionEvent::decode(raw) {
            Ok(event) => event,
            Err(DecodeError::UnknownType(kind)) => {
                tracing::warn!(%kind, "Unknown push message type, dropping frame");
                return None;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to decode push frame, dropping");
                return None;
            }
        };

        self.apply(event.clone()).then_some(event)
    }

    /// Apply an already decoded event.
    ///
    /// Returns `false` if the state ignored it.
    pub fn apply(&self, event: SessionEvent) -> bool {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        if !inner.state.apply(event.clone()) {
            tracing::warn!(
                kind = event.kind().as_str(),
                "Session already terminal, ignoring terminal event"
            );
            return false;
        }

        if matches!(event, SessionEvent::Start(_)) {
            inner.history.clear();
        }
        tracing::debug!(kind = event.kind().as_str(), "Applied session event");

        let update = SessionUpdate::Applied(event);
        if inner.history.len() >= HISTORY_CAPACITY {
            inner.history.pop_front();
        }
        inner.history.push_back(update.clone());
        let _ = self.sender.send(update);
        true
    }

    /// Reset the session state ahead of a new run.
    pub fn clear(&self) {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        inner.state.clear();
        inner.history.clear();
        let _ = self.sender.send(SessionUpdate::Cleared);
    }

    /// Show a progress record before the runner reports its own.
    pub fn seed_progress(&self, progress: Progress) {
        self.apply(SessionEvent::Progress(progress));
    }

    /// Record a locally detected error as the session's last error.
    pub fn report_error(&self, error: ErrorInfo) {
        self.apply(SessionEvent::Error(error));
    }

    /// Copy of the current state.
    #[must_use]
    pub fn snapshot(&self) -> SessionState {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .state
            .clone()
    }

    /// Whether the current session has a terminal summary.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .state
            .is_terminal()
    }

    /// Receiver for live updates.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<SessionUpdate> {
        self.sender.subscribe()
    }

    /// Updates applied since the current session began, up to the most
    /// recent 10 000. [`snapshot`](Self::snapshot) always has the full state.
    #[must_use]
    pub fn history(&self) -> Vec<SessionUpdate> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .history
            .iter()
            .cloned()
            .collect()
    }

    /// Stream that yields the current session's history, then live updates.
    #[must_use]
    pub fn history_plus_stream(&self) -> futures::stream::BoxStream<'static, SessionUpdate> {
        // Snapshot and subscribe under one lock so no update is missed or
        // seen twice.
        let (history, rx) = {
            let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
            (inner.history.clone(), self.sender.subscribe())
        };

        let hist = futures::stream::iter(history);
        let live = BroadcastStream::new(rx).filter_map(|res| async move {
            match res {
                Ok(update) => Some(update),
                Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Session subscriber lagged");
                    None
                }
            }
        });

        Box::pin(hist.chain(live))
    }
}
