//! Observable state of the session in progress.

use crate::protocol::{
    Cancellation, Completion, ErrorInfo, Progress, SessionEvent, StartInfo, TargetResult,
};

/// Session state assembled from push events.
///
/// `results` only grows and keeps arrival order. At most one of
/// `completion` and `cancellation` is set; once either is, further terminal
/// events are ignored until the state is cleared.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionState {
    start_info: Option<StartInfo>,
    progress: Option<Progress>,
    results: Vec<TargetResult>,
    completion: Option<Completion>,
    cancellation: Option<Cancellation>,
    last_error: Option<ErrorInfo>,
}

impl SessionState {
    #[must_use]
    pub const fn start_info(&self) -> Option<&StartInfo> {
        self.start_info.as_ref()
    }

    #[must_use]
    pub const fn progress(&self) -> Option<&Progress> {
        self.progress.as_ref()
    }

    #[must_use]
    pub fn results(&self) -> &[TargetResult] {
        &self.results
    }

    #[must_use]
    pub const fn completion(&self) -> Option<&Completion> {
        self.completion.as_ref()
    }

    #[must_use]
    pub const fn cancellation(&self) -> Option<&Cancellation> {
        self.cancellation.as_ref()
    }

    #[must_use]
    pub const fn last_error(&self) -> Option<&ErrorInfo> {
        self.last_error.as_ref()
    }

    /// Whether a terminal summary has been recorded.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        self.completion.is_some() || self.cancellation.is_some()
    }

    /// Reset every slice.
    pub fn clear(&mut self) {
        *self = Self::default();
    }

    /// Apply one event. Returns `false` if the event was ignored.
    pub fn apply(&mut self, event: SessionEvent) -> bool {
        match event {
            SessionEvent::Start(info) => {
                self.clear();
                self.start_info = Some(info);
            }
            SessionEvent::Progress(progress) => self.progress = Some(progress),
            SessionEvent::Result(result) => self.results.push(result),
            SessionEvent::Complete(summary) => {
                if self.is_terminal() {
                    return false;
                }
                self.completion = Some(summary);
            }
            SessionEvent::Cancelled(summary) => {
                if self.is_terminal() {
                    return false;
                }
                self.cancellation = Some(summary);
            }
            SessionEvent::Error(error) => self.last_error = Some(error),
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::protocol::TargetStatus;

    fn start(total: u32) -> SessionEvent {
        SessionEvent::Start(StartInfo {
            total_targets: total,
            config: json!({"testMode": "both"}),
        })
    }

    fn result(name: &str) -> SessionEvent {
        SessionEvent::Result(TargetResult {
            target_name: name.to_string(),
            target_type: "ss".to_string(),
            target_address: None,
            latency_ms: 10.0,
            jitter_ms: 1.0,
            packet_loss_pct: 0.0,
            download_mbps: 50.0,
            upload_mbps: 5.0,
            status: TargetStatus::Success,
            error_stage: None,
            error_code: None,
            error_message: None,
            unlock_results: None,
        })
    }

    fn complete() -> SessionEvent {
        SessionEvent::Complete(Completion {
            total_tested: 2,
            successful: 2,
            failed: 0,
            duration: "3s".to_string(),
            avg_latency: 10.0,
            avg_download_mbps: 50.0,
            avg_upload_mbps: 5.0,
            best_target: "a".to_string(),
            best_download_mbps: 50.0,
            unlock_stats: None,
        })
    }

    fn cancelled() -> SessionEvent {
        SessionEvent::Cancelled(Cancellation {
            message: "stopped".to_string(),
            completed_tests: 1,
            total_tests: 2,
            partial_duration: "1s".to_string(),
        })
    }

    #[test]
    fn test_results_keep_arrival_order_and_duplicates() {
        let mut state = SessionState::default();
        for name in ["b", "a", "b", "c"] {
            assert!(state.apply(result(name)));
        }
        let names: Vec<_> = state.results().iter().map(|r| r.target_name.as_str()).collect();
        assert_eq!(names, ["b", "a", "b", "c"]);
    }

    #[test]
    fn test_start_clears_everything() {
        let mut state = SessionState::default();
        state.apply(result("a"));
        state.apply(cancelled());
        state.apply(SessionEvent::Error(ErrorInfo::new("boom", "E1")));
        state.apply(SessionEvent::Progress(Progress {
            current_target: "a".to_string(),
            completed_count: 1,
            total_count: 2,
            progress_percent: 50.0,
            status: "running".to_string(),
            current_stage: None,
        }));

        state.apply(start(4));

        assert_eq!(state.start_info().map(|s| s.total_targets), Some(4));
        assert!(state.progress().is_none());
        assert!(state.results().is_empty());
        assert!(state.completion().is_none());
        assert!(state.cancellation().is_none());
        assert!(state.last_error().is_none());
    }

    #[test]
    fn test_start_is_idempotent() {
        let mut once = SessionState::default();
        once.apply(result("x"));
        once.apply(start(2));

        let mut twice = once.clone();
        twice.apply(start(2));
        assert_eq!(once, twice);
    }

    #[test]
    fn test_terminal_summaries_are_exclusive() {
        let mut state = SessionState::default();
        assert!(state.apply(complete()));
        assert!(!state.apply(cancelled()));
        assert!(state.completion().is_some());
        assert!(state.cancellation().is_none());

        let mut state = SessionState::default();
        assert!(state.apply(cancelled()));
        assert!(!state.apply(complete()));
        assert!(state.cancellation().is_some());
        assert!(state.completion().is_none());
    }

    #[test]
    fn test_error_does_not_terminate() {
        let mut state = SessionState::default();
        state.apply(SessionEvent::Error(ErrorInfo::new("slow runner", "E2")));
        assert!(!state.is_terminal());
        assert!(state.apply(result("a")));
        assert_eq!(state.results().len(), 1);
    }
}
