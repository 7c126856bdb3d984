//! Saved-session records and their persisted document.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use speedtest_core::{
    TestMode,
    protocol::{Completion, StartInfo, TargetResult},
};
use uuid::Uuid;

/// Schema version written into persisted and exported documents.
pub const STORE_VERSION: &str = "1.0.0";

/// What a saved session measured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TestType {
    Speed,
    Unlock,
    Both,
}

impl From<TestMode> for TestType {
    fn from(mode: TestMode) -> Self {
        match mode {
            TestMode::SpeedOnly => Self::Speed,
            TestMode::UnlockOnly => Self::Unlock,
            TestMode::Both => Self::Both,
        }
    }
}

impl TestType {
    /// Test type from the echoed configuration's test mode, falling back to
    /// what the results carry.
    #[must_use]
    pub fn infer(start: &StartInfo, results: &[TargetResult]) -> Self {
        let mode = start
            .config
            .get("testMode")
            .or_else(|| start.config.get("test_mode"))
            .and_then(|m| serde_json::from_value::<TestMode>(m.clone()).ok());
        if let Some(mode) = mode {
            return mode.into();
        }

        let unlock = results.iter().any(TargetResult::has_unlock_results);
        let speed = results.iter().any(|r| r.download_mbps > 0.0 || r.upload_mbps > 0.0);
        match (speed, unlock) {
            (true, true) => Self::Both,
            (false, true) => Self::Unlock,
            _ => Self::Speed,
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Speed => "speed",
            Self::Unlock => "unlock",
            Self::Both => "both",
        }
    }
}

/// User-facing metadata of a saved session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionMeta {
    pub duration: String,
    pub test_type: TestType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_notes: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
}

impl SessionMeta {
    /// Metadata derived from the session itself, without notes or tags.
    #[must_use]
    pub fn derive(start: &StartInfo, results: &[TargetResult], completion: &Completion) -> Self {
        Self {
            duration: completion.duration.clone(),
            test_type: TestType::infer(start, results),
            user_notes: None,
            tags: None,
        }
    }

    #[must_use]
    pub fn with_notes(mut self, notes: impl Into<String>) -> Self {
        self.user_notes = Some(notes.into());
        self
    }

    #[must_use]
    pub fn with_tags<I>(mut self, tags: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        self.tags = Some(tags.into_iter().map(Into::into).collect());
        self
    }
}

/// Immutable projection of one completed session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SavedRecord {
    pub id: Uuid,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub saved_at: DateTime<Utc>,
    pub start_data: StartInfo,
    pub results: Vec<TargetResult>,
    pub complete_data: Completion,
    pub meta: SessionMeta,
}

impl SavedRecord {
    /// Share of selected targets that tested successfully; 0 when the
    /// session had no targets.
    #[must_use]
    pub fn success_rate(&self) -> f64 {
        if self.start_data.total_targets == 0 {
            return 0.0;
        }
        f64::from(self.complete_data.successful) / f64::from(self.start_data.total_targets)
    }

    /// Configuration source echoed by the runner.
    #[must_use]
    pub fn config_path(&self) -> &str {
        let config = &self.start_data.config;
        config
            .get("configPaths")
            .or_else(|| config.get("config_paths"))
            .and_then(Value::as_str)
            .unwrap_or_default()
    }

    #[must_use]
    pub fn summary(&self) -> SessionSummary {
        let done = &self.complete_data;
        SessionSummary {
            id: self.id,
            saved_at: self.saved_at,
            config_path: self.config_path().to_string(),
            total_targets: self.start_data.total_targets,
            successful: done.successful,
            failed: done.failed,
            avg_download_mbps: done.avg_download_mbps,
            avg_latency: done.avg_latency,
            best_target: done.best_target.clone(),
            best_download_mbps: done.best_download_mbps,
            duration: self.meta.duration.clone(),
            test_type: self.meta.test_type,
            notes: self.meta.user_notes.clone(),
            tags: self.meta.tags.clone(),
            unlock_stats: done.unlock_stats.clone(),
        }
    }
}

/// Lightweight listing entry; carries no per-target results.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub id: Uuid,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub saved_at: DateTime<Utc>,
    pub config_path: String,
    pub total_targets: u32,
    pub successful: u32,
    pub failed: u32,
    pub avg_download_mbps: f64,
    pub avg_latency: f64,
    pub best_target: String,
    pub best_download_mbps: f64,
    pub duration: String,
    pub test_type: TestType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unlock_stats: Option<Value>,
}

/// Document kept in the storage slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreDocument {
    pub sessions: Vec<SavedRecord>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub last_cleanup: DateTime<Utc>,
    pub version: String,
}

impl StoreDocument {
    #[must_use]
    pub fn empty(now: DateTime<Utc>) -> Self {
        Self {
            sessions: Vec::new(),
            last_cleanup: now,
            version: STORE_VERSION.to_string(),
        }
    }
}
