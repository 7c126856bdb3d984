//! Capacity-bounded store of completed sessions.

use std::{cmp::Ordering, collections::HashSet, fmt, sync::Arc};

use chrono::{DateTime, SubsecRound, TimeDelta, Utc};
use serde::Serialize;
use speedtest_core::{
    SlotStorage, StoreLimits,
    protocol::{Completion, StartInfo, TargetResult},
    traits::StorageError,
};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::{
    export::{self, ExportFormat},
    record::{SavedRecord, SessionMeta, SessionSummary, StoreDocument},
};

/// Source of the current time.
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// Store error.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Not enough storage space to save the session, clear some history: {0}")]
    Capacity(#[source] StorageError),
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("Failed to serialize sessions: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("Invalid export document: {0}")]
    InvalidExport(#[source] serde_json::Error),
}

/// Storage statistics, computed on demand.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreStats {
    pub total_sessions: usize,
    pub size_bytes: usize,
    pub last_cleanup: Option<DateTime<Utc>>,
    pub oldest_session: Option<DateTime<Utc>>,
    pub newest_session: Option<DateTime<Utc>>,
}

/// Eviction order: higher success rate first, then newer first.
#[must_use]
pub fn rank(a: &SavedRecord, b: &SavedRecord) -> Ordering {
    b.success_rate()
        .total_cmp(&a.success_rate())
        .then_with(|| b.saved_at.cmp(&a.saved_at))
}

/// Apply the retention window and the size cap.
///
/// Records saved at or before `now - retention` are dropped. If more than
/// `max_sessions` remain they are ranked with [`rank`] and the tail is
/// dropped; otherwise the input order is kept.
#[must_use]
pub fn evict(
    mut records: Vec<SavedRecord>,
    now: DateTime<Utc>,
    limits: &StoreLimits,
) -> Vec<SavedRecord> {
    let retention = TimeDelta::from_std(limits.retention).unwrap_or(TimeDelta::MAX);
    let threshold = now.checked_sub_signed(retention).unwrap_or(DateTime::<Utc>::MIN_UTC);
    records.retain(|r| r.saved_at > threshold);

    if records.len() > limits.max_sessions {
        records.sort_by(rank);
        records.truncate(limits.max_sessions);
    }
    records
}

/// Saved-session store over a single storage slot.
///
/// Each mutation reads the whole document, changes it and writes it back;
/// mutations are serialized by an internal lock.
pub struct SessionStore<S: SlotStorage> {
    slot: S,
    limits: StoreLimits,
    clock: Clock,
    write_lock: Mutex<()>,
}

impl<S: SlotStorage> fmt::Debug for SessionStore<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionStore")
            .field("limits", &self.limits)
            .finish_non_exhaustive()
    }
}

impl<S: SlotStorage> SessionStore<S> {
    #[must_use]
    pub fn new(slot: S, limits: StoreLimits) -> Self {
        Self::with_clock(slot, limits, Arc::new(Utc::now))
    }

    #[must_use]
    pub fn with_clock(slot: S, limits: StoreLimits, clock: Clock) -> Self {
        Self {
            slot,
            limits,
            clock,
            write_lock: Mutex::new(()),
        }
    }

    #[must_use]
    pub const fn limits(&self) -> &StoreLimits {
        &self.limits
    }

    /// Current time at the precision records are persisted with.
    fn now(&self) -> DateTime<Utc> {
        (self.clock)().trunc_subsecs(3)
    }

    /// Persisted document, or `None` if the slot is empty.
    ///
    /// An unreadable document is treated as empty.
    async fn load(&self) -> Result<Option<StoreDocument>, StoreError> {
        let Some(raw) = self.slot.read().await? else {
            return Ok(None);
        };
        match serde_json::from_str(&raw) {
            Ok(doc) => Ok(Some(doc)),
            Err(e) => {
                tracing::warn!(error = %e, "Saved sessions are unreadable, starting fresh");
                Ok(None)
            }
        }
    }

    async fn load_or_empty(&self) -> Result<StoreDocument, StoreError> {
        Ok(self
            .load()
            .await?
            .unwrap_or_else(|| StoreDocument::empty(self.now())))
    }

    async fn persist(&self, doc: &StoreDocument) -> Result<(), StoreError> {
        let raw = serde_json::to_string(doc)?;
        self.slot.write(&raw).await.map_err(StoreError::Capacity)
    }

    /// Save a completed session and apply eviction.
    ///
    /// # Returns
    /// The new record's id.
    ///
    /// # Errors
    /// Returns [`StoreError::Capacity`] if the document cannot be written.
    pub async fn save(
        &self,
        start: StartInfo,
        results: Vec<TargetResult>,
        completion: Completion,
        meta: SessionMeta,
    ) -> Result<Uuid, StoreError> {
        let _guard = self.write_lock.lock().await;
        let now = self.now();
        let record = SavedRecord {
            id: Uuid::new_v4(),
            saved_at: now,
            start_data: start,
            results,
            complete_data: completion,
            meta,
        };
        let id = record.id;

        let mut doc = self.load_or_empty().await?;
        let mut sessions = Vec::with_capacity(doc.sessions.len() + 1);
        sessions.push(record);
        sessions.append(&mut doc.sessions);

        let before = sessions.len();
        doc.sessions = evict(sessions, now, &self.limits);
        doc.last_cleanup = now;
        let evicted = before - doc.sessions.len();
        if evicted > 0 {
            tracing::info!(evicted, kept = doc.sessions.len(), "Evicted saved sessions");
        }

        self.persist(&doc).await?;
        tracing::info!(%id, total = doc.sessions.len(), "Session saved");
        Ok(id)
    }

    /// One summary per record, newest first.
    ///
    /// # Errors
    /// Returns error if the slot cannot be read.
    pub async fn list_summaries(&self) -> Result<Vec<SessionSummary>, StoreError> {
        let doc = self.load_or_empty().await?;
        let mut summaries: Vec<_> = doc.sessions.iter().map(SavedRecord::summary).collect();
        summaries.sort_by(|a, b| b.saved_at.cmp(&a.saved_at));
        Ok(summaries)
    }

    /// # Errors
    /// Returns error if the slot cannot be read.
    pub async fn get(&self, id: Uuid) -> Result<Option<SavedRecord>, StoreError> {
        let doc = self.load_or_empty().await?;
        Ok(doc.sessions.into_iter().find(|r| r.id == id))
    }

    /// Delete one record. Returns whether it existed.
    ///
    /// # Errors
    /// Returns error if the slot cannot be read or written.
    pub async fn delete(&self, id: Uuid) -> Result<bool, StoreError> {
        Ok(self.delete_many(&[id]).await? == 1)
    }

    /// Delete every record whose id is in `ids`. Returns how many were
    /// removed.
    ///
    /// # Errors
    /// Returns error if the slot cannot be read or written.
    pub async fn delete_many(&self, ids: &[Uuid]) -> Result<usize, StoreError> {
        let _guard = self.write_lock.lock().await;
        let Some(mut doc) = self.load().await? else {
            return Ok(0);
        };

        let ids: HashSet<_> = ids.iter().collect();
        let before = doc.sessions.len();
        doc.sessions.retain(|r| !ids.contains(&r.id));
        let removed = before - doc.sessions.len();

        if removed > 0 {
            self.persist(&doc).await?;
            tracing::info!(removed, "Deleted saved sessions");
        }
        Ok(removed)
    }

    /// Remove every record.
    ///
    /// # Errors
    /// Returns error if the slot cannot be removed.
    pub async fn clear_all(&self) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        self.slot.remove().await?;
        tracing::info!("Cleared saved sessions");
        Ok(())
    }

    /// # Errors
    /// Returns error if the slot cannot be read.
    pub async fn stats(&self) -> Result<StoreStats, StoreError> {
        let doc = self.load().await?;
        let Some(doc) = doc else {
            return Ok(StoreStats {
                total_sessions: 0,
                size_bytes: serde_json::to_string(&StoreDocument::empty(self.now()))?.len(),
                last_cleanup: None,
                oldest_session: None,
                newest_session: None,
            });
        };

        Ok(StoreStats {
            total_sessions: doc.sessions.len(),
            size_bytes: serde_json::to_string(&doc)?.len(),
            last_cleanup: Some(doc.last_cleanup),
            oldest_session: doc.sessions.iter().map(|r| r.saved_at).min(),
            newest_session: doc.sessions.iter().map(|r| r.saved_at).max(),
        })
    }

    /// Serialize the selected records, or all of them when `ids` is `None`.
    ///
    /// # Errors
    /// Returns error if the slot cannot be read.
    pub async fn export(
        &self,
        ids: Option<&[Uuid]>,
        format: ExportFormat,
    ) -> Result<String, StoreError> {
        let doc = self.load_or_empty().await?;
        let sessions: Vec<_> = match ids {
            Some(ids) => doc
                .sessions
                .into_iter()
                .filter(|r| ids.contains(&r.id))
                .collect(),
            None => doc.sessions,
        };

        match format {
            ExportFormat::Json => Ok(export::to_json(sessions, self.now())?),
            ExportFormat::Csv => Ok(export::to_csv(&sessions)),
        }
    }

    /// Merge the records of a JSON export, replacing stored records with the
    /// same id, then apply eviction. Returns how many imported records were
    /// kept.
    ///
    /// # Errors
    /// Returns error if `contents` is not an export document or the slot
    /// cannot be written.
    pub async fn import(&self, contents: &str) -> Result<usize, StoreError> {
        let imported = Self::parse_export(contents)?;
        let imported_ids: HashSet<_> = imported.iter().map(|r| r.id).collect();

        let _guard = self.write_lock.lock().await;
        let now = self.now();
        let mut doc = self.load_or_empty().await?;
        doc.sessions.retain(|r| !imported_ids.contains(&r.id));
        doc.sessions.extend(imported);

        doc.sessions = evict(std::mem::take(&mut doc.sessions), now, &self.limits);
        doc.last_cleanup = now;
        self.persist(&doc).await?;

        let kept = doc
            .sessions
            .iter()
            .filter(|r| imported_ids.contains(&r.id))
            .count();
        tracing::info!(kept, offered = imported_ids.len(), "Imported saved sessions");
        Ok(kept)
    }

    /// Records of a JSON export, without touching the store.
    ///
    /// # Errors
    /// Returns error if `contents` is not an export document.
    pub fn parse_export(contents: &str) -> Result<Vec<SavedRecord>, StoreError> {
        export::parse(contents).map_err(StoreError::InvalidExport)
    }
}
