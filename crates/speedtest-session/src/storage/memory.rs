//! In-memory slot storage.

use std::sync::RwLock;

use async_trait::async_trait;
use speedtest_core::{SlotStorage, traits::StorageError};

/// In-memory slot.
///
/// Useful for tests and throwaway runs. Data is lost on drop. An optional
/// byte quota makes oversized writes fail the way a full browser or disk
/// store would.
#[derive(Debug, Default)]
pub struct MemorySlot {
    contents: RwLock<Option<String>>,
    quota: Option<usize>,
}

impl MemorySlot {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject writes larger than `quota` bytes.
    #[must_use]
    pub const fn with_quota(quota: usize) -> Self {
        Self {
            contents: RwLock::new(None),
            quota: Some(quota),
        }
    }

    /// Slot pre-filled with `contents`.
    #[must_use]
    pub fn with_contents(contents: impl Into<String>) -> Self {
        Self {
            contents: RwLock::new(Some(contents.into())),
            quota: None,
        }
    }
}

#[async_trait]
impl SlotStorage for MemorySlot {
    async fn read(&self) -> Result<Option<String>, StorageError> {
        Ok(self
            .contents
            .read()
            .map_err(|e| StorageError::Internal(e.to_string()))?
            .clone())
    }

    async fn write(&self, contents: &str) -> Result<(), StorageError> {
        if let Some(quota) = self.quota.filter(|q| contents.len() > *q) {
            return Err(StorageError::QuotaExceeded {
                needed: contents.len(),
                quota,
            });
        }

        *self
            .contents
            .write()
            .map_err(|e| StorageError::Internal(e.to_string()))? = Some(contents.to_string());
        Ok(())
    }

    async fn remove(&self) -> Result<(), StorageError> {
        self.contents
            .write()
            .map_err(|e| StorageError::Internal(e.to_string()))?
            .take();
        Ok(())
    }
}
