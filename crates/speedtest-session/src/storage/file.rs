//! File-backed slot storage.

use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
};

use async_trait::async_trait;
use speedtest_core::{SlotStorage, traits::StorageError};

use super::SLOT_KEY;

/// Slot kept in a single JSON file.
///
/// Writes go to a sibling temp file that is then renamed over the target,
/// so readers never see a half-written document.
#[derive(Debug, Clone)]
pub struct FileSlot {
    path: PathBuf,
}

impl FileSlot {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Slot file named after [`SLOT_KEY`] inside `dir`.
    #[must_use]
    pub fn in_dir(dir: impl AsRef<Path>) -> Self {
        Self::new(dir.as_ref().join(format!("{SLOT_KEY}.json")))
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self.path.file_name().unwrap_or_default().to_os_string();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

#[async_trait]
impl SlotStorage for FileSlot {
    async fn read(&self) -> Result<Option<String>, StorageError> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => Ok(Some(contents)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn write(&self, contents: &str) -> Result<(), StorageError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }

        let temp = self.temp_path();
        tokio::fs::write(&temp, contents).await?;
        tokio::fs::rename(&temp, &self.path).await?;
        tracing::debug!(path = %self.path.display(), bytes = contents.len(), "Slot written");
        Ok(())
    }

    async fn remove(&self) -> Result<(), StorageError> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_write_creates_dirs_and_leaves_no_temp() {
        let dir = tempfile::tempdir().unwrap();
        let slot = FileSlot::in_dir(dir.path().join("nested"));

        assert_eq!(slot.read().await.unwrap(), None);
        slot.write(r#"{"sessions":[]}"#).await.unwrap();

        assert_eq!(
            slot.read().await.unwrap().as_deref(),
            Some(r#"{"sessions":[]}"#)
        );
        assert!(!slot.temp_path().exists());
        assert!(slot.path().ends_with("clash-speedtest-sessions.json"));
    }

    #[tokio::test]
    async fn test_remove_missing_is_ok() {
        let dir = tempfile::tempdir().unwrap();
        let slot = FileSlot::in_dir(dir.path());
        slot.remove().await.unwrap();

        slot.write("x").await.unwrap();
        slot.remove().await.unwrap();
        assert_eq!(slot.read().await.unwrap(), None);
    }
}
