//! Durable storage for the relay stream resume position.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use peruse_core::StorageError;
use tokio::io::AsyncWriteExt;
use tracing::debug;

/// Persistence for a single stream cursor value.
#[async_trait]
pub trait CursorStore: Send + Sync {
    /// Read the last persisted cursor. `None` means start from the live head.
    async fn load(&self) -> Result<Option<i64>, StorageError>;

    /// Replace the persisted cursor.
    async fn save(&self, cursor: i64) -> Result<(), StorageError>;
}

/// Cursor kept in a text file holding one decimal value.
///
/// Writes go to a sibling temporary file that is synced, renamed over the
/// target, and followed by a sync of the parent directory. An empty file is
/// treated as torn and refuses to load.
#[derive(Debug, Clone)]
pub struct FileCursorStore {
    path: PathBuf,
}

impl FileCursorStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }

    /// Make the rename itself durable. Directories cannot be synced on Windows.
    async fn sync_parent(&self) -> Result<(), StorageError> {
        #[cfg(unix)]
        {
            let dir = match self.path.parent() {
                Some(dir) if !dir.as_os_str().is_empty() => dir,
                _ => Path::new("."),
            };
            let handle = tokio::fs::File::open(dir)
                .await
                .map_err(|e| self.io_error(e))?;
            handle.sync_all().await.map_err(|e| self.io_error(e))?;
        }
        Ok(())
    }

    fn io_error(&self, reason: impl ToString) -> StorageError {
        StorageError::CursorIo {
            path: self.path.display().to_string(),
            reason: reason.to_string(),
        }
    }
}

#[async_trait]
impl CursorStore for FileCursorStore {
    async fn load(&self) -> Result<Option<i64>, StorageError> {
        let contents = match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(self.io_error(e)),
        };

        let trimmed = contents.trim();
        if trimmed.is_empty() {
            return Err(self.io_error("cursor file is empty"));
        }
        trimmed
            .parse::<i64>()
            .map(Some)
            .map_err(|e| self.io_error(format!("unparseable cursor {trimmed:?}: {e}")))
    }

    async fn save(&self, cursor: i64) -> Result<(), StorageError> {
        let tmp = self.temp_path();
        let mut file = tokio::fs::File::create(&tmp)
            .await
            .map_err(|e| self.io_error(e))?;
        file.write_all(cursor.to_string().as_bytes())
            .await
            .map_err(|e| self.io_error(e))?;
        file.sync_all().await.map_err(|e| self.io_error(e))?;
        drop(file);

        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| self.io_error(e))?;
        self.sync_parent().await?;
        debug!(cursor, path = %self.path.display(), "Cursor checkpointed");
        Ok(())
    }
}

/// In-memory cursor store that remembers every save.
#[derive(Debug, Default)]
pub struct MemoryCursorStore {
    initial: Option<i64>,
    saves: Mutex<Vec<i64>>,
}

impl MemoryCursorStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start with a previously persisted cursor.
    pub fn with_cursor(cursor: i64) -> Self {
        Self {
            initial: Some(cursor),
            saves: Mutex::new(Vec::new()),
        }
    }

    /// Every value saved so far, oldest first.
    pub fn saves(&self) -> Vec<i64> {
        self.saves
            .lock()
            .map(|s| s.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl CursorStore for MemoryCursorStore {
    async fn load(&self) -> Result<Option<i64>, StorageError> {
        let saves = self.saves.lock().map_err(|_| StorageError::LockPoisoned)?;
        Ok(saves.last().copied().or(self.initial))
    }

    async fn save(&self, cursor: i64) -> Result<(), StorageError> {
        self.saves
            .lock()
            .map_err(|_| StorageError::LockPoisoned)?
            .push(cursor);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_file_means_live_head() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCursorStore::new(dir.path().join("cursor"));
        assert_eq!(store.load().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCursorStore::new(dir.path().join("cursor"));

        store.save(1_234_567).await.unwrap();
        assert_eq!(store.load().await.unwrap(), Some(1_234_567));

        store.save(1_234_600).await.unwrap();
        assert_eq!(store.load().await.unwrap(), Some(1_234_600));
        assert!(!dir.path().join("cursor.tmp").exists());
    }

    #[tokio::test]
    async fn test_garbage_cursor_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cursor");
        std::fs::write(&path, "not-a-number").unwrap();

        let err = FileCursorStore::new(&path).load().await.unwrap_err();
        assert!(matches!(err, StorageError::CursorIo { .. }));
    }

    #[tokio::test]
    async fn test_empty_cursor_file_fails_instead_of_resetting() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cursor");
        std::fs::write(&path, "").unwrap();
        let err = FileCursorStore::new(&path).load().await.unwrap_err();
        assert!(matches!(err, StorageError::CursorIo { .. }));

        std::fs::write(&path, "  \n").unwrap();
        assert!(FileCursorStore::new(&path).load().await.is_err());
    }

    #[tokio::test]
    async fn test_saved_file_holds_only_the_value() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCursorStore::new(dir.path().join("nested-cursor"));
        store.save(42).await.unwrap();
        assert_eq!(
            std::fs::read_to_string(store.path()).unwrap(),
            "42"
        );
    }

    #[tokio::test]
    async fn test_unreadable_cursor_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        // A directory where the file should be cannot be read as text.
        let path = dir.path().join("cursor");
        std::fs::create_dir(&path).unwrap();

        assert!(FileCursorStore::new(&path).load().await.is_err());
    }

    #[tokio::test]
    async fn test_memory_store_tracks_saves() {
        let store = MemoryCursorStore::with_cursor(10);
        assert_eq!(store.load().await.unwrap(), Some(10));
        store.save(11).await.unwrap();
        store.save(15).await.unwrap();
        assert_eq!(store.load().await.unwrap(), Some(15));
        assert_eq!(store.saves(), vec![11, 15]);
    }
}
