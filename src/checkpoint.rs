//! Detector state checkpoints
//!
//! The pipeline saves the per-key statistics of every detector partition on
//! graceful shutdown and restores them at startup, so burst detection keeps
//! its history across restarts. The checkpoint is one map keyed by
//! `event_type:user_id` and does not record partitions: on restore the keys
//! are routed again, so a restart may change the partition count.

use crate::anomaly::KeyStats;
use crate::error::{Result, StreamError};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

/// Per-key detector statistics
pub type DetectorState = HashMap<String, KeyStats>;

/// Trait for persisting detector state
pub trait CheckpointStore: Send + Sync {
    fn save(&self, state: &DetectorState) -> Result<()>;

    /// Load the saved state; empty when nothing was saved
    fn load(&self) -> Result<DetectorState>;
}

/// Save on the blocking thread pool
pub async fn save_blocking(store: Arc<dyn CheckpointStore>, state: DetectorState) -> Result<()> {
    tokio::task::spawn_blocking(move || store.save(&state))
        .await
        .map_err(|e| StreamError::Checkpoint(format!("save task failed: {}", e)))?
}

/// Load on the blocking thread pool
pub async fn load_blocking(store: Arc<dyn CheckpointStore>) -> Result<DetectorState> {
    tokio::task::spawn_blocking(move || store.load())
        .await
        .map_err(|e| StreamError::Checkpoint(format!("load task failed: {}", e)))?
}

/// JSON file on disk
///
/// Atomic writes via temp file + rename to prevent corruption.
pub struct FileCheckpointStore {
    dir: PathBuf,
}

impl FileCheckpointStore {
    const FILE_NAME: &'static str = "detector-state.json";

    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path(&self) -> PathBuf {
        self.dir.join(Self::FILE_NAME)
    }
}

impl CheckpointStore for FileCheckpointStore {
    fn save(&self, state: &DetectorState) -> Result<()> {
        let path = self.path();
        let json = serde_json::to_string(state)?;
        let tmp_path = path.with_extension("tmp");

        std::fs::create_dir_all(&self.dir).map_err(|e| {
            StreamError::Checkpoint(format!(
                "Failed to create checkpoint directory {}: {}",
                self.dir.display(),
                e
            ))
        })?;

        std::fs::write(&tmp_path, json).map_err(|e| {
            StreamError::Checkpoint(format!(
                "Failed to write checkpoint {}: {}",
                tmp_path.display(),
                e
            ))
        })?;

        std::fs::rename(&tmp_path, &path).map_err(|e| {
            StreamError::Checkpoint(format!(
                "Failed to rename checkpoint {} to {}: {}",
                tmp_path.display(),
                path.display(),
                e
            ))
        })?;

        tracing::debug!(path = %path.display(), keys = state.len(), "Checkpoint saved");
        Ok(())
    }

    fn load(&self) -> Result<DetectorState> {
        let path = self.path();
        if !path.exists() {
            return Ok(HashMap::new());
        }

        let json = std::fs::read_to_string(&path).map_err(|e| {
            StreamError::Checkpoint(format!("Failed to read checkpoint {}: {}", path.display(), e))
        })?;

        let state: DetectorState = serde_json::from_str(&json).map_err(|e| {
            StreamError::Checkpoint(format!("unreadable checkpoint {}: {}", path.display(), e))
        })?;

        tracing::debug!(path = %path.display(), keys = state.len(), "Checkpoint loaded");
        Ok(state)
    }
}

/// In-memory checkpoint store for testing
#[derive(Default)]
pub struct MemoryCheckpointStore {
    state: std::sync::RwLock<DetectorState>,
}

impl CheckpointStore for MemoryCheckpointStore {
    fn save(&self, state: &DetectorState) -> Result<()> {
        let mut saved = self
            .state
            .write()
            .map_err(|e| StreamError::Checkpoint(format!("Failed to acquire checkpoint lock: {}", e)))?;
        *saved = state.clone();
        Ok(())
    }

    fn load(&self) -> Result<DetectorState> {
        let saved = self
            .state
            .read()
            .map_err(|e| StreamError::Checkpoint(format!("Failed to acquire checkpoint lock: {}", e)))?;
        Ok(saved.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_state() -> DetectorState {
        let mut state = HashMap::new();
        state.insert(
            "LOGIN:u1".to_string(),
            KeyStats {
                event_count: 4,
                last_event_time: 1_709_294_400_000,
                avg_inter_arrival_ms: 1_500.0,
            },
        );
        state.insert(
            "PAYMENT:u2".to_string(),
            KeyStats {
                event_count: 1,
                last_event_time: 1_709_294_401_000,
                avg_inter_arrival_ms: 0.0,
            },
        );
        state
    }

    #[test]
    fn test_memory_store_save_load() {
        let store = MemoryCheckpointStore::default();
        assert!(store.load().unwrap().is_empty());
        store.save(&sample_state()).unwrap();
        assert_eq!(store.load().unwrap(), sample_state());
    }

    #[test]
    fn test_file_store_save_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCheckpointStore::new(dir.path().join("nested"));

        store.save(&sample_state()).unwrap();
        let loaded = store.load().unwrap();
        assert_eq!(loaded, sample_state());
        assert!(dir.path().join("nested/detector-state.json").exists());
        assert!(!dir.path().join("nested/detector-state.tmp").exists());
    }

    #[test]
    fn test_file_store_missing_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCheckpointStore::new(dir.path());
        assert!(store.load().unwrap().is_empty());
    }

    #[test]
    fn test_file_store_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCheckpointStore::new(dir.path());
        store.save(&sample_state()).unwrap();
        store.save(&HashMap::new()).unwrap();
        assert!(store.load().unwrap().is_empty());
    }

    #[test]
    fn test_file_store_corrupt_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("detector-state.json"), "{ not json").unwrap();

        let store = FileCheckpointStore::new(dir.path());
        let err = store.load().unwrap_err();
        assert!(matches!(err, StreamError::Checkpoint(_)));
    }

    #[tokio::test]
    async fn test_blocking_helpers_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn CheckpointStore> = Arc::new(FileCheckpointStore::new(dir.path()));

        save_blocking(store.clone(), sample_state()).await.unwrap();
        assert_eq!(load_blocking(store).await.unwrap(), sample_state());
    }
}
