//! Conversation state persistence with optimistic concurrency.
//!
//! Every [`StateStore`] save names the version the caller loaded. The store
//! rejects the write with `VersionConflict` when the stored record moved on
//! in the meantime, and otherwise bumps the version by one. A record that
//! was never saved has version 0.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;

use parley_types::{ConversationKey, ConversationState, FlowError, Result};

#[async_trait]
pub trait StateStore: Send + Sync {
    async fn load(&self, key: &ConversationKey) -> Result<Option<ConversationState>>;

    /// Persist `state` if the stored version equals `expected_version`.
    /// Returns the new version.
    async fn save(&self, state: &ConversationState, expected_version: u64) -> Result<u64>;

    /// Move the record out of the live set. Archiving a missing record is a no-op.
    async fn archive(&self, key: &ConversationKey) -> Result<()>;
}

fn conflict(key: &ConversationKey, expected: u64, actual: u64) -> FlowError {
    FlowError::VersionConflict {
        key: key.to_string(),
        expected,
        actual,
    }
}

fn next_record(state: &ConversationState, expected_version: u64) -> ConversationState {
    let mut stored = state.clone();
    stored.version = expected_version + 1;
    stored.last_updated = Utc::now();
    stored
}

// ---------------------------------------------------------------------------
// MemoryStateStore
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MemoryStateStore {
    live: Mutex<HashMap<ConversationKey, ConversationState>>,
    archived: Mutex<Vec<ConversationState>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Archived records of a conversation, oldest first.
    pub fn archived(&self, key: &ConversationKey) -> Vec<ConversationState> {
        self.archived
            .lock()
            .iter()
            .filter(|s| s.key() == *key)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.live.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.lock().is_empty()
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn load(&self, key: &ConversationKey) -> Result<Option<ConversationState>> {
        Ok(self.live.lock().get(key).cloned())
    }

    async fn save(&self, state: &ConversationState, expected_version: u64) -> Result<u64> {
        let key = state.key();
        let mut live = self.live.lock();
        let actual = live.get(&key).map_or(0, |s| s.version);
        if actual != expected_version {
            return Err(conflict(&key, expected_version, actual));
        }
        let stored = next_record(state, expected_version);
        let version = stored.version;
        live.insert(key, stored);
        Ok(version)
    }

    async fn archive(&self, key: &ConversationKey) -> Result<()> {
        let removed = self.live.lock().remove(key);
        if let Some(state) = removed {
            self.archived.lock().push(state);
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// FileStateStore
// ---------------------------------------------------------------------------

/// One JSON file per conversation under `<root>/<tenant>/<user>.json`.
/// Archived records move to `<root>/archive/<tenant>/<user>-<timestamp>.json`.
///
/// The version check and the write run under an in-process lock, so one store
/// instance must own the directory.
pub struct FileStateStore {
    root: PathBuf,
    write_lock: tokio::sync::Mutex<()>,
}

impl FileStateStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &ConversationKey) -> PathBuf {
        self.root
            .join(encode_segment(&key.tenant_id))
            .join(format!("{}.json", encode_segment(&key.end_user_id)))
    }

    fn archive_dir(&self, key: &ConversationKey) -> PathBuf {
        self.root.join("archive").join(encode_segment(&key.tenant_id))
    }

    async fn read(path: &Path) -> Result<Option<ConversationState>> {
        if !tokio::fs::try_exists(path).await? {
            return Ok(None);
        }
        let json = tokio::fs::read_to_string(path).await?;
        let state: ConversationState = serde_json::from_str(&json)
            .map_err(|e| FlowError::Store(format!("corrupt state file {}: {e}", path.display())))?;
        Ok(Some(state))
    }
}

/// Keep ids filesystem-safe: ASCII alphanumerics, `-` and `_` pass through,
/// every other byte becomes `%XX`.
fn encode_segment(id: &str) -> String {
    let mut out = String::with_capacity(id.len());
    for byte in id.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'-' || byte == b'_' {
            out.push(byte as char);
        } else {
            out.push_str(&format!("%{byte:02X}"));
        }
    }
    out
}

#[async_trait]
impl StateStore for FileStateStore {
    async fn load(&self, key: &ConversationKey) -> Result<Option<ConversationState>> {
        Self::read(&self.path_for(key)).await
    }

    async fn save(&self, state: &ConversationState, expected_version: u64) -> Result<u64> {
        let key = state.key();
        let path = self.path_for(&key);
        let _guard = self.write_lock.lock().await;

        let actual = Self::read(&path).await?.map_or(0, |s| s.version);
        if actual != expected_version {
            return Err(conflict(&key, expected_version, actual));
        }

        let stored = next_record(state, expected_version);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, serde_json::to_string_pretty(&stored)?).await?;
        tokio::fs::rename(&tmp, &path).await?;
        tracing::debug!(path = %path.display(), version = stored.version, "Conversation state saved");
        Ok(stored.version)
    }

    async fn archive(&self, key: &ConversationKey) -> Result<()> {
        let path = self.path_for(key);
        let _guard = self.write_lock.lock().await;
        if !tokio::fs::try_exists(&path).await? {
            return Ok(());
        }
        let dir = self.archive_dir(key);
        tokio::fs::create_dir_all(&dir).await?;
        let target = dir.join(format!(
            "{}-{}.json",
            encode_segment(&key.end_user_id),
            Utc::now().format("%Y%m%dT%H%M%S%.3fZ")
        ));
        tokio::fs::rename(&path, &target).await?;
        tracing::debug!(path = %target.display(), "Conversation state archived");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use parley_types::{ConversationStatus, Cursor};
    use serde_json::json;

    fn key() -> ConversationKey {
        ConversationKey::new("acme", "+54 9 11 0000")
    }

    fn sample_state() -> ConversationState {
        let mut state = ConversationState::new(&key(), "sales", 2);
        state.cursor = Cursor::Execute("ask".into());
        state.status = ConversationStatus::AwaitingInput;
        state.globals.insert("name".into(), json!("Ana"));
        state.globals.insert("ask.values".into(), json!({ "city": "Salta" }));
        state
    }

    async fn exercise_versioning(store: &dyn StateStore) {
        assert!(store.load(&key()).await.unwrap().is_none());

        let state = sample_state();
        assert_eq!(store.save(&state, 0).await.unwrap(), 1);

        let loaded = store.load(&key()).await.unwrap().unwrap();
        assert_eq!(loaded.version, 1);
        assert_eq!(loaded.cursor, state.cursor);
        assert_eq!(loaded.globals, state.globals);

        // A writer still holding version 0 loses.
        match store.save(&state, 0).await {
            Err(FlowError::VersionConflict { expected, actual, .. }) => {
                assert_eq!(expected, 0);
                assert_eq!(actual, 1);
            }
            other => panic!("Expected VersionConflict, got: {other:?}"),
        }

        assert_eq!(store.save(&loaded, 1).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn memory_store_versioning() {
        exercise_versioning(&MemoryStateStore::new()).await;
    }

    #[tokio::test]
    async fn file_store_versioning() {
        let dir = tempfile::tempdir().unwrap();
        exercise_versioning(&FileStateStore::new(dir.path())).await;
    }

    #[tokio::test]
    async fn memory_archive_moves_record() {
        let store = MemoryStateStore::new();
        store.save(&sample_state(), 0).await.unwrap();
        store.archive(&key()).await.unwrap();
        assert!(store.load(&key()).await.unwrap().is_none());
        assert!(store.is_empty());
        assert_eq!(store.archived(&key()).len(), 1);

        // Saving after archive starts from version 0 again.
        assert_eq!(store.save(&sample_state(), 0).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn file_archive_moves_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStateStore::new(dir.path());
        store.save(&sample_state(), 0).await.unwrap();
        let live = store.path_for(&key());
        assert!(live.exists());

        store.archive(&key()).await.unwrap();
        assert!(!live.exists());
        let archived: Vec<_> = std::fs::read_dir(dir.path().join("archive").join("acme"))
            .unwrap()
            .collect();
        assert_eq!(archived.len(), 1);

        // Archiving twice is fine.
        store.archive(&key()).await.unwrap();
    }

    #[tokio::test]
    async fn file_store_reports_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStateStore::new(dir.path());
        let path = store.path_for(&key());
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "{ not json").unwrap();
        assert!(matches!(store.load(&key()).await, Err(FlowError::Store(_))));
    }

    #[test]
    fn encode_segment_escapes_unsafe_bytes() {
        assert_eq!(encode_segment("acme_1-x"), "acme_1-x");
        assert_eq!(encode_segment("+54 9"), "%2B54%209");
        assert_eq!(encode_segment("../etc"), "%2E%2E%2Fetc");
    }
}
