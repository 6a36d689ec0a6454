//! The file-state repository (C2): an in-memory, concurrently-readable map
//! from relative path to last-known file state, persisted best-effort to a
//! hidden cache file in the synced folder.

use crate::error::Result;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex as AsyncMutex;
use tracing::warn;

pub const CACHE_FILE_NAME: &str = ".swarm-cache";

/// Last-known state of one file under the synced folder, keyed by
/// case-folded relative path. `content_hash` is empty until a deep rescan
/// computes it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncedFile {
    pub relative_path: String,
    pub file_size: u64,
    pub last_modified: DateTime<Utc>,
    #[serde(default)]
    pub content_hash: String,
}

fn fold_key(relative_path: &str) -> String {
    relative_path.to_ascii_lowercase()
}

/// Concurrent map of synced-file state for one sync folder, with best-effort
/// JSON persistence to `<sync_folder>/.swarm-cache`.
pub struct FileStateRepository {
    states: DashMap<String, SyncedFile>,
    cache_path: PathBuf,
    persist_mutex: AsyncMutex<()>,
}

impl FileStateRepository {
    pub fn new(sync_folder: &Path) -> Self {
        Self {
            states: DashMap::new(),
            cache_path: sync_folder.join(CACHE_FILE_NAME),
            persist_mutex: AsyncMutex::new(()),
        }
    }

    pub fn get(&self, relative_path: &str) -> Option<SyncedFile> {
        self.states.get(&fold_key(relative_path)).map(|e| e.value().clone())
    }

    /// Returns a stable snapshot; later mutations to the repository are not
    /// visible through the returned vector.
    pub fn get_all(&self) -> Vec<SyncedFile> {
        self.states.iter().map(|e| e.value().clone()).collect()
    }

    pub fn add_or_update(&self, file: SyncedFile) {
        self.states.insert(fold_key(&file.relative_path), file);
    }

    pub fn remove(&self, relative_path: &str) -> bool {
        self.states.remove(&fold_key(relative_path)).is_some()
    }

    pub fn exists(&self, relative_path: &str) -> bool {
        self.states.contains_key(&fold_key(relative_path))
    }

    pub fn clear(&self) {
        self.states.clear();
    }

    pub fn count(&self) -> usize {
        self.states.len()
    }

    /// Read-only view backed by the same map — a snapshot, not a live alias.
    pub fn as_read_only(&self) -> Vec<SyncedFile> {
        self.get_all()
    }

    /// Loads state from the cache file, if present. A missing file is not an
    /// error. A malformed file is logged and leaves current state untouched.
    /// Entries from the file override existing in-memory entries with the
    /// same key.
    pub async fn load(&self) -> Result<()> {
        let bytes = match tokio::fs::read(&self.cache_path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(err) => {
                warn!(path = %self.cache_path.display(), error = %err, "failed to read file-state cache");
                return Ok(());
            }
        };

        let loaded: std::collections::HashMap<String, SyncedFile> = match serde_json::from_slice(&bytes) {
            Ok(loaded) => loaded,
            Err(err) => {
                warn!(path = %self.cache_path.display(), error = %err, "malformed file-state cache, leaving state untouched");
                return Ok(());
            }
        };

        for (key, file) in loaded {
            self.states.insert(fold_key(&key), file);
        }
        Ok(())
    }

    /// Serializes the current state to the cache file. Best-effort: I/O
    /// failures are logged and swallowed, never surfaced to the caller.
    /// Serialized through `persist_mutex` so concurrent saves don't
    /// interleave partial writes.
    pub async fn save_changes(&self) {
        let _guard = self.persist_mutex.lock().await;

        let snapshot: std::collections::HashMap<String, SyncedFile> = self
            .states
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();

        let json = match serde_json::to_vec_pretty(&snapshot) {
            Ok(json) => json,
            Err(err) => {
                warn!(error = %err, "failed to serialize file-state cache");
                return;
            }
        };

        if let Some(parent) = self.cache_path.parent() {
            if let Err(err) = tokio::fs::create_dir_all(parent).await {
                warn!(path = %parent.display(), error = %err, "failed to create cache parent directory");
                return;
            }
        }

        if let Err(err) = tokio::fs::write(&self.cache_path, &json).await {
            warn!(path = %self.cache_path.display(), error = %err, "failed to write file-state cache");
            return;
        }

        set_hidden_attribute(&self.cache_path);
    }
}

#[cfg(windows)]
fn set_hidden_attribute(path: &Path) {
    use std::ffi::OsStr;
    use std::os::windows::ffi::OsStrExt;
    use winapi::um::fileapi::SetFileAttributesW;
    use winapi::um::winnt::FILE_ATTRIBUTE_HIDDEN;

    let wide: Vec<u16> = OsStr::new(path)
        .encode_wide()
        .chain(std::iter::once(0))
        .collect();
    // SAFETY: `wide` is a valid null-terminated UTF-16 string for the
    // lifetime of this call; failure to mark the cache hidden is
    // non-fatal and intentionally unchecked here.
    unsafe {
        SetFileAttributesW(wide.as_ptr(), FILE_ATTRIBUTE_HIDDEN);
    }
}

#[cfg(not(windows))]
fn set_hidden_attribute(_path: &Path) {
    // The leading dot in CACHE_FILE_NAME already hides the file on Unix.
}

/// Shared handle for the repository, suitable for passing into the rescan
/// engine and connection handlers alike.
pub type SharedRepository = Arc<FileStateRepository>;

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample(path: &str) -> SyncedFile {
        SyncedFile {
            relative_path: path.to_string(),
            file_size: 123,
            last_modified: Utc::now(),
            content_hash: "ABCDEF".to_string(),
        }
    }

    #[test]
    fn add_and_get_is_case_insensitive() {
        let repo = FileStateRepository::new(Path::new("/tmp/whatever"));
        repo.add_or_update(sample("Docs/Readme.TXT"));
        assert!(repo.exists("docs/readme.txt"));
        assert_eq!(repo.get("DOCS/README.TXT").unwrap().file_size, 123);
    }

    #[test]
    fn remove_reports_whether_key_existed() {
        let repo = FileStateRepository::new(Path::new("/tmp/whatever"));
        repo.add_or_update(sample("a.txt"));
        assert!(repo.remove("A.TXT"));
        assert!(!repo.remove("a.txt"));
    }

    #[test]
    fn get_all_is_a_stable_snapshot() {
        let repo = FileStateRepository::new(Path::new("/tmp/whatever"));
        repo.add_or_update(sample("a.txt"));
        let snapshot = repo.get_all();
        repo.add_or_update(sample("b.txt"));
        assert_eq!(snapshot.len(), 1);
        assert_eq!(repo.count(), 2);
    }

    #[tokio::test]
    async fn missing_cache_file_loads_as_empty() {
        let dir = tempdir().unwrap();
        let repo = FileStateRepository::new(dir.path());
        repo.load().await.unwrap();
        assert_eq!(repo.count(), 0);
    }

    #[tokio::test]
    async fn save_then_load_round_trips() {
        let dir = tempdir().unwrap();
        let repo = FileStateRepository::new(dir.path());
        repo.add_or_update(sample("notes.md"));
        repo.save_changes().await;

        let reloaded = FileStateRepository::new(dir.path());
        reloaded.load().await.unwrap();
        assert_eq!(reloaded.count(), 1);
        assert!(reloaded.exists("notes.md"));
    }

    #[tokio::test]
    async fn malformed_cache_file_is_ignored() {
        let dir = tempdir().unwrap();
        tokio::fs::write(dir.path().join(CACHE_FILE_NAME), b"not json")
            .await
            .unwrap();

        let repo = FileStateRepository::new(dir.path());
        repo.add_or_update(sample("kept.txt"));
        repo.load().await.unwrap();

        assert!(repo.exists("kept.txt"));
    }
}
