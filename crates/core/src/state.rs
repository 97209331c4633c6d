//! Durable per-dataset state
//!
//! One JSON document on disk, keyed by dataset name. All mutation goes
//! through a single writer path that serializes the full document to a
//! temp file and renames it into place, so concurrent readers never
//! observe a torn record. Readers take whole-document snapshots.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use chrono::{DateTime, FixedOffset};
use color_eyre::Result;
use color_eyre::eyre::{WrapErr, eyre};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Persisted state for one dataset
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatasetState {
    /// Majority minute of the most recent settled version
    pub last_updated: Option<DateTime<FixedOffset>>,
    /// Files observed at package time
    pub file_count: u64,
    /// Total source bytes observed at package time
    pub total_size: u64,
    /// Whether a downloadable archive exists
    pub package_ready: bool,
    /// Archive size in bytes
    pub package_size: u64,
    /// Hub-local path of the current archive (never exposed externally)
    pub package_path: Option<PathBuf>,
    /// Wall-clock time of the last successful packaging trigger
    pub last_trigger_at: Option<DateTime<FixedOffset>>,
}

/// Store of per-dataset state with atomic JSON persistence
#[derive(Debug)]
pub struct StateStore {
    path: PathBuf,
    inner: RwLock<HashMap<String, DatasetState>>,
}

impl StateStore {
    /// Load the state document, tolerating a missing or corrupt file
    ///
    /// A file that does not parse is treated as empty with a warning;
    /// the next successful update rewrites it.
    ///
    /// # Errors
    /// Returns an error only when the file exists but cannot be read.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();

        let entries = match fs::read(&path) {
            Ok(bytes) => match serde_json::from_slice(&bytes) {
                Ok(entries) => entries,
                Err(e) => {
                    warn!("state file {} is corrupt, starting empty: {e}", path.display());
                    HashMap::new()
                }
            },
            Err(e) if e.kind() == io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => {
                return Err(e).wrap_err_with(|| format!("reading state file {}", path.display()));
            }
        };

        Ok(Self {
            path,
            inner: RwLock::new(entries),
        })
    }

    /// Snapshot of one dataset's state
    #[must_use]
    pub fn get(&self, name: &str) -> Option<DatasetState> {
        self.read_lock().get(name).cloned()
    }

    /// Snapshot of the whole document
    #[must_use]
    pub fn get_all(&self) -> HashMap<String, DatasetState> {
        self.read_lock().clone()
    }

    /// Mutate one dataset's state and persist the document
    ///
    /// The in-memory state keeps the mutation even when persistence
    /// fails, so a later update can retry the write.
    ///
    /// # Errors
    /// Returns an error when the document cannot be written to disk.
    pub fn update(
        &self,
        name: &str,
        mutate: impl FnOnce(&mut DatasetState),
    ) -> Result<()> {
        let snapshot = {
            let mut guard = self
                .inner
                .write()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            mutate(guard.entry(name.to_string()).or_default());
            guard.clone()
        };

        write_json_atomic(&self.path, &snapshot)
            .wrap_err_with(|| format!("persisting state to {}", self.path.display()))
    }

    /// Path of the backing document
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_lock(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, DatasetState>> {
        self.inner
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

/// Serialize `value` as pretty JSON and atomically replace `path`
///
/// Writes to a `.tmp` sibling and renames, creating parent directories
/// as needed.
///
/// # Errors
/// Returns an error on serialization or filesystem failures.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| eyre!("state path has no parent: {}", path.display()))?;
    if !parent.as_os_str().is_empty() {
        fs::create_dir_all(parent)?;
    }

    let mut tmp_name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    tmp_name.push(".tmp");
    let tmp = path.with_file_name(tmp_name);

    let bytes = serde_json::to_vec_pretty(value)?;
    fs::write(&tmp, bytes)?;
    fs::rename(&tmp, path)?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn ts(s: &str) -> DateTime<FixedOffset> {
        DateTime::parse_from_rfc3339(s).unwrap()
    }

    #[test]
    fn test_missing_file_loads_empty() {
        let dir = TempDir::new().unwrap();
        let store = StateStore::load(dir.path().join("state.json")).unwrap();
        assert!(store.get_all().is_empty());
    }

    #[test]
    fn test_update_persists_and_reloads() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");

        let store = StateStore::load(&path).unwrap();
        store
            .update("quotes", |s| {
                s.last_updated = Some(ts("2025-02-04T20:16:00+08:00"));
                s.file_count = 100;
                s.total_size = 12_345;
                s.package_ready = true;
                s.package_size = 4_096;
                s.package_path = Some(PathBuf::from("/cache/quotes_20250204_201600.zip"));
            })
            .unwrap();

        let reloaded = StateStore::load(&path).unwrap();
        let state = reloaded.get("quotes").unwrap();
        assert_eq!(state.file_count, 100);
        assert!(state.package_ready);
        assert_eq!(state.last_updated, Some(ts("2025-02-04T20:16:00+08:00")));
    }

    #[test]
    fn test_corrupt_file_loads_empty() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");
        fs::write(&path, b"{ not json").unwrap();

        let store = StateStore::load(&path).unwrap();
        assert!(store.get_all().is_empty());
    }

    #[test]
    fn test_no_temp_file_left_behind() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");

        let store = StateStore::load(&path).unwrap();
        store.update("a", |s| s.file_count = 1).unwrap();

        let names: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(names, vec!["state.json".to_string()]);
    }

    #[test]
    fn test_snapshot_is_detached_from_later_updates() {
        let dir = TempDir::new().unwrap();
        let store = StateStore::load(dir.path().join("state.json")).unwrap();
        store.update("a", |s| s.file_count = 1).unwrap();

        let snapshot = store.get_all();
        store.update("a", |s| s.file_count = 2).unwrap();

        assert_eq!(snapshot.get("a").unwrap().file_count, 1);
        assert_eq!(store.get("a").unwrap().file_count, 2);
    }

    #[test]
    fn test_document_layout_matches_contract() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");

        let store = StateStore::load(&path).unwrap();
        store
            .update("quotes", |s| {
                s.last_updated = Some(ts("2025-02-04T20:16:00+00:00"));
                s.package_ready = true;
            })
            .unwrap();

        let raw: serde_json::Value =
            serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
        let entry = &raw["quotes"];
        assert_eq!(entry["last_updated"], "2025-02-04T20:16:00+00:00");
        assert_eq!(entry["package_ready"], true);
        assert!(entry.get("file_count").is_some());
        assert!(entry.get("total_size").is_some());
        assert!(entry.get("package_size").is_some());
        assert!(entry.get("last_trigger_at").is_some());
    }
}
