//! Open-reader accounting for the archive cache
//!
//! Retention must never delete an archive a download handler is
//! streaming. The HTTP surface registers a [`ReaderGuard`] per open
//! archive; retention asks the registry to remove files and the
//! registry defers deletion of open ones to the guard's drop (the
//! "reaper on close"). A sweep drains deferred entries whose readers
//! disappeared without triggering the drop path.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tracing::{debug, warn};

#[derive(Default)]
struct RegistryInner {
    /// Open reader count per archive path
    open: HashMap<PathBuf, usize>,
    /// Archives retention wants gone once their readers close
    deferred: HashSet<PathBuf>,
}

/// Shared registry of archives currently held open by readers
#[derive(Default)]
pub struct ReaderRegistry {
    inner: Mutex<RegistryInner>,
}

/// What happened to a removal request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Removal {
    /// File deleted (or already gone)
    Removed,
    /// File is open; deletion deferred to last close
    Deferred,
}

impl ReaderRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a reader for `path`; the returned guard must live as
    /// long as the stream that reads from the file
    #[must_use]
    pub fn open(self: &Arc<Self>, path: PathBuf) -> ReaderGuard {
        {
            let mut inner = self.lock();
            *inner.open.entry(path.clone()).or_insert(0) += 1;
        }
        ReaderGuard {
            registry: Arc::clone(self),
            path,
        }
    }

    /// Delete `path` now, or defer if a reader holds it open
    pub fn remove_or_defer(&self, path: &Path) -> Removal {
        let mut inner = self.lock();
        if inner.open.get(path).copied().unwrap_or(0) > 0 {
            let _ = inner.deferred.insert(path.to_path_buf());
            debug!("deferring deletion of open archive {}", path.display());
            return Removal::Deferred;
        }
        drop(inner);
        delete_file(path);
        Removal::Removed
    }

    /// Delete deferred entries whose readers are gone
    ///
    /// Normally the last guard drop handles this; the sweep cleans up
    /// entries that became stale some other way.
    pub fn sweep_deferred(&self) -> usize {
        let stale: Vec<PathBuf> = {
            let mut inner = self.lock();
            let ready: Vec<PathBuf> = inner
                .deferred
                .iter()
                .filter(|p| inner.open.get(*p).copied().unwrap_or(0) == 0)
                .cloned()
                .collect();
            for path in &ready {
                let _ = inner.deferred.remove(path);
            }
            ready
        };

        for path in &stale {
            delete_file(path);
        }
        stale.len()
    }

    /// Current reader count for a path (test hook)
    #[must_use]
    pub fn reader_count(&self, path: &Path) -> usize {
        self.lock().open.get(path).copied().unwrap_or(0)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RegistryInner> {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

/// Keeps one archive alive while a response body streams from it
pub struct ReaderGuard {
    registry: Arc<ReaderRegistry>,
    path: PathBuf,
}

impl Drop for ReaderGuard {
    fn drop(&mut self) {
        let delete = {
            let mut inner = self.registry.lock();
            let closed = match inner.open.get_mut(&self.path) {
                Some(count) => {
                    *count = count.saturating_sub(1);
                    *count == 0
                }
                None => true,
            };
            if closed {
                let _ = inner.open.remove(&self.path);
            }
            closed && inner.deferred.remove(&self.path)
        };

        if delete {
            delete_file(&self.path);
        }
    }
}

fn delete_file(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => debug!("deleted archive {}", path.display()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!("failed to delete archive {}: {e}", path.display()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn touch(dir: &TempDir, name: &str) -> PathBuf {
        let path = dir.path().join(name);
        fs::write(&path, b"archive").unwrap();
        path
    }

    #[test]
    fn test_remove_unopened_file() {
        let dir = TempDir::new().unwrap();
        let path = touch(&dir, "a.zip");

        let registry = Arc::new(ReaderRegistry::new());
        assert_eq!(registry.remove_or_defer(&path), Removal::Removed);
        assert!(!path.exists());
    }

    #[test]
    fn test_open_file_survives_until_last_close() {
        let dir = TempDir::new().unwrap();
        let path = touch(&dir, "a.zip");

        let registry = Arc::new(ReaderRegistry::new());
        let first = registry.open(path.clone());
        let second = registry.open(path.clone());
        assert_eq!(registry.reader_count(&path), 2);

        assert_eq!(registry.remove_or_defer(&path), Removal::Deferred);
        assert!(path.exists());

        drop(first);
        assert!(path.exists());

        // Last close runs the deferred deletion
        drop(second);
        assert!(!path.exists());
        assert_eq!(registry.reader_count(&path), 0);
    }

    #[test]
    fn test_sweep_cleans_stale_deferred_entries() {
        let dir = TempDir::new().unwrap();
        let path = touch(&dir, "a.zip");

        let registry = Arc::new(ReaderRegistry::new());
        {
            let mut inner = registry.lock();
            let _ = inner.deferred.insert(path.clone());
        }

        assert_eq!(registry.sweep_deferred(), 1);
        assert!(!path.exists());
    }

    #[test]
    fn test_close_without_deferred_keeps_file() {
        let dir = TempDir::new().unwrap();
        let path = touch(&dir, "a.zip");

        let registry = Arc::new(ReaderRegistry::new());
        let guard = registry.open(path.clone());
        drop(guard);

        assert!(path.exists());
    }
}
