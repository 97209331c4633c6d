//! Background packaging with single-flight semantics and retention
//!
//! Drives `hubsync_core::archive` on a blocking thread. At most one
//! packaging run per dataset may be in flight; concurrent triggers for
//! the same dataset coalesce into the one already running. After a
//! successful run, retention keeps the newest `keep_versions` archives
//! per dataset, never touching the current archive or one a download
//! handler still holds open.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Local, NaiveDateTime};
use color_eyre::Result;
use color_eyre::eyre::{bail, eyre};
use tokio::task;
use tracing::{info, warn};

use hubsync_core::archive::{self, ArchiveSummary};
use hubsync_core::scan::Scanner;

use crate::readers::{ReaderRegistry, Removal};

/// Produces dataset archives into the cache directory
pub struct Packager {
    cache_dir: PathBuf,
    keep_versions: usize,
    readers: Arc<ReaderRegistry>,
    in_flight: Mutex<HashSet<String>>,
}

impl Packager {
    #[must_use]
    pub fn new(cache_dir: PathBuf, keep_versions: usize, readers: Arc<ReaderRegistry>) -> Self {
        Self {
            cache_dir,
            keep_versions,
            readers,
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    /// Package one dataset version
    ///
    /// Scans `source`, writes the archive as
    /// `{name}_{YYYYMMDD_HHMMSS}.zip` under the cache directory and
    /// applies retention. The version stamp is the dataset's majority
    /// minute in the hub's local zone.
    ///
    /// # Errors
    /// Returns an error when a run for this dataset is already in
    /// flight, or on any scan/write failure; the previous archive is
    /// left untouched and the caller may retry next tick.
    pub async fn package(
        &self,
        name: &str,
        source: &Path,
        version: DateTime<Local>,
    ) -> Result<ArchiveSummary> {
        let Some(_flight) = self.begin(name) else {
            bail!("packaging already in flight for `{name}`");
        };

        fs::create_dir_all(&self.cache_dir)?;
        let dest = self.cache_dir.join(archive::archive_file_name(name, version));

        let source = source.to_path_buf();
        let blocking_dest = dest.clone();
        let summary = task::spawn_blocking(move || -> Result<ArchiveSummary> {
            let observations = Scanner::new(&source).scan()?;
            archive::write_archive(&source, &observations, &blocking_dest)
        })
        .await
        .map_err(|e| eyre!("packaging task panicked: {e}"))??;

        info!(
            dataset = name,
            archive = %summary.archive_path.display(),
            files = summary.file_count,
            bytes = summary.compressed_size,
            "archive published"
        );

        self.apply_retention(name, &summary.archive_path);

        Ok(summary)
    }

    /// Delete archives beyond the retention quota
    ///
    /// Versions sort by the timestamp embedded in their file name,
    /// newest first. The archive at `current` is always preserved.
    /// Errors here are logged, never fatal.
    pub fn apply_retention(&self, name: &str, current: &Path) {
        let entries = match fs::read_dir(&self.cache_dir) {
            Ok(entries) => entries,
            Err(e) => {
                warn!("retention skipped, cannot read cache dir: {e}");
                return;
            }
        };

        let mut versions: Vec<(NaiveDateTime, PathBuf)> = entries
            .filter_map(|entry| {
                let entry = entry.ok()?;
                let file_name = entry.file_name();
                let stamp = archive::parse_archive_stamp(file_name.to_str()?, name)?;
                Some((stamp, entry.path()))
            })
            .collect();
        versions.sort_by(|a, b| b.0.cmp(&a.0));

        for (_, path) in versions.iter().skip(self.keep_versions) {
            if path == current {
                continue;
            }
            match self.readers.remove_or_defer(path) {
                Removal::Removed => info!("retention deleted {}", path.display()),
                Removal::Deferred => info!("retention deferred {}", path.display()),
            }
        }

        let _ = self.readers.sweep_deferred();
    }

    /// Begin a packaging flight for `name`; `None` when one is running
    fn begin(&self, name: &str) -> Option<FlightGuard<'_>> {
        FlightGuard::acquire(&self.in_flight, name)
    }
}

/// Membership in the in-flight set, released on drop
struct FlightGuard<'a> {
    set: &'a Mutex<HashSet<String>>,
    name: String,
}

impl<'a> FlightGuard<'a> {
    fn acquire(set: &'a Mutex<HashSet<String>>, name: &str) -> Option<Self> {
        let mut guard = set.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        guard.insert(name.to_string()).then(|| Self {
            set,
            name: name.to_string(),
        })
    }
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        let mut guard = self
            .set
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let _ = guard.remove(&self.name);
    }
}
