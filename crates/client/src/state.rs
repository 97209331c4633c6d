//! Client sync state
//!
//! One small JSON document mapping dataset name to the last installed
//! `last_updated` timestamp. The file is only advanced after a
//! successful extraction-and-swap, and every write is atomic.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::PathBuf;

use chrono::{DateTime, FixedOffset};
use color_eyre::Result;
use tracing::warn;

use hubsync_core::state::write_json_atomic;

/// Dataset name → last installed version timestamp
pub struct SyncState {
    path: PathBuf,
    entries: HashMap<String, String>,
}

impl SyncState {
    /// Load the state document, tolerating a missing or corrupt file
    ///
    /// # Errors
    /// Returns an error only when the file exists but cannot be read.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();

        let entries = match fs::read(&path) {
            Ok(bytes) => match serde_json::from_slice(&bytes) {
                Ok(entries) => entries,
                Err(e) => {
                    warn!("sync state {} is corrupt, starting empty: {e}", path.display());
                    HashMap::new()
                }
            },
            Err(e) if e.kind() == io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(e.into()),
        };

        Ok(Self { path, entries })
    }

    /// Last installed version for a dataset; absent means never synced
    #[must_use]
    pub fn last_updated(&self, dataset: &str) -> Option<DateTime<FixedOffset>> {
        let raw = self.entries.get(dataset)?;
        match DateTime::parse_from_rfc3339(raw) {
            Ok(ts) => Some(ts),
            Err(e) => {
                warn!("ignoring unparsable timestamp for `{dataset}`: {e}");
                None
            }
        }
    }

    /// Record a newly installed version and persist atomically
    ///
    /// # Errors
    /// Returns an error when the document cannot be written.
    pub fn record(&mut self, dataset: &str, version: DateTime<FixedOffset>) -> Result<()> {
        let _ = self
            .entries
            .insert(dataset.to_string(), version.to_rfc3339());
        write_json_atomic(&self.path, &self.entries)
    }
}
